//! Typed handlers and the decode-and-adapt layer.
//!
//! A [`TypedHandler<E>`] receives the envelope together with its value decoded
//! into a domain event `E`. [`adapt_typed_handler`] turns it into a plain
//! [`MessageHandler`] so it can be driven by a consumer.
//!
//! A payload that fails to decode is reported as a handler error, which
//! means its offset is not committed. There is no dead-letter escape in the
//! adapter: a permanently malformed record will be delivered again whenever
//! consumption restarts from an offset behind it.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::error::ConsumerError;
use crate::handler::{HandlerResult, MessageHandler};

/// Handles an envelope whose value has been decoded into `E`.
///
/// The envelope itself is still passed for access to key, headers and
/// position metadata.
#[async_trait]
pub trait TypedHandler<E>: Send + Sync
where
    E: Send + 'static,
{
    async fn handle(&self, ctx: &CancellationToken, msg: &Envelope, event: E) -> HandlerResult;
}

type NewEventFn<E> = Arc<dyn Fn() -> E + Send + Sync>;
type DecodeFn<E> = Arc<dyn Fn(&[u8], &mut E) -> anyhow::Result<()> + Send + Sync>;

/// How typed events are constructed and decoded.
pub struct HandlerConfig<E> {
    new_event: NewEventFn<E>,
    decode: DecodeFn<E>,
}

impl<E> Clone for HandlerConfig<E> {
    fn clone(&self) -> Self {
        Self {
            new_event: self.new_event.clone(),
            decode: self.decode.clone(),
        }
    }
}

impl<E> HandlerConfig<E> {
    /// Explicit constructor and decoder, for event types that are neither
    /// `Default` nor JSON.
    pub fn new<N, D>(new_event: N, decode: D) -> Self
    where
        N: Fn() -> E + Send + Sync + 'static,
        D: Fn(&[u8], &mut E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            new_event: Arc::new(new_event),
            decode: Arc::new(decode),
        }
    }

    /// Provide the constructor for fresh events (default values).
    pub fn with_new_event<N>(mut self, new_event: N) -> Self
    where
        N: Fn() -> E + Send + Sync + 'static,
    {
        self.new_event = Arc::new(new_event);
        self
    }

    /// Decode with a custom function (protobuf, avro, ...).
    pub fn with_decoder<D>(mut self, decode: D) -> Self
    where
        D: Fn(&[u8], &mut E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.decode = Arc::new(decode);
        self
    }

    fn new_event(&self) -> E {
        (self.new_event)()
    }

    fn decode(&self, bytes: &[u8], dst: &mut E) -> anyhow::Result<()> {
        (self.decode)(bytes, dst)
    }
}

impl<E> HandlerConfig<E>
where
    E: DeserializeOwned + 'static,
{
    /// Decode with JSON (the default).
    pub fn with_json_decoder(self) -> Self {
        self.with_decoder(json_decode::<E>)
    }
}

impl<E> Default for HandlerConfig<E>
where
    E: Default + DeserializeOwned + 'static,
{
    fn default() -> Self {
        Self::new(E::default, json_decode::<E>)
    }
}

/// JSON decoder used by default.
///
/// The decoded value replaces `dst` entirely; fields absent from the payload
/// take their serde defaults rather than the constructor's values.
pub fn json_decode<E: DeserializeOwned>(bytes: &[u8], dst: &mut E) -> anyhow::Result<()> {
    *dst = serde_json::from_slice(bytes).map_err(|e| ConsumerError::Decode(e.to_string()))?;
    Ok(())
}

/// A [`TypedHandler`] exposed as a [`MessageHandler`].
pub struct TypedAdapter<E, H> {
    handler: H,
    config: HandlerConfig<E>,
    _event: PhantomData<fn() -> E>,
}

/// Adapt a typed handler into a raw handler using `config` for event
/// construction and decoding.
pub fn adapt_typed_handler<E, H>(handler: H, config: HandlerConfig<E>) -> TypedAdapter<E, H>
where
    E: Send + 'static,
    H: TypedHandler<E>,
{
    TypedAdapter {
        handler,
        config,
        _event: PhantomData,
    }
}

#[async_trait]
impl<E, H> MessageHandler for TypedAdapter<E, H>
where
    E: Send + 'static,
    H: TypedHandler<E>,
{
    async fn handle(&self, ctx: &CancellationToken, msg: &Envelope) -> HandlerResult {
        let mut event = self.config.new_event();
        self.config.decode(msg.value(), &mut event)?;
        self.handler.handle(ctx, msg, event).await
    }
}

/// Closure-backed typed handler, built with [`typed_fn`].
pub struct TypedFn<F> {
    f: F,
}

/// Wrap an async closure as a [`TypedHandler`].
pub fn typed_fn<E, F, Fut>(f: F) -> TypedFn<F>
where
    E: Send + 'static,
    F: Fn(CancellationToken, Envelope, E) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    TypedFn { f }
}

#[async_trait]
impl<E, F, Fut> TypedHandler<E> for TypedFn<F>
where
    E: Send + 'static,
    F: Fn(CancellationToken, Envelope, E) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, ctx: &CancellationToken, msg: &Envelope, event: E) -> HandlerResult {
        (self.f)(ctx.clone(), msg.clone(), event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct OrderCreated {
        id: String,
        amount: i64,
        #[serde(default)]
        currency: String,
    }

    fn recorder() -> (Arc<Mutex<Vec<OrderCreated>>>, impl TypedHandler<OrderCreated>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = typed_fn(move |_ctx, _msg, evt: OrderCreated| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(evt);
                Ok(())
            }
        });
        (seen, handler)
    }

    #[tokio::test]
    async fn test_default_config_decodes_json() {
        let (seen, handler) = recorder();
        let adapter = adapt_typed_handler(handler, HandlerConfig::<OrderCreated>::default());
        let msg = Envelope::new("orders", 0, 0, &br#"{"id":"o-1","amount":12}"#[..]);

        adapter.handle(&CancellationToken::new(), &msg).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen[0],
            OrderCreated {
                id: "o-1".to_string(),
                amount: 12,
                currency: String::new(),
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_payload_is_handler_error() {
        let (seen, handler) = recorder();
        let adapter = adapt_typed_handler(handler, HandlerConfig::<OrderCreated>::default());
        let msg = Envelope::new("orders", 0, 5, &b"not json"[..]);

        let err = adapter
            .handle(&CancellationToken::new(), &msg)
            .await
            .unwrap_err();

        assert!(err.downcast_ref::<ConsumerError>().is_some());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_custom_constructor_and_decoder() {
        let (seen, handler) = recorder();
        let config = HandlerConfig::<OrderCreated>::default()
            .with_new_event(|| OrderCreated {
                currency: "IDR".to_string(),
                ..Default::default()
            })
            .with_decoder(|bytes, dst: &mut OrderCreated| {
                let text = std::str::from_utf8(bytes)?;
                let (id, amount) = text
                    .split_once(':')
                    .ok_or_else(|| anyhow::anyhow!("expected id:amount"))?;
                dst.id = id.to_string();
                dst.amount = amount.parse()?;
                Ok(())
            });
        let adapter = adapt_typed_handler(handler, config);

        adapter
            .handle(
                &CancellationToken::new(),
                &Envelope::new("orders", 1, 3, &b"o-9:40"[..]),
            )
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].id, "o-9");
        assert_eq!(seen[0].amount, 40);
        assert_eq!(seen[0].currency, "IDR");
    }

    #[tokio::test]
    async fn test_json_decoder_overrides_custom_decoder() {
        let (seen, handler) = recorder();
        let config = HandlerConfig::<OrderCreated>::default()
            .with_decoder(|_bytes, _dst: &mut OrderCreated| Err(anyhow::anyhow!("never")))
            .with_json_decoder();
        let adapter = adapt_typed_handler(handler, config);

        adapter
            .handle(
                &CancellationToken::new(),
                &Envelope::new("orders", 0, 0, &br#"{"id":"o-2","amount":1}"#[..]),
            )
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
