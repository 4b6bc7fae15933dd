//! Raw message handler capability

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;

/// Outcome of handling one envelope.
///
/// `Ok` commits the envelope's offset; any error leaves it uncommitted.
pub type HandlerResult = anyhow::Result<()>;

/// Handles raw envelopes.
///
/// Implementations are shared by every partition dispatcher of a consumer, so
/// they may be called concurrently for different partitions. Calls for one
/// partition never overlap. Any serialization the handler needs is its own
/// responsibility.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one envelope; `ctx` is cancelled when the session ends.
    async fn handle(&self, ctx: &CancellationToken, msg: &Envelope) -> HandlerResult;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, ctx: &CancellationToken, msg: &Envelope) -> HandlerResult {
        (**self).handle(ctx, msg).await
    }
}

/// Closure-backed handler, built with [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as a [`MessageHandler`].
///
/// The closure receives owned clones of the token and envelope so the
/// returned future can be `'static`.
///
/// ```ignore
/// let handler = handler_fn(|_ctx, msg| async move {
///     tracing::info!(offset = msg.offset(), "got message");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(CancellationToken, Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(CancellationToken, Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, ctx: &CancellationToken, msg: &Envelope) -> HandlerResult {
        (self.f)(ctx.clone(), msg.clone()).await
    }
}
