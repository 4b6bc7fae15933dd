//! # Group Consumer Library
//!
//! Consumer-group message consumption with commit-on-success semantics.
//!
//! A [`GroupConsumer`] joins a consumer group for a set of topics and runs a
//! [`MessageHandler`] once per record. Records of one partition are handled
//! strictly in offset order; different partitions are handled concurrently.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: an offset is marked only after the handler returned
//!   `Ok`, and marked offsets are committed periodically.
//! - **No retry**: a failing record is logged and skipped for the rest of the
//!   session. See [`dispatcher`] for the exact commit policy.
//! - **Rebalance-safe**: a revoked partition ends the session; the consumer
//!   rejoins and resumes from the committed position.
//!
//! ## Architecture
//!
//! ```text
//! GroupConsumer ── rejoin loop ──► GroupMembership::consume (one per generation)
//!       │                                │
//!       │                                ├─► ClaimDispatcher (partition 0) ─► MessageHandler
//!       │                                └─► ClaimDispatcher (partition n) ─► MessageHandler
//!       └── fault drain ◄── GroupMembership::take_faults
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use group_consumer::{adapt_typed_handler, typed_fn, GroupConsumer, HandlerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Default, serde::Deserialize)]
//! struct OrderCreated { order_id: String }
//!
//! let handler = adapt_typed_handler(
//!     typed_fn(|_ctx, _msg, event: OrderCreated| async move {
//!         tracing::info!(order_id = %event.order_id, "order created");
//!         Ok(())
//!     }),
//!     HandlerConfig::default(),
//! );
//!
//! let mut consumer = GroupConsumer::from_env(
//!     "KAFKA_",
//!     "order-consumer",
//!     vec!["orders.created".to_string()],
//!     handler,
//! )?;
//!
//! let shutdown = CancellationToken::new();
//! consumer.start(&shutdown);
//! tokio::signal::ctrl_c().await?;
//! consumer.close().await?;
//! ```

pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod fault;
pub mod group;
pub mod handler;
pub mod kafka;
pub mod memory;
pub mod metrics;
pub mod typed;

pub use config::{ConsumerConfig, InitialOffset, NetTimeouts, RebalanceStrategy, SaslPlain, TlsConfig};
pub use consumer::{ConsumerState, GroupConsumer};
pub use dispatcher::ClaimDispatcher;
pub use envelope::{Envelope, Header};
pub use error::{ConsumerError, ConsumerResult};
pub use fault::drain_faults;
pub use group::{Assignment, ClaimHandler, GroupMembership, GroupSession, PartitionClaim};
pub use handler::{handler_fn, HandlerFn, HandlerResult, MessageHandler};
pub use kafka::KafkaGroup;
pub use memory::InMemoryGroup;
pub use metrics::ConsumerMetrics;
pub use typed::{
    adapt_typed_handler, json_decode, typed_fn, HandlerConfig, TypedAdapter, TypedFn,
    TypedHandler,
};
