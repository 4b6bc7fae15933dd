//! `orders.created` events

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use group_consumer::{
    adapt_typed_handler, Envelope, HandlerConfig, HandlerResult, TypedAdapter, TypedHandler,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use validator::Validate;

/// Order placed by a customer
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct OrderCreated {
    #[validate(length(min = 1))]
    pub order_id: String,

    #[validate(length(min = 1))]
    pub customer_id: String,

    /// Total in minor currency units
    #[validate(range(min = 0))]
    pub amount_cents: i64,

    #[serde(default)]
    pub currency: String,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

pub struct OrderCreatedHandler;

#[async_trait]
impl TypedHandler<OrderCreated> for OrderCreatedHandler {
    async fn handle(
        &self,
        _ctx: &CancellationToken,
        msg: &Envelope,
        event: OrderCreated,
    ) -> HandlerResult {
        event.validate().with_context(|| {
            format!(
                "invalid order event at {}/{}@{}",
                msg.topic(),
                msg.partition(),
                msg.offset()
            )
        })?;

        info!(
            order_id = %event.order_id,
            customer_id = %event.customer_id,
            amount_cents = event.amount_cents,
            currency = %event.currency,
            partition = msg.partition(),
            offset = msg.offset(),
            "Order created"
        );
        Ok(())
    }
}

/// Raw handler decoding JSON `OrderCreated` payloads.
pub fn order_handler() -> TypedAdapter<OrderCreated, OrderCreatedHandler> {
    adapt_typed_handler(OrderCreatedHandler, HandlerConfig::default())
}
