//! Per-partition dispatch and the commit policy.
//!
//! # Commit policy
//!
//! Delivery is at-least-once with commit-on-success and **no automatic
//! retry**:
//!
//! - handler returns `Ok` → the offset is marked before the next envelope of
//!   that partition is pulled;
//! - handler returns `Err` → the offset is not marked, the failure is logged
//!   and the dispatcher moves on to the next envelope. The failed envelope is
//!   not retried in this session.
//!
//! A skipped envelope is only delivered again if a later session starts from
//! a committed position behind it (restart, or a rebalance that happens
//! before any later offset of the partition was marked). Once a later offset
//! is marked, the committed position moves past the failed one. Callers that
//! need retries or dead-lettering must build them into the handler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::ConsumerResult;
use crate::group::{ClaimHandler, GroupSession, PartitionClaim};
use crate::handler::MessageHandler;
use crate::metrics::{ConsumerMetrics, OUTCOME_COMMITTED, OUTCOME_FAILED};

/// Drives one [`MessageHandler`] over every claim of a session.
pub struct ClaimDispatcher {
    handler: Arc<dyn MessageHandler>,
    metrics: Option<ConsumerMetrics>,
}

impl ClaimDispatcher {
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            handler,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ConsumerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl ClaimHandler for ClaimDispatcher {
    async fn setup(&self, session: &dyn GroupSession) -> ConsumerResult<()> {
        info!(
            generation = session.generation_id(),
            member_id = %session.member_id(),
            claims = ?session.claims(),
            "Group session started"
        );
        Ok(())
    }

    async fn cleanup(&self, session: &dyn GroupSession) -> ConsumerResult<()> {
        info!(generation = session.generation_id(), "Group session ended");
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: &dyn GroupSession,
        claim: &mut PartitionClaim,
    ) -> ConsumerResult<()> {
        let ctx = session.context();
        debug!(
            topic = %claim.topic(),
            partition = claim.partition(),
            initial_offset = claim.initial_offset(),
            "Consuming partition claim"
        );

        loop {
            let msg = tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                next = claim.next() => match next {
                    Some(msg) => msg,
                    None => break,
                },
            };

            match self.handler.handle(ctx, &msg).await {
                Ok(()) => {
                    session.mark_message(&msg);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_message(msg.topic(), OUTCOME_COMMITTED);
                    }
                    debug!(
                        topic = %msg.topic(),
                        partition = msg.partition(),
                        offset = msg.offset(),
                        "Message handled, offset marked"
                    );
                }
                Err(e) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_message(msg.topic(), OUTCOME_FAILED);
                    }
                    warn!(
                        topic = %msg.topic(),
                        partition = msg.partition(),
                        offset = msg.offset(),
                        error = %e,
                        "Handler failed, offset not committed"
                    );
                }
            }
        }

        debug!(
            topic = %claim.topic(),
            partition = claim.partition(),
            "Partition claim finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::group::Assignment;
    use crate::handler::handler_fn;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Session double recording marks together with the handler calls seen
    /// so far, to check that a mark lands before the next pull.
    struct RecordingSession {
        ctx: CancellationToken,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl GroupSession for RecordingSession {
        fn context(&self) -> &CancellationToken {
            &self.ctx
        }

        fn generation_id(&self) -> i32 {
            1
        }

        fn member_id(&self) -> &str {
            "member-1"
        }

        fn claims(&self) -> Assignment {
            BTreeMap::from([("orders".to_string(), vec![0])])
        }

        fn mark_message(&self, msg: &Envelope) {
            self.events
                .lock()
                .unwrap()
                .push(format!("mark:{}", msg.offset()));
        }
    }

    fn session() -> (RecordingSession, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            RecordingSession {
                ctx: CancellationToken::new(),
                events: events.clone(),
            },
            events,
        )
    }

    fn recording_dispatcher(
        events: Arc<Mutex<Vec<String>>>,
        fail_offset: Option<i64>,
    ) -> ClaimDispatcher {
        ClaimDispatcher::new(Arc::new(handler_fn(move |_ctx, msg| {
            let events = events.clone();
            async move {
                events
                    .lock()
                    .unwrap()
                    .push(format!("handle:{}", msg.offset()));
                if Some(msg.offset()) == fail_offset {
                    anyhow::bail!("rejected offset {}", msg.offset());
                }
                Ok(())
            }
        })))
    }

    async fn filled_claim(offsets: std::ops::RangeInclusive<i64>) -> PartitionClaim {
        let (tx, rx) = mpsc::channel(16);
        for offset in offsets {
            tx.send(Envelope::new("orders", 0, offset, &b"{}"[..]))
                .await
                .unwrap();
        }
        PartitionClaim::new("orders", 0, 1, rx)
    }

    #[tokio::test]
    async fn test_mark_happens_before_next_envelope() {
        let (session, events) = session();
        let dispatcher = recording_dispatcher(events.clone(), None);
        let mut claim = filled_claim(1..=3).await;

        dispatcher.consume_claim(&session, &mut claim).await.unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec!["handle:1", "mark:1", "handle:2", "mark:2", "handle:3", "mark:3"]
        );
    }

    #[tokio::test]
    async fn test_failed_envelope_is_skipped_not_retried() {
        let (session, events) = session();
        let dispatcher = recording_dispatcher(events.clone(), Some(2));
        let mut claim = filled_claim(1..=3).await;

        dispatcher.consume_claim(&session, &mut claim).await.unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec!["handle:1", "mark:1", "handle:2", "handle:3", "mark:3"]
        );
    }

    #[tokio::test]
    async fn test_returns_when_cancelled_while_waiting() {
        let (session, events) = session();
        let dispatcher = recording_dispatcher(events, None);
        let (_tx, rx) = mpsc::channel(1);
        let mut claim = PartitionClaim::new("orders", 0, 0, rx);

        let ctx = session.ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx.cancel();
        });

        tokio::time::timeout(
            Duration::from_secs(2),
            dispatcher.consume_claim(&session, &mut claim),
        )
        .await
        .expect("dispatcher should stop after cancellation")
        .unwrap();
    }

    #[tokio::test]
    async fn test_outcomes_are_counted() {
        let (session, events) = session();
        let metrics = ConsumerMetrics::new("dispatcher-test");
        let dispatcher = recording_dispatcher(events, Some(1)).with_metrics(metrics.clone());
        let mut claim = filled_claim(1..=3).await;

        dispatcher.consume_claim(&session, &mut claim).await.unwrap();

        let committed = metrics
            .messages
            .with_label_values(&["orders", OUTCOME_COMMITTED])
            .get();
        let failed = metrics
            .messages
            .with_label_values(&["orders", OUTCOME_FAILED])
            .get();
        assert_eq!((committed, failed), (2, 1));
    }
}
