//! Consumer lifecycle: rejoin loop, fault drain and ordered shutdown.

use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::dispatcher::ClaimDispatcher;
use crate::error::ConsumerResult;
use crate::fault::drain_faults;
use crate::group::{ClaimHandler, GroupMembership};
use crate::handler::MessageHandler;
use crate::kafka::KafkaGroup;
use crate::metrics::ConsumerMetrics;

/// Lifecycle of a [`GroupConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Running,
    Closing,
    Closed,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Created => "created",
            ConsumerState::Running => "running",
            ConsumerState::Closing => "closing",
            ConsumerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Consumer-group consumer running one [`MessageHandler`] over its topics.
///
/// ```ignore
/// let mut consumer = GroupConsumer::from_env("KAFKA_", "orders-svc", topics, handler)?;
/// let shutdown = CancellationToken::new();
/// consumer.start(&shutdown);
/// tokio::signal::ctrl_c().await?;
/// consumer.close().await?;
/// ```
pub struct GroupConsumer<G: GroupMembership = KafkaGroup> {
    group: Arc<G>,
    topics: Vec<String>,
    handler: Arc<dyn MessageHandler>,
    metrics: Option<ConsumerMetrics>,
    state: ConsumerState,
    cancel: Option<CancellationToken>,
    tasks: TaskTracker,
    fault_drain: Option<JoinHandle<u64>>,
}

impl<G: GroupMembership> GroupConsumer<G> {
    pub fn new<H>(group: Arc<G>, topics: Vec<String>, handler: H) -> Self
    where
        H: MessageHandler + 'static,
    {
        Self {
            group,
            topics,
            handler: Arc::new(handler),
            metrics: None,
            state: ConsumerState::Created,
            cancel: None,
            tasks: TaskTracker::new(),
            fault_drain: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ConsumerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Background tasks not yet joined: the rejoin loop and the fault drain.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len() + usize::from(self.fault_drain.is_some())
    }

    /// Start the rejoin loop and the fault drain in the background.
    ///
    /// Consumption stops when `parent` is cancelled or on [`close`](Self::close).
    /// Dropping a running consumer cancels it and aborts the fault drain
    /// without closing the group. Must be called from within a Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics unless the consumer is in [`ConsumerState::Created`].
    pub fn start(&mut self, parent: &CancellationToken) {
        assert_eq!(
            self.state,
            ConsumerState::Created,
            "GroupConsumer::start called on a {} consumer",
            self.state
        );

        let ctx = parent.child_token();

        match self.group.take_faults() {
            Some(faults) => {
                self.fault_drain = Some(tokio::spawn(drain_faults(faults, self.metrics.clone())));
            }
            None => warn!("Fault stream already taken, faults will not be logged"),
        }

        let mut dispatcher = ClaimDispatcher::new(self.handler.clone());
        if let Some(metrics) = &self.metrics {
            dispatcher = dispatcher.with_metrics(metrics.clone());
        }

        self.tasks.spawn(rejoin_loop(
            self.group.clone(),
            ctx.clone(),
            self.topics.clone(),
            Arc::new(dispatcher),
            self.metrics.clone(),
        ));
        self.tasks.close();

        self.cancel = Some(ctx);
        self.state = ConsumerState::Running;
        info!(topics = ?self.topics, "Group consumer started");
    }

    /// Stop consuming and release the group.
    ///
    /// Cancels the consumer context, waits for the rejoin loop (and with it
    /// every claim handler), closes the group and finally waits for the fault
    /// stream to be drained. Returns the group's close result.
    ///
    /// # Panics
    ///
    /// Panics unless the consumer is in [`ConsumerState::Running`].
    pub async fn close(&mut self) -> ConsumerResult<()> {
        assert_eq!(
            self.state,
            ConsumerState::Running,
            "GroupConsumer::close called on a {} consumer",
            self.state
        );
        self.state = ConsumerState::Closing;
        info!("Closing group consumer");

        if let Some(ctx) = &self.cancel {
            ctx.cancel();
        }
        self.tasks.wait().await;

        let result = self.group.close().await;
        if let Err(e) = &result {
            error!(error = %e, "Failed to close consumer group");
        }

        if let Some(drain) = self.fault_drain.take() {
            match drain.await {
                Ok(drained) => debug!(drained, "Fault drain finished"),
                Err(e) => error!(error = %e, "Fault drain task failed"),
            }
        }

        self.state = ConsumerState::Closed;
        info!("Group consumer closed");
        result
    }
}

impl<G: GroupMembership> Drop for GroupConsumer<G> {
    fn drop(&mut self) {
        if let Some(ctx) = &self.cancel {
            ctx.cancel();
        }
        if let Some(drain) = self.fault_drain.take() {
            warn!("Group consumer dropped without close, aborting fault drain");
            drain.abort();
        }
    }
}

impl GroupConsumer<KafkaGroup> {
    /// Consumer over a librdkafka group built from `config`.
    pub fn from_config<H>(config: &ConsumerConfig, handler: H) -> ConsumerResult<Self>
    where
        H: MessageHandler + 'static,
    {
        let group = KafkaGroup::new(config)?;
        Ok(Self::new(Arc::new(group), config.topics.clone(), handler))
    }

    /// Consumer configured from `{prefix}*` environment variables, see
    /// [`ConsumerConfig::from_env`].
    pub fn from_env<H>(
        prefix: &str,
        group_id: impl Into<String>,
        topics: Vec<String>,
        handler: H,
    ) -> ConsumerResult<Self>
    where
        H: MessageHandler + 'static,
    {
        let config = ConsumerConfig::from_env(prefix, group_id, topics)?;
        Self::from_config(&config, handler)
    }
}

/// Join sessions until the group is closed or `ctx` is cancelled.
async fn rejoin_loop<G: GroupMembership>(
    group: Arc<G>,
    ctx: CancellationToken,
    topics: Vec<String>,
    dispatcher: Arc<dyn ClaimHandler>,
    metrics: Option<ConsumerMetrics>,
) {
    loop {
        if let Some(metrics) = &metrics {
            metrics.sessions.inc();
        }

        match group.consume(&ctx, &topics, dispatcher.clone()).await {
            Ok(()) => debug!("Group session ended"),
            Err(e) if e.is_terminal() => {
                info!("Consumer group closed, leaving rejoin loop");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Group session failed, rejoining");
                tokio::task::yield_now().await;
            }
        }

        if ctx.is_cancelled() {
            info!("Consumer context cancelled, leaving rejoin loop");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::error::ConsumerError;
    use crate::group::{GroupSession, PartitionClaim};
    use crate::handler::handler_fn;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Group whose sessions fail a fixed number of times before it reports
    /// itself closed.
    struct FlakyGroup {
        attempts: AtomicUsize,
        failures: usize,
        faults: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<ConsumerError>>>,
        faults_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<ConsumerError>>>,
    }

    impl FlakyGroup {
        fn new(failures: usize) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                attempts: AtomicUsize::new(0),
                failures,
                faults: parking_lot::Mutex::new(Some(rx)),
                faults_tx: parking_lot::Mutex::new(Some(tx)),
            }
        }
    }

    #[async_trait]
    impl GroupMembership for FlakyGroup {
        async fn consume(
            &self,
            ctx: &CancellationToken,
            _topics: &[String],
            _handler: Arc<dyn ClaimHandler>,
        ) -> ConsumerResult<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(ConsumerError::Session(format!("attempt {attempt}")));
            }
            ctx.cancelled().await;
            Ok(())
        }

        fn take_faults(&self) -> Option<mpsc::UnboundedReceiver<ConsumerError>> {
            self.faults.lock().take()
        }

        async fn close(&self) -> ConsumerResult<()> {
            self.faults_tx.lock().take();
            Ok(())
        }
    }

    fn noop_handler() -> impl MessageHandler {
        handler_fn(|_ctx, _msg: Envelope| async { Ok(()) })
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let group = Arc::new(FlakyGroup::new(3));
        let metrics = ConsumerMetrics::new("consumer-retry-test");
        let mut consumer = GroupConsumer::new(group.clone(), vec!["orders".to_string()], noop_handler())
            .with_metrics(metrics.clone());

        consumer.start(&CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(2), async {
            while group.attempts.load(Ordering::SeqCst) < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        consumer.close().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Closed);
        assert_eq!(consumer.pending_tasks(), 0);
        assert_eq!(metrics.sessions.get(), 4);
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_rejoin_loop() {
        let group = Arc::new(FlakyGroup::new(0));
        let mut consumer = GroupConsumer::new(group, vec!["orders".to_string()], noop_handler());
        let parent = CancellationToken::new();

        consumer.start(&parent);
        parent.cancel();

        tokio::time::timeout(Duration::from_secs(2), consumer.close())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_drop_without_close_stops_background_tasks() {
        let group = Arc::new(FlakyGroup::new(0));
        let faults = group.faults_tx.lock().clone().unwrap();
        let mut consumer = GroupConsumer::new(group.clone(), vec!["orders".to_string()], noop_handler());
        consumer.start(&CancellationToken::new());
        drop(consumer);

        // the aborted drain drops the fault receiver
        tokio::time::timeout(Duration::from_secs(2), faults.closed())
            .await
            .expect("fault drain should stop on drop");
    }

    #[tokio::test]
    #[should_panic(expected = "GroupConsumer::start called on a running consumer")]
    async fn test_start_twice_panics() {
        let mut consumer =
            GroupConsumer::new(Arc::new(FlakyGroup::new(0)), vec![], noop_handler());
        let parent = CancellationToken::new();
        consumer.start(&parent);
        consumer.start(&parent);
    }

    #[tokio::test]
    #[should_panic(expected = "GroupConsumer::close called on a created consumer")]
    async fn test_close_before_start_panics() {
        let mut consumer =
            GroupConsumer::new(Arc::new(FlakyGroup::new(0)), vec![], noop_handler());
        let _ = consumer.close().await;
    }

    struct Unused;

    #[async_trait]
    impl ClaimHandler for Unused {
        async fn consume_claim(
            &self,
            _session: &dyn GroupSession,
            _claim: &mut PartitionClaim,
        ) -> ConsumerResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rejoin_loop_exits_on_closed_group() {
        struct Closed;
        #[async_trait]
        impl GroupMembership for Closed {
            async fn consume(
                &self,
                _ctx: &CancellationToken,
                _topics: &[String],
                _handler: Arc<dyn ClaimHandler>,
            ) -> ConsumerResult<()> {
                Err(ConsumerError::GroupClosed)
            }

            fn take_faults(&self) -> Option<mpsc::UnboundedReceiver<ConsumerError>> {
                None
            }

            async fn close(&self) -> ConsumerResult<()> {
                Ok(())
            }
        }

        tokio::time::timeout(
            Duration::from_secs(2),
            rejoin_loop(
                Arc::new(Closed),
                CancellationToken::new(),
                vec!["orders".to_string()],
                Arc::new(Unused),
                None,
            ),
        )
        .await
        .expect("rejoin loop should stop on a closed group");
    }
}
