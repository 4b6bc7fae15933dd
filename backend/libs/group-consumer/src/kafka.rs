//! Group membership backed by librdkafka.
//!
//! Auto-commit is on and auto offset store is off: only offsets stored through
//! [`GroupSession::mark_message`] are ever committed. A revocation ends the
//! running session so the rejoin loop starts the next generation with fresh
//! claims; partitions kept across the rebalance are rewound to the first
//! record their claim never received.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::envelope::{Envelope, Header};
use crate::error::{ConsumerError, ConsumerResult};
use crate::group::{Assignment, ClaimHandler, GroupMembership, GroupSession, PartitionClaim};

/// Client context forwarding client errors to the fault stream and
/// signalling revocations.
pub struct GroupContext {
    faults: Mutex<Option<mpsc::UnboundedSender<ConsumerError>>>,
    revocations: watch::Sender<u64>,
}

impl GroupContext {
    fn new(faults: mpsc::UnboundedSender<ConsumerError>) -> Self {
        let (revocations, _) = watch::channel(0);
        Self {
            faults: Mutex::new(Some(faults)),
            revocations,
        }
    }

    fn report(&self, fault: ConsumerError) {
        match self.faults.lock().as_ref() {
            Some(tx) => {
                let _ = tx.send(fault);
            }
            None => debug!(error = %fault, "Fault after close dropped"),
        }
    }

    fn close_faults(&self) {
        self.faults.lock().take();
    }
}

impl ClientContext for GroupContext {
    fn error(&self, error: KafkaError, reason: &str) {
        self.report(ConsumerError::Session(format!("{}: {}", error, reason)));
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                info!(partitions = tpl.count(), "Partitions revoked");
                self.revocations.send_modify(|count| *count += 1);
            }
            Rebalance::Assign(tpl) => {
                info!(partitions = tpl.count(), "Partitions assigned");
            }
            Rebalance::Error(e) => {
                self.report(ConsumerError::Session(format!("rebalance failed: {}", e)));
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "Offsets committed"),
            Err(e) if is_no_offset(&e) => {}
            Err(e) => self.report(ConsumerError::Kafka(e)),
        }
    }
}

/// Commit with nothing stored since the last commit.
fn is_no_offset(error: &KafkaError) -> bool {
    matches!(
        error,
        KafkaError::ConsumerCommit(rdkafka::types::RDKafkaErrorCode::NoOffset)
    )
}

type GroupConsumerClient = StreamConsumer<GroupContext>;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// librdkafka client configuration for `config`.
pub fn client_config(config: &ConsumerConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("group.id", &config.group_id)
        .set("client.id", &config.client_id)
        .set("broker.version.fallback", &config.version)
        .set("auto.offset.reset", config.initial_offset.auto_offset_reset())
        .set(
            "partition.assignment.strategy",
            config.rebalance_strategy.assignment_strategy(),
        )
        .set(
            "heartbeat.interval.ms",
            config.heartbeat_interval_ms.to_string(),
        )
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set(
            "max.poll.interval.ms",
            config.rebalance_timeout_ms.to_string(),
        )
        .set("enable.auto.commit", "true")
        .set(
            "auto.commit.interval.ms",
            config.auto_commit_interval_ms.to_string(),
        )
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false")
        .set(
            "socket.connection.setup.timeout.ms",
            config.net.dial_timeout_ms.to_string(),
        )
        .set(
            "socket.timeout.ms",
            config
                .net
                .read_timeout_ms
                .max(config.net.write_timeout_ms)
                .to_string(),
        );

    let protocol = match (config.tls.is_some(), config.sasl.is_some()) {
        (true, true) => "sasl_ssl",
        (false, true) => "sasl_plaintext",
        (true, false) => "ssl",
        (false, false) => "plaintext",
    };
    client.set("security.protocol", protocol);

    if let Some(tls) = &config.tls {
        if tls.insecure_skip_verify {
            client
                .set("enable.ssl.certificate.verification", "false")
                .set("ssl.endpoint.identification.algorithm", "none");
        }
    }

    if let Some(sasl) = &config.sasl {
        use secrecy::ExposeSecret;
        client
            .set("sasl.mechanism", "PLAIN")
            .set("sasl.username", &sasl.username)
            .set("sasl.password", sasl.password.expose_secret());
    }

    client
}

/// Consumer group membership on a librdkafka consumer.
pub struct KafkaGroup {
    consumer: Arc<GroupConsumerClient>,
    client_id: String,
    channel_buffer_size: usize,
    subscribed: Mutex<Vec<String>>,
    generation: AtomicI32,
    faults: Mutex<Option<mpsc::UnboundedReceiver<ConsumerError>>>,
    closed: CancellationToken,
}

impl KafkaGroup {
    pub fn new(config: &ConsumerConfig) -> ConsumerResult<Self> {
        config.ensure_valid()?;

        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let consumer: GroupConsumerClient =
            client_config(config).create_with_context(GroupContext::new(faults_tx))?;

        info!(
            brokers = %config.bootstrap_servers(),
            group_id = %config.group_id,
            client_id = %config.client_id,
            "Kafka consumer group client created"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            client_id: config.client_id.clone(),
            channel_buffer_size: config.channel_buffer_size,
            subscribed: Mutex::new(Vec::new()),
            generation: AtomicI32::new(0),
            faults: Mutex::new(Some(faults_rx)),
            closed: CancellationToken::new(),
        })
    }

    fn ensure_subscribed(&self, topics: &[String]) -> ConsumerResult<()> {
        let mut subscribed = self.subscribed.lock();
        if subscribed.as_slice() != topics {
            let names: Vec<&str> = topics.iter().map(String::as_str).collect();
            self.consumer.subscribe(&names)?;
            info!(topics = ?topics, "Subscribed to topics");
            *subscribed = topics.to_vec();
        }
        Ok(())
    }
}

struct KafkaSession {
    ctx: CancellationToken,
    /// Local session counter; librdkafka does not expose the group generation
    session_number: i32,
    client_id: String,
    consumer: Arc<GroupConsumerClient>,
}

impl GroupSession for KafkaSession {
    fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    fn generation_id(&self) -> i32 {
        self.session_number
    }

    fn member_id(&self) -> &str {
        &self.client_id
    }

    fn claims(&self) -> Assignment {
        let mut assignment = Assignment::new();
        if let Ok(tpl) = self.consumer.assignment() {
            for elem in tpl.elements() {
                assignment
                    .entry(elem.topic().to_string())
                    .or_default()
                    .push(elem.partition());
            }
        }
        assignment
    }

    fn mark_message(&self, msg: &Envelope) {
        // committed position is the next offset to read
        if let Err(e) = self
            .consumer
            .store_offset(msg.topic(), msg.partition(), msg.offset() + 1)
        {
            warn!(
                topic = %msg.topic(),
                partition = msg.partition(),
                offset = msg.offset(),
                error = %e,
                "Failed to store offset"
            );
        }
    }
}

#[async_trait]
impl GroupMembership for KafkaGroup {
    async fn consume(
        &self,
        ctx: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
    ) -> ConsumerResult<()> {
        if self.closed.is_cancelled() {
            return Err(ConsumerError::GroupClosed);
        }
        self.ensure_subscribed(topics)?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut revocations = self.consumer.context().revocations.subscribe();
        let session_ctx = ctx.child_token();
        let session = Arc::new(KafkaSession {
            ctx: session_ctx.clone(),
            session_number: generation,
            client_id: self.client_id.clone(),
            consumer: self.consumer.clone(),
        });

        handler.setup(&*session).await?;

        let mut claims: HashMap<(String, i32), mpsc::Sender<Envelope>> = HashMap::new();
        let mut dispatchers = JoinSet::new();
        let mut undispatched = Undispatched::default();

        loop {
            let msg = tokio::select! {
                biased;
                _ = session_ctx.cancelled() => break,
                _ = self.closed.cancelled() => break,
                _ = revocations.changed() => {
                    info!(generation, "Assignment revoked, ending session");
                    break;
                }
                Some(joined) = dispatchers.join_next(), if !dispatchers.is_empty() => {
                    undispatched.claim_exited(joined);
                    continue;
                }
                received = self.consumer.recv() => match received {
                    Ok(msg) => envelope_from(&msg),
                    Err(e) => {
                        self.consumer.context().report(ConsumerError::Kafka(e));
                        continue;
                    }
                },
            };

            let (topic, partition, offset) = (msg.topic().to_string(), msg.partition(), msg.offset());
            let tx = claims.entry((topic.clone(), partition)).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.channel_buffer_size);
                let handler = handler.clone();
                let session = session.clone();
                let mut claim = PartitionClaim::new(topic.as_str(), partition, offset, rx);
                dispatchers.spawn(async move {
                    let result = handler.consume_claim(&*session, &mut claim).await;
                    (claim, result)
                });
                tx
            });

            // callbacks only run while polling, so a full claim stalls rebalances
            tokio::select! {
                biased;
                _ = session_ctx.cancelled() => {
                    undispatched.note(&topic, partition, offset);
                    break;
                }
                _ = self.closed.cancelled() => {
                    undispatched.note(&topic, partition, offset);
                    break;
                }
                sent = tx.send(msg) => {
                    if sent.is_err() {
                        debug!(%topic, partition, offset, "Claim handler gone, record held back");
                        undispatched.note(&topic, partition, offset);
                    }
                }
            }
        }

        session_ctx.cancel();
        drop(claims);
        while let Some(joined) = dispatchers.join_next().await {
            undispatched.claim_exited(joined);
        }
        self.rewind(undispatched);

        if let Err(e) = handler.cleanup(&*session).await {
            warn!(generation, error = %e, "Session cleanup failed");
        }

        Ok(())
    }

    fn take_faults(&self) -> Option<mpsc::UnboundedReceiver<ConsumerError>> {
        self.faults.lock().take()
    }

    async fn close(&self) -> ConsumerResult<()> {
        self.closed.cancel();

        let mut result = Ok(());
        let subscribed = !self.subscribed.lock().is_empty();
        if subscribed {
            // nothing polls after close, so flush marked offsets here
            result = self.commit_marked().await;
            self.consumer.unsubscribe();
        }

        self.consumer.context().close_faults();
        info!("Kafka consumer group closed");
        result
    }
}

type ClaimExit = Result<(PartitionClaim, ConsumerResult<()>), tokio::task::JoinError>;

/// First offset per partition that was fetched but never handed to a claim
/// handler during the session.
#[derive(Debug, Default)]
struct Undispatched(HashMap<(String, i32), i64>);

impl Undispatched {
    fn note(&mut self, topic: &str, partition: i32, offset: i64) {
        self.0
            .entry((topic.to_string(), partition))
            .and_modify(|first| *first = (*first).min(offset))
            .or_insert(offset);
    }

    fn claim_exited(&mut self, joined: ClaimExit) {
        match joined {
            Ok((mut claim, result)) => {
                if let Err(e) = result {
                    warn!(
                        topic = %claim.topic(),
                        partition = claim.partition(),
                        error = %e,
                        "Claim handler returned an error"
                    );
                }
                if let Some(offset) = claim.take_unread_offset() {
                    self.note(claim.topic(), claim.partition(), offset);
                }
            }
            Err(e) => error!(error = %e, "Claim handler task failed"),
        }
    }
}

impl KafkaGroup {
    /// Synchronously commit every offset stored through `mark_message`.
    async fn commit_marked(&self) -> ConsumerResult<()> {
        let consumer = self.consumer.clone();
        let committed =
            tokio::task::spawn_blocking(move || consumer.commit_consumer_state(CommitMode::Sync))
                .await
                .map_err(|e| ConsumerError::Session(format!("final commit task failed: {}", e)))?;

        match committed {
            Ok(()) => {
                debug!("Marked offsets committed on close");
                Ok(())
            }
            Err(e) if is_no_offset(&e) => Ok(()),
            Err(e) => {
                error!(error = %e, "Failed to commit marked offsets on close");
                Err(e.into())
            }
        }
    }

    /// Seek partitions still assigned back to their first undispatched
    /// record. The fetch position of a partition kept across an incremental
    /// rebalance is otherwise already past the records dropped with the
    /// session's claims.
    fn rewind(&self, undispatched: Undispatched) {
        if undispatched.0.is_empty() {
            return;
        }
        let assignment = match self.consumer.assignment() {
            Ok(assignment) => assignment,
            Err(e) => {
                warn!(error = %e, "Failed to read assignment, fetch positions not rewound");
                return;
            }
        };

        for ((topic, partition), offset) in undispatched.0 {
            if assignment.find_partition(&topic, partition).is_none() {
                // the next owner resumes from the committed offset
                continue;
            }
            match self
                .consumer
                .seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
            {
                Ok(()) => debug!(%topic, partition, offset, "Rewound retained partition"),
                Err(e) => {
                    warn!(%topic, partition, offset, error = %e, "Failed to rewind partition");
                    self.consumer.context().report(ConsumerError::Kafka(e));
                }
            }
        }
    }
}

/// Copy a received record into an owned [`Envelope`].
pub fn envelope_from<M: Message>(msg: &M) -> Envelope {
    let headers = msg
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    Header::new(
                        header.key,
                        header.value.map(Bytes::copy_from_slice).unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    let mut envelope = Envelope::new(
        msg.topic(),
        msg.partition(),
        msg.offset(),
        Bytes::copy_from_slice(msg.payload().unwrap_or_default()),
    )
    .with_headers(headers);

    if let Some(key) = msg.key() {
        envelope = envelope.with_key(Bytes::copy_from_slice(key));
    }
    if let Some(timestamp) = msg
        .timestamp()
        .to_millis()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
    {
        envelope = envelope.with_timestamp(timestamp);
    }

    envelope
}
