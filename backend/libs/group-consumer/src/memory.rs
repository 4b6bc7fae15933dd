//! Broker-less group membership.
//!
//! [`InMemoryGroup`] keeps per-partition logs in memory and behaves like a
//! single-member consumer group: every partition of a subscribed topic is
//! claimed, sessions end on [`rebalance`](InMemoryGroup::rebalance), and a new
//! session resumes each partition right after its committed offset.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::InitialOffset;
use crate::envelope::{Envelope, Header};
use crate::error::{ConsumerError, ConsumerResult};
use crate::group::{Assignment, ClaimHandler, GroupMembership, GroupSession, PartitionClaim};

const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 256;

type PartitionKey = (String, i32);

#[derive(Default)]
struct PartitionLog {
    records: Vec<Envelope>,
    /// Highest marked offset
    committed: Option<i64>,
    marked: Vec<i64>,
}

struct GroupState {
    logs: BTreeMap<PartitionKey, PartitionLog>,
    generation: i32,
    rebalance: CancellationToken,
}

impl GroupState {
    /// A partition appeared; the running session has to rejoin to claim it.
    fn partitions_changed(&self) {
        if !self.rebalance.is_cancelled() {
            debug!(generation = self.generation, "Partitions added, rebalancing");
        }
        self.rebalance.cancel();
    }
}

struct Shared {
    member_id: String,
    initial_offset: InitialOffset,
    channel_buffer_size: usize,
    state: Mutex<GroupState>,
    /// Bumped on every append
    appended: watch::Sender<u64>,
    closed: CancellationToken,
    faults_tx: Mutex<Option<mpsc::UnboundedSender<ConsumerError>>>,
    faults_rx: Mutex<Option<mpsc::UnboundedReceiver<ConsumerError>>>,
    active_claims: AtomicUsize,
}

impl Shared {
    fn pending(&self, key: &PartitionKey, from: i64) -> Vec<Envelope> {
        let state = self.state.lock();
        state
            .logs
            .get(key)
            .map(|log| {
                log.records
                    .iter()
                    .skip(from.max(0) as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-memory consumer group with a single member.
#[derive(Clone)]
pub struct InMemoryGroup {
    shared: Arc<Shared>,
}

impl InMemoryGroup {
    pub fn new(initial_offset: InitialOffset) -> Self {
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let (appended, _) = watch::channel(0);

        Self {
            shared: Arc::new(Shared {
                member_id: "in-memory-member".to_string(),
                initial_offset,
                channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
                state: Mutex::new(GroupState {
                    logs: BTreeMap::new(),
                    generation: 0,
                    rebalance: CancellationToken::new(),
                }),
                appended,
                closed: CancellationToken::new(),
                faults_tx: Mutex::new(Some(faults_tx)),
                faults_rx: Mutex::new(Some(faults_rx)),
                active_claims: AtomicUsize::new(0),
            }),
        }
    }

    /// Create empty partitions `0..partitions` for `topic`. Adding partitions
    /// rebalances the group.
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut state = self.shared.state.lock();
        let mut added = false;
        for partition in 0..partitions {
            let key = (topic.to_string(), partition);
            if !state.logs.contains_key(&key) {
                state.logs.insert(key, PartitionLog::default());
                added = true;
            }
        }
        if added {
            state.partitions_changed();
        }
    }

    /// Append a record and return its offset. Offsets start at 0.
    pub fn append(&self, topic: &str, partition: i32, value: impl Into<Bytes>) -> i64 {
        self.append_record(topic, partition, None, Vec::new(), value.into())
    }

    pub fn append_keyed(
        &self,
        topic: &str,
        partition: i32,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> i64 {
        self.append_record(topic, partition, Some(key.into()), Vec::new(), value.into())
    }

    pub fn append_record(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        headers: Vec<Header>,
        value: Bytes,
    ) -> i64 {
        let offset = {
            let mut state = self.shared.state.lock();
            let log_key = (topic.to_string(), partition);
            if !state.logs.contains_key(&log_key) {
                state.logs.insert(log_key.clone(), PartitionLog::default());
                state.partitions_changed();
            }
            let log = state.logs.entry(log_key).or_default();
            let offset = log.records.len() as i64;

            let mut envelope = Envelope::new(topic, partition, offset, value)
                .with_headers(headers)
                .with_timestamp(Utc::now());
            if let Some(key) = key {
                envelope = envelope.with_key(key);
            }
            log.records.push(envelope);
            offset
        };

        self.shared.appended.send_modify(|version| *version += 1);
        offset
    }

    /// End the current session; the rejoin loop starts a new generation.
    ///
    /// Between sessions this is a no-op: the next join already starts a new
    /// generation and resolves the partitions as they are at that point.
    pub fn rebalance(&self) {
        let state = self.shared.state.lock();
        state.rebalance.cancel();
    }

    /// Publish a fault on the fault stream. Dropped once the group is closed.
    pub fn inject_fault(&self, fault: ConsumerError) {
        if let Some(tx) = self.shared.faults_tx.lock().as_ref() {
            let _ = tx.send(fault);
        }
    }

    /// Highest offset marked for the partition.
    pub fn committed_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        let state = self.shared.state.lock();
        state
            .logs
            .get(&(topic.to_string(), partition))
            .and_then(|log| log.committed)
    }

    /// Every offset marked for the partition, in marking order.
    pub fn marked_offsets(&self, topic: &str, partition: i32) -> Vec<i64> {
        let state = self.shared.state.lock();
        state
            .logs
            .get(&(topic.to_string(), partition))
            .map(|log| log.marked.clone())
            .unwrap_or_default()
    }

    /// Generation of the latest session.
    pub fn generation(&self) -> i32 {
        self.shared.state.lock().generation
    }

    /// Claim handlers currently running.
    pub fn active_claims(&self) -> usize {
        self.shared.active_claims.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Start a new generation and resolve the starting offset of every
    /// partition of `topics`.
    fn join(&self, topics: &[String]) -> (i32, CancellationToken, Vec<(PartitionKey, i64)>) {
        let mut state = self.shared.state.lock();
        state.generation += 1;
        state.rebalance = CancellationToken::new();

        let initial_offset = self.shared.initial_offset;
        let positions = state
            .logs
            .iter()
            .filter(|((topic, _), _)| topics.contains(topic))
            .map(|(key, log)| {
                let start = match (log.committed, initial_offset) {
                    (Some(committed), _) => committed + 1,
                    (None, InitialOffset::Oldest) => 0,
                    (None, InitialOffset::Newest) => log.records.len() as i64,
                };
                (key.clone(), start)
            })
            .collect();

        (state.generation, state.rebalance.clone(), positions)
    }
}

impl Default for InMemoryGroup {
    fn default() -> Self {
        Self::new(InitialOffset::Oldest)
    }
}

struct MemorySession {
    ctx: CancellationToken,
    generation: i32,
    assignment: Assignment,
    shared: Arc<Shared>,
}

impl GroupSession for MemorySession {
    fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    fn generation_id(&self) -> i32 {
        self.generation
    }

    fn member_id(&self) -> &str {
        &self.shared.member_id
    }

    fn claims(&self) -> Assignment {
        self.assignment.clone()
    }

    fn mark_message(&self, msg: &Envelope) {
        let mut state = self.shared.state.lock();
        if let Some(log) = state
            .logs
            .get_mut(&(msg.topic().to_string(), msg.partition()))
        {
            log.marked.push(msg.offset());
            log.committed = Some(log.committed.map_or(msg.offset(), |c| c.max(msg.offset())));
        }
    }
}

#[async_trait]
impl GroupMembership for InMemoryGroup {
    async fn consume(
        &self,
        ctx: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
    ) -> ConsumerResult<()> {
        if self.shared.closed.is_cancelled() {
            return Err(ConsumerError::GroupClosed);
        }

        let (generation, rebalance, positions) = self.join(topics);

        let mut assignment = Assignment::new();
        for ((topic, partition), _) in &positions {
            assignment.entry(topic.clone()).or_default().push(*partition);
        }

        let session_ctx = ctx.child_token();
        let session = Arc::new(MemorySession {
            ctx: session_ctx.clone(),
            generation,
            assignment,
            shared: self.shared.clone(),
        });

        handler.setup(&*session).await?;

        let mut feeders = JoinSet::new();
        let mut claims = JoinSet::new();
        for ((topic, partition), start) in positions {
            let (tx, rx) = mpsc::channel(self.shared.channel_buffer_size);
            feeders.spawn(feed_partition(
                self.shared.clone(),
                (topic.clone(), partition),
                start,
                tx,
                session_ctx.clone(),
            ));

            let handler = handler.clone();
            let session = session.clone();
            let shared = self.shared.clone();
            claims.spawn(async move {
                let mut claim = PartitionClaim::new(topic, partition, start, rx);
                shared.active_claims.fetch_add(1, Ordering::SeqCst);
                let result = handler.consume_claim(&*session, &mut claim).await;
                shared.active_claims.fetch_sub(1, Ordering::SeqCst);
                result
            });
        }

        loop {
            tokio::select! {
                biased;
                _ = session_ctx.cancelled() => break,
                _ = rebalance.cancelled() => {
                    info!(generation, "Rebalance requested, ending session");
                    break;
                }
                _ = self.shared.closed.cancelled() => break,
                Some(joined) = claims.join_next(), if !claims.is_empty() => {
                    log_claim_exit(joined);
                }
            }
        }

        session_ctx.cancel();
        while let Some(joined) = claims.join_next().await {
            log_claim_exit(joined);
        }
        while feeders.join_next().await.is_some() {}

        if let Err(e) = handler.cleanup(&*session).await {
            warn!(generation, error = %e, "Session cleanup failed");
        }

        Ok(())
    }

    fn take_faults(&self) -> Option<mpsc::UnboundedReceiver<ConsumerError>> {
        self.shared.faults_rx.lock().take()
    }

    async fn close(&self) -> ConsumerResult<()> {
        self.shared.closed.cancel();
        self.shared.faults_tx.lock().take();
        debug!("In-memory group closed");
        Ok(())
    }
}

fn log_claim_exit(joined: Result<ConsumerResult<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Claim handler returned an error"),
        Err(e) => error!(error = %e, "Claim handler task failed"),
    }
}

/// Push records of one partition into its claim, in offset order, until the
/// session ends.
async fn feed_partition(
    shared: Arc<Shared>,
    key: PartitionKey,
    mut next: i64,
    tx: mpsc::Sender<Envelope>,
    ctx: CancellationToken,
) {
    let mut appended = shared.appended.subscribe();

    loop {
        appended.borrow_and_update();
        let pending = shared.pending(&key, next);

        if pending.is_empty() {
            tokio::select! {
                _ = ctx.cancelled() => return,
                changed = appended.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            continue;
        }

        for msg in pending {
            next = msg.offset() + 1;
            tokio::select! {
                _ = ctx.cancelled() => return,
                sent = tx.send(msg) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
