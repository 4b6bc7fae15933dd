//! Group-membership seam.
//!
//! The consumer never talks to a broker directly. It drives a
//! [`GroupMembership`], which joins the group, hands out one
//! [`PartitionClaim`] per assigned partition and runs a [`ClaimHandler`] for
//! each of them concurrently. [`crate::kafka::KafkaGroup`] implements it on
//! top of librdkafka; [`crate::memory::InMemoryGroup`] is a broker-less
//! implementation for tests and local runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::error::{ConsumerError, ConsumerResult};

/// Topic → assigned partitions.
pub type Assignment = BTreeMap<String, Vec<i32>>;

/// Membership of one consumer in a consumer group.
#[async_trait]
pub trait GroupMembership: Send + Sync + 'static {
    /// Join the group for `topics` and run one session (generation).
    ///
    /// Blocks until the session ends: on rebalance, on error, or when `ctx`
    /// is cancelled. Every claim handler spawned for the session has exited
    /// before this returns. Returns [`ConsumerError::GroupClosed`] once
    /// [`close`](Self::close) has been called.
    async fn consume(
        &self,
        ctx: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
    ) -> ConsumerResult<()>;

    /// Take the fault stream. Yields `Some` at most once.
    ///
    /// Senders never block on this stream; it is closed by
    /// [`close`](Self::close).
    fn take_faults(&self) -> Option<mpsc::UnboundedReceiver<ConsumerError>>;

    /// Leave the group and release client resources.
    async fn close(&self) -> ConsumerResult<()>;
}

/// One generation of group membership.
///
/// `mark_message` may be called from every claim handler of the session
/// concurrently.
pub trait GroupSession: Send + Sync {
    /// Cancelled when the session ends.
    fn context(&self) -> &CancellationToken;

    /// Session number as counted by this member, starting at 1. Not
    /// necessarily the coordinator's generation id.
    fn generation_id(&self) -> i32;

    /// Stable identity of this member. The librdkafka backend reports its
    /// `client.id`, not the member id assigned by the coordinator.
    fn member_id(&self) -> &str;

    /// Partitions currently claimed by this member.
    fn claims(&self) -> Assignment;

    /// Mark `msg` as consumed so the committed position moves past it.
    fn mark_message(&self, msg: &Envelope);
}

/// Callbacks run by a [`GroupMembership`] for each session.
#[async_trait]
pub trait ClaimHandler: Send + Sync {
    /// Runs before any claim is consumed.
    async fn setup(&self, _session: &dyn GroupSession) -> ConsumerResult<()> {
        Ok(())
    }

    /// Runs after every claim handler of the session has exited.
    async fn cleanup(&self, _session: &dyn GroupSession) -> ConsumerResult<()> {
        Ok(())
    }

    /// Consume one claim until its stream closes or the session is cancelled.
    async fn consume_claim(
        &self,
        session: &dyn GroupSession,
        claim: &mut PartitionClaim,
    ) -> ConsumerResult<()>;
}

/// Ownership of one partition's record stream for one session.
///
/// Records arrive in offset order. The stream is closed when the claim is
/// revoked.
#[derive(Debug)]
pub struct PartitionClaim {
    topic: String,
    partition: i32,
    initial_offset: i64,
    messages: mpsc::Receiver<Envelope>,
}

impl PartitionClaim {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        initial_offset: i64,
        messages: mpsc::Receiver<Envelope>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            initial_offset,
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Offset the claim started from.
    pub fn initial_offset(&self) -> i64 {
        self.initial_offset
    }

    /// Next record, or `None` once the claim is revoked.
    pub async fn next(&mut self) -> Option<Envelope> {
        self.messages.recv().await
    }

    /// Offset of the first record delivered to the claim that was never
    /// taken with [`next`](Self::next). Consumes that record.
    pub(crate) fn take_unread_offset(&mut self) -> Option<i64> {
        self.messages.try_recv().ok().map(|msg| msg.offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unread_offset_is_first_record_not_taken() {
        let (tx, rx) = mpsc::channel(4);
        let mut claim = PartitionClaim::new("orders", 1, 10, rx);
        for offset in 10..13 {
            tx.send(Envelope::new("orders", 1, offset, &b"v"[..])).await.unwrap();
        }

        assert_eq!(claim.next().await.map(|msg| msg.offset()), Some(10));
        assert_eq!(claim.take_unread_offset(), Some(11));

        let (_tx, rx) = mpsc::channel(1);
        let mut empty = PartitionClaim::new("orders", 1, 0, rx);
        assert_eq!(empty.take_unread_offset(), None);
    }
}
