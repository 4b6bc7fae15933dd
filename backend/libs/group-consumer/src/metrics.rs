use prometheus::{IntCounter, IntCounterVec, Opts};
use tracing::warn;

pub const OUTCOME_COMMITTED: &str = "committed";
pub const OUTCOME_FAILED: &str = "failed";

/// Prometheus counters for one consumer.
#[derive(Clone)]
pub struct ConsumerMetrics {
    /// Envelopes handled, by topic and outcome (`committed` | `failed`)
    pub messages: IntCounterVec,
    /// Items drained from the group's fault stream
    pub faults: IntCounter,
    /// Group sessions joined by the rejoin loop
    pub sessions: IntCounter,
}

impl ConsumerMetrics {
    pub fn new(consumer: &str) -> Self {
        let registry = prometheus::default_registry();

        let messages = IntCounterVec::new(
            Opts::new(
                "group_consumer_messages_total",
                "Total number of envelopes dispatched to the handler",
            )
            .const_label("consumer", consumer.to_string()),
            &["topic", "outcome"],
        )
        .expect("valid metric opts for group_consumer_messages_total");

        let faults = IntCounter::with_opts(
            Opts::new(
                "group_consumer_faults_total",
                "Total number of faults reported by the consumer group",
            )
            .const_label("consumer", consumer.to_string()),
        )
        .expect("valid metric opts for group_consumer_faults_total");

        let sessions = IntCounter::with_opts(
            Opts::new(
                "group_consumer_sessions_total",
                "Total number of consumer group sessions joined",
            )
            .const_label("consumer", consumer.to_string()),
        )
        .expect("valid metric opts for group_consumer_sessions_total");

        for metric in [
            Box::new(messages.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(faults.clone()),
            Box::new(sessions.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register group consumer metric: {}", e);
            }
        }

        Self {
            messages,
            faults,
            sessions,
        }
    }

    pub(crate) fn record_message(&self, topic: &str, outcome: &str) {
        self.messages.with_label_values(&[topic, outcome]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_is_tolerated() {
        let first = ConsumerMetrics::new("metrics-dup");
        let second = ConsumerMetrics::new("metrics-dup");

        first.record_message("orders", OUTCOME_COMMITTED);
        second.record_message("orders", OUTCOME_FAILED);

        assert_eq!(
            first
                .messages
                .with_label_values(&["orders", OUTCOME_COMMITTED])
                .get(),
            1
        );
        assert_eq!(
            second
                .messages
                .with_label_values(&["orders", OUTCOME_FAILED])
                .get(),
            1
        );
    }
}
