//! Background drain of the group's fault stream.

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::ConsumerError;
use crate::metrics::ConsumerMetrics;

/// Log every fault until the stream is closed.
///
/// Faults are observational only; they never stop the consumer. Returns the
/// number of faults drained.
pub async fn drain_faults(
    mut faults: mpsc::UnboundedReceiver<ConsumerError>,
    metrics: Option<ConsumerMetrics>,
) -> u64 {
    let mut drained = 0;

    while let Some(fault) = faults.recv().await {
        drained += 1;
        if let Some(metrics) = &metrics {
            metrics.faults.inc();
        }
        error!(error = %fault, "Kafka consumer error");
    }

    debug!(drained, "Fault stream closed");
    drained
}
