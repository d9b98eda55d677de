use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SinkError;
use crate::export::SnapshotSink;
use crate::state::{Aggregator, MetricsSnapshot};

/// Publish on the blocking pool so slow sink I/O never stalls the sender
///
/// Hands the sink back with the result; None if the sink panicked.
pub async fn publish_blocking<S>(mut sink: S, snapshot: MetricsSnapshot) -> Option<(S, Result<(), SinkError>)>
where
    S: SnapshotSink + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = sink.publish(&snapshot);
        (sink, result)
    })
    .await
    .ok()
}

/// Periodically writes live snapshots to a sink
///
/// Sink failures are logged and dropped; the publisher never touches probe
/// timing. The sink is handed back when the publisher halts so the final
/// snapshot goes to the same place, unless the sink panicked.
pub struct Publisher<S> {
    aggregator: Arc<Aggregator>,
    sink: S,
    interval: Duration,
    halt: CancellationToken,
    failures: u64,
}

impl<S: SnapshotSink + 'static> Publisher<S> {
    pub fn new(aggregator: Arc<Aggregator>, sink: S, interval: Duration, halt: CancellationToken) -> Self {
        Self {
            aggregator,
            sink,
            interval,
            halt,
            failures: 0,
        }
    }

    pub async fn run(self) -> Option<S> {
        let Self {
            aggregator,
            mut sink,
            interval,
            halt,
            mut failures,
        } = self;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = halt.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = aggregator.snapshot(true);
                    let Some((returned, result)) = publish_blocking(sink, snapshot).await else {
                        warn!("snapshot sink panicked, live publishing stopped");
                        return None;
                    };
                    sink = returned;
                    if let Err(e) = result {
                        failures += 1;
                        debug!(error = %e, failures, "snapshot publish failed");
                    }
                }
            }
        }

        Some(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_publishes_on_cadence_and_returns_sink() {
        let aggregator = Arc::new(Aggregator::new(Config::default()));
        let seen = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&seen);
        let sink = move |_: &MetricsSnapshot| -> Result<(), SinkError> {
            *counter.lock().unwrap() += 1;
            Ok(())
        };

        let halt = CancellationToken::new();
        let publisher = Publisher::new(aggregator, sink, Duration::from_millis(20), halt.clone());
        let handle = tokio::spawn(publisher.run());

        tokio::time::sleep(Duration::from_millis(110)).await;
        halt.cancel();
        let _sink = handle.await.unwrap();
        let published = *seen.lock().unwrap();
        assert!(published >= 3, "published {}", published);
    }

    #[tokio::test]
    async fn test_sink_errors_are_swallowed() {
        let aggregator = Arc::new(Aggregator::new(Config::default()));
        let sink = |_: &MetricsSnapshot| -> Result<(), SinkError> {
            Err(SinkError::Io(std::io::Error::other("disk full")))
        };
        let halt = CancellationToken::new();
        let publisher = Publisher::new(aggregator, sink, Duration::from_millis(10), halt.clone());
        let handle = tokio::spawn(publisher.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        halt.cancel();
        assert!(handle.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_slow_sink_does_not_stall_runtime() {
        let aggregator = Arc::new(Aggregator::new(Config::default()));
        let sink = |_: &MetricsSnapshot| -> Result<(), SinkError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        };
        let halt = CancellationToken::new();
        let publisher = Publisher::new(aggregator, sink, Duration::from_millis(10), halt.clone());
        let handle = tokio::spawn(publisher.run());

        // A timer on the same single-threaded runtime still fires on time
        let begin = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(begin.elapsed() < Duration::from_millis(150), "{:?}", begin.elapsed());

        halt.cancel();
        assert!(handle.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_panicking_sink_is_contained() {
        let aggregator = Arc::new(Aggregator::new(Config::default()));
        let sink = |_: &MetricsSnapshot| -> Result<(), SinkError> { panic!("sink exploded") };
        let halt = CancellationToken::new();
        let publisher = Publisher::new(aggregator, sink, Duration::from_millis(10), halt);
        assert!(publisher.run().await.is_none());
    }
}
