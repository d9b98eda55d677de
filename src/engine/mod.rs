//! Probe run orchestration.
//!
//! A run is four flows sharing one socket and one [`Aggregator`]: the
//! sender task, the receiver thread, the snapshot publisher task and (voice
//! with RTCP) the sender report task. Two tokens drive shutdown: `stop`
//! ends the sender, `halt` ends the receiver and publisher once the grace
//! period has passed.

pub mod publisher;
pub mod receiver;
pub mod reporter;
pub mod sender;
pub mod shutdown;

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ProbeError, Result};
use crate::export::{SnapshotSink, format_missed};
use crate::probe::{PayloadBuilder, create_probe_socket};
use crate::state::{Aggregator, MetricsSnapshot};

pub use publisher::{Publisher, publish_blocking};
pub use receiver::{Receiver, ReceiverStats, spawn_receiver};
pub use sender::{SendCounters, SendSummary, Sender, StopReason};

/// Cooperative cancellation for one run
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    stop: CancellationToken,
    halt: CancellationToken,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to wind down (idempotent)
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Token cancelled when a stop is requested
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

/// Everything a finished run reports
#[derive(Debug)]
pub struct RunOutcome {
    pub snapshot: MetricsSnapshot,
    pub missed: Vec<u64>,
    pub reason: StopReason,
    pub receiver: ReceiverStats,
    pub rtcp_reports: u64,
    /// Fatal send failure that ended the run early
    pub failure: Option<ProbeError>,
    /// Receiver failure; the counts stop at the moment it gave up
    pub receiver_error: Option<ProbeError>,
    /// Comfort noise frames sent during simulated silence
    pub comfort_noise: u64,
}

impl RunOutcome {
    /// True when the run ended cleanly and every flow finished
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.receiver_error.is_none()
    }
}

/// One configured probe run, bound to its socket
pub struct ProbeRun {
    config: Config,
    socket: Arc<UdpSocket>,
    aggregator: Arc<Aggregator>,
    builder: PayloadBuilder,
    control: RunControl,
}

impl ProbeRun {
    /// Bind the probe socket for `config`
    pub fn new(config: Config) -> Result<Self> {
        let socket = create_probe_socket(&config)?;
        let builder = PayloadBuilder::new(&config);
        Ok(Self::with_parts(config, socket, builder))
    }

    /// Assemble a run from an already bound socket and payload builder
    pub fn with_parts(config: Config, socket: UdpSocket, builder: PayloadBuilder) -> Self {
        Self {
            aggregator: Arc::new(Aggregator::new(config.clone())),
            config,
            socket: Arc::new(socket),
            builder,
            control: RunControl::new(),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(ProbeError::Socket)
    }

    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn aggregator(&self) -> Arc<Aggregator> {
        Arc::clone(&self.aggregator)
    }

    /// Run to completion, publishing live snapshots to `sink`
    ///
    /// Returns once the final snapshot has been taken and published. Flow
    /// failures are reported in the outcome; the final snapshot is still
    /// taken and published.
    pub async fn run<S>(self, sink: S) -> Result<RunOutcome>
    where
        S: SnapshotSink + 'static,
    {
        let Self {
            config,
            socket,
            aggregator,
            builder,
            control,
        } = self;

        if let Ok(local) = socket.local_addr() {
            debug!(%local, target = %config.target, "probe socket bound");
        }
        let ssrc = builder.ssrc();
        aggregator.begin_run();
        // Early returns must not leave the receiver thread or publisher running
        let _halt_on_exit = control.halt.clone().drop_guard();

        let receiver = Receiver::new(
            Arc::clone(&socket),
            Arc::clone(&aggregator),
            config.mode,
            control.halt.clone(),
            config.shutdown.poll_window + config.recv_timeout,
        )
        .with_ssrc(ssrc);
        let receiver_handle = spawn_receiver(receiver);

        let publisher = Publisher::new(
            Arc::clone(&aggregator),
            sink,
            config.snapshot_interval,
            control.halt.clone(),
        );
        let publisher_handle = tokio::spawn(publisher.run());

        let counters = Arc::new(SendCounters::default());
        let rtcp_handle = match (config.voice.as_ref(), ssrc) {
            (Some(voice), Some(ssrc)) if voice.rtcp => Some(tokio::spawn(
                reporter::run_rtcp_reporter(
                    Arc::clone(&socket),
                    config.target,
                    ssrc,
                    Arc::clone(&counters),
                    control.stop.clone(),
                ),
            )),
            _ => None,
        };

        let sender = Sender::new(
            config.clone(),
            Arc::clone(&socket),
            Arc::clone(&aggregator),
            builder,
            control.stop.clone(),
            counters,
        );
        let sender_handle = tokio::spawn(sender.run());

        // running -> draining; the sender returns once stop is requested
        let summary = match sender_handle.await {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "sender task failed");
                control.stop.cancel();
                SendSummary {
                    last_seq: aggregator.highest_seq(),
                    send_errors: aggregator.send_failures(),
                    reason: StopReason::SendFailed,
                    failure: Some(ProbeError::Task("sender", e.to_string())),
                    stopped_at: Instant::now(),
                    comfort_noise: 0,
                }
            }
        };
        aggregator.begin_drain(summary.stopped_at);

        let grace = shutdown::grace_period(aggregator.avg_rtt(), config.rate, &config.shutdown);
        debug!(grace_ms = grace.as_millis() as u64, "waiting for in-flight echoes");
        tokio::time::sleep(grace).await;

        control.halt.cancel();
        let received = shutdown::wait_for_quiet(&aggregator, &config.shutdown).await;
        debug!(received, "receive count settled");

        let (receiver_stats, receiver_error) = join_receiver(receiver_handle).await;

        let sink = match publisher_handle.await {
            Ok(sink) => sink,
            Err(e) => {
                warn!(error = %e, "publisher task failed");
                None
            }
        };
        let rtcp_reports = match rtcp_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => 0,
        };

        let snapshot = conclude(&aggregator, sink).await;

        let missed = aggregator.missed_sequences();
        if !missed.is_empty() {
            info!(count = missed.len(), missed = %format_missed(&missed), "missed sequences");
        }
        info!(
            id = %snapshot.test_id,
            sent = snapshot.sent,
            received = snapshot.received,
            loss_pct = snapshot.loss_pct,
            max_blackout_ms = snapshot.max_blackout_ms,
            sync_lost = snapshot.sync_lost,
            comfort_noise = summary.comfort_noise,
            "probe run finished"
        );

        Ok(RunOutcome {
            snapshot,
            missed,
            reason: summary.reason,
            receiver: receiver_stats,
            rtcp_reports,
            failure: summary.failure,
            receiver_error,
            comfort_noise: summary.comfort_noise,
        })
    }
}

/// Wait for the receiver thread; a failed receiver is reported, not propagated
async fn join_receiver(
    handle: std::thread::JoinHandle<Result<ReceiverStats>>,
) -> (ReceiverStats, Option<ProbeError>) {
    let joined = tokio::task::spawn_blocking(move || handle.join()).await;
    let (stats, failure) = match joined {
        Ok(Ok(Ok(stats))) => (stats, None),
        Ok(Ok(Err(e))) => (ReceiverStats::default(), Some(e)),
        Ok(Err(_)) => (
            ReceiverStats::default(),
            Some(ProbeError::Task("receiver", "thread panicked".to_string())),
        ),
        Err(e) => (ReceiverStats::default(), Some(ProbeError::Task("receiver", e.to_string()))),
    };
    if let Some(e) = &failure {
        error!(error = %e, "receiver failed, final counts are incomplete");
    }
    (stats, failure)
}

/// draining -> stopped: take the final snapshot and hand it to the sink
async fn conclude<S>(aggregator: &Aggregator, sink: Option<S>) -> MetricsSnapshot
where
    S: SnapshotSink + 'static,
{
    aggregator.finish();
    let snapshot = aggregator.snapshot(false);
    match sink {
        Some(sink) => match publish_blocking(sink, snapshot.clone()).await {
            Some((_, Err(e))) => warn!(error = %e, "final snapshot could not be written"),
            Some((_, Ok(()))) => {}
            None => warn!("snapshot sink panicked on the final snapshot"),
        },
        None => warn!("snapshot sink unavailable, final snapshot not written"),
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::export::NullSink;
    use crate::state::RunStatus;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_failed_receiver_still_gets_final_snapshot() {
        let aggregator = Aggregator::new(Config::default());
        aggregator.begin_run();
        let now = Instant::now();
        for seq in 1..=4 {
            aggregator.record_send(seq, now);
        }
        aggregator.record_receive(1, 1, now);
        aggregator.begin_drain(now);

        let handle = std::thread::spawn(|| -> Result<ReceiverStats> {
            Err(ProbeError::Task("receiver", "50 consecutive errors".to_string()))
        });
        let (stats, failure) = join_receiver(handle).await;
        assert_eq!(stats, ReceiverStats::default());
        assert!(matches!(failure, Some(ProbeError::Task("receiver", _))));

        let written = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&written);
        let sink = move |s: &MetricsSnapshot| -> std::result::Result<(), SinkError> {
            seen.lock().unwrap().push(s.clone());
            Ok(())
        };
        let snapshot = conclude(&aggregator, Some(sink)).await;

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0], snapshot);
        assert_eq!(snapshot.status, RunStatus::Stopped);
        assert_eq!(snapshot.sent, 4);
        assert_eq!(snapshot.received, 1);
    }

    #[tokio::test]
    async fn test_panicked_receiver_is_reported() {
        let handle = std::thread::spawn(|| -> Result<ReceiverStats> { panic!("boom") });
        let (_, failure) = join_receiver(handle).await;
        assert!(failure.unwrap().to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn test_conclude_without_sink_still_snapshots() {
        let aggregator = Aggregator::new(Config::default());
        let snapshot = conclude::<NullSink>(&aggregator, None).await;
        assert_eq!(snapshot.status, RunStatus::Stopped);
        assert_eq!(aggregator.state(), crate::state::RunState::Stopped);
    }
}
