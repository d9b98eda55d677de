use chrono::Utc;
use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, SendFailurePolicy};
use crate::error::ProbeError;
use crate::probe::PayloadBuilder;
use crate::state::Aggregator;

/// Live transmit counters (read by the RTCP reporter)
#[derive(Debug, Default)]
pub struct SendCounters {
    pub packets: AtomicU64,
    pub octets: AtomicU64,
    /// RTP timestamp of the most recent voice frame
    pub rtp_timestamp: AtomicU32,
}

impl SendCounters {
    fn add(&self, bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.octets.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Why the sender loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stop requested from outside (signal, caller)
    Requested,
    /// Fixed duration elapsed after ramp-up
    DurationElapsed,
    /// Fixed packet count sent
    CountReached,
    /// A send failed and the policy is to abort
    SendFailed,
}

/// Result of a sender run
#[derive(Debug)]
pub struct SendSummary {
    /// Highest sequence number assigned
    pub last_seq: u64,
    pub send_errors: u64,
    pub reason: StopReason,
    /// Set when the run was aborted by a send failure
    pub failure: Option<ProbeError>,
    /// When the last tick ended
    pub stopped_at: std::time::Instant,
    /// Comfort noise frames sent in place of speech
    pub comfort_noise: u64,
}

/// Effective rate during a linear ramp from `floor` to `target`
pub fn ramp_rate(target: f64, floor: f64, ramp: Option<Duration>, elapsed: Duration) -> f64 {
    let Some(ramp) = ramp.filter(|r| !r.is_zero()) else {
        return target;
    };
    if floor >= target || elapsed >= ramp {
        return target;
    }
    let progress = elapsed.as_secs_f64() / ramp.as_secs_f64();
    floor + (target - floor) * progress
}

/// Paces probes onto the socket
pub struct Sender {
    config: Config,
    socket: Arc<UdpSocket>,
    aggregator: Arc<Aggregator>,
    builder: PayloadBuilder,
    stop: CancellationToken,
    counters: Arc<SendCounters>,
}

impl Sender {
    pub fn new(
        config: Config,
        socket: Arc<UdpSocket>,
        aggregator: Arc<Aggregator>,
        builder: PayloadBuilder,
        stop: CancellationToken,
        counters: Arc<SendCounters>,
    ) -> Self {
        Self {
            config,
            socket,
            aggregator,
            builder,
            stop,
            counters,
        }
    }

    /// Run until stopped, the duration/count is reached, or a fatal send error
    ///
    /// Scheduling is absolute: each send is due one interval after the
    /// previous due time, not after the previous send returned, so slow
    /// sends do not accumulate drift. If the loop falls further behind than
    /// `schedule_reset` it restarts the schedule from now instead of
    /// bursting to catch up.
    pub async fn run(mut self) -> SendSummary {
        let start = Instant::now();
        let run_end = self
            .config
            .duration
            .map(|d| start + self.config.ramp_up.unwrap_or_default() + d);

        let mut seq: u64 = 0;
        let mut send_errors: u64 = 0;
        let mut failure = None;
        let mut next_send = start;

        let reason = loop {
            if let Some(count) = self.config.count
                && seq >= count
            {
                break StopReason::CountReached;
            }

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break StopReason::Requested,
                _ = sleep_until(next_send) => {}
            }

            let now = Instant::now();
            if let Some(end) = run_end
                && now >= end
            {
                break StopReason::DurationElapsed;
            }

            seq += 1;
            let wall_ts = Utc::now().timestamp_micros() as f64 / 1e6;
            let payload = self.builder.build(seq, wall_ts);

            // Account before transmitting so a fast echo always finds its record
            self.aggregator.record_send(seq, now.into_std());
            match self.socket.send_to(&payload, self.config.target) {
                Ok(n) => {
                    self.counters.add(n);
                    if let Some(ts) = self.builder.rtp_timestamp() {
                        self.counters.rtp_timestamp.store(ts, Ordering::Relaxed);
                    }
                }
                Err(source) => {
                    send_errors += 1;
                    self.aggregator.mark_send_failed(seq);
                    error!(
                        seq,
                        target = %self.config.target,
                        errors = send_errors,
                        error = %source,
                        "send failed"
                    );
                    if self.config.send_failure == SendFailurePolicy::Abort {
                        failure = Some(ProbeError::Send {
                            seq,
                            target: self.config.target,
                            source,
                        });
                        break StopReason::SendFailed;
                    }
                }
            }

            let rate = ramp_rate(
                self.config.rate,
                self.config.ramp_floor,
                self.config.ramp_up,
                now.duration_since(start),
            );
            next_send += Duration::from_secs_f64(1.0 / rate);

            let behind = Instant::now().saturating_duration_since(next_send);
            if behind > self.config.schedule_reset {
                warn!(
                    seq,
                    behind_ms = behind.as_millis() as u64,
                    "sender fell behind schedule, resetting"
                );
                next_send = Instant::now();
            }
        };

        let stopped_at = std::time::Instant::now();
        match reason {
            StopReason::Requested => debug!(seq, "sender stopped on request"),
            _ => info!(seq, ?reason, "sender finished"),
        }
        // A self-terminated sender starts the shutdown sequence
        self.stop.cancel();

        SendSummary {
            last_seq: seq,
            send_errors,
            reason,
            failure,
            stopped_at,
            comfort_noise: self.builder.comfort_noise_sent(),
        }
    }
}
