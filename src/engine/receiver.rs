use std::io;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ProbeMode;
use crate::error::ProbeError;
use crate::probe::{extend_rtp_sequence, is_timeout, parse_echo};
use crate::state::Aggregator;

/// Maximum consecutive errors before stopping the receiver
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

/// Largest datagram we expect back (jumbo-safe)
const RECV_BUFFER_LEN: usize = 9000;

/// Counters reported when the receiver exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub datagrams: u64,
    pub accepted: u64,
    pub malformed: u64,
    /// Duplicate echoes and echoes for unknown sequences
    pub ignored: u64,
}

/// Reads echoes off the probe socket and feeds the aggregator
pub struct Receiver {
    socket: Arc<UdpSocket>,
    aggregator: Arc<Aggregator>,
    mode: ProbeMode,
    halt: CancellationToken,
    /// How long to keep draining queued echoes after halt
    drain_limit: Duration,
    /// Voice echoes must carry our SSRC
    ssrc: Option<u32>,
    consecutive_errors: u32,
    stats: ReceiverStats,
}

impl Receiver {
    pub fn new(
        socket: Arc<UdpSocket>,
        aggregator: Arc<Aggregator>,
        mode: ProbeMode,
        halt: CancellationToken,
        drain_limit: Duration,
    ) -> Self {
        Self {
            socket,
            aggregator,
            mode,
            halt,
            drain_limit,
            ssrc: None,
            consecutive_errors: 0,
            stats: ReceiverStats::default(),
        }
    }

    /// Only accept RTP echoes from this synchronization source
    pub fn with_ssrc(mut self, ssrc: Option<u32>) -> Self {
        self.ssrc = ssrc;
        self
    }

    /// Run the receiver on a dedicated thread (blocking I/O)
    ///
    /// The socket read timeout bounds how long a halt goes unnoticed. After
    /// halt the loop keeps reading until the socket goes quiet (or the drain
    /// limit passes) so echoes already queued are still counted.
    pub fn run_blocking(mut self) -> Result<ReceiverStats, ProbeError> {
        let mut buffer = vec![0u8; RECV_BUFFER_LEN];
        let mut halted_at: Option<Instant> = None;

        loop {
            if halted_at.is_none() && self.halt.is_cancelled() {
                halted_at = Some(Instant::now());
            }
            if let Some(at) = halted_at
                && at.elapsed() >= self.drain_limit
            {
                break;
            }

            match self.socket.recv_from(&mut buffer) {
                Ok((len, from)) => {
                    self.consecutive_errors = 0;
                    self.handle_datagram(&buffer[..len], from);
                }
                Err(e) if is_timeout(&e) => {
                    self.consecutive_errors = 0;
                    if halted_at.is_some() || self.halt.is_cancelled() {
                        break;
                    }
                }
                // ICMP errors from earlier sends surface here on some platforms
                Err(e) if is_icmp_feedback(&e) => {
                    debug!(error = %e, "ignoring ICMP feedback on probe socket");
                }
                Err(e) => {
                    self.consecutive_errors += 1;
                    warn!(
                        errors = self.consecutive_errors,
                        max = MAX_CONSECUTIVE_ERRORS,
                        error = %e,
                        "receive error"
                    );
                    if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        return Err(ProbeError::Task(
                            "receiver",
                            format!("{} consecutive errors (last: {})", self.consecutive_errors, e),
                        ));
                    }
                }
            }
        }

        debug!(stats = ?self.stats, "receiver stopped");
        Ok(self.stats)
    }

    fn handle_datagram(&mut self, data: &[u8], from: std::net::SocketAddr) {
        self.stats.datagrams += 1;
        let now = Instant::now();

        let Some(echo) = parse_echo(self.mode, data) else {
            self.stats.malformed += 1;
            debug!(%from, len = data.len(), "discarding malformed datagram");
            return;
        };
        if let (Some(expected), Some(got)) = (self.ssrc, echo.ssrc)
            && expected != got
        {
            self.stats.malformed += 1;
            debug!(%from, ssrc = got, expected, "discarding frame from foreign stream");
            return;
        }

        let seq = match self.mode {
            ProbeMode::Voice => extend_rtp_sequence(echo.seq as u16, self.aggregator.highest_seq()),
            ProbeMode::Convergence => echo.seq,
        };

        if self.aggregator.record_receive(seq, echo.server_count, now) {
            self.stats.accepted += 1;
            trace!(seq, server_count = echo.server_count, "echo");
        } else {
            self.stats.ignored += 1;
        }
    }
}

fn is_icmp_feedback(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

/// Spawn the receiver on a dedicated OS thread
pub fn spawn_receiver(receiver: Receiver) -> std::thread::JoinHandle<Result<ReceiverStats, ProbeError>> {
    std::thread::spawn(move || {
        // Catch panics and convert to error with details
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| receiver.run_blocking())) {
            Ok(result) => result,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Err(ProbeError::Task("receiver", format!("panicked: {}", msg)))
            }
        }
    })
}
