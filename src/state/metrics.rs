//! Shared measurement state for one probe run.
//!
//! The sender, receiver and publisher all go through [`Aggregator`]; its
//! fields sit behind a single mutex that is only held for map/set updates
//! and for copying the state a snapshot needs.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::state::quality;
use crate::state::snapshot::{
    HISTORY_LEN, MetricsSnapshot, RunState, RunStatus, round1, round2,
};

/// Round-trip latency statistics (Welford's online mean)
#[derive(Debug, Clone, Copy)]
struct LatencyStats {
    count: u64,
    /// Mean RTT in microseconds
    mean_us: f64,
    min: Duration,
    max: Duration,
    /// RFC 3550 jitter estimate in microseconds
    jitter_us: f64,
    /// Transit time of the previously received echo
    last_transit: Option<Duration>,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self {
            count: 0,
            mean_us: 0.0,
            min: Duration::MAX,
            max: Duration::ZERO,
            jitter_us: 0.0,
            last_transit: None,
        }
    }
}

impl LatencyStats {
    fn record(&mut self, transit: Duration) {
        self.count += 1;
        let us = transit.as_micros() as f64;
        self.mean_us += (us - self.mean_us) / self.count as f64;
        self.min = self.min.min(transit);
        self.max = self.max.max(transit);

        // J += (|D| - J) / 16, D = difference of consecutive transit times
        if let Some(last) = self.last_transit {
            let d = (us - last.as_micros() as f64).abs();
            self.jitter_us += (d - self.jitter_us) / 16.0;
        }
        self.last_transit = Some(transit);
    }

    fn min_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min.as_secs_f64() * 1000.0
        }
    }
}

/// Smallest counter drop that can mark a restart
///
/// Outbound reordering can hand a newer sequence a slightly lower count, so
/// drops this small are never a restart, however early in the run.
const MIN_RESTART_DROP: u64 = 4;

/// Responder echo counter with restart correction
///
/// Counts are grouped into epochs, one per responder lifetime. A restart
/// can only be signalled by a sequence newer than every one seen so far;
/// echoes that arrive late belong to the epoch they were sent in.
#[derive(Debug, Clone, Copy, Default)]
struct ServerCounter {
    /// Highest raw count seen in the current epoch
    high_raw: u64,
    /// Sum of the completed epochs' counts
    offset: u64,
    /// Highest raw count of the previous epoch
    prev_high: u64,
    /// First sequence of the current epoch
    epoch_seq: u64,
    /// First sequence of the previous epoch
    prev_epoch_seq: u64,
    /// Newest sequence that carried a count
    newest_seq: u64,
    /// Effective (offset-corrected) count
    received: u64,
    sync_lost: bool,
}

impl ServerCounter {
    /// Feed the count echoed for `seq`; returns true if a responder restart was detected
    fn observe(&mut self, seq: u64, raw: u64, slack: u64) -> bool {
        if seq < self.epoch_seq {
            // Late echo from the previous responder lifetime
            if seq >= self.prev_epoch_seq && raw > self.prev_high {
                self.offset += raw - self.prev_high;
                self.prev_high = raw;
                self.received = self.offset + self.high_raw;
            }
            return false;
        }

        let tolerance = slack.min(self.high_raw / 2).max(MIN_RESTART_DROP);
        let restarted = seq > self.newest_seq && raw + tolerance < self.high_raw;
        if restarted {
            self.offset += self.high_raw;
            self.prev_high = self.high_raw;
            self.prev_epoch_seq = self.epoch_seq;
            self.epoch_seq = seq;
            self.high_raw = raw;
            self.sync_lost = true;
        } else {
            self.high_raw = self.high_raw.max(raw);
        }
        self.newest_seq = self.newest_seq.max(seq);
        self.received = self.offset + self.high_raw;
        restarted
    }
}

#[derive(Debug)]
struct Inner {
    state: RunState,
    /// Send time of every sequence still counted as sent
    sent: BTreeMap<u64, Instant>,
    highest_seq: u64,
    send_failures: u64,
    received: BTreeSet<u64>,
    /// Time of the last echo (run start until the first one arrives)
    last_received: Instant,
    latency: LatencyStats,
    server: ServerCounter,
    max_blackout: Duration,
    /// When the sender stopped; bounds outage measurement while draining
    stopped_at: Option<Instant>,
}

/// Loss split between the outbound and return legs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectionalLoss {
    pub tx_lost: u64,
    pub rx_lost: u64,
}

/// Attribute `sent - received` to TX and RX using the responder's count
///
/// Without a responder count (0) nothing is known to have arrived, so all
/// loss is attributed to TX. If the
/// responder claims fewer echoes than we received (beyond `tolerance`)
/// its counter is not trusted and all loss goes to RX.
pub fn split_directional_loss(
    sent: u64,
    received: u64,
    server_received: u64,
    tolerance: u64,
) -> DirectionalLoss {
    if server_received == 0 {
        return DirectionalLoss {
            tx_lost: sent.saturating_sub(received),
            rx_lost: 0,
        };
    }
    let midpoint = server_received.min(sent);
    if midpoint + tolerance < received {
        return DirectionalLoss {
            tx_lost: 0,
            rx_lost: sent.saturating_sub(received),
        };
    }
    DirectionalLoss {
        tx_lost: sent - midpoint,
        rx_lost: midpoint.saturating_sub(received),
    }
}

/// State copied out of the lock for a snapshot
struct Frozen {
    state: RunState,
    sent: u64,
    received: u64,
    send_failures: u64,
    server: ServerCounter,
    latency: LatencyStats,
    max_blackout: Duration,
    current_blackout: Duration,
    perfect: bool,
    reference: Instant,
    /// (sequence, send time, received) for the history window
    window: Vec<(u64, Option<Instant>, bool)>,
}

/// Thread-safe metrics for one probe run
#[derive(Debug)]
pub struct Aggregator {
    config: Config,
    started: Instant,
    start_time: f64,
    blackout_threshold: Duration,
    inner: Mutex<Inner>,
}

impl Aggregator {
    pub fn new(config: Config) -> Self {
        Self::with_start(config, Instant::now())
    }

    /// Create with an explicit monotonic start (tests drive time by hand)
    pub fn with_start(config: Config, started: Instant) -> Self {
        let blackout_threshold = config.blackout_threshold();
        Self {
            config,
            started,
            start_time: Utc::now().timestamp_micros() as f64 / 1e6,
            blackout_threshold,
            inner: Mutex::new(Inner {
                state: RunState::Created,
                sent: BTreeMap::new(),
                highest_seq: 0,
                send_failures: 0,
                received: BTreeSet::new(),
                last_received: started,
                latency: LatencyStats::default(),
                server: ServerCounter::default(),
                max_blackout: Duration::ZERO,
                stopped_at: None,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn state(&self) -> RunState {
        self.inner.lock().state
    }

    /// created -> running
    pub fn begin_run(&self) {
        let mut inner = self.inner.lock();
        if inner.state == RunState::Created {
            inner.state = RunState::Running;
            info!(id = %self.config.id, target = %self.config.target, rate = self.config.rate, "probe run started");
        }
    }

    /// running -> draining: the sender has stopped at `now`
    pub fn begin_drain(&self, now: Instant) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, RunState::Created | RunState::Running) {
            inner.state = RunState::Draining;
            inner.stopped_at = Some(now);
            debug!(sent = inner.highest_seq, received = inner.received.len(), "draining");
        }
    }

    /// draining -> stopped
    pub fn finish(&self) {
        let mut inner = self.inner.lock();
        if inner.stopped_at.is_none() {
            inner.stopped_at = Some(Instant::now());
        }
        inner.state = RunState::Stopped;
    }

    /// Record a probe about to be transmitted
    pub fn record_send(&self, seq: u64, ts: Instant) {
        let mut inner = self.inner.lock();
        inner.sent.insert(seq, ts);
        inner.highest_seq = inner.highest_seq.max(seq);
    }

    /// Undo `record_send` for a probe the socket refused
    pub fn mark_send_failed(&self, seq: u64) {
        let mut inner = self.inner.lock();
        if inner.sent.remove(&seq).is_some() {
            inner.send_failures += 1;
        }
    }

    /// Record an echo; returns false if it was a duplicate or unknown sequence
    pub fn record_receive(&self, seq: u64, server_count: u64, ts: Instant) -> bool {
        let mut inner = self.inner.lock();

        let Some(&sent_at) = inner.sent.get(&seq) else {
            debug!(seq, "echo for unknown sequence ignored");
            return false;
        };
        if !inner.received.insert(seq) {
            debug!(seq, "duplicate echo dropped");
            return false;
        }
        inner.last_received = inner.last_received.max(ts);
        inner
            .latency
            .record(ts.saturating_duration_since(sent_at));

        if server_count > 0 {
            let previous = inner.server.high_raw;
            if inner.server.observe(seq, server_count, self.config.resync_slack) {
                warn!(
                    seq,
                    previous,
                    current = server_count,
                    offset = inner.server.offset,
                    received = inner.received.len(),
                    "responder counter reset, resynchronizing"
                );
            }
        }
        true
    }

    /// Highest sequence handed to the socket so far
    pub fn highest_seq(&self) -> u64 {
        self.inner.lock().highest_seq
    }

    pub fn received_count(&self) -> u64 {
        self.inner.lock().received.len() as u64
    }

    /// Number of probes counted as sent
    pub fn sent_count(&self) -> u64 {
        let inner = self.inner.lock();
        inner.highest_seq.saturating_sub(inner.send_failures)
    }

    pub fn send_failures(&self) -> u64 {
        self.inner.lock().send_failures
    }

    /// Average RTT so far (zero before the first echo)
    pub fn avg_rtt(&self) -> Duration {
        Duration::from_micros(self.inner.lock().latency.mean_us as u64)
    }

    /// Sent sequences that never got an echo, in order
    pub fn missed_sequences(&self) -> Vec<u64> {
        let inner = self.inner.lock();
        inner
            .sent
            .keys()
            .filter(|seq| !inner.received.contains(seq))
            .copied()
            .collect()
    }

    pub fn snapshot(&self, is_running: bool) -> MetricsSnapshot {
        self.snapshot_at(is_running, Instant::now())
    }

    /// Compute a snapshot as of `now`
    pub fn snapshot_at(&self, is_running: bool, now: Instant) -> MetricsSnapshot {
        let frozen = self.freeze(is_running, now);
        self.derive(is_running, frozen, now)
    }

    /// Copy what the snapshot needs and apply the blackout ratchet
    fn freeze(&self, is_running: bool, now: Instant) -> Frozen {
        let mut inner = self.inner.lock();

        let sent = inner.highest_seq.saturating_sub(inner.send_failures);
        let received = inner.received.len() as u64;

        // Once the sender has stopped, outage is measured up to that moment
        let reference = inner.stopped_at.map_or(now, |stopped| stopped.min(now));
        let outage = reference.saturating_duration_since(inner.last_received);
        let current_blackout = if outage > self.blackout_threshold && sent > received {
            outage
        } else {
            Duration::ZERO
        };
        if current_blackout > inner.max_blackout {
            inner.max_blackout = current_blackout;
        }

        let perfect = !is_running && received >= sent;
        if perfect && inner.max_blackout > Duration::ZERO {
            debug!(
                max_blackout_ms = inner.max_blackout.as_millis() as u64,
                "all probes answered, clearing transient blackout"
            );
            inner.max_blackout = Duration::ZERO;
        }

        let first = inner.highest_seq.saturating_sub(HISTORY_LEN as u64 - 1).max(1);
        let window = (first..=inner.highest_seq)
            .map(|seq| {
                (
                    seq,
                    inner.sent.get(&seq).copied(),
                    inner.received.contains(&seq),
                )
            })
            .collect();

        Frozen {
            state: inner.state,
            sent,
            received,
            send_failures: inner.send_failures,
            server: inner.server,
            latency: inner.latency,
            max_blackout: inner.max_blackout,
            current_blackout: if perfect { Duration::ZERO } else { current_blackout },
            perfect,
            reference,
            window,
        }
    }

    fn derive(&self, is_running: bool, f: Frozen, now: Instant) -> MetricsSnapshot {
        let config = &self.config;
        let history = if f.perfect {
            vec![1; HISTORY_LEN]
        } else {
            build_history(&f.window, now, self.blackout_threshold, f.received > 0)
        };

        let lost = f.sent.saturating_sub(f.received);
        let pct = |n: u64| {
            if f.sent == 0 {
                0.0
            } else {
                round1(n as f64 / f.sent as f64 * 100.0)
            }
        };
        let to_ms = |n: u64| round1(n as f64 / config.rate * 1000.0);

        // Voice echoes are verbatim and carry no counter to split on
        let split = if config.is_voice() {
            DirectionalLoss::default()
        } else {
            split_directional_loss(f.sent, f.received, f.server.received, config.directional_tolerance)
        };

        let avg_rtt_ms = f.latency.mean_us / 1000.0;
        let jitter_ms = f.latency.jitter_us / 1000.0;
        let loss_pct = pct(lost);

        let voice = config.voice.as_ref();
        let mos = voice.map(|v| {
            quality::calculate_mos(avg_rtt_ms, jitter_ms, loss_pct, v.codec.spec().ie_factor)
        });

        let status = if is_running && f.state != RunState::Stopped {
            RunStatus::Running
        } else {
            RunStatus::Stopped
        };

        MetricsSnapshot {
            test_id: config.id.clone(),
            label: config.label.clone(),
            status,
            sent: f.sent,
            received: f.received,
            server_received: f.server.received,
            send_errors: f.send_failures,
            loss_pct,
            tx_loss_pct: pct(split.tx_lost),
            rx_loss_pct: pct(split.rx_lost),
            tx_lost_packets: split.tx_lost,
            rx_lost_packets: split.rx_lost,
            tx_loss_ms: to_ms(split.tx_lost),
            rx_loss_ms: to_ms(split.rx_lost),
            sync_lost: f.server.sync_lost,
            max_blackout_ms: f.max_blackout.as_millis() as u64,
            current_blackout_ms: f.current_blackout.as_millis() as u64,
            avg_rtt_ms: round2(avg_rtt_ms),
            min_rtt_ms: round2(f.latency.min_ms()),
            max_rtt_ms: round2(f.latency.max.as_secs_f64() * 1000.0),
            jitter_ms: round2(jitter_ms),
            rate_pps: config.rate,
            duration_s: round1(f.reference.saturating_duration_since(self.started).as_secs_f64()),
            history,
            start_time: self.start_time,
            mos,
            codec: voice.map(|v| v.codec.name().to_string()),
            vad_enabled: voice.map(|v| v.vad.is_some()),
            rtcp_enabled: voice.map(|v| v.rtcp),
        }
    }
}

/// 1 for answered (or still in flight), 0 for overdue
///
/// Short histories are padded at the front to 100 slots. The padding reads
/// as healthy unless the path is confirmed dead: nothing ever came back
/// and every probe in the window is overdue.
fn build_history(
    window: &[(u64, Option<Instant>, bool)],
    now: Instant,
    overdue: Duration,
    any_received: bool,
) -> Vec<u8> {
    let mut history: Vec<u8> = window
        .iter()
        .filter_map(|&(_, sent_at, received)| {
            // Failed sends were never on the wire
            let sent_at = sent_at?;
            let ok = received || now.saturating_duration_since(sent_at) <= overdue;
            Some(ok as u8)
        })
        .collect();

    if history.len() < HISTORY_LEN {
        let dead = !any_received && !history.is_empty() && history.iter().all(|&h| h == 0);
        let mut padded = vec![if dead { 0 } else { 1 }; HISTORY_LEN - history.len()];
        padded.append(&mut history);
        history = padded;
    }
    history
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProbeMode, VoiceConfig};
    use crate::probe::Codec;

    fn config(rate: f64) -> Config {
        Config {
            id: "CONV-001".to_string(),
            label: "Lab".to_string(),
            rate,
            ..Config::default()
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Send `count` probes at `interval`, echo each after `rtt` with counter = seq
    fn run_clean(agg: &Aggregator, t0: Instant, count: u64, interval: Duration, rtt: Duration) {
        for seq in 1..=count {
            let sent_at = t0 + interval * seq as u32;
            agg.record_send(seq, sent_at);
            agg.record_receive(seq, seq, sent_at + rtt);
        }
    }

    #[test]
    fn test_empty_snapshot() {
        let t0 = Instant::now();
        let agg = Aggregator::with_start(config(50.0), t0);
        let snap = agg.snapshot_at(true, t0);
        assert_eq!(snap.sent, 0);
        assert_eq!(snap.received, 0);
        assert_eq!(snap.loss_pct, 0.0);
        assert_eq!(snap.history.len(), HISTORY_LEN);
        assert!(snap.history.iter().all(|&h| h == 1));
        assert_eq!(snap.status, RunStatus::Running);
    }

    #[test]
    fn test_clean_run() {
        let t0 = Instant::now();
        let agg = Aggregator::with_start(config(10.0), t0);
        run_clean(&agg, t0, 100, ms(100), ms(5));

        agg.begin_drain(t0 + ms(10_100));
        let snap = agg.snapshot_at(false, t0 + ms(12_000));
        assert_eq!(snap.sent, 100);
        assert_eq!(snap.received, 100);
        assert_eq!(snap.server_received, 100);
        assert_eq!(snap.loss_pct, 0.0);
        assert_eq!(snap.max_blackout_ms, 0);
        assert!(!snap.sync_lost);
        assert_eq!(snap.avg_rtt_ms, 5.0);
        assert_eq!(snap.jitter_ms, 0.0);
        assert_eq!(snap.status, RunStatus::Stopped);
    }

    #[test]
    fn test_duplicate_receive_is_idempotent() {
        let t0 = Instant::now();
        let agg = Aggregator::with_start(config(50.0), t0);
        agg.record_send(1, t0);
        assert!(agg.record_receive(1, 1, t0 + ms(10)));
        let before = agg.snapshot_at(true, t0 + ms(20));

        assert!(!agg.record_receive(1, 1, t0 + ms(40)));
        let after = agg.snapshot_at(true, t0 + ms(20));
        assert_eq!(before.received, after.received);
        assert_eq!(before.avg_rtt_ms, after.avg_rtt_ms);
        assert_eq!(before.jitter_ms, after.jitter_ms);
    }

    #[test]
    fn test_unknown_sequence_ignored() {
        let t0 = Instant::now();
        let agg = Aggregator::with_start(config(50.0), t0);
        agg.record_send(1, t0);
        assert!(!agg.record_receive(7, 3, t0 + ms(5)));
        assert_eq!(agg.received_count(), 0);
        assert_eq!(agg.snapshot_at(true, t0 + ms(5)).server_received, 0);
    }

    #[test]
    fn test_send_failure_excluded_from_sent() {
        let t0 = Instant::now();
        let agg = Aggregator::with_start(config(50.0), t0);
        for seq in 1..=5 {
            agg.record_send(seq, t0);
        }
        agg.mark_send_failed(3);
        agg.mark_send_failed(3);
        assert_eq!(agg.sent_count(), 4);
        assert_eq!(agg.send_failures(), 1);

        // An echo for the failed sequence cannot count
        assert!(!agg.record_receive(3, 1, t0 + ms(1)));
        assert!(!agg.missed_sequences().contains(&3));
    }

    #[test]
    fn test_jitter_rfc3550() {
        let t0 = Instant::now();
        let agg = Aggregator::with_start(config(50.0), t0);
        // Transit alternates 10ms / 20ms: |D| = 10ms every step
        for seq in 1..=200u64 {
            let sent_at = t0 + ms(20 * seq);
            let transit = if seq % 2 == 0 { ms(20) } else { ms(10) };
            agg.record_send(seq, sent_at);
            agg.record_receive(seq, seq, sent_at + transit);
        }
        let snap = agg.snapshot_at(true, t0 + ms(4100));
        assert!((snap.jitter_ms - 10.0).abs() < 0.1, "jitter {}", snap.jitter_ms);
        assert_eq!(snap.min_rtt_ms, 10.0);
        assert_eq!(snap.max_rtt_ms, 20.0);
        assert_eq!(snap.avg_rtt_ms, 15.0);
    }

    #[test]
    fn test_counter_restart_detected() {
        let t0 = Instant::now();
        let agg = Aggregator::with_start(config(10.0), t0);
        for seq in 1..=100u64 {
            let sent_at = t0 + ms(100 * seq);
            agg.record_send(seq, sent_at);
            // Responder restarts after 50 echoes
            let count = if seq <= 50 { seq } else { seq - 48 };
            agg.record_receive(seq, count, sent_at + ms(5));
        }

        let snap = agg.snapshot_at(true, t0 + ms(10_200));
        assert!(snap.sync_lost);
        // 50 before the restart plus 52 after
        assert_eq!(snap.server_received, 102);
        assert_eq!(snap.tx_lost_packets, 0);
        assert_eq!(snap.rx_lost_packets, 0);
    }

    #[test]
    fn test_reordered_counter_is_not_a_restart() {
        let mut counter = ServerCounter::default();
        assert!(!counter.observe(10, 10, 100));
        assert!(!counter.observe(8, 8, 100));
        assert!(!counter.observe(11, 11, 100));
        assert!(!counter.sync_lost);
        assert_eq!(counter.received, 11);
    }

    #[test]
    fn test_early_reordering_keeps_sync() {
        let t0 = Instant::now();
        let agg = Aggregator::with_start(config(50.0), t0);
        for seq in 1..=3 {
            agg.record_send(seq, t0 + ms(20 * seq));
        }
        agg.record_receive(3, 3, t0 + ms(70));
        agg.record_receive(1, 1, t0 + ms(71));
        agg.record_receive(2, 2, t0 + ms(72));

        let snap = agg.snapshot_at(true, t0 + ms(80));
        assert!(!snap.sync_lost);
        assert_eq!(snap.server_received, 3);
        assert_eq!(snap.received, 3);
    }

    #[test]
    fn test_outbound_swap_early_is_not_a_restart() {
        // Packet 3 overtook packet 2 on the way out
        let mut counter = ServerCounter::default();
        counter.observe(1, 1, 100);
        counter.observe(2, 3, 100);
        assert!(!counter.observe(3, 2, 100));
        assert!(!counter.sync_lost);
        assert_eq!(counter.received, 3);
    }

    #[test]
    fn test_small_counter_restart_detected() {
        let mut counter = ServerCounter::default();
        counter.observe(50, 50, 100);
        assert!(counter.observe(51, 3, 100));
        assert_eq!(counter.received, 53);
        // Offset stays applied
        counter.observe(52, 4, 100);
        assert_eq!(counter.received, 54);
    }

    #[test]
    fn test_late_echo_after_restart_stays_in_old_epoch() {
        let t0 = Instant::now();
        let agg = Aggregator::with_start(config(50.0), t0);
        for seq in 1..=54 {
            agg.record_send(seq, t0 + ms(20 * seq));
        }
        for seq in 1..=48 {
            agg.record_receive(seq, seq, t0 + ms(20 * seq + 5));
        }
        agg.record_receive(50, 50, t0 + ms(1005));
        // Responder restarted before packet 51 arrived
        agg.record_receive(51, 1, t0 + ms(1025));
        // Packet 49 was delayed on the return leg
        agg.record_receive(49, 49, t0 + ms(1030));
        for (seq, count) in [(52, 2), (53, 3), (54, 4)] {
            agg.record_receive(seq, count, t0 + ms(20 * seq + 5));
        }

        agg.begin_drain(t0 + ms(1100));
        let snap = agg.snapshot_at(false, t0 + ms(1200));
        assert!(snap.sync_lost);
        assert_eq!(snap.sent, 54);
        assert_eq!(snap.received, 54);
        assert_eq!(snap.server_received, 54);
        assert_eq!(snap.tx_lost_packets, 0);
        assert_eq!(snap.rx_lost_packets, 0);
    }

    #[test]
    fn test_late_echo_raises_previous_epoch_total() {
        let mut counter = ServerCounter::default();
        for seq in 1..=40 {
            counter.observe(seq, seq, 100);
        }
        // 41 and 42 reached the responder but their echoes are late
        assert!(counter.observe(43, 1, 100));
        assert_eq!(counter.received, 41);
        counter.observe(42, 42, 100);
        counter.observe(41, 41, 100);
        assert_eq!(counter.received, 43);
        counter.observe(44, 2, 100);
        assert_eq!(counter.received, 44);
    }

    #[test]
    fn test_restart_at_fifty_then_conservation() {
        let t0 = Instant::now();
        let agg = Aggregator::with_start(config(10.0), t0);
        let mut responder = 0u64;
        for seq in 1..=120u64 {
            let sent_at = t0 + ms(100 * seq);
            agg.record_send(seq, sent_at);
            // Outbound loss on every 10th packet; return loss on every 15th
            if seq % 10 == 0 {
                continue;
            }
            responder += 1;
            // Responder restarts after its 50th echo; the next one reads 3
            if responder == 51 {
                responder = 3;
            }
            if seq % 15 != 0 {
                agg.record_receive(seq, responder, sent_at + ms(5));
            }
        }

        agg.begin_drain(t0 + ms(12_100));
        let snap = agg.snapshot_at(false, t0 + ms(13_000));
        assert!(snap.sync_lost);
        assert_eq!(snap.sent, 120);
        assert_eq!(snap.tx_lost_packets + snap.rx_lost_packets, snap.sent - snap.received);
        assert!(snap.server_received <= snap.sent);
    }

    #[test]
    fn test_directional_split() {
        // 100 sent, responder saw 95, we got 90 back
        assert_eq!(
            split_directional_loss(100, 90, 95, 0),
            DirectionalLoss { tx_lost: 5, rx_lost: 5 }
        );
        // No counter: everything is outbound loss
        assert_eq!(
            split_directional_loss(100, 90, 0, 0),
            DirectionalLoss { tx_lost: 10, rx_lost: 0 }
        );
        // Counter implausibly low: all loss is RX
        assert_eq!(
            split_directional_loss(100, 90, 40, 0),
            DirectionalLoss { tx_lost: 0, rx_lost: 10 }
        );
        // Counter above sent is capped
        assert_eq!(
            split_directional_loss(100, 90, 130, 0),
            DirectionalLoss { tx_lost: 0, rx_lost: 10 }
        );
        // Within tolerance the split is kept, RX saturates
        assert_eq!(
            split_directional_loss(100, 90, 88, 5),
            DirectionalLoss { tx_lost: 12, rx_lost: 0 }
        );
    }

    #[test]
    fn test_unreachable_target() {
        let t0 = Instant::now();
        let agg = Aggregator::with_start(config(5.0), t0);
        for seq in 1..=20u64 {
            agg.record_send(seq, t0 + ms(200 * (seq - 1)));
        }
        agg.begin_drain(t0 + ms(4000));
        let snap = agg.snapshot_at(false, t0 + ms(6500));

        assert_eq!(snap.received, 0);
        assert_eq!(snap.loss_pct, 100.0);
        assert!(snap.max_blackout_ms >= 4000 - 300);
        assert!(snap.history.iter().all(|&h| h == 0));
        assert_eq!(snap.history.len(), HISTORY_LEN);
        assert_eq!(snap.duration_s, 4.0);
        assert_eq!(agg.missed_sequences(), (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn test_blackout_needs_a_gap() {
        let t0 = Instant::now();
        let agg = Aggregator::with_start(config(50.0), t0);
        run_clean(&agg, t0, 10, ms(20), ms(1));
        // Idle for a second with nothing outstanding: not a blackout
        let snap = agg.snapshot_at(true, t0 + ms(1200));
        assert_eq!(snap.current_blackout_ms, 0);
        assert_eq!(snap.max_blackout_ms, 0);
    }

    #[test]
    fn test_blackout_ratchet_and_perfect_run_reset() {
        let t0 = Instant::now();
        let agg = Aggregator::with_start(config(50.0), t0);
        run_clean(&agg, t0, 10, ms(20), ms(1));

        // 11..=20 outstanding for 500ms
        for seq in 11..=20u64 {
            agg.record_send(seq, t0 + ms(200 + 20 * (seq - 10)));
        }
        let during = agg.snapshot_at(true, t0 + ms(700));
        assert!(during.current_blackout_ms >= 400);
        assert!(during.max_blackout_ms >= 400);

        // Echoes return late; live view keeps the maximum
        for seq in 11..=20u64 {
            agg.record_receive(seq, seq, t0 + ms(710));
        }
        let after = agg.snapshot_at(true, t0 + ms(720));
        assert_eq!(after.current_blackout_ms, 0);
        assert_eq!(after.max_blackout_ms, during.max_blackout_ms);

        // Every probe answered: the final snapshot clears it
        agg.begin_drain(t0 + ms(720));
        let last = agg.snapshot_at(false, t0 + ms(900));
        assert_eq!(last.max_blackout_ms, 0);
        assert!(last.history.iter().all(|&h| h == 1));
    }

    #[test]
    fn test_history_marks_only_overdue_as_lost() {
        let t0 = Instant::now();
        let agg = Aggregator::with_start(config(50.0), t0);
        // seq 1 lost long ago, seq 2 answered, seq 3 just sent
        agg.record_send(1, t0);
        agg.record_send(2, t0 + ms(20));
        agg.record_receive(2, 1, t0 + ms(25));
        agg.record_send(3, t0 + ms(500));

        let snap = agg.snapshot_at(true, t0 + ms(510));
        let tail = &snap.history[HISTORY_LEN - 3..];
        assert_eq!(tail, &[0, 1, 1]);
        assert!(snap.history[..HISTORY_LEN - 3].iter().all(|&h| h == 1));
    }

    #[test]
    fn test_history_window_is_last_hundred() {
        let t0 = Instant::now();
        let agg = Aggregator::with_start(config(50.0), t0);
        for seq in 1..=250u64 {
            agg.record_send(seq, t0);
            if seq != 151 {
                agg.record_receive(seq, seq, t0 + ms(1));
            }
        }
        let snap = agg.snapshot_at(true, t0 + ms(1000));
        assert_eq!(snap.history.len(), HISTORY_LEN);
        // 151 is the first slot of the window 151..=250
        assert_eq!(snap.history[0], 0);
        assert_eq!(snap.history.iter().filter(|&&h| h == 0).count(), 1);
    }

    #[test]
    fn test_voice_snapshot_has_mos() {
        let t0 = Instant::now();
        let mut cfg = config(50.0);
        cfg.mode = ProbeMode::Voice;
        cfg.voice = Some(VoiceConfig {
            codec: Codec::G711Ulaw,
            vad: None,
            rtcp: true,
        });
        let agg = Aggregator::with_start(cfg, t0);
        run_clean(&agg, t0, 50, ms(20), ms(20));

        let snap = agg.snapshot_at(true, t0 + ms(1100));
        assert_eq!(snap.codec.as_deref(), Some("G.711-ulaw"));
        assert_eq!(snap.vad_enabled, Some(false));
        assert_eq!(snap.rtcp_enabled, Some(true));
        let mos = snap.mos.unwrap();
        assert!(mos >= 4.4, "mos {}", mos);
    }

    #[test]
    fn test_lifecycle() {
        let agg = Aggregator::new(config(50.0));
        assert_eq!(agg.state(), RunState::Created);
        agg.begin_run();
        assert_eq!(agg.state(), RunState::Running);
        agg.begin_drain(Instant::now());
        assert_eq!(agg.state(), RunState::Draining);
        agg.finish();
        assert_eq!(agg.state(), RunState::Stopped);
        assert_eq!(agg.snapshot(true).status, RunStatus::Stopped);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn proptest_receive_idempotent(
                echoes in prop::collection::vec((1u64..50, 0u64..200), 0..200)
            ) {
                let t0 = Instant::now();
                let once = Aggregator::with_start(config(50.0), t0);
                let twice = Aggregator::with_start(config(50.0), t0);
                for seq in 1..50u64 {
                    once.record_send(seq, t0);
                    twice.record_send(seq, t0);
                }
                for (i, &(seq, count)) in echoes.iter().enumerate() {
                    let ts = t0 + ms(i as u64);
                    once.record_receive(seq, count, ts);
                    twice.record_receive(seq, count, ts);
                    twice.record_receive(seq, count, ts);
                }
                let a = once.snapshot_at(true, t0 + ms(300));
                let b = twice.snapshot_at(true, t0 + ms(300));
                prop_assert_eq!(a.received, b.received);
                prop_assert_eq!(a.avg_rtt_ms, b.avg_rtt_ms);
                prop_assert_eq!(a.jitter_ms, b.jitter_ms);
                prop_assert_eq!(a.server_received, b.server_received);
            }

            #[test]
            fn proptest_jitter_non_negative(transits in prop::collection::vec(0u64..500, 1..300)) {
                let t0 = Instant::now();
                let agg = Aggregator::with_start(config(50.0), t0);
                let max = *transits.iter().max().unwrap_or(&0) as f64;
                for (i, &transit) in transits.iter().enumerate() {
                    let seq = i as u64 + 1;
                    agg.record_send(seq, t0 + ms(seq));
                    agg.record_receive(seq, seq, t0 + ms(seq + transit));
                }
                let snap = agg.snapshot_at(true, t0 + ms(1000));
                prop_assert!(snap.jitter_ms >= 0.0);
                prop_assert!(snap.jitter_ms <= max);
            }

            #[test]
            fn proptest_history_always_full(sent in 0u64..400, answered in prop::collection::vec(any::<bool>(), 400)) {
                let t0 = Instant::now();
                let agg = Aggregator::with_start(config(50.0), t0);
                for seq in 1..=sent {
                    agg.record_send(seq, t0);
                    if answered[seq as usize - 1] {
                        agg.record_receive(seq, 0, t0 + ms(1));
                    }
                }
                prop_assert_eq!(agg.snapshot_at(true, t0 + ms(5000)).history.len(), HISTORY_LEN);
                prop_assert_eq!(agg.snapshot_at(false, t0 + ms(5000)).history.len(), HISTORY_LEN);
            }

            #[test]
            fn proptest_loss_conservation(
                sent in 1u64..300,
                tx_drop in prop::collection::vec(any::<bool>(), 300),
                rx_drop in prop::collection::vec(any::<bool>(), 300),
            ) {
                let t0 = Instant::now();
                let agg = Aggregator::with_start(config(50.0), t0);
                let mut server = 0u64;
                for seq in 1..=sent {
                    agg.record_send(seq, t0 + ms(seq));
                    if tx_drop[seq as usize] {
                        continue;
                    }
                    server += 1;
                    if !rx_drop[seq as usize] {
                        agg.record_receive(seq, server, t0 + ms(seq + 2));
                    }
                }
                // Final echo count as the responder would report it
                let snap = agg.snapshot_at(true, t0 + ms(sent + 1000));
                prop_assert!(!snap.sync_lost);
                prop_assert_eq!(
                    snap.tx_lost_packets + snap.rx_lost_packets,
                    snap.sent - snap.received
                );
            }

            #[test]
            fn proptest_return_reordering_never_desyncs(
                order in Just((1..=60u64).collect::<Vec<_>>()).prop_shuffle()
            ) {
                let t0 = Instant::now();
                let agg = Aggregator::with_start(config(50.0), t0);
                for seq in 1..=60u64 {
                    agg.record_send(seq, t0 + ms(seq));
                }
                // Echo counts follow send order; arrival order is arbitrary
                for (i, &seq) in order.iter().enumerate() {
                    agg.record_receive(seq, seq, t0 + ms(100 + i as u64));
                }
                let snap = agg.snapshot_at(true, t0 + ms(200));
                prop_assert!(!snap.sync_lost);
                prop_assert_eq!(snap.server_received, 60);
                prop_assert_eq!(snap.tx_lost_packets + snap.rx_lost_packets, 0);
            }

            #[test]
            fn proptest_max_blackout_monotonic(gaps in prop::collection::vec(0u64..800, 1..40)) {
                let t0 = Instant::now();
                let agg = Aggregator::with_start(config(50.0), t0);
                let mut now = t0;
                let mut last_max = 0;
                for (i, &gap) in gaps.iter().enumerate() {
                    let seq = i as u64 + 1;
                    now += ms(20);
                    agg.record_send(seq, now);
                    now += ms(gap);
                    let snap = agg.snapshot_at(true, now);
                    prop_assert!(snap.max_blackout_ms >= last_max);
                    last_max = snap.max_blackout_ms;
                    if gap % 3 != 0 {
                        agg.record_receive(seq, 0, now);
                    }
                }
            }
        }
    }
}
