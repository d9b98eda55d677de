use serde::{Deserialize, Serialize};

/// Number of slots in the rolling success/fail history
pub const HISTORY_LEN: usize = 100;

/// Run lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Created,
    Running,
    /// Sender stopped, in-flight echoes still being collected
    Draining,
    Stopped,
}

/// Status as published in snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Stopped,
}

/// Point-in-time view of a probe run, as written to snapshot sinks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub test_id: String,
    pub label: String,
    pub status: RunStatus,

    // Counters
    pub sent: u64,
    pub received: u64,
    /// Responder-reported echo count, corrected across restarts
    pub server_received: u64,
    pub send_errors: u64,

    // Loss
    pub loss_pct: f64,
    pub tx_loss_pct: f64,
    pub rx_loss_pct: f64,
    pub tx_lost_packets: u64,
    pub rx_lost_packets: u64,
    pub tx_loss_ms: f64,
    pub rx_loss_ms: f64,
    pub sync_lost: bool,

    // Outage
    pub max_blackout_ms: u64,
    pub current_blackout_ms: u64,

    // Latency
    pub avg_rtt_ms: f64,
    pub min_rtt_ms: f64,
    pub max_rtt_ms: f64,
    pub jitter_ms: f64,

    pub rate_pps: f64,
    pub duration_s: f64,
    /// Outcome of the last 100 sequences, oldest first (1 = ok, 0 = lost)
    pub history: Vec<u8>,
    /// Wall-clock run start, Unix seconds
    pub start_time: f64,

    // Voice only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mos: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vad_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp_enabled: Option<bool>,
}

impl MetricsSnapshot {
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Packets sent but never echoed
    pub fn lost(&self) -> u64 {
        self.sent.saturating_sub(self.received)
    }
}

/// Round to one decimal place
pub(crate) fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Round to two decimal places
pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
