//! Voice quality estimation with a simplified ITU-T G.107 E-model.

use crate::state::snapshot::round2;

/// Default transmission rating with no impairments
const R_BASE: f64 = 93.2;
/// Mouth-to-ear delay below which delay impairment is ignored
const DELAY_KNEE_MS: f64 = 160.0;
/// Fixed codec and jitter-buffer processing delay
const PROCESSING_DELAY_MS: f64 = 10.0;
/// MOS ceiling for narrow-band telephony
const MOS_MAX: f64 = 4.5;

/// Quality of a measured call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityScore {
    /// Transmission rating factor, 0..=100
    pub r_factor: f64,
    /// Mean opinion score, 1.0..=4.5
    pub mos: f64,
}

/// Score a stream from its average RTT, jitter (ms), loss (%) and codec Ie
pub fn score(avg_rtt_ms: f64, jitter_ms: f64, loss_pct: f64, ie_factor: f64) -> QualityScore {
    // Jitter costs roughly two buffer depths of delay
    let effective_latency = avg_rtt_ms + jitter_ms * 2.0 + PROCESSING_DELAY_MS;

    let delay_impairment = if effective_latency < DELAY_KNEE_MS {
        0.0
    } else {
        0.024 * effective_latency + 0.11 * (effective_latency - DELAY_KNEE_MS)
    };

    let loss_pct = loss_pct.max(0.0);
    let effective_loss = loss_pct / (1.0 + 0.1 * loss_pct);
    let loss_impairment = 2.5 * effective_loss;

    let r_factor = (R_BASE - delay_impairment - ie_factor - loss_impairment).clamp(0.0, 100.0);
    let mos = 1.0 + 0.035 * r_factor + 7.0e-6 * r_factor * (r_factor - 60.0) * (100.0 - r_factor);

    QualityScore {
        r_factor,
        mos: round2(mos.clamp(1.0, MOS_MAX)),
    }
}

/// MOS only
pub fn calculate_mos(avg_rtt_ms: f64, jitter_ms: f64, loss_pct: f64, ie_factor: f64) -> f64 {
    score(avg_rtt_ms, jitter_ms, loss_pct, ie_factor).mos
}
