//! Staged shutdown: drain in-flight echoes before the final snapshot.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ShutdownConfig;
use crate::state::Aggregator;

/// Rates above this get a longer grace multiplier
const HIGH_RATE_PPS: f64 = 50.0;

/// Grace period before halting the receiver, scaled to the observed RTT
///
/// `clamp(avg_rtt x 15, min, max)`, or x20 above 50 pps where more probes
/// are in flight at any moment.
pub fn grace_period(avg_rtt: Duration, rate: f64, config: &ShutdownConfig) -> Duration {
    let factor = if rate > HIGH_RATE_PPS { 20 } else { 15 };
    let min = config.grace_min.min(config.grace_max);
    (avg_rtt * factor).clamp(min, config.grace_max)
}

/// Poll the received count until it holds still
///
/// Polls every `poll_interval` for at most `poll_window`; returns early
/// once the count is unchanged for `stable_polls` consecutive polls.
/// Returns the last count seen.
pub async fn wait_for_quiet(aggregator: &Arc<Aggregator>, config: &ShutdownConfig) -> u64 {
    let polls = if config.poll_interval.is_zero() {
        1
    } else {
        (config.poll_window.as_nanos() / config.poll_interval.as_nanos()).max(1) as u32
    };

    let mut last = aggregator.received_count();
    let mut stable = 0;
    for _ in 0..polls {
        tokio::time::sleep(config.poll_interval).await;
        let count = aggregator.received_count();
        if count == last {
            stable += 1;
            if stable >= config.stable_polls {
                break;
            }
        } else {
            debug!(received = count, late = count - last, "late echoes arriving");
            stable = 0;
            last = count;
        }
    }
    last
}
