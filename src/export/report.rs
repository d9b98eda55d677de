use chrono::{DateTime, Utc};
use std::io::Write;

use crate::state::MetricsSnapshot;

/// Missed-sequence lists longer than this are summarized
const MISSED_LIST_LIMIT: usize = 50;
/// Entries kept from each end of a summarized list
const MISSED_EDGE: usize = 25;

/// Render missed sequences, keeping the head and tail of long lists
pub fn format_missed(missed: &[u64]) -> String {
    let join = |seqs: &[u64]| {
        seqs.iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };

    if missed.len() > MISSED_LIST_LIMIT {
        format!(
            "{} ... {} (total {})",
            join(&missed[..MISSED_EDGE]),
            join(&missed[missed.len() - MISSED_EDGE..]),
            missed.len()
        )
    } else {
        join(missed)
    }
}

/// Write the end-of-run text report
pub fn generate_report<W: Write>(
    snapshot: &MetricsSnapshot,
    missed: &[u64],
    mut writer: W,
) -> std::io::Result<()> {
    let started = DateTime::<Utc>::from_timestamp_micros((snapshot.start_time * 1e6) as i64)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string());

    writeln!(writer, "wanprobe report for {} ({})", snapshot.test_id, snapshot.label)?;
    writeln!(writer, "Started: {}", started)?;
    if let Some(ref codec) = snapshot.codec {
        writeln!(
            writer,
            "Codec: {}  VAD: {}  RTCP: {}",
            codec,
            on_off(snapshot.vad_enabled),
            on_off(snapshot.rtcp_enabled)
        )?;
    }
    writeln!(
        writer,
        "Duration: {:.1}s at {:.1} pps",
        snapshot.duration_s, snapshot.rate_pps
    )?;
    writeln!(writer)?;

    writeln!(
        writer,
        "TX  sent {:>8}   lost {:>6} ({:>5.1}%, ~{:.0}ms)",
        snapshot.sent, snapshot.tx_lost_packets, snapshot.tx_loss_pct, snapshot.tx_loss_ms
    )?;
    writeln!(
        writer,
        "RX  recv {:>8}   lost {:>6} ({:>5.1}%, ~{:.0}ms)",
        snapshot.received, snapshot.rx_lost_packets, snapshot.rx_loss_pct, snapshot.rx_loss_ms
    )?;
    writeln!(
        writer,
        "Loss {} ({:.1}%)  responder count {}{}",
        snapshot.lost(),
        snapshot.loss_pct,
        snapshot.server_received,
        if snapshot.sync_lost { " (resynchronized)" } else { "" }
    )?;
    if snapshot.send_errors > 0 {
        writeln!(writer, "Send errors: {}", snapshot.send_errors)?;
    }
    writeln!(
        writer,
        "RTT avg {:.2}ms  min {:.2}ms  max {:.2}ms  jitter {:.2}ms",
        snapshot.avg_rtt_ms, snapshot.min_rtt_ms, snapshot.max_rtt_ms, snapshot.jitter_ms
    )?;
    writeln!(writer, "Max blackout: {}ms", snapshot.max_blackout_ms)?;
    if let Some(mos) = snapshot.mos {
        writeln!(writer, "MOS: {:.2}", mos)?;
    }

    if !missed.is_empty() {
        writeln!(writer, "Missed: {}", format_missed(missed))?;
    }

    Ok(())
}

fn on_off(flag: Option<bool>) -> &'static str {
    if flag.unwrap_or(false) { "on" } else { "off" }
}
