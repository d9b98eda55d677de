use chrono::Utc;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::sender::SendCounters;
use crate::probe::SenderReport;
use crate::probe::rtcp::ntp_timestamp;

/// RTCP sender report cadence
pub const RTCP_INTERVAL: Duration = Duration::from_secs(5);

/// RTCP goes to the port above the media port
pub fn rtcp_target(media: SocketAddr) -> SocketAddr {
    SocketAddr::new(media.ip(), media.port().saturating_add(1))
}

/// Sends RTCP sender reports for a voice stream until stopped
pub async fn run_rtcp_reporter(
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    ssrc: u32,
    counters: Arc<SendCounters>,
    stop: CancellationToken,
) -> u64 {
    let target = rtcp_target(target);
    let mut ticker = tokio::time::interval(RTCP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; reports start one interval in
    ticker.tick().await;

    let mut reports = 0;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let report = SenderReport {
                    ssrc,
                    ntp_timestamp: ntp_timestamp(Utc::now()),
                    rtp_timestamp: counters.rtp_timestamp.load(Ordering::Relaxed),
                    packet_count: counters.packets.load(Ordering::Relaxed) as u32,
                    octet_count: counters.octets.load(Ordering::Relaxed) as u32,
                };
                match socket.send_to(&report.to_bytes(), target) {
                    Ok(_) => reports += 1,
                    Err(e) => debug!(%target, error = %e, "RTCP send failed"),
                }
            }
        }
    }
    reports
}
