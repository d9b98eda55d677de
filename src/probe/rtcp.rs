//! RTCP sender reports for voice probes.

use chrono::{DateTime, Utc};

/// RTCP packet type: sender report
pub const RTCP_SENDER_REPORT: u8 = 200;
/// Second header byte of RTCP packets (SR, RR, SDES, BYE, APP)
///
/// With the RTP marker bit set these read as payload types 72-76, which
/// RTP itself reserves to keep the two demultiplexable.
pub const RTCP_PACKET_TYPES: std::ops::RangeInclusive<u8> = 200..=204;
/// Sender report without reception blocks
pub const SENDER_REPORT_SIZE: usize = 28;

/// Seconds between the NTP epoch (1900) and the Unix epoch
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Fields of a sender report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    /// 64-bit NTP timestamp (32.32 fixed point)
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    pub fn to_bytes(&self) -> [u8; SENDER_REPORT_SIZE] {
        let mut buf = [0u8; SENDER_REPORT_SIZE];
        buf[0] = 2 << 6; // V=2, P=0, RC=0
        buf[1] = RTCP_SENDER_REPORT;
        // Length in 32-bit words minus one
        buf[2..4].copy_from_slice(&((SENDER_REPORT_SIZE / 4 - 1) as u16).to_be_bytes());
        buf[4..8].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[8..16].copy_from_slice(&self.ntp_timestamp.to_be_bytes());
        buf[16..20].copy_from_slice(&self.rtp_timestamp.to_be_bytes());
        buf[20..24].copy_from_slice(&self.packet_count.to_be_bytes());
        buf[24..28].copy_from_slice(&self.octet_count.to_be_bytes());
        buf
    }
}

/// Convert wall-clock time to a 64-bit NTP timestamp
pub fn ntp_timestamp(now: DateTime<Utc>) -> u64 {
    let secs = (now.timestamp() as u64).wrapping_add(NTP_UNIX_OFFSET);
    let frac = ((now.timestamp_subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | frac
}
