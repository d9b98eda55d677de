//! Probe payload construction and echo decoding.
//!
//! Convergence probes are text: `CONV:ID:LABEL:SEQ:TIMESTAMP`, echoed back
//! with an optional `:S<n>` responder counter suffix. Voice probes are RTP
//! frames (12-byte header, sequence at bytes 2-3) echoed verbatim.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::Rng;
use std::time::Duration;

use crate::config::{Config, ProbeMode};
use crate::probe::codec::{COMFORT_NOISE_PT, COMFORT_NOISE_SIZE, CodecSpec, audio_payload, comfort_noise};
use crate::probe::rtcp::RTCP_PACKET_TYPES;
use crate::probe::vad::VadSimulator;

/// Leading tag of convergence payloads
pub const CONVERGENCE_TAG: &str = "CONV";
/// RTP fixed header length
pub const RTP_HEADER_SIZE: usize = 12;
/// RTP protocol version
pub const RTP_VERSION: u8 = 2;

/// A decoded echo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Echo {
    /// Sequence as carried on the wire (16-bit for RTP)
    pub seq: u64,
    /// Responder echo counter (0 = not reported)
    pub server_count: u64,
    /// RTP synchronization source (voice only)
    pub ssrc: Option<u32>,
}

/// Header fields of an RTP frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.push(RTP_VERSION << 6);
        buf.push(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
    }

    /// Parse an RTP header; RTCP packets sharing the port are rejected
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < RTP_HEADER_SIZE || data[0] >> 6 != RTP_VERSION {
            return None;
        }
        if RTCP_PACKET_TYPES.contains(&data[1]) {
            return None;
        }
        Some(Self {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

/// Keep delimiters out of free-form payload fields
fn sanitize_field(s: &str) -> String {
    s.chars().map(|c| if c == ':' { '_' } else { c }).collect()
}

/// Build a convergence payload: `CONV:ID:LABEL:SEQ:TIMESTAMP`
pub fn build_convergence_payload(id: &str, label: &str, seq: u64, timestamp: f64) -> Vec<u8> {
    format!(
        "{}:{}:{}:{}:{:.6}",
        CONVERGENCE_TAG,
        sanitize_field(id),
        sanitize_field(label),
        seq,
        timestamp
    )
    .into_bytes()
}

/// Decode an echoed convergence payload
///
/// Returns None for anything that is not a well-formed echo of ours.
pub fn parse_convergence_echo(data: &[u8]) -> Option<Echo> {
    let text = std::str::from_utf8(data).ok()?;
    let mut parts = text.split(':');
    if parts.next()? != CONVERGENCE_TAG {
        return None;
    }
    let _id = parts.next()?;
    let _label = parts.next()?;
    let seq: u64 = parts.next()?.trim().parse().ok()?;
    if seq == 0 {
        return None;
    }
    // Skip the send timestamp, then look for the responder suffix
    let _timestamp = parts.next();
    let server_count = parts
        .filter_map(|p| p.strip_prefix('S'))
        .find_map(|n| n.trim().parse::<u64>().ok())
        .unwrap_or(0);

    Some(Echo {
        seq,
        server_count,
        ssrc: None,
    })
}

/// Decode an echoed RTP frame (sequence only, no counter)
pub fn parse_rtp_echo(data: &[u8]) -> Option<Echo> {
    let header = RtpHeader::parse(data)?;
    Some(Echo {
        seq: header.sequence as u64,
        server_count: 0,
        ssrc: Some(header.ssrc),
    })
}

/// Extend a 16-bit RTP sequence to the 64-bit space using the highest sent sequence
pub fn extend_rtp_sequence(wire: u16, highest_sent: u64) -> u64 {
    const SPAN: u64 = 1 << 16;
    let base = highest_sent & !(SPAN - 1);
    let candidate = base | wire as u64;

    // Pick the candidate nearest to highest_sent; echoes lag, so prefer the past
    if candidate > highest_sent && candidate >= SPAN {
        let below = candidate - SPAN;
        if highest_sent - below < candidate - highest_sent {
            below
        } else {
            candidate
        }
    } else if candidate + SPAN / 2 < highest_sent {
        candidate + SPAN
    } else {
        candidate
    }
}

/// Per-run voice framing state
#[derive(Debug)]
struct VoiceFramer {
    spec: CodecSpec,
    ssrc: u32,
    timestamp: u32,
    tag: Vec<u8>,
    vad: Option<VadSimulator>,
    comfort_noise_sent: u64,
}

/// Builds the byte payload for each sequence of a run
#[derive(Debug)]
pub struct PayloadBuilder {
    mode: ProbeMode,
    id: String,
    label: String,
    /// Packet time used to advance the talk/silence model
    step: Duration,
    voice: Option<VoiceFramer>,
    rng: StdRng,
}

impl PayloadBuilder {
    pub fn new(config: &Config) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic builder (tests, reproducible captures)
    pub fn with_seed(config: &Config, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &Config, mut rng: StdRng) -> Self {
        let voice = config.voice.as_ref().map(|voice| {
            let vad = voice.vad.map(|vad| VadSimulator::new(vad, &mut rng));
            VoiceFramer {
                spec: voice.codec.spec(),
                ssrc: rng.r#gen(),
                timestamp: rng.r#gen(),
                tag: format!("CID:{}:", sanitize_field(&config.id)).into_bytes(),
                vad,
                comfort_noise_sent: 0,
            }
        });

        Self {
            mode: config.mode,
            id: config.id.clone(),
            label: config.label.clone(),
            step: config.interval(),
            voice,
            rng,
        }
    }

    /// RTP synchronization source of this run (voice only)
    pub fn ssrc(&self) -> Option<u32> {
        self.voice.as_ref().map(|v| v.ssrc)
    }

    /// Current RTP timestamp (voice only)
    pub fn rtp_timestamp(&self) -> Option<u32> {
        self.voice.as_ref().map(|v| v.timestamp)
    }

    /// Number of comfort noise packets produced so far
    pub fn comfort_noise_sent(&self) -> u64 {
        self.voice.as_ref().map_or(0, |v| v.comfort_noise_sent)
    }

    /// Build the payload for `seq`, stamped with wall-clock `timestamp` (epoch seconds)
    pub fn build(&mut self, seq: u64, timestamp: f64) -> Vec<u8> {
        match (self.mode, self.voice.as_mut()) {
            (ProbeMode::Voice, Some(voice)) => {
                let talking = match voice.vad.as_mut() {
                    Some(vad) => vad.advance(self.step, &mut self.rng),
                    None => true,
                };

                let (payload_type, media) = if talking {
                    (voice.spec.payload_type, audio_payload(&voice.spec, seq, &mut self.rng))
                } else {
                    voice.comfort_noise_sent += 1;
                    (COMFORT_NOISE_PT, comfort_noise(COMFORT_NOISE_SIZE, &mut self.rng))
                };

                let header = RtpHeader {
                    marker: seq == 1,
                    payload_type,
                    sequence: seq as u16,
                    timestamp: voice.timestamp,
                    ssrc: voice.ssrc,
                };
                voice.timestamp = voice.timestamp.wrapping_add(voice.spec.timestamp_increment());

                let mut buf = Vec::with_capacity(RTP_HEADER_SIZE + voice.tag.len() + media.len());
                header.write(&mut buf);
                if talking {
                    buf.extend_from_slice(&voice.tag);
                }
                buf.extend_from_slice(&media);
                buf
            }
            _ => build_convergence_payload(&self.id, &self.label, seq, timestamp),
        }
    }
}

/// Decode an echo for the given mode
pub fn parse_echo(mode: ProbeMode, data: &[u8]) -> Option<Echo> {
    match mode {
        ProbeMode::Convergence => parse_convergence_echo(data),
        ProbeMode::Voice => parse_rtp_echo(data),
    }
}
