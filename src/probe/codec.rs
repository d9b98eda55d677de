//! Voice codec catalog and synthetic media payloads.
//!
//! No audio is encoded. Each codec family gets a byte pattern with roughly
//! the entropy and size of real media so the probe stream looks like a call
//! to shapers and DPI engines on the path.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// RTP payload type for comfort noise (RFC 3389)
pub const COMFORT_NOISE_PT: u8 = 13;
/// Default comfort noise body length
pub const COMFORT_NOISE_SIZE: usize = 13;
/// Spread of companded sample values around their base level
const PCM_NOISE_STDDEV: f64 = 15.0;

/// Supported voice codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Codec {
    #[default]
    #[serde(rename = "G.711-ulaw")]
    G711Ulaw,
    #[serde(rename = "G.711-alaw")]
    G711Alaw,
    #[serde(rename = "G.729")]
    G729,
    #[serde(rename = "G.722")]
    G722,
    #[serde(rename = "Opus")]
    Opus,
}

/// Byte-pattern family used for synthetic payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecFamily {
    /// Narrow-band companded PCM
    Pcm,
    /// CELP-compressed frames
    Celp,
    /// Variable bitrate with a TOC byte
    Vbr,
}

/// Static codec parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodecSpec {
    pub name: &'static str,
    pub payload_type: u8,
    pub sample_rate: u32,
    /// Packetization time in milliseconds
    pub ptime_ms: u32,
    /// Media bytes per packet
    pub payload_size: usize,
    pub packets_per_sec: f64,
    /// E-model equipment impairment factor
    pub ie_factor: f64,
    pub family: CodecFamily,
}

impl CodecSpec {
    /// RTP timestamp advance per packet
    pub fn timestamp_increment(&self) -> u32 {
        self.sample_rate * self.ptime_ms / 1000
    }
}

impl Codec {
    pub const ALL: [Codec; 5] = [
        Codec::G711Ulaw,
        Codec::G711Alaw,
        Codec::G729,
        Codec::G722,
        Codec::Opus,
    ];

    pub fn spec(&self) -> CodecSpec {
        match self {
            Codec::G711Ulaw => CodecSpec {
                name: "G.711-ulaw",
                payload_type: 0,
                sample_rate: 8000,
                ptime_ms: 20,
                payload_size: 160,
                packets_per_sec: 50.0,
                ie_factor: 0.0,
                family: CodecFamily::Pcm,
            },
            Codec::G711Alaw => CodecSpec {
                name: "G.711-alaw",
                payload_type: 8,
                sample_rate: 8000,
                ptime_ms: 20,
                payload_size: 160,
                packets_per_sec: 50.0,
                ie_factor: 0.0,
                family: CodecFamily::Pcm,
            },
            Codec::G729 => CodecSpec {
                name: "G.729",
                payload_type: 18,
                sample_rate: 8000,
                ptime_ms: 20,
                payload_size: 20,
                packets_per_sec: 50.0,
                ie_factor: 10.0,
                family: CodecFamily::Celp,
            },
            Codec::G722 => CodecSpec {
                name: "G.722",
                payload_type: 9,
                sample_rate: 16000,
                ptime_ms: 20,
                payload_size: 160,
                packets_per_sec: 50.0,
                ie_factor: 0.0,
                family: CodecFamily::Pcm,
            },
            Codec::Opus => CodecSpec {
                name: "Opus",
                payload_type: 111,
                sample_rate: 48000,
                ptime_ms: 20,
                payload_size: 60,
                packets_per_sec: 50.0,
                ie_factor: 0.0,
                family: CodecFamily::Vbr,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        self.spec().name
    }

    /// Look up a codec by name, falling back to G.711 u-law
    pub fn from_name(name: &str) -> Self {
        let wanted = normalize(name);
        Self::ALL
            .into_iter()
            .find(|c| normalize(c.name()) == wanted)
            .unwrap_or_else(|| {
                warn!(codec = name, "unknown codec, using G.711-ulaw profile");
                Codec::G711Ulaw
            })
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Generate a media payload shaped like the codec family
pub fn audio_payload<R: Rng>(spec: &CodecSpec, sequence: u64, rng: &mut R) -> Vec<u8> {
    let size = spec.payload_size;
    let mut payload = vec![0u8; size];
    if size == 0 {
        return payload;
    }

    match spec.family {
        CodecFamily::Pcm => {
            // Companded samples cluster around 0xFF / 0x7F; a slow sine
            // envelope stands in for speech loudness
            let envelope = (sequence as f64 * 0.05).sin().abs() * 0.7 + 0.3;
            let noise = Normal::new(0.0, PCM_NOISE_STDDEV).ok();
            for (i, byte) in payload.iter_mut().enumerate() {
                let base: f64 = if (sequence as usize + i) % 2 == 0 { 255.0 } else { 127.0 };
                let variation = noise.map_or(0.0, |n| n.sample(rng)) * envelope;
                *byte = (base + variation).round().clamp(0.0, 255.0) as u8;
            }
        }
        CodecFamily::Celp => {
            // First byte carries the LSP indices and has the most entropy
            payload[0] = rng.gen_range(0x80..=0xFF);
            for byte in payload[1..].iter_mut() {
                *byte = rng.gen_range(0x20..=0xDF);
            }
        }
        CodecFamily::Vbr => {
            // TOC byte: SILK-only, 20ms, stereo
            payload[0] = 0x78;
            rng.fill(&mut payload[1..]);
        }
    }

    payload
}

/// Generate an RFC 3389 comfort noise body: noise level then reflection coefficients
pub fn comfort_noise<R: Rng>(size: usize, rng: &mut R) -> Vec<u8> {
    let mut payload = vec![0u8; size.max(1)];
    payload[0] = rng.gen_range(0x30..=0x50);
    rng.fill(&mut payload[1..]);
    payload
}
