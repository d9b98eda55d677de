use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::cli::Args;
use crate::probe::Codec;

/// Probe stream type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// Tagged text probes, echoed with a responder counter suffix
    #[default]
    Convergence,
    /// RTP-framed synthetic audio, echoed verbatim
    Voice,
}

/// What the sender does when a datagram cannot be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendFailurePolicy {
    /// Stop the run (a failing socket is usually a dead interface)
    #[default]
    Abort,
    /// Count the failure and keep pacing
    Continue,
}

/// Voice activity simulation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VadConfig {
    /// Mean talk spurt duration
    #[serde(with = "duration_serde")]
    pub talk_mean: Duration,
    /// Mean silence duration
    #[serde(with = "duration_serde")]
    pub silence_mean: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            talk_mean: Duration::from_millis(1800),
            silence_mean: Duration::from_millis(1200),
        }
    }
}

/// Voice-only settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub codec: Codec,
    /// Talk/silence simulation (None = always talking)
    pub vad: Option<VadConfig>,
    /// Send RTCP sender reports to port + 1
    pub rtcp: bool,
}

/// Timing of the staged shutdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Lower bound of the RTT-scaled grace period
    #[serde(with = "duration_serde")]
    pub grace_min: Duration,
    /// Upper bound of the RTT-scaled grace period
    #[serde(with = "duration_serde")]
    pub grace_max: Duration,
    /// Interval between received-count polls
    #[serde(with = "duration_serde")]
    pub poll_interval: Duration,
    /// Maximum time spent polling
    #[serde(with = "duration_serde")]
    pub poll_window: Duration,
    /// Consecutive unchanged polls that end polling early
    pub stable_polls: u32,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_min: Duration::from_millis(2000),
            grace_max: Duration::from_millis(7000),
            poll_interval: Duration::from_millis(100),
            poll_window: Duration::from_secs(1),
            stable_polls: 3,
        }
    }
}

/// Immutable per-run configuration (the probe session)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Echo responder address
    pub target: SocketAddr,
    pub mode: ProbeMode,
    /// Probe identifier embedded in every payload
    pub id: String,
    /// Human label embedded in convergence payloads
    pub label: String,
    /// Target packets per second
    pub rate: f64,
    /// Fixed run duration after ramp-up (None = until stopped)
    #[serde(with = "opt_duration_serde")]
    pub duration: Option<Duration>,
    /// Fixed packet count (None = unlimited)
    pub count: Option<u64>,
    /// Linear ramp from `ramp_floor` to `rate`
    #[serde(with = "opt_duration_serde")]
    pub ramp_up: Option<Duration>,
    /// Starting rate of the ramp
    pub ramp_floor: f64,
    /// Requested source port (None = derive from id)
    pub source_port: Option<u16>,
    /// Voice settings (Some only in voice mode)
    pub voice: Option<VoiceConfig>,
    /// Snapshot publisher cadence
    #[serde(with = "duration_serde")]
    pub snapshot_interval: Duration,
    /// Receiver socket read timeout
    #[serde(with = "duration_serde")]
    pub recv_timeout: Duration,
    /// Lag behind schedule after which pacing restarts from now
    #[serde(with = "duration_serde")]
    pub schedule_reset: Duration,
    pub send_failure: SendFailurePolicy,
    /// Counter drop that marks a responder restart
    pub resync_slack: u64,
    /// How far the responder count may sit below our received count
    /// before directional loss collapses to RX-only
    pub directional_tolerance: u64,
    pub shutdown: ShutdownConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: SocketAddr::from((Ipv4Addr::LOCALHOST, 6200)),
            mode: ProbeMode::Convergence,
            id: "CONV-000".to_string(),
            label: "Unknown".to_string(),
            rate: 50.0,
            duration: None,
            count: None,
            ramp_up: None,
            ramp_floor: 10.0,
            source_port: None,
            voice: None,
            snapshot_interval: Duration::from_millis(200),
            recv_timeout: Duration::from_millis(200),
            schedule_reset: Duration::from_millis(500),
            send_failure: SendFailurePolicy::Abort,
            resync_slack: 100,
            directional_tolerance: 0,
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl Config {
    /// Build the run configuration from validated arguments and a resolved target
    pub fn from_args(args: &Args, target: SocketAddr) -> Self {
        let (id, embedded_label) = split_probe_id(&args.id);
        let label = args.label.clone().unwrap_or(embedded_label);

        let (mode, voice) = if args.is_voice() {
            let vad = args.enable_vad.then(|| VadConfig {
                talk_mean: Duration::from_secs_f64(args.talk_mean),
                silence_mean: Duration::from_secs_f64(args.silence_mean),
            });
            let voice = VoiceConfig {
                codec: Codec::from_name(&args.codec),
                vad,
                rtcp: args.enable_rtcp,
            };
            (ProbeMode::Voice, Some(voice))
        } else {
            (ProbeMode::Convergence, None)
        };

        let rate = args.rate.unwrap_or_else(|| {
            voice
                .as_ref()
                .map(|v| v.codec.spec().packets_per_sec)
                .unwrap_or(50.0)
        });

        Self {
            target,
            mode,
            id,
            label,
            rate,
            duration: args.duration(),
            count: if args.count == 0 { None } else { Some(args.count) },
            ramp_up: args.ramp_up(),
            source_port: if args.source_port == 0 { None } else { Some(args.source_port) },
            voice,
            snapshot_interval: Duration::from_millis(args.snapshot_interval_ms),
            send_failure: if args.continue_on_send_error {
                SendFailurePolicy::Continue
            } else {
                SendFailurePolicy::Abort
            },
            ..Self::default()
        }
    }

    /// Nominal gap between packets at the target rate
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate)
    }

    /// Outage length that counts as a blackout: max(100ms, 1.5 x interval)
    pub fn blackout_threshold(&self) -> Duration {
        self.interval()
            .mul_f64(1.5)
            .max(Duration::from_millis(100))
    }

    pub fn is_voice(&self) -> bool {
        self.mode == ProbeMode::Voice
    }
}

/// Split "Label (ID)" into (id, label); plain ids get the label "Unknown"
pub fn split_probe_id(raw: &str) -> (String, String) {
    let raw = raw.trim();
    if let Some(open) = raw.rfind('(')
        && raw.ends_with(')')
    {
        let id = raw[open + 1..raw.len() - 1].trim();
        let label = raw[..open].trim();
        if !id.is_empty() {
            let label = if label.is_empty() { "Unknown" } else { label };
            return (id.to_string(), label.to_string());
        }
    }
    (raw.to_string(), "Unknown".to_string())
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Serde helper for Option<Duration>
mod opt_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["wanprobe", "-D", "192.0.2.1"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    fn target() -> SocketAddr {
        "192.0.2.1:6200".parse().unwrap()
    }

    #[test]
    fn test_split_probe_id() {
        assert_eq!(
            split_probe_id("Branch Paris (CONV-007)"),
            ("CONV-007".to_string(), "Branch Paris".to_string())
        );
        assert_eq!(
            split_probe_id("CONV-001"),
            ("CONV-001".to_string(), "Unknown".to_string())
        );
        assert_eq!(
            split_probe_id("(CONV-002)"),
            ("CONV-002".to_string(), "Unknown".to_string())
        );
        // Empty parentheses are not an id
        assert_eq!(split_probe_id("Weird ()").0, "Weird ()");
    }

    #[test]
    fn test_blackout_threshold_floor() {
        let mut config = Config::default();

        // 50 pps -> 20ms interval -> 30ms, floored to 100ms
        config.rate = 50.0;
        assert_eq!(config.blackout_threshold(), Duration::from_millis(100));

        // 5 pps -> 200ms interval -> 300ms
        config.rate = 5.0;
        assert_eq!(config.blackout_threshold(), Duration::from_millis(300));
    }

    #[test]
    fn test_voice_rate_defaults_to_codec() {
        let config = Config::from_args(&args(&["--mode", "voice", "--codec", "G.729"]), target());
        assert!(config.is_voice());
        assert_eq!(config.rate, 50.0);
        let voice = config.voice.unwrap();
        assert_eq!(voice.codec, Codec::G729);
        assert!(voice.vad.is_none());
    }

    #[test]
    fn test_explicit_values_carried() {
        let config = Config::from_args(
            &args(&[
                "--id",
                "Lab (CONV-010)",
                "--rate",
                "100",
                "-c",
                "500",
                "--source-port",
                "40000",
                "--continue-on-send-error",
            ]),
            target(),
        );
        assert_eq!(config.id, "CONV-010");
        assert_eq!(config.label, "Lab");
        assert_eq!(config.rate, 100.0);
        assert_eq!(config.count, Some(500));
        assert_eq!(config.source_port, Some(40000));
        assert_eq!(config.send_failure, SendFailurePolicy::Continue);
        assert!(config.voice.is_none());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = Config::default();
        config.duration = Some(Duration::from_secs(30));
        let json = serde_json::to_string(&config).unwrap();
        let restored: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.duration, Some(Duration::from_secs(30)));
        assert_eq!(restored.ramp_up, None);
        assert_eq!(restored.shutdown, ShutdownConfig::default());
    }
}
