use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Active SD-WAN path probe: convergence and voice echo streams with loss, jitter, blackout and MOS
#[derive(Parser, Debug, Clone)]
#[command(name = "wanprobe")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Echo responder address (IP or hostname)
    #[arg(short = 'D', long = "target")]
    pub target: String,

    /// Echo responder port
    #[arg(long = "port", default_value = "6200")]
    pub port: u16,

    /// Probe mode (convergence, voice)
    #[arg(short = 'm', long = "mode", default_value = "convergence")]
    pub mode: String,

    /// Probe identifier; "Label (ID)" is split into label and id
    #[arg(long = "id", default_value = "CONV-000")]
    pub id: String,

    /// Human label (overrides a label embedded in --id)
    #[arg(long = "label")]
    pub label: Option<String>,

    /// Packets per second (voice mode defaults to the codec rate)
    #[arg(short = 'C', long = "rate")]
    pub rate: Option<f64>,

    /// Stop after this many seconds (0 = run until interrupted)
    #[arg(short = 'd', long = "duration", default_value = "0")]
    pub duration: f64,

    /// Stop after this many packets (0 = unlimited)
    #[arg(short = 'c', long = "count", default_value = "0")]
    pub count: u64,

    /// Ramp the rate up linearly over this many seconds
    #[arg(long = "ramp-up", default_value = "0")]
    pub ramp_up: f64,

    /// Source port (0 = derive from the id, random if it has no number)
    #[arg(long = "source-port", default_value = "0")]
    pub source_port: u16,

    /// Voice codec (G.711-ulaw, G.711-alaw, G.729, G.722, Opus)
    #[arg(long = "codec", default_value = "G.711-ulaw")]
    pub codec: String,

    /// Simulate voice activity (talk spurts and comfort noise)
    #[arg(long = "enable-vad")]
    pub enable_vad: bool,

    /// Send RTCP sender reports to port + 1
    #[arg(long = "enable-rtcp")]
    pub enable_rtcp: bool,

    /// Mean talk spurt duration in seconds (with --enable-vad)
    #[arg(long = "talk-mean", default_value = "1.8")]
    pub talk_mean: f64,

    /// Mean silence duration in seconds (with --enable-vad)
    #[arg(long = "silence-mean", default_value = "1.2")]
    pub silence_mean: f64,

    /// Snapshot JSON file, rewritten every --snapshot-interval
    #[arg(long = "stats-file")]
    pub stats_file: Option<PathBuf>,

    /// Emit snapshots as JSON lines on stdout instead of a file
    #[arg(long = "stats-stdout", conflicts_with = "stats_file")]
    pub stats_stdout: bool,

    /// Snapshot cadence in milliseconds
    #[arg(long = "snapshot-interval", default_value = "200")]
    pub snapshot_interval_ms: u64,

    /// Keep sending after a socket send error instead of aborting
    #[arg(long = "continue-on-send-error")]
    pub continue_on_send_error: bool,

    /// Log level when RUST_LOG is not set
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Get fixed run duration (None = until interrupted)
    pub fn duration(&self) -> Option<Duration> {
        (self.duration > 0.0).then(|| Duration::from_secs_f64(self.duration))
    }

    /// Get ramp-up duration (None = start at full rate)
    pub fn ramp_up(&self) -> Option<Duration> {
        (self.ramp_up > 0.0).then(|| Duration::from_secs_f64(self.ramp_up))
    }

    /// Check if voice mode was requested
    pub fn is_voice(&self) -> bool {
        self.mode.eq_ignore_ascii_case("voice")
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        let mode = self.mode.to_lowercase();
        if !["convergence", "voice"].contains(&mode.as_str()) {
            return Err(format!("Unknown mode: {}. Use convergence or voice", self.mode));
        }

        if self.target.trim().is_empty() {
            return Err("Target cannot be empty".into());
        }

        if self.port == 0 {
            return Err("Port must be non-zero".into());
        }

        if self.id.trim().is_empty() {
            return Err("Probe id cannot be empty".into());
        }

        if let Some(rate) = self.rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err("Rate must be positive".into());
            }
            // Upper bound keeps the pacing loop and history window meaningful
            const MAX_RATE: f64 = 10_000.0;
            if rate > MAX_RATE {
                return Err(format!("Rate cannot exceed {} pps", MAX_RATE));
            }
        }

        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err("Duration cannot be negative".into());
        }

        if !self.ramp_up.is_finite() || self.ramp_up < 0.0 {
            return Err("Ramp-up cannot be negative".into());
        }

        if self.enable_vad && (self.talk_mean <= 0.0 || self.silence_mean <= 0.0) {
            return Err("Talk and silence means must be positive".into());
        }

        if self.snapshot_interval_ms == 0 {
            return Err("Snapshot interval must be at least 1ms".into());
        }

        Ok(())
    }
}

/// UDP echo responder for wanprobe streams
#[derive(Parser, Debug, Clone)]
#[command(name = "wanprobe-echo")]
#[command(author, version, about, long_about = None)]
pub struct EchoArgs {
    /// Address to listen on
    #[arg(long = "ip", default_value = "0.0.0.0")]
    pub ip: IpAddr,

    /// Comma-separated ports to serve
    #[arg(long = "ports", value_delimiter = ',', default_value = "6100,6200")]
    pub ports: Vec<u16>,

    /// Seconds of silence after which a session is forgotten
    #[arg(long = "session-timeout", default_value = "60")]
    pub session_timeout: u64,

    /// Log level when RUST_LOG is not set
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

impl EchoArgs {
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.ports.iter().map(|&p| SocketAddr::new(self.ip, p)).collect()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.ports.is_empty() {
            return Err("At least one port is required".into());
        }
        if self.ports.contains(&0) {
            return Err("Ports must be non-zero".into());
        }
        if self.session_timeout == 0 {
            return Err("Session timeout must be at least 1s".into());
        }
        Ok(())
    }
}
