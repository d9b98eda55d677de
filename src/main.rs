use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};

use wanprobe::cli::Args;
use wanprobe::config::Config;
use wanprobe::engine::{ProbeRun, RunControl, StopReason};
use wanprobe::export::{JsonFileSink, NullSink, SnapshotSink, StdoutSink, generate_report};
use wanprobe::logging;
use wanprobe::state::MetricsSnapshot;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    logging::init(&args.log_level);

    let target = resolve_target(&args.target, args.port)
        .with_context(|| format!("Failed to resolve target: {}", args.target))?;
    let config = Config::from_args(&args, target);

    tracing::info!(
        id = %config.id,
        label = %config.label,
        %target,
        mode = ?config.mode,
        rate = config.rate,
        "starting probe run"
    );

    let run = ProbeRun::new(config.clone()).context("Failed to open probe socket")?;
    if let Ok(local) = run.local_addr() {
        tracing::info!(%local, "probe socket bound");
    }
    spawn_signal_handler(run.control());

    let mut sink = open_sink(&args);
    let outcome = run
        .run(move |snapshot: &MetricsSnapshot| sink.publish(snapshot))
        .await
        .context("Probe run failed")?;

    // Keep stdout clean for the JSON line stream
    let report = if args.stats_stdout {
        generate_report(&outcome.snapshot, &outcome.missed, std::io::stderr())
    } else {
        generate_report(&outcome.snapshot, &outcome.missed, std::io::stdout())
    };
    report.context("Failed to write report")?;

    if config.is_voice() {
        let json = serde_json::to_string(&outcome.snapshot).context("Failed to serialize result")?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "RESULT: {}", json)?;
        stdout.flush()?;
    }

    if !outcome.is_success() {
        for e in outcome.failure.iter().chain(outcome.receiver_error.iter()) {
            eprintln!("Error: {}", e);
        }
        std::process::exit(2);
    }
    if outcome.reason == StopReason::SendFailed {
        eprintln!("Error: probe aborted after a send failure");
        std::process::exit(2);
    }

    Ok(())
}

/// Resolve a hostname or IP literal, preferring IPv4
fn resolve_target(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| anyhow::anyhow!("No addresses found for {}", host))
}

fn open_sink(args: &Args) -> Box<dyn SnapshotSink> {
    match (&args.stats_file, args.stats_stdout) {
        (Some(path), _) => Box::new(JsonFileSink::new(path)),
        (None, true) => Box::new(StdoutSink),
        (None, false) => Box::new(NullSink),
    }
}

/// Translate SIGINT/SIGTERM into one cooperative stop request
fn spawn_signal_handler(control: RunControl) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("stop requested, draining");
        control.request_stop();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
