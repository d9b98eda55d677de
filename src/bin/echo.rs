use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;

use wanprobe::cli::EchoArgs;
use wanprobe::logging;
use wanprobe::responder::{Responder, ResponderConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = EchoArgs::parse();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    logging::init(&args.log_level);

    let config = ResponderConfig {
        session_timeout: Duration::from_secs(args.session_timeout),
        ..ResponderConfig::default()
    };
    let responder = Responder::bind(&args.listen_addrs(), config).context("Failed to bind echo ports")?;
    let handle = responder.handle();
    let threads = responder.spawn();

    tokio::signal::ctrl_c().await.ok();
    tracing::info!(sessions = handle.session_count(), "shutting down");
    handle.shutdown();

    // Threads notice the shutdown within one read timeout
    let results = tokio::task::spawn_blocking(move || {
        threads
            .into_iter()
            .map(|t| t.join().map_err(|_| anyhow::anyhow!("responder thread panicked")))
            .collect::<Vec<_>>()
    })
    .await?;
    for result in results {
        result??;
    }
    Ok(())
}
