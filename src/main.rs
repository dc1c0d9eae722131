//! relaybot - Entry Point
//!
//! Reads messages from stdin, writes JSON replies to stdout. See
//! [`relaybot::transport`] for the line format.
//!
//! Commands:
//! - `/metrics`: print the metrics snapshot
//! - `/reenable <service>`: clear a disabled service
//! - `/clear`: drop the caller's history

use relaybot::{transport, Config, HttpUpstream, Orchestrator};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let json_logs = args.iter().any(|a| a == "--json");

    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("relaybot v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: relaybot [--json]");
        println!();
        println!("Reads messages from stdin, writes JSON replies to stdout.");
        println!();
        println!("Environment variables:");
        println!("  OPENAI_API_KEY       Generalist service key");
        println!("  PERPLEXITY_API_KEY   Web-search service key");
        println!("  RUST_LOG             Log filter (default: info)");
        return Ok(());
    }

    // Logs go to stderr; stdout carries replies
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = Config::from_env();
    config.validate()?;

    info!("relaybot v{}", env!("CARGO_PKG_VERSION"));

    let upstream = HttpUpstream::from_config(&config);
    let orchestrator = Arc::new(Orchestrator::new(config, upstream));
    orchestrator.start_sweeper();

    // Single writer keeps reply lines whole
    let (replies, mut outbox) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = outbox.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let stop = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let served = transport::serve(
        orchestrator,
        BufReader::new(tokio::io::stdin()),
        replies,
        stop,
    )
    .await;

    // `serve` dropped its sender and every turn task has finished
    writer.await??;
    served?;
    Ok(())
}
