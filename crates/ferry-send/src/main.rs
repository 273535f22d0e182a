//! ferry-send — push one file to a ferryd receiver.
//!
//! Exits 0 once every chunk has been acknowledged; exits nonzero when the
//! retry budget runs out or the local file cannot be read.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ferry_transfer::{Sender, SenderConfig};

#[derive(Parser, Debug)]
#[command(name = "ferry-send")]
#[command(about = "Reliable file transfer sender over UDP")]
#[command(version)]
struct Args {
    /// File to send.
    file: PathBuf,

    /// Receiver host.
    #[arg(long)]
    host: String,

    /// Receiver UDP port.
    #[arg(long)]
    port: u16,

    /// Chunk size in bytes.
    #[arg(long, default_value_t = 1024, value_parser = clap::value_parser!(u32).range(1..))]
    chunk: u32,

    /// Initial retransmission timeout in seconds.
    #[arg(long, default_value_t = 0.3)]
    rto: f64,

    /// Retransmissions tolerated per exchange before giving up.
    #[arg(long, default_value_t = 50)]
    max_retry: u32,

    /// Always start from chunk 0, even if the receiver holds a partial.
    #[arg(long)]
    no_resume: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let peer = tokio::net::lookup_host((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to resolve {}:{}", args.host, args.port))?
        .next()
        .context("receiver resolved to no addresses")?;

    let cfg = SenderConfig {
        chunk_size: args.chunk,
        rto_init: Duration::from_secs_f64(args.rto),
        max_retries: args.max_retry,
        resume: !args.no_resume,
        ..SenderConfig::default()
    };

    let mut sender = Sender::connect(peer, cfg).await?;
    let report = sender
        .send_file(&args.file)
        .await
        .with_context(|| format!("transfer of {} failed", args.file.display()))?;

    tracing::info!(
        chunks = report.chunks_sent,
        retransmissions = report.retransmissions,
        goodput_mib_s = format_args!("{:.2}", report.goodput_mib_s()),
        "delivered"
    );
    Ok(())
}
