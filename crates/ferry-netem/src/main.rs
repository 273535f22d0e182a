//! ferry-netem — UDP link emulator CLI.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use ferry_netem::{EmulatorConfig, LinkEmulator};

#[derive(Parser, Debug)]
#[command(name = "ferry-netem")]
#[command(about = "UDP relay injecting loss, delay, jitter, and duplication")]
#[command(version)]
struct Args {
    /// Client-facing UDP port.
    #[arg(long)]
    listen_port: u16,

    /// Host the relay forwards to.
    #[arg(long)]
    target_host: String,

    /// Port the relay forwards to.
    #[arg(long)]
    target_port: u16,

    /// Probability of dropping a forwarded datagram (0.0 - 1.0).
    #[arg(long, default_value_t = 0.0)]
    loss_rate: f64,

    /// Base one-way delay in milliseconds.
    #[arg(long, default_value_t = 0)]
    delay: u64,

    /// Uniform jitter half-width in milliseconds.
    #[arg(long, default_value_t = 0)]
    jitter: u64,

    /// Probability of duplicating a forwarded datagram (0.0 - 1.0).
    #[arg(long, default_value_t = 0.0)]
    duplicate_rate: f64,

    /// Send unroutable reverse traffic to every known client instead of
    /// dropping it. Testing convenience only.
    #[arg(long)]
    broadcast_fallback: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let target = tokio::net::lookup_host((args.target_host.as_str(), args.target_port))
        .await
        .with_context(|| format!("failed to resolve {}:{}", args.target_host, args.target_port))?
        .next()
        .context("target resolved to no addresses")?;

    let cfg = EmulatorConfig {
        listen: ([0, 0, 0, 0], args.listen_port).into(),
        target,
        loss_rate: args.loss_rate.clamp(0.0, 1.0),
        delay_ms: args.delay,
        jitter_ms: args.jitter,
        duplicate_rate: args.duplicate_rate.clamp(0.0, 1.0),
        broadcast_fallback: args.broadcast_fallback,
    };

    let emulator = LinkEmulator::bind(cfg).await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let relay = tokio::spawn(emulator.run(shutdown_tx.subscribe()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    let _ = shutdown_tx.send(());
    relay.await??;
    Ok(())
}
