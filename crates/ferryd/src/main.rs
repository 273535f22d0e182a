//! ferryd — the receiving end of the ferry transfer protocol.
//!
//! Binds one UDP socket, serves any number of concurrent sessions, and
//! persists progress so interrupted transfers can resume. Runs until
//! interrupted.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use ferry_transfer::{Receiver, ReceiverConfig};

#[derive(Parser, Debug)]
#[command(name = "ferryd")]
#[command(about = "Reliable file transfer receiver over UDP")]
#[command(version)]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// UDP port to listen on.
    #[arg(long)]
    port: u16,

    /// Directory receiving delivered files and in-flight session state.
    #[arg(long, default_value = "./downloads")]
    out_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let receiver = Receiver::bind(ReceiverConfig {
        bind: (args.bind, args.port).into(),
        out_dir: args.out_dir,
    })
    .await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let serve = tokio::spawn(receiver.run(shutdown_tx.subscribe()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    let _ = shutdown_tx.send(());
    serve.await??;
    Ok(())
}
