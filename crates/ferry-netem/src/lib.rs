//! ferry-netem — a UDP link emulator for exercising the transfer protocol
//! under loss, delay, jitter, and duplication.
//!
//! The emulator sits between senders and a receiver. Forward traffic is
//! relayed to a fixed target; reverse traffic is routed back by reading
//! the session identifier out of each datagram (`peek_file_id`), so many
//! clients can share one relay without any transport-layer state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use ferry_core::wire::peek_file_id;

#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Client-facing address.
    pub listen: SocketAddr,
    /// Where forward traffic goes.
    pub target: SocketAddr,
    /// Probability of discarding a forwarded datagram, in [0, 1].
    pub loss_rate: f64,
    /// Base one-way delay added to every forwarded datagram.
    pub delay_ms: u64,
    /// Half-width of uniform jitter around the base delay. The final delay
    /// clamps at zero.
    pub jitter_ms: u64,
    /// Probability of emitting one extra copy of a forwarded datagram.
    pub duplicate_rate: f64,
    /// Reverse traffic with no known client mapping is normally dropped.
    /// Turning this on sends it to every known client instead — a testing
    /// convenience only, never for real deployments.
    pub broadcast_fallback: bool,
}

impl EmulatorConfig {
    /// A transparent relay: no loss, no delay, no duplication.
    pub fn transparent(listen: SocketAddr, target: SocketAddr) -> Self {
        EmulatorConfig {
            listen,
            target,
            loss_rate: 0.0,
            delay_ms: 0,
            jitter_ms: 0,
            duplicate_rate: 0.0,
            broadcast_fallback: false,
        }
    }
}

/// Lifetime counters, shared with the owner for inspection and the
/// shutdown report.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub forwarded: AtomicU64,
    pub dropped: AtomicU64,
    pub delayed: AtomicU64,
    pub duplicated: AtomicU64,
    pub unroutable: AtomicU64,
}

pub struct LinkEmulator {
    cfg: EmulatorConfig,
    client_sock: Arc<UdpSocket>,
    target_sock: Arc<UdpSocket>,
    clients: Arc<DashMap<u64, SocketAddr>>,
    stats: Arc<RelayStats>,
}

impl LinkEmulator {
    pub async fn bind(cfg: EmulatorConfig) -> Result<Self> {
        let client_sock = UdpSocket::bind(cfg.listen)
            .await
            .with_context(|| format!("failed to bind {}", cfg.listen))?;
        let target_sock = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind target-side socket")?;
        tracing::info!(
            listen = %client_sock.local_addr()?,
            target = %cfg.target,
            loss_rate = cfg.loss_rate,
            delay_ms = cfg.delay_ms,
            jitter_ms = cfg.jitter_ms,
            duplicate_rate = cfg.duplicate_rate,
            "link emulator up"
        );
        Ok(LinkEmulator {
            cfg,
            client_sock: Arc::new(client_sock),
            target_sock: Arc::new(target_sock),
            clients: Arc::new(DashMap::new()),
            stats: Arc::new(RelayStats::default()),
        })
    }

    /// The client-facing address (useful when bound to port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.client_sock.local_addr()
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    /// Relay until the shutdown channel fires, then log the counters.
    pub async fn run(self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let forward = tokio::spawn(Self::client_loop(
            self.client_sock.clone(),
            self.target_sock.clone(),
            self.clients.clone(),
            self.cfg.clone(),
            self.stats.clone(),
            shutdown.resubscribe(),
        ));
        let reverse = tokio::spawn(Self::target_loop(
            self.client_sock.clone(),
            self.target_sock.clone(),
            self.clients.clone(),
            self.cfg.clone(),
            self.stats.clone(),
            shutdown,
        ));

        let _ = forward.await;
        let _ = reverse.await;

        tracing::info!(
            forwarded = self.stats.forwarded.load(Ordering::Relaxed),
            dropped = self.stats.dropped.load(Ordering::Relaxed),
            delayed = self.stats.delayed.load(Ordering::Relaxed),
            duplicated = self.stats.duplicated.load(Ordering::Relaxed),
            unroutable = self.stats.unroutable.load(Ordering::Relaxed),
            "link emulator stopped"
        );
        Ok(())
    }

    /// Client→target: learn the client behind each session, then forward.
    async fn client_loop(
        client_sock: Arc<UdpSocket>,
        target_sock: Arc<UdpSocket>,
        clients: Arc<DashMap<u64, SocketAddr>>,
        cfg: EmulatorConfig,
        stats: Arc<RelayStats>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,

                result = client_sock.recv_from(&mut buf) => {
                    let (len, from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "client-side recv failed");
                            continue;
                        }
                    };
                    let data = Bytes::copy_from_slice(&buf[..len]);

                    if let Some(file_id) = peek_file_id(&data) {
                        clients.insert(file_id, from);
                        tracing::trace!(
                            file_id = format_args!("{file_id:016x}"),
                            client = %from,
                            "client mapping recorded"
                        );
                    }

                    forward(&cfg, &stats, target_sock.clone(), data, cfg.target).await;
                }
            }
        }
    }

    /// Target→client: route each response to the session's recorded client.
    async fn target_loop(
        client_sock: Arc<UdpSocket>,
        target_sock: Arc<UdpSocket>,
        clients: Arc<DashMap<u64, SocketAddr>>,
        cfg: EmulatorConfig,
        stats: Arc<RelayStats>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,

                result = target_sock.recv_from(&mut buf) => {
                    let (len, _from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "target-side recv failed");
                            continue;
                        }
                    };
                    let data = Bytes::copy_from_slice(&buf[..len]);

                    let client = peek_file_id(&data).and_then(|id| clients.get(&id).map(|c| *c));
                    match client {
                        Some(addr) => {
                            forward(&cfg, &stats, client_sock.clone(), data, addr).await;
                        }
                        None if cfg.broadcast_fallback => {
                            tracing::debug!("no client mapping, broadcasting to all known clients");
                            for entry in clients.iter() {
                                forward(&cfg, &stats, client_sock.clone(), data.clone(), *entry.value())
                                    .await;
                            }
                        }
                        None => {
                            stats.unroutable.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!("no client mapping, dropping response");
                        }
                    }
                }
            }
        }
    }
}

/// Apply the configured perturbations to one datagram and send it.
///
/// Drop, delay, and duplication are sampled independently. An on-time send
/// goes out inline; a delayed one is handed to a one-shot timer task so
/// the receive loop never stalls. A duplicate trails a delayed original by
/// one extra millisecond, otherwise it goes out back-to-back.
async fn forward(
    cfg: &EmulatorConfig,
    stats: &Arc<RelayStats>,
    sock: Arc<UdpSocket>,
    data: Bytes,
    to: SocketAddr,
) {
    let (dropped, delay, duplicate) = {
        let mut rng = rand::thread_rng();
        (
            rng.gen::<f64>() < cfg.loss_rate,
            sample_delay(cfg.delay_ms, cfg.jitter_ms, &mut rng),
            rng.gen::<f64>() < cfg.duplicate_rate,
        )
    };

    if dropped {
        stats.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(bytes = data.len(), %to, "datagram dropped");
        return;
    }

    if duplicate {
        stats.duplicated.fetch_add(1, Ordering::Relaxed);
        let dup_delay = if delay.is_zero() {
            Duration::ZERO
        } else {
            delay + Duration::from_millis(1)
        };
        dispatch(stats.clone(), sock.clone(), data.clone(), to, delay).await;
        dispatch(stats.clone(), sock, data, to, dup_delay).await;
    } else {
        dispatch(stats.clone(), sock, data, to, delay).await;
    }
}

async fn dispatch(
    stats: Arc<RelayStats>,
    sock: Arc<UdpSocket>,
    data: Bytes,
    to: SocketAddr,
    delay: Duration,
) {
    if delay.is_zero() {
        transmit(&stats, &sock, &data, to).await;
        return;
    }

    stats.delayed.fetch_add(1, Ordering::Relaxed);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        transmit(&stats, &sock, &data, to).await;
    });
}

async fn transmit(stats: &RelayStats, sock: &UdpSocket, data: &[u8], to: SocketAddr) {
    match sock.send_to(data, to).await {
        Ok(_) => {
            stats.forwarded.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => tracing::warn!(%to, error = %e, "relay send failed"),
    }
}

/// Base delay plus uniform jitter, clamped at zero.
fn sample_delay(delay_ms: u64, jitter_ms: u64, rng: &mut impl Rng) -> Duration {
    if delay_ms == 0 && jitter_ms == 0 {
        return Duration::ZERO;
    }
    let jitter = if jitter_ms > 0 {
        rng.gen_range(-(jitter_ms as i64)..=jitter_ms as i64)
    } else {
        0
    };
    Duration::from_millis((delay_ms as i64 + jitter).max(0) as u64)
}
