//! LAN discovery: broadcast probe, unicast JSON reply.
//!
//! A probe is a single UDP datagram carrying a 4-byte scanner-chosen
//! correlation value; the daemon answers unicast to the probe's source
//! address with a JSON [`ServerDescriptor`] in one datagram (no length
//! prefix). Discovery is best-effort: dropped packets mean missing
//! servers, never a global failure, and malformed replies are dropped
//! silently.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::protocol::ServerDescriptor;

/// Probe payload size: an arbitrary correlation value.
pub const PROBE_LEN: usize = 4;

const MAX_REPLY_LEN: usize = 64 * 1024;

/// Server side: answers every probe with a descriptor snapshot.
pub struct DiscoveryDaemon {
    socket: UdpSocket,
    descriptor: Arc<ServerDescriptor>,
}

impl DiscoveryDaemon {
    /// Binds the discovery socket. Callers must not pass port 0 here; a
    /// disabled discovery port means the daemon is simply not started.
    pub async fn bind(port: u16, descriptor: Arc<ServerDescriptor>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
        tracing::info!("discovery daemon listening on udp port {}", port);
        Ok(DiscoveryDaemon { socket, descriptor })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Reply loop; runs until the task is dropped.
    pub async fn run(self) {
        let mut buf = [0u8; 64];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(error) => {
                    tracing::warn!("discovery recv failed: {}", error);
                    continue;
                }
            };
            if len < PROBE_LEN {
                tracing::debug!("dropping short discovery probe from {}", peer);
                continue;
            }
            let reply = match serde_json::to_vec(self.descriptor.as_ref()) {
                Ok(reply) => reply,
                Err(error) => {
                    tracing::error!("cannot serialize server descriptor: {}", error);
                    continue;
                }
            };
            tracing::debug!("answering discovery probe from {}", peer);
            if let Err(error) = self.socket.send_to(&reply, peer).await {
                tracing::warn!("discovery reply to {} failed: {}", peer, error);
            }
        }
    }
}

/// One discovery reply, tagged with the address it came from.
#[derive(Clone, Debug)]
pub struct Discovered {
    pub descriptor: ServerDescriptor,
    pub source: SocketAddr,
}

/// Client side: broadcast one probe, stream back distinct replies until
/// the wait window closes.
pub async fn scan(
    discover_port: u16,
    wait: std::time::Duration,
) -> anyhow::Result<async_channel::Receiver<Discovered>> {
    let socket = broadcast_socket()?;
    let probe: [u8; PROBE_LEN] = rand::random();
    let mut targets = vec![SocketAddrV4::new(Ipv4Addr::BROADCAST, discover_port)];
    for iface in if_addrs::get_if_addrs().unwrap_or_default() {
        if let if_addrs::IfAddr::V4(v4) = iface.addr {
            if let Some(broadcast) = v4.broadcast {
                targets.push(SocketAddrV4::new(broadcast, discover_port));
            }
        }
    }
    for target in &targets {
        if let Err(error) = socket.send_to(&probe, *target).await {
            tracing::debug!("discovery probe to {} failed: {}", target, error);
        }
    }
    let (sender, receiver) = async_channel::unbounded();
    tokio::spawn(collect_replies(socket, wait, sender));
    Ok(receiver)
}

async fn collect_replies(
    socket: UdpSocket,
    wait: std::time::Duration,
    sender: async_channel::Sender<Discovered>,
) {
    let deadline = tokio::time::Instant::now() + wait;
    let mut seen = std::collections::HashSet::new();
    let mut buf = vec![0u8; MAX_REPLY_LEN];
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let received = tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await;
        let (len, source) = match received {
            Ok(Ok(received)) => received,
            Ok(Err(error)) => {
                tracing::debug!("discovery reply recv failed: {}", error);
                continue;
            }
            Err(_) => break,
        };
        let Ok(descriptor) = serde_json::from_slice::<ServerDescriptor>(&buf[..len]) else {
            tracing::debug!("dropping malformed discovery reply from {}", source);
            continue;
        };
        if !seen.insert((source.ip(), descriptor.port)) {
            continue;
        }
        if sender
            .send(Discovered { descriptor, source })
            .await
            .is_err()
        {
            break;
        }
    }
}

fn broadcast_socket() -> anyhow::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_broadcast(true)?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}
