//! The server daemon: TLS setup, descriptor snapshot, discovery and the
//! control accept loop.

use anyhow::Context;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use remote::discovery::DiscoveryDaemon;
use remote::protocol::{ServerDescriptor, SharingDescriptor};

use crate::server::config::ServerConfig;
use crate::server::session;

/// State shared by every session task.
pub struct Shared {
    pub config: ServerConfig,
    pub sharings: std::collections::HashMap<String, Arc<common::sharing::Sharing>>,
    pub tls: Option<tokio_rustls::TlsAcceptor>,
    pub ssl_fingerprint: Option<String>,
    pub descriptor: ServerDescriptor,
    /// Control listener address; transfer endpoints bind on the same IP.
    pub bind_ip: std::net::IpAddr,
    pub sessions: tokio::sync::Mutex<std::collections::HashMap<u64, std::net::SocketAddr>>,
    next_session_id: AtomicU64,
}

impl Shared {
    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A bound, not yet running server.
pub struct Server {
    shared: Arc<Shared>,
    listener: tokio::net::TcpListener,
    discovery: Option<DiscoveryDaemon>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        let (tls, ssl_fingerprint) = if config.ssl {
            remote::tls::install_crypto_provider();
            let cert_key = match (&config.ssl_cert, &config.ssl_privkey) {
                (Some(cert), Some(key)) => remote::tls::load_cert_key(cert, key)?,
                _ => {
                    let generated = remote::tls::generate_self_signed_cert()?;
                    tracing::info!(
                        "no certificate configured; generated an ephemeral self-signed one"
                    );
                    generated
                }
            };
            let fingerprint = remote::tls::fingerprint_to_hex(&cert_key.fingerprint);
            tracing::info!("TLS certificate fingerprint: {}", fingerprint);
            let server_config = remote::tls::create_server_config(&cert_key)?;
            (
                Some(tokio_rustls::TlsAcceptor::from(server_config)),
                Some(fingerprint),
            )
        } else {
            (None, None)
        };
        let listener = tokio::net::TcpListener::bind((config.address.as_str(), config.port))
            .await
            .with_context(|| {
                format!("esd: cannot bind control port {}:{}", config.address, config.port)
            })?;
        let local_addr = listener.local_addr()?;
        tracing::info!("control channel listening on {}", local_addr);
        let descriptor = ServerDescriptor {
            name: config.name.clone(),
            address: config.address.clone(),
            port: local_addr.port(),
            discover_port: config.discover_port,
            ssl: config.ssl,
            auth: config.credentials.is_some(),
            rexec: config.rexec,
            version: env!("CARGO_PKG_VERSION").to_string(),
            ssl_fingerprint: ssl_fingerprint.clone(),
            sharings: config
                .sharings
                .iter()
                .map(|sharing| SharingDescriptor {
                    name: sharing.name.clone(),
                    kind: sharing.kind,
                    read_only: sharing.read_only,
                })
                .collect(),
        };
        let discovery = if config.discover_port != 0 {
            Some(DiscoveryDaemon::bind(config.discover_port, Arc::new(descriptor.clone())).await?)
        } else {
            tracing::info!("discovery disabled");
            None
        };
        let sharings = config
            .sharings
            .iter()
            .map(|sharing| (sharing.name.clone(), Arc::new(sharing.clone())))
            .collect();
        let shared = Arc::new(Shared {
            sharings,
            tls,
            ssl_fingerprint,
            descriptor,
            bind_ip: local_addr.ip(),
            sessions: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            next_session_id: AtomicU64::new(1),
            config,
        });
        Ok(Server {
            shared,
            listener,
            discovery,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.shared.descriptor
    }

    /// Accept loop; runs until the surrounding task is cancelled.
    pub async fn run(self) -> anyhow::Result<()> {
        if let Some(discovery) = self.discovery {
            tokio::spawn(discovery.run());
        }
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!("accept failed: {}", error);
                    continue;
                }
            };
            tracing::debug!("control connection from {}", peer);
            let shared = self.shared.clone();
            tokio::spawn(async move {
                session::handle_connection(shared, stream, peer).await;
            });
        }
    }

    /// Spawns the accept loop and returns a handle; used by the
    /// integration tests and the interactive binary alike.
    pub fn spawn(self) -> anyhow::Result<ServerHandle> {
        let addr = self.local_addr()?;
        let discover_port = self.shared.config.discover_port;
        let task = tokio::spawn(async move {
            if let Err(error) = self.run().await {
                tracing::error!("server terminated: {:#}", error);
            }
        });
        Ok(ServerHandle {
            addr,
            discover_port,
            task,
        })
    }
}

/// Handle to a running server; aborting the task closes the listener.
pub struct ServerHandle {
    pub addr: std::net::SocketAddr,
    pub discover_port: u16,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
