//! The client's control-channel connection.

use anyhow::Context;
use std::sync::Arc;

use common::errors::ErrorCode;
use remote::protocol::{Request, ServerDescriptor};
use remote::streams::Channel;

/// Errors a command can hit: a machine code the server sent back, or a
/// transport-level failure (the connection is gone).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{}: {}", .0, .0.message())]
    Remote(ErrorCode),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl ClientError {
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

/// One authenticated-or-not control connection plus the server's
/// descriptor fetched at connect time.
pub struct Connection {
    channel: Channel,
    pub peer: std::net::SocketAddr,
    pub descriptor: ServerDescriptor,
    tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl Connection {
    /// Connects, optionally wrapping in TLS, and fetches `info`.
    ///
    /// When a fingerprint is known (from discovery or a previous session)
    /// it is pinned; otherwise self-signed certificates are accepted and
    /// the fingerprint is surfaced through the descriptor.
    pub async fn open(
        addr: std::net::SocketAddr,
        ssl: bool,
        pinned_fingerprint: Option<&str>,
    ) -> anyhow::Result<Self> {
        let tls_config = if ssl {
            remote::tls::install_crypto_provider();
            Some(match pinned_fingerprint {
                Some(fingerprint_hex) => remote::tls::create_client_config_pinned(
                    remote::tls::fingerprint_from_hex(fingerprint_hex)?,
                ),
                None => remote::tls::create_client_config_insecure(),
            })
        } else {
            None
        };
        let mut channel = remote::transfer::connect(addr, tls_config.clone()).await?;
        let response = channel
            .request(&Request::Info)
            .await
            .context("info request failed")?;
        let descriptor: ServerDescriptor = serde_json::from_value(
            response
                .into_result()
                .map_err(|code| anyhow::anyhow!("info failed: {code}"))?,
        )
        .context("malformed server descriptor")?;
        Ok(Connection {
            channel,
            peer: addr,
            descriptor,
            tls_config,
        })
    }

    /// One strict request/response exchange.
    pub async fn call(&mut self, request: &Request) -> Result<serde_json::Value, ClientError> {
        let response = self
            .channel
            .request(request)
            .await
            .map_err(ClientError::Transport)?;
        response.into_result().map_err(ClientError::Remote)
    }

    /// [`Self::call`] plus payload decoding.
    pub async fn call_as<T: serde::de::DeserializeOwned>(
        &mut self,
        request: &Request,
    ) -> Result<T, ClientError> {
        let value = self.call(request).await?;
        serde_json::from_value(value)
            .map_err(|error| ClientError::Transport(anyhow::Error::new(error)))
    }

    /// Opens a dedicated channel to a transfer/rexec endpoint on the same
    /// host, inheriting the TLS setup of the control channel.
    pub async fn open_endpoint(&self, port: u16) -> anyhow::Result<Channel> {
        remote::transfer::connect(
            std::net::SocketAddr::new(self.peer.ip(), port),
            self.tls_config.clone(),
        )
        .await
    }
}
