//! Explicit client state threaded through every command.

use std::collections::HashMap;

use remote::discovery::Discovered;
use remote::protocol::{OverwritePolicy, Request};

use crate::client::connection::{ClientError, Connection};

/// Everything a command needs: the live connection (if any), the scan
/// cache keyed by server name, and the discovery/transfer settings.
pub struct ClientContext {
    pub connection: Option<Connection>,
    pub cache: HashMap<String, Discovered>,
    pub discover_port: u16,
    pub discover_wait: std::time::Duration,
    pub policy: OverwritePolicy,
    pub show_progress: bool,
}

impl ClientContext {
    pub fn new(discover_port: u16, discover_wait: std::time::Duration) -> Self {
        ClientContext {
            connection: None,
            cache: HashMap::new(),
            discover_port,
            discover_wait,
            policy: OverwritePolicy::Prompt,
            show_progress: true,
        }
    }

    pub fn connected(&mut self) -> anyhow::Result<&mut Connection> {
        self.connection
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("not connected (use `scan`, `open` or `connect`)"))
    }

    /// Calls on the current connection; a transport failure drops it so
    /// the next command reports "not connected" instead of hanging.
    pub async fn call(&mut self, request: &Request) -> anyhow::Result<serde_json::Value> {
        let connection = self.connected()?;
        match connection.call(request).await {
            Ok(value) => Ok(value),
            Err(error) => {
                if error.is_connection_loss() {
                    self.connection = None;
                }
                Err(error.into())
            }
        }
    }

    pub async fn call_as<T: serde::de::DeserializeOwned>(
        &mut self,
        request: &Request,
    ) -> anyhow::Result<T> {
        let value = self.call(request).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Runs a scan, refreshing the cache, and returns what was found.
    pub async fn scan(&mut self) -> anyhow::Result<Vec<Discovered>> {
        let receiver = remote::discovery::scan(self.discover_port, self.discover_wait).await?;
        let mut found = vec![];
        while let Ok(discovered) = receiver.recv().await {
            self.cache
                .insert(discovered.descriptor.name.clone(), discovered.clone());
            found.push(discovered);
        }
        Ok(found)
    }

    /// Connects to the server exposing the named sharing, scanning if the
    /// cache has no match, then opens the sharing.
    pub async fn open_sharing(&mut self, name: &str) -> anyhow::Result<()> {
        if self.connection.is_none() {
            let discovered = match self.find_sharing(name) {
                Some(discovered) => discovered,
                None => {
                    self.scan().await?;
                    self.find_sharing(name)
                        .ok_or_else(|| anyhow::anyhow!("no server exposes a sharing named {name:?}"))?
                }
            };
            let addr =
                std::net::SocketAddr::new(discovered.source.ip(), discovered.descriptor.port);
            let connection = Connection::open(
                addr,
                discovered.descriptor.ssl,
                discovered.descriptor.ssl_fingerprint.as_deref(),
            )
            .await?;
            self.connection = Some(connection);
        }
        self.call(&Request::Open {
            name: name.to_string(),
        })
        .await?;
        Ok(())
    }

    fn find_sharing(&self, name: &str) -> Option<Discovered> {
        self.cache
            .values()
            .find(|discovered| {
                discovered
                    .descriptor
                    .sharings
                    .iter()
                    .any(|sharing| sharing.name == name)
            })
            .cloned()
    }
}

/// Result of executing one interactive command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommandOutcome {
    Continue,
    Quit,
}

/// True when this error should end the interactive session.
pub fn is_connection_loss(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<ClientError>()
        .is_some_and(ClientError::is_connection_loss)
}
