//! Effective server configuration: command line > config file > defaults.

use anyhow::Context;

use common::auth::Credentials;
use common::cfgfile::FileConfig;
use common::sharing::Sharing;
use remote::protocol::{DEFAULT_CONTROL_PORT, DEFAULT_DISCOVER_PORT};

/// Values the command line may override; `None`/`false` means "not given".
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub discover_port: Option<u16>,
    pub name: Option<String>,
    pub password: Option<String>,
    pub rexec: bool,
    pub ssl_cert: Option<std::path::PathBuf>,
    pub ssl_privkey: Option<std::path::PathBuf>,
    /// Positional sharing: path plus optional name.
    pub sharing: Option<(std::path::PathBuf, Option<String>)>,
}

/// Fully resolved configuration the daemon runs with.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    /// 0 disables the discovery daemon.
    pub discover_port: u16,
    pub name: String,
    pub credentials: Option<Credentials>,
    pub rexec: bool,
    pub ssl: bool,
    pub ssl_cert: Option<std::path::PathBuf>,
    pub ssl_privkey: Option<std::path::PathBuf>,
    pub sharings: Vec<Sharing>,
    /// Sessions idle longer than this are closed.
    pub idle_timeout: std::time::Duration,
    /// How long a transfer/rexec endpoint waits for its one connection.
    pub endpoint_timeout: std::time::Duration,
}

impl ServerConfig {
    pub fn from_sources(cli: CliOverrides, file: FileConfig) -> anyhow::Result<Self> {
        let password = cli.password.or(file.password);
        let credentials = match password {
            Some(value) if !value.is_empty() => Some(
                Credentials::parse(&value).context("esd: invalid password configuration")?,
            ),
            _ => None,
        };
        let ssl_cert = cli.ssl_cert.or(file.ssl_cert);
        let ssl_privkey = cli.ssl_privkey.or(file.ssl_privkey);
        if ssl_cert.is_some() != ssl_privkey.is_some() {
            anyhow::bail!("esd: --ssl-cert and --ssl-privkey must be given together");
        }
        let ssl = file.ssl.unwrap_or(false) || ssl_cert.is_some();
        let mut sharings = vec![];
        for spec in &file.sharings {
            let path = spec
                .path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("esd: sharing without a path"))?;
            sharings.push(Sharing::register(spec.name.as_deref(), path, spec.readonly)?);
        }
        if let Some((path, name)) = &cli.sharing {
            sharings.push(Sharing::register(name.as_deref(), path, false)?);
        }
        let mut seen = std::collections::HashSet::new();
        for sharing in &sharings {
            if !seen.insert(sharing.name.clone()) {
                anyhow::bail!("esd: duplicate sharing name {:?}", sharing.name);
            }
        }
        if sharings.is_empty() {
            tracing::warn!("no sharings configured; clients can only ping/info/rexec");
        }
        Ok(ServerConfig {
            address: cli
                .address
                .or(file.address)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: cli.port.or(file.port).unwrap_or(DEFAULT_CONTROL_PORT),
            discover_port: cli
                .discover_port
                .or(file.discover_port)
                .unwrap_or(DEFAULT_DISCOVER_PORT),
            name: cli.name.or(file.name).unwrap_or_else(common::hostname),
            credentials,
            rexec: cli.rexec || file.rexec.unwrap_or(false),
            ssl,
            ssl_cert,
            ssl_privkey,
            sharings,
            idle_timeout: std::time::Duration::from_secs(300),
            endpoint_timeout: std::time::Duration::from_secs(30),
        })
    }
}
