//! Shared building blocks for the easyshare tools.
//!
//! This crate hosts everything both `es` (client) and `esd` (server) need:
//! the configuration-file parser, server credentials, the path resolver that
//! pins client paths inside a sharing, the sharing-scoped filesystem
//! operations and the error taxonomy spoken over the wire.

use anyhow::Context;

pub mod auth;
pub mod cfgfile;
pub mod copy;
pub mod errors;
pub mod list;
pub mod resolver;
pub mod rm;
pub mod sharing;
pub mod testutils;

/// Output and logging configuration shared by both binaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Force TRACE level regardless of `verbose`
    pub trace: bool,
    /// Disable ANSI colours in log output
    pub no_color: bool,
}

impl OutputConfig {
    fn default_directive(&self) -> &'static str {
        if self.trace {
            return "trace";
        }
        match self.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over the verbosity flags so operators can still scope
/// filtering per module. Safe to call more than once (later calls no-op).
pub fn init_tracing(output: &OutputConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.default_directive()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!output.no_color)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Entry point used by both `es` and `esd` mains.
///
/// Builds the tokio runtime, installs tracing and runs `func` to
/// completion. Returns `None` on failure after logging the error; mains map
/// that to a non-zero exit code.
pub fn run<F, Fut, T>(output: &OutputConfig, func: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    init_tracing(output);
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed building the tokio runtime")
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("{error:#}");
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::error!("{error:#}");
            eprintln!("error: {error:#}");
            None
        }
    }
}

/// Host name used as the default server name.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "easyshare".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_mapping() {
        let mut output = OutputConfig::default();
        assert_eq!(output.default_directive(), "error");
        output.verbose = 1;
        assert_eq!(output.default_directive(), "info");
        output.verbose = 2;
        assert_eq!(output.default_directive(), "debug");
        output.verbose = 7;
        assert_eq!(output.default_directive(), "trace");
        output.verbose = 0;
        output.trace = true;
        assert_eq!(output.default_directive(), "trace");
    }

    #[test]
    fn test_hostname_not_empty() {
        assert!(!hostname().is_empty());
    }
}
