//! Line-based `key=value` server configuration file.
//!
//! # File format
//!
//! ```text
//! # global keys first
//! name = "media-box"
//! port = 12020
//! password = sha256:...:...
//!
//! [music]
//! path = /srv/music
//! readonly = yes
//!
//! []                  # name defaults to the path's basename
//! path = "/srv/drop zone"
//! ```
//!
//! Values may be quoted with `"..."`; quotes are stripped. Booleans accept
//! `true/false/1/0/yes/no`. A `[Name]` header starts a sharing section; all
//! keys before the first header are global.

use anyhow::{anyhow, Context};

/// Parsed global section, every key optional so CLI flags can win.
#[derive(Clone, Debug, Default)]
pub struct FileConfig {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub discover_port: Option<u16>,
    pub name: Option<String>,
    pub password: Option<String>,
    pub rexec: Option<bool>,
    pub ssl: Option<bool>,
    pub ssl_cert: Option<std::path::PathBuf>,
    pub ssl_privkey: Option<std::path::PathBuf>,
    pub trace: Option<bool>,
    pub verbose: Option<bool>,
    pub no_color: Option<bool>,
    pub sharings: Vec<SharingSpec>,
}

/// One `[Name]` section; the name is empty for `[]` (derive from basename).
#[derive(Clone, Debug, Default)]
pub struct SharingSpec {
    pub name: Option<String>,
    pub path: Option<std::path::PathBuf>,
    pub readonly: bool,
}

impl FileConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("esd: cannot read config file {path:?}"))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config = FileConfig::default();
        let mut section: Option<SharingSpec> = None;
        for (line_idx, raw_line) in content.lines().enumerate() {
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }
            let line_num = line_idx + 1;
            if let Some(header) = line.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .ok_or_else(|| anyhow!("line {line_num}: unterminated section header"))?
                    .trim();
                if let Some(done) = section.take() {
                    config.sharings.push(done);
                }
                section = Some(SharingSpec {
                    name: (!name.is_empty()).then(|| name.to_string()),
                    ..SharingSpec::default()
                });
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("line {line_num}: expected `key=value` or `[section]`"))?;
            let key = key.trim();
            let value = unquote(value.trim());
            match section.as_mut() {
                Some(sharing) => apply_sharing_key(sharing, key, value, line_num)?,
                None => apply_global_key(&mut config, key, value, line_num)?,
            }
        }
        if let Some(done) = section.take() {
            config.sharings.push(done);
        }
        for (idx, sharing) in config.sharings.iter().enumerate() {
            if sharing.path.is_none() {
                anyhow::bail!(
                    "sharing section #{} ({:?}) is missing its `path` key",
                    idx + 1,
                    sharing.name.as_deref().unwrap_or("")
                );
            }
        }
        Ok(config)
    }
}

fn strip_comment(line: &str) -> &str {
    // a `#` inside quotes stays part of the value
    let mut in_quotes = false;
    for (idx, ch) in line.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '#' if !in_quotes => return &line[..idx],
            _ => {}
        }
    }
    line
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(value)
}

fn parse_bool(value: &str, key: &str, line_num: usize) -> anyhow::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(anyhow!(
            "line {line_num}: `{key}` expects a boolean (true/false/1/0/yes/no), got {value:?}"
        )),
    }
}

fn parse_port(value: &str, key: &str, line_num: usize) -> anyhow::Result<u16> {
    value
        .parse::<u16>()
        .map_err(|_| anyhow!("line {line_num}: `{key}` expects a port number, got {value:?}"))
}

fn apply_global_key(
    config: &mut FileConfig,
    key: &str,
    value: &str,
    line_num: usize,
) -> anyhow::Result<()> {
    match key {
        "address" => config.address = Some(value.to_string()),
        "port" => config.port = Some(parse_port(value, key, line_num)?),
        "discover_port" => config.discover_port = Some(parse_port(value, key, line_num)?),
        "name" => config.name = Some(value.to_string()),
        "password" => config.password = Some(value.to_string()),
        "rexec" => config.rexec = Some(parse_bool(value, key, line_num)?),
        "ssl" => config.ssl = Some(parse_bool(value, key, line_num)?),
        "ssl_cert" => config.ssl_cert = Some(value.into()),
        "ssl_privkey" => config.ssl_privkey = Some(value.into()),
        "trace" => config.trace = Some(parse_bool(value, key, line_num)?),
        "verbose" => config.verbose = Some(parse_bool(value, key, line_num)?),
        "no_color" => config.no_color = Some(parse_bool(value, key, line_num)?),
        _ => tracing::warn!("config line {line_num}: unknown global key `{key}` ignored"),
    }
    Ok(())
}

fn apply_sharing_key(
    sharing: &mut SharingSpec,
    key: &str,
    value: &str,
    line_num: usize,
) -> anyhow::Result<()> {
    match key {
        "path" => sharing.path = Some(value.into()),
        "readonly" => sharing.readonly = parse_bool(value, key, line_num)?,
        _ => tracing::warn!("config line {line_num}: unknown sharing key `{key}` ignored"),
    }
    Ok(())
}
