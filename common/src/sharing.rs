//! Server-side sharing registry types.

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Maximum length of a sharing name.
pub const MAX_NAME_LEN: usize = 64;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingKind {
    File,
    Directory,
}

/// A named, root-anchored view of part of the server's filesystem.
///
/// The root is canonical and immutable for the life of the process; the
/// name is what clients pass to `open` and is distinct from the on-disk
/// path.
#[derive(Clone, Debug)]
pub struct Sharing {
    pub name: String,
    pub root: std::path::PathBuf,
    pub kind: SharingKind,
    pub read_only: bool,
}

/// Sharing names are `[A-Za-z0-9._-]+`, at most [`MAX_NAME_LEN`] bytes.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

impl Sharing {
    /// Registers a sharing over `path`, defaulting the name to the on-disk
    /// basename.
    pub fn register(
        name: Option<&str>,
        path: &std::path::Path,
        read_only: bool,
    ) -> anyhow::Result<Self> {
        let root = std::fs::canonicalize(path)
            .with_context(|| format!("esd: cannot resolve sharing path {path:?}"))?;
        let metadata = std::fs::metadata(&root)
            .with_context(|| format!("esd: cannot stat sharing path {root:?}"))?;
        let kind = if metadata.is_dir() {
            SharingKind::Directory
        } else {
            SharingKind::File
        };
        let name = match name {
            Some(name) => name.to_string(),
            None => root
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    anyhow::anyhow!("esd: cannot derive a sharing name from {root:?}")
                })?,
        };
        if !valid_name(&name) {
            anyhow::bail!(
                "esd: invalid sharing name {name:?} (allowed: [A-Za-z0-9._-], max {MAX_NAME_LEN} chars)"
            );
        }
        Ok(Sharing {
            name,
            root,
            kind,
            read_only,
        })
    }
}
