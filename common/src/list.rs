//! Directory listing, tree walking and glob search scoped to a sharing.

use anyhow::{Context, Result};
use async_recursion::async_recursion;
use serde::{Deserialize, Serialize};
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    pub fn of(file_type: &std::fs::FileType) -> Self {
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        }
    }
}

/// One listed entry; `name` is a single component for `ls` and a relative
/// path for `tree`/`find`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EntryInfo {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime_nsec: i64,
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

impl EntryInfo {
    fn new(name: String, metadata: &std::fs::Metadata, depth: Option<u32>) -> Self {
        let kind = EntryKind::of(&metadata.file_type());
        EntryInfo {
            name,
            kind,
            size: if kind == EntryKind::Directory {
                0
            } else {
                metadata.size()
            },
            mtime_nsec: full_mtime_nsec(metadata),
            mode: metadata.permissions().mode(),
            depth,
        }
    }
}

/// Full nanosecond-epoch mtime.
pub fn full_mtime_nsec(metadata: &std::fs::Metadata) -> i64 {
    metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec()
}

/// Sorting options for `ls` (and entry ordering inside `tree`).
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LsFlags {
    pub dirs_first: bool,
    pub reverse: bool,
    pub sort_size: bool,
}

/// Options for `find`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FindFlags {
    pub case_insensitive: bool,
    pub max_depth: Option<u32>,
}

async fn read_sorted(dir: &std::path::Path, flags: &LsFlags) -> Result<Vec<EntryInfo>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("cannot open directory {dir:?} for reading"))?;
    let mut listed = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {dir:?}"))?
    {
        let metadata = entry
            .metadata()
            .await
            .with_context(|| format!("failed reading metadata from {:?}", entry.path()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        listed.push(EntryInfo::new(name, &metadata, None));
    }
    listed.sort_by(|a, b| a.name.cmp(&b.name));
    if flags.sort_size {
        listed.sort_by_key(|entry| entry.size);
    }
    if flags.dirs_first {
        listed.sort_by_key(|entry| entry.kind != EntryKind::Directory);
    }
    if flags.reverse {
        listed.reverse();
    }
    Ok(listed)
}

/// Lists one directory, lexically sorted with the requested tweaks.
pub async fn ls(dir: &std::path::Path, flags: &LsFlags) -> Result<Vec<EntryInfo>> {
    read_sorted(dir, flags).await
}

/// Pre-order DFS of `dir`, entries tagged with their depth. Symlinks are
/// listed but never followed.
pub async fn tree(
    dir: &std::path::Path,
    max_depth: Option<u32>,
    flags: &LsFlags,
) -> Result<Vec<EntryInfo>> {
    let mut collected = vec![];
    walk_tree(
        dir,
        std::path::Path::new(""),
        0,
        max_depth,
        flags,
        &mut collected,
    )
    .await?;
    Ok(collected)
}

#[async_recursion]
async fn walk_tree(
    dir: &std::path::Path,
    prefix: &std::path::Path,
    depth: u32,
    max_depth: Option<u32>,
    flags: &LsFlags,
    collected: &mut Vec<EntryInfo>,
) -> Result<()> {
    if max_depth.is_some_and(|limit| depth >= limit) {
        return Ok(());
    }
    for entry in read_sorted(dir, flags).await? {
        let rel = prefix.join(&entry.name);
        let child = dir.join(&entry.name);
        let is_dir = entry.kind == EntryKind::Directory;
        collected.push(EntryInfo {
            name: rel.to_string_lossy().into_owned(),
            depth: Some(depth),
            ..entry
        });
        if is_dir {
            walk_tree(&child, &rel, depth + 1, max_depth, flags, collected).await?;
        }
    }
    Ok(())
}

/// Glob search over relative paths under `dir`. `*`/`?`/character classes
/// per glob syntax, with `*` allowed to cross directory separators so a
/// bare `*.txt` finds nested files too.
pub async fn find(
    dir: &std::path::Path,
    pattern: &str,
    flags: &FindFlags,
) -> Result<Vec<EntryInfo>> {
    let glob = globset::GlobBuilder::new(pattern)
        .literal_separator(false)
        .case_insensitive(flags.case_insensitive)
        .build()
        .with_context(|| format!("invalid glob pattern: {pattern}"))?;
    let matcher = glob.compile_matcher();
    let walked = tree(dir, flags.max_depth, &LsFlags::default()).await?;
    Ok(walked
        .into_iter()
        .filter(|entry| matcher.is_match(&entry.name))
        .collect())
}
