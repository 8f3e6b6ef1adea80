//! Recursive copy, move and mkdir primitives used by the sharing service
//! and the transfer engine.

use anyhow::{Context, Result};
use async_recursion::async_recursion;
use std::os::unix::fs::PermissionsExt;

use crate::list::full_mtime_nsec;

const READ_BUFFER: usize = 128 * 1024;

/// Applies mode bits and a nanosecond-epoch mtime to `dst`.
pub async fn set_mode_and_time(dst: &std::path::Path, mode: u32, mtime_nsec: i64) -> Result<()> {
    let dst = dst.to_owned();
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(mode & 0o7777))
            .with_context(|| format!("cannot set {:?} permissions to {:o}", &dst, mode))?;
        let mtime = filetime::FileTime::from_unix_time(
            mtime_nsec.div_euclid(1_000_000_000),
            mtime_nsec.rem_euclid(1_000_000_000) as u32,
        );
        filetime::set_file_mtime(&dst, mtime)
            .with_context(|| format!("failed setting timestamps for {:?}", &dst))?;
        Ok(())
    })
    .await?
}

async fn copy_file(src: &std::path::Path, dst: &std::path::Path) -> Result<()> {
    let mut reader = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("cannot open {src:?} for reading"))?;
    let mut buf_reader = tokio::io::BufReader::with_capacity(READ_BUFFER, &mut reader);
    let mut writer = tokio::fs::File::create(dst)
        .await
        .with_context(|| format!("cannot open {dst:?} for writing"))?;
    tokio::io::copy_buf(&mut buf_reader, &mut writer)
        .await
        .with_context(|| format!("failed copying data to {:?}", &dst))?;
    let src_metadata = reader
        .metadata()
        .await
        .with_context(|| format!("failed reading metadata from {:?}", &src))?;
    set_mode_and_time(
        dst,
        src_metadata.permissions().mode(),
        full_mtime_nsec(&src_metadata),
    )
    .await
}

/// Recursive copy preserving mtime and mode bits.
#[async_recursion]
pub async fn cp(src: &std::path::Path, dst: &std::path::Path) -> Result<()> {
    tracing::debug!("cp: {:?} -> {:?}", src, dst);
    let src_metadata = tokio::fs::symlink_metadata(src)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", &src))?;
    if src_metadata.is_file() {
        return copy_file(src, dst).await;
    }
    if src_metadata.is_symlink() {
        let link = tokio::fs::read_link(src)
            .await
            .with_context(|| format!("failed reading symlink {:?}", &src))?;
        tokio::fs::symlink(link, dst)
            .await
            .with_context(|| format!("failed creating symlink {:?}", &dst))?;
        return Ok(());
    }
    let mut entries = tokio::fs::read_dir(src)
        .await
        .with_context(|| format!("cannot open directory {src:?} for reading"))?;
    tokio::fs::create_dir(dst)
        .await
        .with_context(|| format!("cannot create directory {dst:?}"))?;
    let mut join_set = tokio::task::JoinSet::new();
    let mut errors = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", &src))?
    {
        let entry_path = entry.path();
        let entry_name = entry_path.file_name().unwrap_or_default().to_owned();
        let dst_path = dst.join(entry_name);
        let do_copy = || async move { cp(&entry_path, &dst_path).await };
        join_set.spawn(do_copy());
    }
    while let Some(res) = join_set.join_next().await {
        if let Err(error) = res? {
            errors.push(error);
        }
    }
    if !errors.is_empty() {
        tracing::debug!("cp: {:?} -> {:?} failed with: {:?}", src, dst, &errors);
        return Err(anyhow::anyhow!("{:?}", &errors));
    }
    set_mode_and_time(
        dst,
        src_metadata.permissions().mode(),
        full_mtime_nsec(&src_metadata),
    )
    .await?;
    Ok(())
}

/// Rename, falling back to copy+unlink across devices.
pub async fn mv(src: &std::path::Path, dst: &std::path::Path) -> Result<()> {
    tracing::debug!("mv: {:?} -> {:?}", src, dst);
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::CrossesDevices => {
            cp(src, dst).await?;
            crate::rm::rm(src).await
        }
        Err(error) => {
            Err(error).with_context(|| format!("failed moving {:?} to {:?}", &src, &dst))
        }
    }
}

/// Creates `path` and any missing parents; a no-op if it is already a
/// directory.
pub async fn mkdir(path: &std::path::Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("cannot create directory {path:?}"))
}
