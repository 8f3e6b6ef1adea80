#![allow(dead_code)]

use anyhow::{Context, Result};
use async_recursion::async_recursion;

/// Builds the small fixture tree used across the test suites:
///
/// ```text
/// share
/// |- a
/// |  |- f1  ("hello\n")
/// |  |- f2  (empty)
/// |- docs
/// |  |- readme.txt
/// |- top.txt
/// ```
pub async fn setup_share_tree(base: &std::path::Path) -> Result<std::path::PathBuf> {
    let share = base.join("share");
    tokio::fs::create_dir_all(share.join("a")).await?;
    tokio::fs::create_dir_all(share.join("docs")).await?;
    tokio::fs::write(share.join("a/f1"), "hello\n").await?;
    tokio::fs::write(share.join("a/f2"), "").await?;
    tokio::fs::write(share.join("docs/readme.txt"), "read me\n").await?;
    tokio::fs::write(share.join("top.txt"), "top\n").await?;
    tokio::fs::canonicalize(&share).await.map_err(Into::into)
}

/// Asserts two trees have identical structure and file contents (symlink
/// targets compared literally, mtimes ignored).
#[async_recursion]
pub async fn check_dirs_identical(src: &std::path::Path, dst: &std::path::Path) -> Result<()> {
    let mut src_entries = tokio::fs::read_dir(src).await?;
    while let Some(src_entry) = src_entries.next_entry().await? {
        let src_entry_path = src_entry.path();
        let src_entry_name = src_entry_path.file_name().unwrap();
        let dst_entry_path = dst.join(src_entry_name);
        let src_md = tokio::fs::symlink_metadata(&src_entry_path)
            .await
            .context(format!("Source file {:?} is missing!", &src_entry_path))?;
        let dst_md = tokio::fs::symlink_metadata(&dst_entry_path)
            .await
            .context(format!(
                "Destination file {:?} is missing!",
                &dst_entry_path
            ))?;
        assert_eq!(src_md.file_type(), dst_md.file_type());
        if src_md.is_file() {
            let src_contents = tokio::fs::read(&src_entry_path).await?;
            let dst_contents = tokio::fs::read(&dst_entry_path).await?;
            assert_eq!(src_contents, dst_contents, "mismatch at {src_entry_path:?}");
        } else if src_md.file_type().is_symlink() {
            let src_link = tokio::fs::read_link(&src_entry_path).await?;
            let dst_link = tokio::fs::read_link(&dst_entry_path).await?;
            assert_eq!(src_link, dst_link);
        } else {
            check_dirs_identical(&src_entry_path, &dst_entry_path).await?;
        }
    }
    Ok(())
}
