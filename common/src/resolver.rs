//! Constrains every client-supplied path to a sharing root.
//!
//! Resolution happens in two passes: a lexical pass that anchors the input
//! at the sharing root or the session cwd and collapses `.`/`..`, then a
//! symlink pass that walks the result component by component, expanding
//! each symlink and re-checking ancestry against the root after every
//! expansion. A symlink may not redirect outside the sharing, directly or
//! through an absolute target.

use crate::errors::ErrorCode;

/// Longest single path component accepted from a client.
pub const MAX_COMPONENT_LEN: usize = 255;

const MAX_SYMLINK_HOPS: usize = 40;

/// Resolves `input` against (`root`, `cwd`).
///
/// `root` must be canonical (the registry guarantees this) and `cwd` must
/// be inside `root`. An empty input resolves to the cwd; a leading `/`
/// anchors at the sharing root. The returned path is absolute, fully
/// symlink-resolved for every existing component, and equal to or a
/// proper descendant of `root`. Trailing components that do not exist yet
/// are allowed (creation targets).
pub async fn resolve(
    root: &std::path::Path,
    cwd: &std::path::Path,
    input: &str,
) -> Result<std::path::PathBuf, ErrorCode> {
    if input.is_empty() {
        return Ok(cwd.to_path_buf());
    }
    let (base, rest) = if input.starts_with('/') {
        (root, input.trim_start_matches('/'))
    } else {
        (cwd, input)
    };
    let mut lexical = base.to_path_buf();
    for component in std::path::Path::new(rest).components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if lexical == root {
                    return Err(ErrorCode::PathEscapesSharing);
                }
                lexical.pop();
            }
            std::path::Component::Normal(name) => {
                let bytes = name.as_encoded_bytes();
                if bytes.len() > MAX_COMPONENT_LEN || bytes.contains(&0) {
                    return Err(ErrorCode::InvalidArgument);
                }
                lexical.push(name);
            }
            std::path::Component::RootDir | std::path::Component::Prefix(_) => {
                return Err(ErrorCode::InvalidArgument);
            }
        }
    }
    resolve_symlinks(root, &lexical).await
}

/// Renders an absolute in-sharing path the way clients see it: `/` for the
/// root, `/rel/ative` below it.
pub fn display_path(root: &std::path::Path, absolute: &std::path::Path) -> String {
    match absolute.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
        Ok(rel) => format!("/{}", rel.display()),
        Err(_) => absolute.display().to_string(),
    }
}

async fn resolve_symlinks(
    root: &std::path::Path,
    lexical: &std::path::Path,
) -> Result<std::path::PathBuf, ErrorCode> {
    let rel = lexical
        .strip_prefix(root)
        .map_err(|_| ErrorCode::PathEscapesSharing)?;
    let mut pending: std::collections::VecDeque<std::ffi::OsString> = rel
        .components()
        .map(|component| component.as_os_str().to_os_string())
        .collect();
    let mut resolved = root.to_path_buf();
    let mut hops = 0usize;
    while let Some(name) = pending.pop_front() {
        if name == "." {
            continue;
        }
        if name == ".." {
            if resolved == root {
                return Err(ErrorCode::PathEscapesSharing);
            }
            resolved.pop();
            continue;
        }
        let candidate = resolved.join(&name);
        match tokio::fs::symlink_metadata(&candidate).await {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(ErrorCode::PathEscapesSharing);
                }
                let target = tokio::fs::read_link(&candidate)
                    .await
                    .map_err(ErrorCode::from)?;
                if target.is_absolute() {
                    if !target.starts_with(root) {
                        return Err(ErrorCode::PathEscapesSharing);
                    }
                    let target_rel = target
                        .strip_prefix(root)
                        .map_err(|_| ErrorCode::PathEscapesSharing)?;
                    for component in target_rel.components().rev() {
                        pending.push_front(component.as_os_str().to_os_string());
                    }
                    resolved = root.to_path_buf();
                } else {
                    for component in target.components().rev() {
                        pending.push_front(component.as_os_str().to_os_string());
                    }
                }
            }
            Ok(_) => resolved = candidate,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                resolved = candidate;
            }
            Err(error) => return Err(ErrorCode::from(error)),
        }
        if !resolved.starts_with(root) {
            return Err(ErrorCode::PathEscapesSharing);
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = tokio::fs::canonicalize(dir.path()).await.unwrap();
        tokio::fs::create_dir_all(root.join("a/b")).await.unwrap();
        tokio::fs::write(root.join("a/f1"), "hello\n").await.unwrap();
        (dir, root)
    }

    #[tokio::test]
    async fn test_empty_input_is_cwd() {
        let (_dir, root) = setup().await;
        let cwd = root.join("a");
        assert_eq!(resolve(&root, &cwd, "").await.unwrap(), cwd);
    }

    #[tokio::test]
    async fn test_relative_and_root_anchored() {
        let (_dir, root) = setup().await;
        let cwd = root.join("a");
        assert_eq!(resolve(&root, &cwd, "b").await.unwrap(), root.join("a/b"));
        assert_eq!(resolve(&root, &cwd, "/a/b").await.unwrap(), root.join("a/b"));
        assert_eq!(resolve(&root, &cwd, "/").await.unwrap(), root);
        assert_eq!(resolve(&root, &cwd, "./b/.").await.unwrap(), root.join("a/b"));
    }

    #[tokio::test]
    async fn test_parent_traversal_stays_inside() {
        let (_dir, root) = setup().await;
        let cwd = root.join("a/b");
        assert_eq!(resolve(&root, &cwd, "..").await.unwrap(), root.join("a"));
        assert_eq!(resolve(&root, &cwd, "../..").await.unwrap(), root);
        assert_eq!(
            resolve(&root, &cwd, "../../..").await.unwrap_err(),
            ErrorCode::PathEscapesSharing
        );
        assert_eq!(
            resolve(&root, &cwd, "/..").await.unwrap_err(),
            ErrorCode::PathEscapesSharing
        );
        assert_eq!(
            resolve(&root, &cwd, "../../../etc").await.unwrap_err(),
            ErrorCode::PathEscapesSharing
        );
    }

    #[tokio::test]
    async fn test_nonexistent_tail_allowed() {
        let (_dir, root) = setup().await;
        assert_eq!(
            resolve(&root, &root, "new/dir").await.unwrap(),
            root.join("new/dir")
        );
    }

    #[tokio::test]
    async fn test_symlink_inside_is_followed() {
        let (_dir, root) = setup().await;
        tokio::fs::symlink("a/b", root.join("link")).await.unwrap();
        assert_eq!(
            resolve(&root, &root, "link").await.unwrap(),
            root.join("a/b")
        );
        // `..` collapses lexically before the symlink expands
        assert_eq!(
            resolve(&root, &root, "link/../a/f1").await.unwrap(),
            root.join("a/f1")
        );
    }

    #[tokio::test]
    async fn test_symlink_escape_rejected() {
        let (_dir, root) = setup().await;
        tokio::fs::symlink("/etc", root.join("evil-abs"))
            .await
            .unwrap();
        tokio::fs::symlink("../../..", root.join("evil-rel"))
            .await
            .unwrap();
        assert_eq!(
            resolve(&root, &root, "evil-abs").await.unwrap_err(),
            ErrorCode::PathEscapesSharing
        );
        assert_eq!(
            resolve(&root, &root, "evil-rel/passwd").await.unwrap_err(),
            ErrorCode::PathEscapesSharing
        );
    }

    #[tokio::test]
    async fn test_symlink_cycle_rejected() {
        let (_dir, root) = setup().await;
        tokio::fs::symlink("loop-b", root.join("loop-a")).await.unwrap();
        tokio::fs::symlink("loop-a", root.join("loop-b")).await.unwrap();
        assert_eq!(
            resolve(&root, &root, "loop-a").await.unwrap_err(),
            ErrorCode::PathEscapesSharing
        );
    }

    #[tokio::test]
    async fn test_component_limits() {
        let (_dir, root) = setup().await;
        let long = "x".repeat(MAX_COMPONENT_LEN + 1);
        assert_eq!(
            resolve(&root, &root, &long).await.unwrap_err(),
            ErrorCode::InvalidArgument
        );
        let ok = "x".repeat(MAX_COMPONENT_LEN);
        assert!(resolve(&root, &root, &ok).await.is_ok());
    }

    #[tokio::test]
    async fn test_display_path() {
        let (_dir, root) = setup().await;
        assert_eq!(display_path(&root, &root), "/");
        assert_eq!(display_path(&root, &root.join("a/b")), "/a/b");
    }

    // every accepted input resolves inside the root, whatever the segment mix
    #[test]
    fn prop_containment() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        let segments = proptest::collection::vec(
            proptest::prop_oneof![
                proptest::strategy::Just("..".to_string()),
                proptest::strategy::Just(".".to_string()),
                proptest::strategy::Just("a".to_string()),
                proptest::strategy::Just("b".to_string()),
                "[a-z]{1,8}",
            ],
            0..6,
        );
        let mut runner = proptest::test_runner::TestRunner::default();
        runner
            .run(&(segments, proptest::bool::ANY), |(parts, anchored)| {
                let mut input = parts.join("/");
                if anchored {
                    input.insert(0, '/');
                }
                let cwd = root.join("a");
                let outcome = runtime.block_on(resolve(&root, &cwd, &input));
                if let Ok(resolved) = outcome {
                    assert!(
                        resolved == root || resolved.starts_with(&root),
                        "{input:?} resolved to {resolved:?} outside {root:?}"
                    );
                }
                Ok(())
            })
            .unwrap();
    }
}
