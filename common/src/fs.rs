//! Retry-hardened filesystem primitives.
//!
//! Every path that the engine hands to a syscall goes through [`normalize`]
//! first; paths passed to external child processes stay in their raw form
//! since most archivers do not tolerate the Windows long-path sentinel.

use anyhow::{Context, Result};

/// Default attempts/delay for [`remove_file_retrying`].
pub const REMOVE_ATTEMPTS: u32 = 5;
pub const REMOVE_DELAY: std::time::Duration = std::time::Duration::from_millis(200);

/// Default attempts/delay for [`copy_large_retrying`].
pub const COPY_ATTEMPTS: u32 = 3;
pub const COPY_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// Absolutize `path` and, on Windows, prepend the `\\?\` long-path sentinel
/// unless the path is already UNC or already prefixed.
pub fn normalize(path: &std::path::Path) -> Result<std::path::PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot determine current directory")?
            .join(path)
    };
    #[cfg(windows)]
    {
        let raw = absolute.to_string_lossy();
        if !raw.starts_with(r"\\") {
            return Ok(std::path::PathBuf::from(format!(r"\\?\{raw}")));
        }
    }
    Ok(absolute)
}

/// Remove a single file, clearing the read-only bit first and retrying on
/// failure. A missing file counts as removed so concurrent deletion is
/// harmless. Returns whether the file is gone after the final attempt.
pub async fn remove_file_retrying(
    path: &std::path::Path,
    attempts: u32,
    delay: std::time::Duration,
) -> bool {
    let path = match normalize(path) {
        Ok(path) => path,
        Err(error) => {
            tracing::error!("remove: cannot normalize {:?}: {:#}", path, error);
            return false;
        }
    };
    for attempt in 1..=attempts {
        match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => {
                let mut permissions = metadata.permissions();
                if permissions.readonly() {
                    #[allow(clippy::permissions_set_readonly_false)]
                    permissions.set_readonly(false);
                    if let Err(error) = tokio::fs::set_permissions(&path, permissions).await {
                        tracing::debug!("remove: cannot clear read-only on {:?}: {}", path, error);
                    }
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return true,
            Err(_) => {}
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => return true,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return true,
            Err(error) => {
                tracing::debug!(
                    "remove: attempt {}/{} failed for {:?}: {}",
                    attempt,
                    attempts,
                    path,
                    error
                );
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    tracing::error!("remove: giving up on {:?} after {} attempts", path, attempts);
    false
}

/// Copy a single file preserving permissions and mtime, retrying transient IO
/// errors. The final error is propagated once attempts are exhausted.
pub async fn copy_large_retrying(
    src: &std::path::Path,
    dst: &std::path::Path,
    attempts: u32,
    delay: std::time::Duration,
) -> Result<u64> {
    let src = normalize(src)?;
    let dst = normalize(dst)?;
    let mut last_error = None;
    for attempt in 1..=attempts {
        match copy_file_once(&src, &dst).await {
            Ok(bytes) => return Ok(bytes),
            Err(error) => {
                tracing::debug!(
                    "copy: attempt {}/{} failed for {:?}: {:#}",
                    attempt,
                    attempts,
                    src,
                    error
                );
                last_error = Some(error);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_error.unwrap())
}

async fn copy_file_once(src: &std::path::Path, dst: &std::path::Path) -> Result<u64> {
    let bytes = tokio::fs::copy(src, dst)
        .await
        .with_context(|| format!("failed copying {:?} to {:?}", src, dst))?;
    let metadata = tokio::fs::metadata(src)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", src))?;
    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    let dst_owned = dst.to_owned();
    tokio::task::spawn_blocking(move || filetime::set_file_mtime(&dst_owned, mtime))
        .await
        .context("mtime task panicked")?
        .with_context(|| format!("failed setting mtime on {:?}", dst))?;
    Ok(bytes)
}

/// Walk upward from the parent of every seed path, removing directories that
/// have become empty. Stops at the first non-empty ancestor and never removes
/// `stop_at` itself. Returns the number of directories removed.
pub async fn reclaim_empty_dirs(seeds: &[std::path::PathBuf], stop_at: &std::path::Path) -> usize {
    let stop_at = match normalize(stop_at) {
        Ok(path) => path,
        Err(_) => return 0,
    };
    let mut parents = std::collections::HashSet::new();
    for seed in seeds {
        if let Ok(seed) = normalize(seed) {
            if let Some(parent) = seed.parent() {
                parents.insert(parent.to_path_buf());
            }
        }
    }
    let mut removed = 0;
    for parent in parents {
        let mut current = parent;
        while current != stop_at && current.starts_with(&stop_at) {
            if !dir_is_empty(&current).await {
                break;
            }
            match tokio::fs::remove_dir(&current).await {
                Ok(()) => {
                    tracing::debug!("reclaimed empty directory {:?}", current);
                    removed += 1;
                }
                // lost a race with another worker walking the same chain
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    tracing::debug!("cannot reclaim {:?}: {}", current, error);
                    break;
                }
            }
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            }
        }
    }
    removed
}

async fn dir_is_empty(path: &std::path::Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

/// Remove a directory tree through the platform's native shell command, one
/// child process per tree instead of one syscall per file. Falls back to the
/// in-process recursive delete when the shell is unavailable or fails.
pub async fn remove_tree_native(path: &std::path::Path) -> Result<()> {
    let normalized = normalize(path)?;
    match tokio::fs::symlink_metadata(&normalized).await {
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        _ => {}
    }
    // the shell command gets the raw path, it does not tolerate the long-path
    // sentinel
    match native_delete_command(path).status().await {
        Ok(status) if status.success() => return Ok(()),
        Ok(status) => {
            tracing::debug!("native delete of {:?} exited with {}", path, status);
        }
        Err(error) => {
            tracing::debug!("native delete of {:?} failed to spawn: {}", path, error);
        }
    }
    tokio::fs::remove_dir_all(&normalized)
        .await
        .with_context(|| format!("failed removing directory tree {:?}", normalized))
}

#[cfg(unix)]
fn native_delete_command(path: &std::path::Path) -> tokio::process::Command {
    let mut command = tokio::process::Command::new("rm");
    command.arg("-rf").arg(path);
    command
}

#[cfg(windows)]
fn native_delete_command(path: &std::path::Path) -> tokio::process::Command {
    let mut command = tokio::process::Command::new("cmd");
    command.arg("/C").arg("rd").arg("/s").arg("/q").arg(path);
    command
}

/// Create a directory symbolic link at `link` pointing to `target`.
///
/// On Windows this requires the `SeCreateSymbolicLinkPrivilege` right; the
/// raw IO error is returned so the caller can classify privilege failures.
pub async fn make_dir_symlink(
    target: &std::path::Path,
    link: &std::path::Path,
) -> std::io::Result<()> {
    let target = target.to_owned();
    let link = link.to_owned();
    tokio::task::spawn_blocking(move || {
        #[cfg(unix)]
        return std::os::unix::fs::symlink(&target, &link);
        #[cfg(windows)]
        return std::os::windows::fs::symlink_dir(&target, &link);
    })
    .await
    .map_err(|_| std::io::Error::other("symlink task panicked"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;
    use tracing_test::traced_test;

    #[test]
    fn normalize_absolutizes_relative_paths() -> Result<()> {
        let normalized = normalize(std::path::Path::new("some/relative"))?;
        assert!(normalized.is_absolute());
        assert!(normalized.ends_with("some/relative"));
        Ok(())
    }

    #[cfg(windows)]
    #[test]
    fn normalize_prefixes_long_paths_once() -> Result<()> {
        let normalized = normalize(std::path::Path::new(r"C:\data\tree"))?;
        assert!(normalized.to_string_lossy().starts_with(r"\\?\"));
        let again = normalize(&normalized)?;
        assert_eq!(normalized, again);
        Ok(())
    }

    #[tokio::test]
    async fn remove_missing_file_counts_as_removed() {
        let tmp_dir = testutils::temp_dir();
        let gone = tmp_dir.path().join("never-existed.bin");
        assert!(remove_file_retrying(&gone, 2, std::time::Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn remove_clears_read_only_bit() -> Result<()> {
        let tmp_dir = testutils::temp_dir();
        let path = tmp_dir.path().join("locked.bin");
        tokio::fs::write(&path, b"locked").await?;
        let mut permissions = tokio::fs::metadata(&path).await?.permissions();
        permissions.set_readonly(true);
        tokio::fs::set_permissions(&path, permissions).await?;
        assert!(remove_file_retrying(&path, 3, std::time::Duration::from_millis(1)).await);
        assert!(!path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn copy_preserves_contents_and_mtime() -> Result<()> {
        let tmp_dir = testutils::temp_dir();
        let src = tmp_dir.path().join("src.bin");
        let dst = tmp_dir.path().join("dst.bin");
        tokio::fs::write(&src, b"payload").await?;
        let old = filetime::FileTime::from_unix_time(1_500_000_000, 0);
        filetime::set_file_mtime(&src, old)?;
        let bytes = copy_large_retrying(&src, &dst, 3, std::time::Duration::from_millis(1)).await?;
        assert_eq!(bytes, 7);
        assert_eq!(tokio::fs::read(&dst).await?, b"payload");
        let dst_mtime =
            filetime::FileTime::from_last_modification_time(&tokio::fs::metadata(&dst).await?);
        assert_eq!(dst_mtime.unix_seconds(), old.unix_seconds());
        Ok(())
    }

    #[tokio::test]
    async fn copy_propagates_error_after_exhaustion() {
        let tmp_dir = testutils::temp_dir();
        let missing = tmp_dir.path().join("missing.bin");
        let dst = tmp_dir.path().join("dst.bin");
        let result =
            copy_large_retrying(&missing, &dst, 2, std::time::Duration::from_millis(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn reclaim_removes_emptied_chain_but_not_root() -> Result<()> {
        let tmp_dir = testutils::temp_dir();
        let root = tmp_dir.path().join("tree");
        let deep = root.join("a").join("b").join("c");
        tokio::fs::create_dir_all(&deep).await?;
        let file = deep.join("leaf.bin");
        tokio::fs::write(&file, b"x").await?;
        tokio::fs::remove_file(&file).await?;
        let removed = reclaim_empty_dirs(&[file], &root).await;
        assert_eq!(removed, 3);
        assert!(root.exists());
        assert!(!root.join("a").exists());
        Ok(())
    }

    #[tokio::test]
    async fn reclaim_stops_at_non_empty_ancestor() -> Result<()> {
        let tmp_dir = testutils::temp_dir();
        let root = tmp_dir.path().join("tree");
        let keep = root.join("a").join("keep.bin");
        let deep = root.join("a").join("b");
        tokio::fs::create_dir_all(&deep).await?;
        tokio::fs::write(&keep, b"keep").await?;
        let seed = deep.join("gone.bin");
        let removed = reclaim_empty_dirs(&[seed], &root).await;
        assert_eq!(removed, 1);
        assert!(!deep.exists());
        assert!(keep.exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn native_tree_removal_handles_nested_trees() -> Result<()> {
        let tmp_dir = testutils::temp_dir();
        let root = tmp_dir.path().join("victim");
        tokio::fs::create_dir_all(root.join("x").join("y")).await?;
        tokio::fs::write(root.join("x").join("y").join("f.bin"), b"f").await?;
        remove_tree_native(&root).await?;
        assert!(!root.exists());
        // removing again is a no-op
        remove_tree_native(&root).await?;
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dir_symlink_resolves_to_target() -> Result<()> {
        let tmp_dir = testutils::temp_dir();
        let target = tmp_dir.path().join("target");
        tokio::fs::create_dir(&target).await?;
        tokio::fs::write(target.join("inside.bin"), b"inside").await?;
        let link = tmp_dir.path().join("link");
        make_dir_symlink(&target, &link).await?;
        assert_eq!(tokio::fs::read(link.join("inside.bin")).await?, b"inside");
        Ok(())
    }
}
