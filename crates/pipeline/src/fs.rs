//! Crash-safe file helpers shared by the checkpoint store, the cache and
//! artifact promotion.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

/// Hidden sibling path used as the staging file for `path`.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

/// Write `bytes` to `path` so that readers see either the old or the new
/// content, never a partial file.
///
/// The data is flushed to disk before the rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = staging_path(path);
    let written = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if written.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    written
}

/// Move `src` to `dst` atomically.
///
/// A plain rename is tried first. If that fails (typically because `dst` is
/// on another filesystem) the file is copied to a staging sibling of `dst`,
/// renamed into place, and `src` is removed.
pub(crate) async fn promote(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::rename(src, dst).await {
        Ok(()) => return Ok(()),
        Err(e) => {
            tracing::debug!(
                src = %src.display(),
                dst = %dst.display(),
                error = %e,
                "Rename failed, promoting by copy"
            );
        }
    }

    copy_atomic(src, dst).await?;

    if let Err(e) = tokio::fs::remove_file(src).await {
        tracing::warn!(path = %src.display(), error = %e, "Failed to remove promoted source");
    }
    Ok(())
}

/// Copy `src` to `dst` through a staging sibling of `dst`, leaving `src`
/// untouched. Readers of `dst` never see a partial copy.
pub(crate) async fn copy_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = staging_path(dst);
    let copied = async {
        tokio::fs::copy(src, &tmp).await?;
        tokio::fs::File::open(&tmp).await?.sync_all().await?;
        tokio::fs::rename(&tmp, dst).await
    }
    .await;

    if copied.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    copied
}

/// Whether `path` is an existing file with at least one byte.
pub(crate) async fn is_non_empty_file(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

/// Remove a file, treating "already gone" as success.
pub(crate) async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_atomic_replaces_content_and_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/record.json");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"second");
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn promote_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("work/out.mp4");
        let dst = dir.path().join("final/job_output.mp4");
        tokio::fs::create_dir_all(src.parent().unwrap()).await.unwrap();
        tokio::fs::write(&src, b"video").await.unwrap();

        promote(&src, &dst).await.unwrap();

        assert!(!src.exists());
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"video");
    }

    #[tokio::test]
    async fn copy_atomic_keeps_source_and_is_independent_of_it() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("out.mp4");
        let dst = dir.path().join("store/copy.mp4");
        tokio::fs::write(&src, b"first").await.unwrap();

        copy_atomic(&src, &dst).await.unwrap();
        tokio::fs::write(&src, b"second").await.unwrap();

        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"first");
        let staged: Vec<_> = std::fs::read_dir(dst.parent().unwrap())
            .unwrap()
            .collect();
        assert_eq!(staged.len(), 1);
    }

    #[tokio::test]
    async fn empty_and_missing_files_are_not_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        tokio::fs::write(&empty, b"").await.unwrap();

        assert!(!is_non_empty_file(&empty).await);
        assert!(!is_non_empty_file(&dir.path().join("missing")).await);
        assert!(remove_if_exists(&dir.path().join("missing")).await.is_ok());
    }
}
