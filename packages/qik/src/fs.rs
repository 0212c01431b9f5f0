//! Filesystem operations tailored to `qik`.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using.
//!
//! The cache backends rely on the write-rename discipline implemented here:
//! entries are staged in a sibling temporary location and renamed into place,
//! so a partially written entry is never visible under its final path.

use std::path::{Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, ContextCompat},
};
use tap::TapFallible;
use tracing::{instrument, trace};

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub async fn create_dir_all(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Buffer the file content from disk.
///
/// Returns `None` if the file does not exist.
#[instrument]
pub async fn read_buffered(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Buffer the file content from disk.
/// Unlike [`read_buffered`], this function returns an error if the file
/// doesn't exist.
#[instrument]
pub async fn must_read_buffered(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("read file: {path:?}"))
}

/// Buffer the file content from disk and parse it as UTF8.
///
/// Returns `None` if the file does not exist.
#[instrument]
pub async fn read_buffered_utf8(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file as string");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Buffer the file content from disk and parse it as UTF8.
/// Unlike [`read_buffered_utf8`], this function returns an error if the file
/// doesn't exist.
#[instrument]
pub async fn must_read_buffered_utf8(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read file: {path:?}"))
}

/// Write the provided file content to disk, creating parent directories as
/// needed.
#[instrument(skip(content))]
pub async fn write(path: &Path, content: impl AsRef<[u8]>) -> Result<()> {
    let content = content.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Copy the file from `src` to `dst`, creating parent directories as needed.
///
/// Returns the total number of bytes copied.
#[instrument]
pub async fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    let bytes = tokio::fs::copy(src, dst)
        .await
        .with_context(|| format!("copy {src:?} to {dst:?}"))?;
    trace!(?src, ?dst, ?bytes, "copy file");

    Ok(bytes)
}

/// Link `src` to `dst` by hardlink if the filesystem allows it, falling back
/// to a full copy.
///
/// The destination is replaced if it already exists.
#[instrument]
pub async fn hardlink_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    match tokio::fs::remove_file(dst).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).context(format!("replace file: {dst:?}")),
    }
    match tokio::fs::hard_link(src, dst).await {
        Ok(()) => {
            trace!(?src, ?dst, "hardlink file");
            Ok(())
        }
        Err(err) => {
            trace!(?src, ?dst, ?err, "hardlink failed, falling back to copy");
            copy_file(src, dst).await.map(|_| ())
        }
    }
}

/// Rename a file or folder, overwriting the destination if it already exists.
#[instrument]
pub async fn rename(src: &Path, dst: &Path) -> Result<()> {
    tokio::fs::rename(src, dst)
        .await
        .with_context(|| format!("rename: {src:?} -> {dst:?}"))
        .tap_ok(|_| trace!(?src, ?dst, "rename"))
}

/// Remove a directory tree if it exists.
#[instrument]
pub async fn remove_dir_all(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            trace!(?path, "remove directory");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove directory: {path:?}")),
    }
}

/// Report whether the path exists.
#[instrument]
pub async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Stage a directory for atomic publication.
///
/// Returns a unique sibling path of `dst` to stage content into; publish it
/// with [`publish_staged`]. The staging directory lives next to the final
/// path so that the rename never crosses a filesystem boundary.
#[instrument]
pub async fn stage_sibling_dir(dst: &Path) -> Result<PathBuf> {
    let parent = dst
        .parent()
        .with_context(|| format!("no parent for: {dst:?}"))?;
    create_dir_all(parent).await?;

    let staged = tokio::task::spawn_blocking({
        let parent = parent.to_path_buf();
        move || tempfile::TempDir::with_prefix_in(".staged-", parent).map(tempfile::TempDir::keep)
    })
    .await
    .context("join task")?
    .context("create staging directory")?;

    trace!(?staged, ?dst, "staged directory");
    Ok(staged)
}

/// Publish a directory staged with [`stage_sibling_dir`].
///
/// If the destination already exists, the staged copy is discarded: entries
/// are immutable after the first write, and the first writer wins.
#[instrument]
pub async fn publish_staged(staged: &Path, dst: &Path) -> Result<()> {
    if exists(dst).await {
        trace!(?dst, "destination exists, discarding staged directory");
        return remove_dir_all(staged).await;
    }
    match tokio::fs::rename(staged, dst).await {
        Ok(()) => {
            trace!(?staged, ?dst, "published staged directory");
            Ok(())
        }
        Err(err) => {
            // A concurrent writer published first; their entry is complete,
            // so ours is redundant.
            if exists(dst).await {
                remove_dir_all(staged).await
            } else {
                Err(err).context(format!("publish staged directory: {staged:?} -> {dst:?}"))
            }
        }
    }
}
