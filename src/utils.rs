use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use url::Url;

pub fn get_filename_from_url(url_str: &str) -> Result<String> {
    let url = Url::parse(url_str)?;

    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.last() {
            if !filename.is_empty() {
                return Ok(filename.to_string());
            }
        }
    }

    // No usable path segment
    Ok(format!("download_{}", uuid::Uuid::new_v4()))
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(
        |c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_',
        "_",
    )
}

/// Destination inside `dir` named after the URL's last path segment.
pub fn destination_for_url(dir: &Path, url: &str) -> Result<PathBuf> {
    let filename = get_filename_from_url(url)?;
    Ok(dir.join(sanitize_filename(&filename)))
}

/// Moves `src` to `dst`, replacing whatever is there and creating parent
/// directories. Falls back to copy and delete when a rename is not possible,
/// e.g. across filesystems.
pub async fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    if fs::metadata(dst).await.is_ok() {
        fs::remove_file(dst)
            .await
            .with_context(|| format!("Failed to replace {}", dst.display()))?;
    }

    if fs::rename(src, dst).await.is_err() {
        fs::copy(src, dst)
            .await
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
        fs::remove_file(src)
            .await
            .with_context(|| format!("Failed to remove {}", src.display()))?;
    }
    Ok(())
}
