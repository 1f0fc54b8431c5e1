use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use crate::downloader::DownloadRequest;
use crate::utils::destination_for_url;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Resumable, checksum-verified model downloader",
    long_about = None
)]
pub struct Args {
    /// Single URL to download (tasks file is ignored when given)
    #[arg(index = 1)]
    pub url: Option<String>,

    /// File with one `url|sha256|size` entry per line
    #[arg(short = 't', long = "tasks-file", default_value = "download.txt")]
    pub tasks_file: PathBuf,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir")]
    pub download_dir: Option<PathBuf>,

    /// Scratch directory for partial files and checkpoints
    #[arg(long = "temp-dir")]
    pub temp_dir: Option<PathBuf>,

    /// Expected SHA-256 of the single URL
    #[arg(long)]
    pub sha256: Option<String>,

    /// Size estimate in bytes for the single URL
    #[arg(long)]
    pub size: Option<u64>,

    /// Attempts per file
    #[arg(short = 'r', long)]
    pub retries: Option<u32>,

    /// Settings file
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Persist the directories and retry count given on this command line
    #[arg(long = "save-settings")]
    pub save_settings: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLine {
    pub url: String,
    pub sha256: Option<String>,
    pub size: Option<u64>,
}

/// Parses `url|sha256|size` lines; blank lines and `#` comments are skipped.
pub fn parse_tasks(content: &str) -> Result<Vec<TaskLine>> {
    let mut tasks = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let raw = line.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }

        let mut parts = raw.split('|').map(str::trim);
        let url = parts.next().unwrap_or_default().to_string();
        let sha256 = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        let size = match parts.next().filter(|s| !s.is_empty()) {
            Some(size) => Some(
                size.parse::<u64>()
                    .with_context(|| format!("line {}: invalid size {:?}", index + 1, size))?,
            ),
            None => None,
        };

        if !url.is_empty() {
            tasks.push(TaskLine { url, sha256, size });
        }
    }
    Ok(tasks)
}

pub fn requests_from_tasks(
    tasks: Vec<TaskLine>,
    download_dir: &Path,
) -> Result<Vec<DownloadRequest>> {
    tasks
        .into_iter()
        .map(|task| {
            let mut request = DownloadRequest::new(
                task.url.clone(),
                destination_for_url(download_dir, &task.url)?,
            );
            if let Some(sha256) = task.sha256 {
                request = request.with_expected_checksum(sha256);
            }
            if let Some(size) = task.size {
                request = request.with_estimated_size(size);
            }
            Ok(request)
        })
        .collect()
}
