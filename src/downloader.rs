use anyhow::{anyhow, bail, Context, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{header, Response, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

use crate::config::DownloaderConfig;
use crate::hashing::{hash_of_file, ChecksumState};
use crate::http::HttpSession;
use crate::state::{CheckpointState, ResumeCheckpoint};
use crate::utils::{get_filename_from_url, move_file, sanitize_filename};

/// What a caller asks to have fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,
    /// Size hint shown until the server reports the real length.
    pub estimated_size: Option<u64>,
    /// Hex SHA-256, compared case-insensitively.
    pub expected_checksum: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            estimated_size: None,
            expected_checksum: None,
        }
    }

    pub fn with_estimated_size(mut self, size: u64) -> Self {
        self.estimated_size = Some(size);
        self
    }

    pub fn with_expected_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.expected_checksum = Some(checksum.into());
        self
    }

    /// Name of the final file, falling back to the URL when the destination
    /// has none.
    pub fn file_name(&self) -> Result<String> {
        match self.destination.file_name() {
            Some(name) => Ok(name.to_string_lossy().into_owned()),
            None => Ok(sanitize_filename(&get_filename_from_url(&self.url)?)),
        }
    }
}

/// Bytes transferred so far for one URL. `total` is only set once the
/// length is authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub url: String,
    pub transferred: u64,
    pub total: Option<u64>,
}

pub type ProgressSender = UnboundedSender<ProgressEvent>;

/// Result of the HEAD request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub accept_ranges: bool,
    pub content_length: Option<u64>,
}

impl Probe {
    pub fn unknown() -> Self {
        Self {
            accept_ranges: false,
            content_length: None,
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self.content_length {
            Some(content_length) if self.accept_ranges && content_length > 0 => {
                Strategy::Resumable { content_length }
            }
            _ => Strategy::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Full,
    Resumable { content_length: u64 },
}

/// Regroups a response body into fixed-size chunks; the last one may be short.
struct ChunkedBody {
    stream: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    pending: Vec<u8>,
    chunk_size: usize,
}

impl ChunkedBody {
    fn new(response: Response, chunk_size: usize) -> Self {
        Self {
            stream: response.bytes_stream().boxed(),
            pending: Vec::with_capacity(chunk_size),
            chunk_size,
        }
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if self.pending.len() >= self.chunk_size {
                let rest = self.pending.split_off(self.chunk_size);
                return Ok(Some(std::mem::replace(&mut self.pending, rest)));
            }
            match self.stream.next().await {
                Some(item) => {
                    let bytes = item.context("Error while downloading chunk")?;
                    self.pending.extend_from_slice(&bytes);
                }
                None if self.pending.is_empty() => return Ok(None),
                None => return Ok(Some(std::mem::take(&mut self.pending))),
            }
        }
    }
}

/// Drives one request from probe to final placement.
pub struct FileDownloader {
    request: DownloadRequest,
    session: HttpSession,
    config: Arc<DownloaderConfig>,
    channel: Option<ProgressSender>,
}

impl FileDownloader {
    pub fn new(
        request: DownloadRequest,
        session: HttpSession,
        config: Arc<DownloaderConfig>,
        channel: Option<ProgressSender>,
    ) -> Self {
        Self {
            request,
            session,
            config,
            channel,
        }
    }

    /// Runs the download to completion. Every failure is logged and reported
    /// as `false`.
    pub async fn download(&self) -> bool {
        match self.run().await {
            Ok(()) => true,
            Err(e) => {
                error!(url = %self.request.url, "download failed: {:#}", e);
                false
            }
        }
    }

    pub(crate) async fn run(&self) -> Result<()> {
        let url = &self.request.url;
        info!(url = %url, destination = %self.request.destination.display(), "starting download");
        self.emit(0, None);

        let file_name = self.request.file_name()?;
        fs::create_dir_all(&self.config.temp_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.config.temp_dir.display()))?;
        let partial = self.config.temp_dir.join(&file_name);

        let probe = self.probe().await;
        let strategy = probe.strategy();
        info!(
            url = %url,
            accept_ranges = probe.accept_ranges,
            content_length = ?probe.content_length,
            ?strategy,
            "probed server"
        );

        let attempts = self.config.attempts();
        let mut last_error = None;

        for attempt in 1..=attempts {
            info!(url = %url, attempt, "download attempt");
            match self.attempt(strategy, probe.content_length, &partial).await {
                Ok(digest) => match self.verify(&digest) {
                    Ok(()) => {
                        info!(url = %url, checksum = %digest, "download complete");
                        move_file(&partial, &self.request.destination)
                            .await
                            .context("Failed to move download into place")?;
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(url = %url, attempt, "{:#}", e);
                        last_error = Some(e);
                    }
                },
                Err(e) => {
                    warn!(url = %url, attempt, "attempt failed: {:#}", e);
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        let error = last_error.unwrap_or_else(|| anyhow!("no attempt was made"));
        Err(error.context(format!("giving up on {} after {} attempts", url, attempts)))
    }

    /// HEAD request for length and range support. Any failure, including a
    /// missing `Content-Length`, degrades to [`Probe::unknown`].
    pub async fn probe(&self) -> Probe {
        let response = match self
            .session
            .probe_head(&self.request.url, self.config.head_timeout)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %self.request.url, "HEAD request error: {:#}", e);
                return Probe::unknown();
            }
        };

        let headers = response.headers();
        let content_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let accept_ranges = headers
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        match content_length {
            Some(_) => Probe {
                accept_ranges,
                content_length,
            },
            None => {
                warn!(url = %self.request.url, "HEAD response carries no Content-Length");
                Probe::unknown()
            }
        }
    }

    async fn attempt(
        &self,
        strategy: Strategy,
        known_length: Option<u64>,
        partial: &Path,
    ) -> Result<String> {
        let transfer = async {
            match strategy {
                Strategy::Full => self.download_full(partial, known_length).await,
                Strategy::Resumable { content_length } => {
                    self.download_resumable(partial, content_length).await
                }
            }
        };

        match self.config.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, transfer)
                .await
                .map_err(|_| anyhow!("attempt exceeded {:?}", limit))?,
            None => transfer.await,
        }
    }

    fn verify(&self, digest: &str) -> Result<()> {
        match &self.request.expected_checksum {
            Some(expected) if !expected.eq_ignore_ascii_case(digest) => Err(anyhow!(
                "Checksum mismatch: expected {}, got {}",
                expected,
                digest
            )),
            _ => Ok(()),
        }
    }

    async fn download_full(&self, partial: &Path, known_length: Option<u64>) -> Result<String> {
        ResumeCheckpoint::for_partial(partial).discard().await;

        let request = self
            .session
            .client()
            .get(&self.request.url)
            .header(header::ACCEPT_ENCODING, "identity");
        let response = self
            .session
            .send(request)
            .await?
            .error_for_status()
            .context("GET request rejected")?;
        let expected_length = known_length.or_else(|| response.content_length());

        let mut file = File::create(partial)
            .await
            .context("Failed to create partial file")?;
        let mut checksum = ChecksumState::new();
        let mut written: u64 = 0;
        self.emit(0, expected_length);

        let mut body = ChunkedBody::new(response, self.config.chunk_size);
        while let Some(chunk) = body.next_chunk().await? {
            written += chunk.len() as u64;
            if let Some(expected) = expected_length {
                if written > expected {
                    bail!("server sent more than the announced {} bytes", expected);
                }
            }
            file.write_all(&chunk)
                .await
                .context("Error while writing to file")?;
            checksum.update(&chunk);
            self.emit(written, expected_length);
        }
        file.flush().await.context("Failed to flush file")?;

        if let Some(expected) = expected_length {
            if written != expected {
                bail!("received {} of {} bytes", written, expected);
            }
        }
        Ok(checksum.digest())
    }

    async fn download_resumable(&self, partial: &Path, content_length: u64) -> Result<String> {
        let checkpoint = ResumeCheckpoint::for_partial(partial);

        let (mut offset, mut checksum) = match checkpoint.load().await {
            CheckpointState::Valid { offset, checksum } => {
                info!(url = %self.request.url, offset, "resuming from checkpoint");
                (offset, checksum)
            }
            CheckpointState::Absent => {
                if let Some(digest) = self.reuse_complete_partial(partial, content_length).await {
                    return Ok(digest);
                }
                File::create(partial)
                    .await
                    .context("Failed to reset partial file")?;
                (0, ChecksumState::new())
            }
        };

        if offset > content_length {
            checkpoint.discard().await;
            bail!(
                "resume offset {} exceeds content length {}",
                offset,
                content_length
            );
        }

        if offset == content_length {
            info!(url = %self.request.url, "partial file already complete");
            let file = OpenOptions::new()
                .write(true)
                .open(partial)
                .await
                .context("Failed to open partial file")?;
            file.set_len(offset).await?;
            checkpoint.discard().await;
            self.emit(offset, Some(content_length));
            return Ok(checksum.digest());
        }

        let request = self
            .session
            .client()
            .get(&self.request.url)
            .header(header::ACCEPT_ENCODING, "identity")
            .header(header::RANGE, format!("bytes={}-", offset));
        let response = self
            .session
            .send(request)
            .await?
            .error_for_status()
            .context("Ranged GET request rejected")?;

        if offset > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            warn!(
                url = %self.request.url,
                status = %response.status(),
                "server ignored the range request, restarting from zero"
            );
            checkpoint.discard().await;
            offset = 0;
            checksum = ChecksumState::new();
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(partial)
            .await
            .context("Failed to open partial file")?;
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        self.emit(offset, Some(content_length));

        let mut body = ChunkedBody::new(response, self.config.chunk_size);
        while let Some(chunk) = body.next_chunk().await? {
            if offset + chunk.len() as u64 > content_length {
                bail!("server sent more than the announced {} bytes", content_length);
            }
            file.write_all(&chunk)
                .await
                .context("Error while writing to file")?;
            file.flush().await.context("Failed to flush file")?;
            offset += chunk.len() as u64;
            checksum.update(&chunk);
            checkpoint.store(offset, &checksum).await;
            self.emit(offset, Some(content_length));
        }
        drop(file);

        let on_disk = fs::metadata(partial).await?.len();
        if on_disk != content_length {
            bail!(
                "partial file holds {} of {} bytes, keeping checkpoint",
                on_disk,
                content_length
            );
        }

        checkpoint.discard().await;
        Ok(checksum.digest())
    }

    /// A partial file of full length with no checkpoint is only trusted when
    /// its hash matches the expected checksum.
    async fn reuse_complete_partial(&self, partial: &Path, content_length: u64) -> Option<String> {
        let expected = self.request.expected_checksum.as_deref()?;
        let len = fs::metadata(partial).await.ok()?.len();
        if len != content_length {
            return None;
        }

        match hash_of_file(partial).await {
            Ok(digest) if digest.eq_ignore_ascii_case(expected) => {
                info!(url = %self.request.url, "reusing complete partial file");
                self.emit(len, Some(content_length));
                Some(digest)
            }
            Ok(_) => {
                info!(url = %self.request.url, "complete partial file does not match, restarting");
                None
            }
            Err(e) => {
                warn!(url = %self.request.url, "failed to hash partial file: {:#}", e);
                None
            }
        }
    }

    fn emit(&self, transferred: u64, total: Option<u64>) {
        if let Some(channel) = &self.channel {
            // The receiver only goes away with its coordinator.
            let _ = channel.send(ProgressEvent {
                url: self.request.url.clone(),
                transferred,
                total,
            });
        }
    }
}
