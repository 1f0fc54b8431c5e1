use std::path::PathBuf;
use std::time::Duration;

use crate::http::RetryPolicy;

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Scratch directory for in-progress downloads.
pub fn default_temp_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".model_fetch")
        .join("downloads")
}

/// Tunables shared by every download a coordinator runs.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Where partial files and their checkpoints live until relocation.
    pub temp_dir: PathBuf,
    /// Attempts per download, including the first.
    pub max_retries: u32,
    /// Fixed pause between attempts.
    pub retry_delay: Duration,
    /// Unit of writing, hashing, checkpointing and progress reporting.
    pub chunk_size: usize,
    pub head_timeout: Duration,
    pub connect_timeout: Duration,
    /// Longest silence tolerated on an open connection.
    pub read_timeout: Duration,
    /// Optional ceiling on the elapsed time of one attempt.
    pub attempt_timeout: Option<Duration>,
    pub http_retry: RetryPolicy,
    pub worker_threads: usize,
    /// Wait slice of the blocking completion iterator.
    pub progress_poll: Duration,
    pub user_agent: String,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_secs(1),
            chunk_size: DEFAULT_CHUNK_SIZE,
            head_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            attempt_timeout: None,
            http_retry: RetryPolicy::default(),
            worker_threads: num_cpus::get(),
            progress_poll: Duration::from_millis(200),
            user_agent: format!("model-fetch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DownloaderConfig {
    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Option<Duration>) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn with_http_retry(mut self, http_retry: RetryPolicy) -> Self {
        self.http_retry = http_retry;
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads.max(1);
        self
    }

    pub fn with_progress_poll(mut self, progress_poll: Duration) -> Self {
        self.progress_poll = progress_poll;
        self
    }

    /// Attempts actually made; a zero setting still gets one attempt.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}
