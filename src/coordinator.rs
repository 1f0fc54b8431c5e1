//! Owns the set of tracked downloads.
//!
//! Downloads run as tasks on a runtime the coordinator owns, so callers stay
//! synchronous: `submit` returns immediately, `summary`/`drain_progress` never
//! block, and [`Completions`] blocks the calling thread between events.
//! Dropping the coordinator abandons in-flight transfers; their checkpoints
//! stay on disk and a later submission resumes them.

use anyhow::{Context, Result};
use indicatif::HumanBytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver};
use tracing::{error, info, warn};

use crate::config::DownloaderConfig;
use crate::downloader::{DownloadRequest, FileDownloader, ProgressEvent, ProgressSender};
use crate::http::HttpSession;
use crate::state::cleanup_stale_checkpoints;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Succeeded,
    Failed,
}

impl DownloadStatus {
    pub fn is_active(self) -> bool {
        matches!(self, DownloadStatus::Pending | DownloadStatus::Downloading)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadEntry {
    pub url: String,
    pub destination: PathBuf,
    pub estimated_size: Option<u64>,
    /// Authoritative size, once the server has reported it.
    pub total_size: Option<u64>,
    pub transferred: u64,
    pub status: DownloadStatus,
    /// Last failure reason.
    pub error: Option<String>,
}

impl DownloadEntry {
    fn new(request: &DownloadRequest) -> Self {
        Self {
            url: request.url.clone(),
            destination: request.destination.clone(),
            estimated_size: request.estimated_size,
            total_size: None,
            transferred: 0,
            status: DownloadStatus::Pending,
            error: None,
        }
    }

    pub fn file_name(&self) -> String {
        self.destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.url.clone())
    }

    /// Size to report: the real one when known, else the caller's estimate.
    pub fn display_size(&self) -> u64 {
        self.total_size.or(self.estimated_size).unwrap_or(0)
    }

    pub fn percent(&self) -> f64 {
        match self.display_size() {
            0 => 0.0,
            size => self.transferred as f64 / size as f64 * 100.0,
        }
    }

    fn apply(&mut self, event: &ProgressEvent) {
        if event.total.is_some() {
            self.total_size = event.total;
        }
        self.transferred = event.transferred;
    }

    fn finish(&mut self, result: &Result<()>) {
        match result {
            Ok(()) => {
                self.status = DownloadStatus::Succeeded;
                self.error = None;
            }
            Err(e) => {
                self.status = DownloadStatus::Failed;
                self.error = Some(format!("{:#}", e));
            }
        }
    }
}

/// Entries keyed by URL, iterated in submission order.
#[derive(Default)]
struct Entries {
    order: Vec<String>,
    by_url: HashMap<String, DownloadEntry>,
}

impl Entries {
    fn is_active(&self, url: &str) -> bool {
        self.by_url
            .get(url)
            .map(|entry| entry.status.is_active())
            .unwrap_or(false)
    }

    fn any_active(&self) -> bool {
        self.by_url.values().any(|entry| entry.status.is_active())
    }

    fn insert(&mut self, entry: DownloadEntry) {
        if self.by_url.contains_key(&entry.url) {
            self.order.retain(|url| url != &entry.url);
        }
        self.order.push(entry.url.clone());
        self.by_url.insert(entry.url.clone(), entry);
    }

    fn get_mut(&mut self, url: &str) -> Option<&mut DownloadEntry> {
        self.by_url.get_mut(url)
    }

    fn iter(&self) -> impl Iterator<Item = &DownloadEntry> {
        self.order.iter().filter_map(|url| self.by_url.get(url))
    }

    fn aggregate(&self) -> (u64, u64) {
        self.iter().fold((0, 0), |(done, total), entry| {
            (done + entry.transferred, total + entry.display_size())
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadSummary {
    pub ongoing: usize,
    pub finished: usize,
    pub failed: usize,
    pub total: usize,
    pub report: String,
}

pub struct DownloadCoordinator {
    config: Arc<DownloaderConfig>,
    session: HttpSession,
    entries: Arc<Mutex<Entries>>,
    sender: ProgressSender,
    receiver: Mutex<UnboundedReceiver<ProgressEvent>>,
    runtime: Runtime,
}

impl DownloadCoordinator {
    /// Prepares the temp directory, discarding checkpoints written in an
    /// older format, and starts the worker runtime.
    pub fn new(config: DownloaderConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.temp_dir)
            .with_context(|| format!("Failed to create {}", config.temp_dir.display()))?;
        match cleanup_stale_checkpoints(&config.temp_dir) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "removed stale checkpoints"),
            Err(e) => warn!("checkpoint cleanup failed: {:#}", e),
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("model-fetch-worker")
            .enable_all()
            .build()
            .context("Failed to start download runtime")?;

        let session = {
            let _guard = runtime.enter();
            HttpSession::new(&config)?
        };
        let (sender, receiver) = mpsc::unbounded_channel();

        info!(temp_dir = %config.temp_dir.display(), "download coordinator ready");
        Ok(Self {
            config: Arc::new(config),
            session,
            entries: Arc::new(Mutex::new(Entries::default())),
            sender,
            receiver: Mutex::new(receiver),
            runtime,
        })
    }

    /// Schedules a download. Returns `false`, doing nothing else, when the
    /// same URL is still pending or downloading.
    pub fn submit(&self, request: DownloadRequest) -> bool {
        // Events of an earlier run for this URL must land on the old entry,
        // not on its replacement.
        let known = self.entries.lock().by_url.contains_key(&request.url);
        if known {
            self.drain_progress();
        }

        {
            let mut entries = self.entries.lock();
            if entries.is_active(&request.url) {
                warn!(url = %request.url, "already downloading, ignoring duplicate request");
                return false;
            }
            entries.insert(DownloadEntry::new(&request));
        }
        info!(url = %request.url, "start to download");

        let url = request.url.clone();
        let entries = Arc::clone(&self.entries);
        let downloader = FileDownloader::new(
            request,
            self.session.clone(),
            Arc::clone(&self.config),
            Some(self.sender.clone()),
        );

        self.runtime.spawn(async move {
            {
                let mut entries = entries.lock();
                if let Some(entry) = entries.get_mut(&url) {
                    entry.status = DownloadStatus::Downloading;
                }
            }

            let result = downloader.run().await;
            if let Err(e) = &result {
                error!(url = %url, "download failed: {:#}", e);
            }

            let mut entries = entries.lock();
            if let Some(entry) = entries.get_mut(&url) {
                entry.finish(&result);
            }
        });
        true
    }

    /// Applies every queued progress event without waiting. Returns how many
    /// were applied. While a [`Completions`] iterator is waiting for events it
    /// owns the queue, and this returns 0 at once.
    pub fn drain_progress(&self) -> usize {
        let mut receiver = match self.receiver.try_lock() {
            Some(receiver) => receiver,
            None => return 0,
        };
        let mut applied = 0;
        loop {
            match receiver.try_recv() {
                Ok(event) => {
                    self.apply(&event);
                    applied += 1;
                }
                Err(_) => return applied,
            }
        }
    }

    pub fn summary(&self) -> DownloadSummary {
        self.drain_progress();

        let entries = self.entries.lock();
        let mut summary = DownloadSummary {
            ongoing: 0,
            finished: 0,
            failed: 0,
            total: 0,
            report: String::new(),
        };

        let mut lines = String::new();
        for entry in entries.iter() {
            summary.total += 1;
            let state = match entry.status {
                DownloadStatus::Pending | DownloadStatus::Downloading => {
                    summary.ongoing += 1;
                    format!("{:.2} %", entry.percent())
                }
                DownloadStatus::Failed => {
                    summary.failed += 1;
                    "failed!".to_string()
                }
                DownloadStatus::Succeeded => {
                    summary.finished += 1;
                    "finished".to_string()
                }
            };
            lines.push_str(&format!(
                "{} ({}) : {}\n",
                entry.file_name(),
                HumanBytes(entry.display_size()),
                state
            ));
        }

        summary.report = format!(
            "{} ongoing, {} finished, {} failed.\n{}",
            summary.ongoing, summary.finished, summary.failed, lines
        );
        summary
    }

    /// Copies of every tracked entry, in submission order.
    pub fn snapshot(&self) -> Vec<DownloadEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn entry(&self, url: &str) -> Option<DownloadEntry> {
        self.entries.lock().by_url.get(url).cloned()
    }

    pub fn has_active(&self) -> bool {
        self.entries.lock().any_active()
    }

    /// Blocking iterator of `(transferred, total)` across all entries, one
    /// item per progress event, ending once nothing is scheduled and the
    /// queue is empty. Must not be called from inside an async context.
    pub fn await_all_completions(&self) -> Completions<'_> {
        Completions {
            coordinator: self,
            done: false,
        }
    }

    /// Stops the runtime, abandoning in-flight downloads.
    pub fn shutdown(self, timeout: Duration) {
        self.runtime.shutdown_timeout(timeout);
    }

    fn apply(&self, event: &ProgressEvent) {
        if let Some(entry) = self.entries.lock().get_mut(&event.url) {
            entry.apply(event);
        }
    }

    fn apply_and_aggregate(&self, event: &ProgressEvent) -> (u64, u64) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&event.url) {
            entry.apply(event);
        }
        entries.aggregate()
    }
}

pub struct Completions<'a> {
    coordinator: &'a DownloadCoordinator,
    done: bool,
}

impl Iterator for Completions<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let coordinator = self.coordinator;
        loop {
            // Sampled before looking at the queue: a task only goes idle
            // after its last event is queued.
            let idle = !coordinator.has_active();

            let mut receiver = coordinator.receiver.lock();
            let queued = receiver.try_recv();
            match queued {
                Ok(event) => {
                    drop(receiver);
                    return Some(coordinator.apply_and_aggregate(&event));
                }
                Err(TryRecvError::Empty) if !idle => {}
                Err(_) => {
                    self.done = true;
                    return None;
                }
            }

            let poll = coordinator.config.progress_poll;
            let received = coordinator
                .runtime
                .block_on(async { tokio::time::timeout(poll, receiver.recv()).await });
            drop(receiver);

            match received {
                Ok(Some(event)) => return Some(coordinator.apply_and_aggregate(&event)),
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(_) => continue,
            }
        }
    }
}
