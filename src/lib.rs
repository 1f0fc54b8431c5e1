//! Resumable, checksum-verified downloads of large artifacts.
//!
//! A [`DownloadCoordinator`] accepts [`DownloadRequest`]s, runs each through a
//! [`FileDownloader`] on its own runtime and aggregates their progress for
//! polling callers. Interrupted ranged transfers resume from a
//! [`ResumeCheckpoint`] that also carries the running SHA-256 state.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod downloader;
pub mod hashing;
pub mod http;
pub mod settings;
pub mod state;
pub mod utils;

pub use config::DownloaderConfig;
pub use coordinator::{
    Completions, DownloadCoordinator, DownloadEntry, DownloadStatus, DownloadSummary,
};
pub use downloader::{DownloadRequest, FileDownloader, ProgressEvent, Strategy};
pub use hashing::{hash_of_file, ChecksumState};
pub use http::{HttpSession, RetryPolicy};
pub use settings::Settings;
pub use state::{cleanup_stale_checkpoints, CheckpointState, ResumeCheckpoint};
