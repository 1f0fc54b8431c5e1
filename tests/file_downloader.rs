mod common;

use axum::http::StatusCode;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use common::{content, fast_config, sha256_hex, Behavior, TestServer, MIB};
use model_fetch::{
    ChecksumState, DownloadRequest, DownloaderConfig, FileDownloader, HttpSession, ProgressEvent,
    ResumeCheckpoint,
};

fn downloader(
    request: DownloadRequest,
    config: DownloaderConfig,
) -> (FileDownloader, UnboundedReceiver<ProgressEvent>) {
    let config = Arc::new(config);
    let session = HttpSession::new(&config).unwrap();
    let (tx, rx) = unbounded_channel();
    (FileDownloader::new(request, session, config, Some(tx)), rx)
}

fn drain(rx: &mut UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn seed_checkpoint(temp: &Path, name: &str, data: &[u8], offset: usize, junk: &[u8]) {
    let partial = temp.join(name);
    let mut bytes = data[..offset].to_vec();
    bytes.extend_from_slice(junk);
    std::fs::write(&partial, bytes).unwrap();

    let mut checksum = ChecksumState::new();
    checksum.update(&data[..offset]);
    assert!(
        ResumeCheckpoint::for_partial(&partial)
            .store(offset as u64, &checksum)
            .await
    );
}

#[tokio::test]
async fn test_full_download_without_range_support() {
    let data = content(3 * MIB + 123);
    let server = TestServer::start(data.clone(), Behavior::default());
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("out/model.bin");

    let request = DownloadRequest::new(server.url("model.bin"), &destination);
    let (downloader, mut rx) = downloader(request, fast_config(&dir.path().join("tmp")));
    assert!(downloader.download().await);

    assert_eq!(std::fs::read(&destination).unwrap(), data);
    assert_eq!(server.ranges_seen(), vec![None]);
    assert!(!dir.path().join("tmp/model.bin.downloading").exists());

    let events = drain(&mut rx);
    assert!(events.windows(2).all(|w| w[0].transferred <= w[1].transferred));
    let last = events.last().unwrap();
    assert_eq!(last.transferred, data.len() as u64);
    assert_eq!(last.total, Some(data.len() as u64));
}

#[tokio::test]
async fn test_resumable_download_from_scratch() {
    let data = content(5 * MIB + 7);
    let server = TestServer::start(
        data.clone(),
        Behavior {
            ranges: true,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let temp = dir.path().join("tmp");
    let destination = dir.path().join("model.bin");

    let request = DownloadRequest::new(server.url("model.bin"), &destination)
        .with_expected_checksum(sha256_hex(&data));
    let (downloader, _rx) = downloader(request, fast_config(&temp));
    assert!(downloader.download().await);

    assert_eq!(std::fs::read(&destination).unwrap(), data);
    assert_eq!(server.ranges_seen(), vec![Some("bytes=0-".to_string())]);
    assert!(!temp.join("model.bin").exists());
    assert!(!temp.join("model.bin.downloading").exists());
}

#[tokio::test]
async fn test_resume_from_checkpoint_ignores_junk_tail() {
    let data = content(6 * MIB);
    let server = TestServer::start(
        data.clone(),
        Behavior {
            ranges: true,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let temp = dir.path().join("tmp");
    std::fs::create_dir_all(&temp).unwrap();
    seed_checkpoint(&temp, "model.bin", &data, 4 * MIB, b"garbage garbage").await;

    let destination = dir.path().join("model.bin");
    let request = DownloadRequest::new(server.url("model.bin"), &destination)
        .with_expected_checksum(sha256_hex(&data));
    let (downloader, mut rx) = downloader(request, fast_config(&temp));
    assert!(downloader.download().await);

    assert_eq!(
        server.ranges_seen(),
        vec![Some(format!("bytes={}-", 4 * MIB))]
    );
    assert_eq!(std::fs::read(&destination).unwrap(), data);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| e.transferred == 4 * MIB as u64 && e.total == Some(data.len() as u64)));
}

#[tokio::test]
async fn test_foreign_checkpoint_restarts_from_zero() {
    let data = content(2 * MIB);
    let server = TestServer::start(
        data.clone(),
        Behavior {
            ranges: true,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let temp = dir.path().join("tmp");
    std::fs::create_dir_all(&temp).unwrap();
    seed_checkpoint(&temp, "model.bin", &data, MIB, b"").await;

    // Bump the format version stored after the magic.
    let checkpoint = temp.join("model.bin.downloading");
    let mut raw = std::fs::read(&checkpoint).unwrap();
    raw[4] = raw[4].wrapping_add(1);
    std::fs::write(&checkpoint, raw).unwrap();

    let destination = dir.path().join("model.bin");
    let request = DownloadRequest::new(server.url("model.bin"), &destination)
        .with_expected_checksum(sha256_hex(&data));
    let (downloader, _rx) = downloader(request, fast_config(&temp));
    assert!(downloader.download().await);

    assert_eq!(server.ranges_seen(), vec![Some("bytes=0-".to_string())]);
    assert_eq!(std::fs::read(&destination).unwrap(), data);
}

#[tokio::test]
async fn test_interrupted_transfer_resumes_on_next_attempt() {
    let data = content(6 * MIB);
    let server = TestServer::start(
        data.clone(),
        Behavior {
            ranges: true,
            truncate_first_at: Some(4 * MIB),
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("model.bin");

    let request = DownloadRequest::new(server.url("model.bin"), &destination)
        .with_expected_checksum(sha256_hex(&data));
    let (downloader, _rx) = downloader(request, fast_config(&dir.path().join("tmp")));
    assert!(downloader.download().await);

    assert_eq!(
        server.ranges_seen(),
        vec![
            Some("bytes=0-".to_string()),
            Some(format!("bytes={}-", 4 * MIB)),
        ]
    );
    assert_eq!(std::fs::read(&destination).unwrap(), data);
}

#[tokio::test]
async fn test_ignored_range_restarts_transfer() {
    let data = content(3 * MIB);
    let server = TestServer::start(
        data.clone(),
        Behavior {
            ignore_range: true,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let temp = dir.path().join("tmp");
    std::fs::create_dir_all(&temp).unwrap();
    seed_checkpoint(&temp, "model.bin", &data, 2 * MIB, b"").await;

    let destination = dir.path().join("model.bin");
    let request = DownloadRequest::new(server.url("model.bin"), &destination)
        .with_expected_checksum(sha256_hex(&data));
    let (downloader, _rx) = downloader(request, fast_config(&temp));
    assert!(downloader.download().await);

    assert_eq!(
        server.ranges_seen(),
        vec![Some(format!("bytes={}-", 2 * MIB))]
    );
    assert_eq!(std::fs::read(&destination).unwrap(), data);
}

#[tokio::test]
async fn test_complete_partial_is_reused_without_transfer() {
    let data = content(MIB + 5);
    let server = TestServer::start(
        data.clone(),
        Behavior {
            ranges: true,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let temp = dir.path().join("tmp");
    std::fs::create_dir_all(&temp).unwrap();
    std::fs::write(temp.join("model.bin"), &data).unwrap();

    let destination = dir.path().join("model.bin");
    let request = DownloadRequest::new(server.url("model.bin"), &destination)
        .with_expected_checksum(sha256_hex(&data).to_uppercase());
    let (downloader, _rx) = downloader(request, fast_config(&temp));
    assert!(downloader.download().await);

    assert_eq!(server.gets(), 0);
    assert_eq!(std::fs::read(&destination).unwrap(), data);
}

#[tokio::test]
async fn test_checksum_mismatch_exhausts_attempts() {
    let data = content(MIB);
    let server = TestServer::start(
        data,
        Behavior {
            ranges: true,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("model.bin");

    let request = DownloadRequest::new(server.url("model.bin"), &destination)
        .with_expected_checksum("00".repeat(32));
    let (downloader, _rx) = downloader(request, fast_config(&dir.path().join("tmp")));
    assert!(!downloader.download().await);

    assert_eq!(server.gets(), 3);
    assert!(!destination.exists());
}

#[tokio::test]
async fn test_server_errors_are_retried_then_reported() {
    let server = TestServer::start(
        content(1024),
        Behavior {
            fail_status: Some(StatusCode::SERVICE_UNAVAILABLE),
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("model.bin");

    let request = DownloadRequest::new(server.url("model.bin"), &destination);
    let (downloader, _rx) = downloader(request, fast_config(&dir.path().join("tmp")));
    assert!(!downloader.download().await);

    // Three attempts, each with one transport-level retry.
    assert_eq!(server.gets(), 6);
    assert!(!destination.exists());
}

#[tokio::test]
async fn test_existing_destination_is_replaced() {
    let data = content(4096);
    let server = TestServer::start(data.clone(), Behavior::default());
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("model.bin");
    std::fs::write(&destination, b"stale").unwrap();

    let request = DownloadRequest::new(server.url("model.bin"), &destination);
    let (downloader, _rx) = downloader(request, fast_config(&dir.path().join("tmp")));
    assert!(downloader.download().await);

    assert_eq!(std::fs::read(&destination).unwrap(), data);
}

#[tokio::test]
async fn test_stalled_connection_times_out_and_resumes() {
    let data = content(2 * MIB);
    let server = TestServer::start(
        data.clone(),
        Behavior {
            ranges: true,
            stall_first_at: Some(MIB),
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("model.bin");

    let config =
        fast_config(&dir.path().join("tmp")).with_read_timeout(Duration::from_millis(500));
    let request = DownloadRequest::new(server.url("model.bin"), &destination)
        .with_expected_checksum(sha256_hex(&data));
    let (downloader, _rx) = downloader(request, config);
    assert!(downloader.download().await);

    assert_eq!(
        server.ranges_seen(),
        vec![
            Some("bytes=0-".to_string()),
            Some(format!("bytes={}-", MIB)),
        ]
    );
    assert_eq!(std::fs::read(&destination).unwrap(), data);
}

#[tokio::test]
async fn test_rejected_head_falls_back_to_full_transfer() {
    let data = content(MIB + 99);
    let server = TestServer::start(
        data.clone(),
        Behavior {
            ranges: true,
            head_status: Some(StatusCode::METHOD_NOT_ALLOWED),
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("model.bin");

    let request = DownloadRequest::new(server.url("model.bin"), &destination)
        .with_expected_checksum(sha256_hex(&data));
    let (downloader, mut rx) = downloader(request, fast_config(&dir.path().join("tmp")));
    assert!(downloader.download().await);

    assert_eq!(server.heads(), 1);
    assert_eq!(server.ranges_seen(), vec![None]);
    assert_eq!(std::fs::read(&destination).unwrap(), data);

    // The length comes from the GET response once HEAD gave nothing.
    let last = drain(&mut rx).pop().unwrap();
    assert_eq!(last.total, Some(data.len() as u64));
}
