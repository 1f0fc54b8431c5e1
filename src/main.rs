use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use model_fetch::cli::{parse_tasks, requests_from_tasks, Args};
use model_fetch::settings::{
    default_settings_path, Settings, KEY_DOWNLOAD_DIR, KEY_MAX_RETRIES, KEY_TEMP_DIR,
};
use model_fetch::utils::destination_for_url;
use model_fetch::{DownloadCoordinator, DownloadRequest, DownloaderConfig};

fn setup_logging() {
    let filter =
        EnvFilter::try_from_env("MODEL_FETCH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> Result<()> {
    setup_logging();
    let args = Args::parse();

    let mut settings = Settings::load(args.settings.clone().unwrap_or_else(default_settings_path));

    let download_dir = args
        .download_dir
        .clone()
        .or_else(|| settings.get::<PathBuf>(KEY_DOWNLOAD_DIR))
        .unwrap_or_else(|| PathBuf::from("downloads"));
    let download_dir = if download_dir.is_relative() {
        std::env::current_dir()?.join(download_dir)
    } else {
        download_dir
    };

    let mut config = DownloaderConfig::default();
    if let Some(temp_dir) = args.temp_dir.clone().or_else(|| settings.get(KEY_TEMP_DIR)) {
        config = config.with_temp_dir(temp_dir);
    }
    if let Some(retries) = args.retries.or_else(|| settings.get(KEY_MAX_RETRIES)) {
        config = config.with_max_retries(retries);
    }

    if args.save_settings {
        settings.set(KEY_DOWNLOAD_DIR, &download_dir)?;
        settings.set(KEY_TEMP_DIR, &config.temp_dir)?;
        settings.set(KEY_MAX_RETRIES, config.max_retries)?;
        settings.save()?;
        println!("Settings saved to {:?}", settings.path());
    }

    let requests = match &args.url {
        Some(url) => {
            let mut request =
                DownloadRequest::new(url.clone(), destination_for_url(&download_dir, url)?);
            if let Some(sha256) = &args.sha256 {
                request = request.with_expected_checksum(sha256.clone());
            }
            if let Some(size) = args.size {
                request = request.with_estimated_size(size);
            }
            vec![request]
        }
        None => {
            let content = std::fs::read_to_string(&args.tasks_file)
                .with_context(|| format!("Failed to open tasks file: {:?}", args.tasks_file))?;
            requests_from_tasks(parse_tasks(&content)?, &download_dir)?
        }
    };

    if requests.is_empty() {
        bail!("nothing to download");
    }

    let coordinator = DownloadCoordinator::new(config)?;
    for request in requests {
        coordinator.submit(request);
    }

    let pb = ProgressBar::new(0);
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4}")?
            .progress_chars("=>-"),
    );
    for (done, total) in coordinator.await_all_completions() {
        pb.set_length(total);
        pb.set_position(done);
    }
    pb.finish_and_clear();

    let summary = coordinator.summary();
    print!("{}", summary.report);

    if summary.failed > 0 {
        bail!("{} of {} downloads failed", summary.failed, summary.total);
    }
    Ok(())
}
