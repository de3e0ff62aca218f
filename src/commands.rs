use anyhow::{bail, Context, Result};
use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

use blobdl::blocks::bytes_downloaded;
use blobdl::progress::percentage;
use blobdl::state;
use blobdl::utils::{get_filename_from_url, resume_path, sanitize_filename, temp_path};
use blobdl::{CancellationToken, DownloadOptions, Downloader, ProgressCallback, ProgressData};

pub async fn load_options(config: Option<&Path>) -> Result<DownloadOptions> {
    let Some(path) = config else {
        return Ok(DownloadOptions::default());
    };
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {:?}", path))
}

pub fn resolve_destination(
    url: &str,
    output: Option<PathBuf>,
    download_dir: &Path,
) -> Result<PathBuf> {
    if let Some(output) = output {
        return Ok(output);
    }
    let Some(filename) = get_filename_from_url(url) else {
        bail!("Cannot derive a file name from {}; pass --output", url);
    };
    Ok(download_dir.join(sanitize_filename(&filename)))
}

pub async fn run_single_download(
    url: String,
    destination: PathBuf,
    options: DownloadOptions,
) -> Result<()> {
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create output directory")?;
        }
    }

    let pb = ProgressBar::new(0);
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] \
                 {bytes:>12}/{total_bytes:<12} {msg}",
            )?
            .progress_chars("=>-"),
    );
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    pb.set_message(format!("Downloading {}", name));

    let bar = pb.clone();
    let on_progress: ProgressCallback = Arc::new(move |p: &ProgressData| {
        bar.set_length(p.bytes_total);
        bar.set_position(p.bytes_done);
        bar.set_message(format!(
            "{}/s (now {}/s) blocks {}/{}",
            HumanBytes(p.download_rate_bytes_per_sec as u64),
            HumanBytes(p.window_rate_bytes_per_sec as u64),
            p.blocks_downloaded,
            p.blocks_downloaded + p.blocks_downloading + p.blocks_pending,
        ));
    });

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let downloader = Downloader::new();
    let result = downloader
        .download_file(&url, &destination, Some(options), Some(on_progress), Some(cancel))
        .await;

    match result {
        Ok(()) => {
            pb.finish_with_message(format!("Completed   {}", name));
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message(format!("Failed      {}", name));
            Err(e).with_context(|| format!("Failed to download {}", url))
        }
    }
}

pub async fn show_status(destination: &Path) -> Result<()> {
    let resume = resume_path(destination);
    if fs::metadata(destination).await.is_ok() && fs::metadata(&resume).await.is_err() {
        println!("{:?}: completed", destination);
        return Ok(());
    }
    let Some(state) = state::peek(&resume).await else {
        println!("{:?}: no resume data", destination);
        return Ok(());
    };

    let done = bytes_downloaded(&state.blocks, state.blob_size, state.block_size);
    let locked = blobdl::coordinator::is_locked(&temp_path(destination)).unwrap_or(false);
    println!("{:<20} {}", "URL", state.url);
    println!("{:<20} {}", "Status", if locked { "Downloading" } else { "Paused" });
    println!(
        "{:<20} {} / {} ({:.1}%)",
        "Progress",
        HumanBytes(done),
        HumanBytes(state.blob_size),
        percentage(done, state.blob_size)
    );
    println!(
        "{:<20} {} x {}",
        "Blocks",
        state.blocks.len(),
        HumanBytes(state.block_size)
    );
    println!(
        "{:<20} {}",
        "Checksum",
        if state.checksum.is_empty() { "-" } else { state.checksum.as_str() }
    );
    println!("{:<20} {}", "Last saved", state.last_modified.format("%Y-%m-%d %H:%M:%S"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_defaults_to_url_file_name() {
        let downloads = Path::new("downloads");
        let dest = resolve_destination("https://host/files/my+blob.bin", None, downloads).unwrap();
        assert_eq!(dest, PathBuf::from("downloads/my_blob.bin"));

        let output = Some(PathBuf::from("/tmp/y"));
        let explicit = resolve_destination("https://host/x", output, Path::new("d")).unwrap();
        assert_eq!(explicit, PathBuf::from("/tmp/y"));

        assert!(resolve_destination("https://host/", None, Path::new("d")).is_err());
    }

    #[tokio::test]
    async fn missing_config_file_is_an_error() {
        assert!(load_options(Some(Path::new("/nonexistent/blobdl.json"))).await.is_err());
        assert_eq!(load_options(None).await.unwrap(), DownloadOptions::default());
    }
}
