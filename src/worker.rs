//! Block transfer workers: one ranged GET per assigned block, streamed to
//! the block's offset in the temp file.

use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use std::io::SeekFrom;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::blocks::BlockRange;
use crate::error::{DownloadError, DownloadResult};
use crate::session::Transfer;

/// Failed block attempts tolerated per session; one more aborts it.
pub const MAX_FAILED_BLOCKS: u32 = 10;

/// Pull blocks from the scheduler until none are left, the session is
/// cancelled, or another worker hit the failure threshold.
pub(crate) async fn run_worker(transfer: Arc<Transfer>, worker: usize) -> DownloadResult<()> {
    loop {
        if transfer.cancel.is_cancelled() {
            debug!(worker, "cancelled, stopping");
            return Ok(());
        }

        let range = {
            let mut state = transfer.state.lock().await;
            if state.aborted {
                return Ok(());
            }
            match state.scheduler.next_pending() {
                Some(index) => state.scheduler.range(index),
                None => return Ok(()),
            }
        };

        match fetch_block(&transfer, range).await {
            Ok(()) => {
                transfer.state.lock().await.scheduler.mark_downloaded(range.index);
                debug!(worker, block = range.index, "block downloaded");
                transfer.persist().await;
            }
            Err(e) => {
                let mut state = transfer.state.lock().await;
                state.scheduler.mark_failed(range.index);
                state.failed_blocks += 1;
                state.last_error = Some(e.to_string());
                warn!(
                    worker,
                    block = range.index,
                    failures = state.failed_blocks,
                    error = %e,
                    "block download failed"
                );

                if state.failed_blocks > MAX_FAILED_BLOCKS {
                    state.aborted = true;
                    return Err(DownloadError::BlockDownload {
                        failures: state.failed_blocks,
                        last_error: state.last_error.clone().unwrap_or_default(),
                    });
                }
            }
        }
    }
}

async fn fetch_block(transfer: &Transfer, range: BlockRange) -> DownloadResult<()> {
    let response = transfer
        .client
        .get(&transfer.url)
        .header(RANGE, range.range_header())
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Network(format!(
            "{} for block {} returned {}",
            range.range_header(),
            range.index,
            status
        )));
    }
    let whole_blob = range.start == 0 && range.len() == transfer.blob_size;
    if status != StatusCode::PARTIAL_CONTENT && !whole_blob {
        return Err(DownloadError::Network(format!(
            "server ignored {} and answered {}",
            range.range_header(),
            status
        )));
    }

    // A second handle on the locked temp file; see `coordinator` for platform notes.
    let mut file = OpenOptions::new()
        .write(true)
        .open(&transfer.temp_path)
        .await?;
    file.seek(SeekFrom::Start(range.start)).await?;

    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(item) = stream.next().await {
        let chunk = item?;
        let len = chunk.len() as u64;
        if len == 0 {
            continue;
        }
        if written + len > range.len() {
            return Err(DownloadError::Network(format!(
                "server sent more than {} bytes for block {}",
                range.len(),
                range.index
            )));
        }

        transfer.throttle(len).await;
        file.write_all(&chunk).await?;
        written += len;

        transfer.state.lock().await.counters.record(len, Instant::now());
    }
    file.flush().await?;

    if written != range.len() {
        return Err(DownloadError::Network(format!(
            "block {} ended after {} of {} bytes",
            range.index,
            written,
            range.len()
        )));
    }
    Ok(())
}

impl Transfer {
    /// Wait until `len` bytes fit the rate limit. Waits larger than the
    /// limiter's burst are split into burst-sized steps.
    pub(crate) async fn throttle(&self, len: u64) {
        let Some((limiter, burst)) = &self.limiter else {
            return;
        };
        let mut remaining = len;
        while remaining > 0 {
            let step = remaining.min(u64::from(burst.get()));
            if let Some(n) = NonZeroU32::new(step as u32) {
                let _ = limiter.until_n_ready(n).await;
            }
            remaining -= step;
        }
    }
}
