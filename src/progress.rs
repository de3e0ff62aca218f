use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::blocks::{bytes_downloaded, BlockCounts};
use crate::state::{BlockState, ResumeState};

/// Snapshot handed to progress subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressData {
    pub bytes_total: u64,
    pub bytes_done: u64,
    /// Percentage with one decimal place.
    pub percentage: f64,
    pub blocks_downloading: usize,
    pub blocks_downloaded: usize,
    pub blocks_pending: usize,
    /// Bytes transferred by this session divided by its lifetime.
    pub download_rate_bytes_per_sec: f64,
    /// Bytes transferred in the current rate window divided by the window's age.
    pub window_rate_bytes_per_sec: f64,
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressData) + Send + Sync>;

pub fn percentage(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (done as f64 * 1000.0 / total as f64).floor() / 10.0
}

impl ProgressData {
    pub fn new(bytes_total: u64, bytes_done: u64, counts: BlockCounts, rates: (f64, f64)) -> Self {
        Self {
            bytes_total,
            bytes_done,
            percentage: percentage(bytes_done, bytes_total),
            blocks_downloading: counts.downloading,
            blocks_downloaded: counts.downloaded,
            blocks_pending: counts.pending,
            download_rate_bytes_per_sec: rates.0,
            window_rate_bytes_per_sec: rates.1,
        }
    }

    /// Progress as described by another process's resume file.
    pub fn from_resume_state(state: &ResumeState, rates: (f64, f64)) -> Self {
        let mut counts = BlockCounts::default();
        for block in &state.blocks {
            match block {
                BlockState::Pending => counts.pending += 1,
                BlockState::Downloading => counts.downloading += 1,
                BlockState::Downloaded => counts.downloaded += 1,
            }
        }
        let done = bytes_downloaded(&state.blocks, state.blob_size, state.block_size);
        Self::new(state.blob_size, done, counts, rates)
    }
}

/// A fresh rate window reports the previous window's rate until it is this old.
const MIN_WINDOW_AGE: Duration = Duration::from_secs(1);

/// Lifetime and windowed byte counters of a session.
#[derive(Debug, Clone)]
pub struct TransferCounters {
    started: Instant,
    bytes_transferred: u64,
    window: Duration,
    window_start: Instant,
    window_bytes: u64,
    previous_window_rate: Option<f64>,
}

impl TransferCounters {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            started: now,
            bytes_transferred: 0,
            window,
            window_start: now,
            window_bytes: 0,
            previous_window_rate: None,
        }
    }

    pub fn record(&mut self, bytes: u64, now: Instant) {
        let age = now.duration_since(self.window_start);
        if age > self.window {
            self.previous_window_rate = Some(rate(self.window_bytes, age));
            self.window_start = now;
            self.window_bytes = 0;
        }
        self.bytes_transferred += bytes;
        self.window_bytes += bytes;
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// `(lifetime, windowed)` throughput in bytes per second.
    pub fn rates(&self, now: Instant) -> (f64, f64) {
        let age = now.duration_since(self.window_start);
        let windowed = match self.previous_window_rate {
            Some(previous) if age < MIN_WINDOW_AGE => previous,
            _ => rate(self.window_bytes, age.max(MIN_WINDOW_AGE)),
        };
        (rate(self.bytes_transferred, now.duration_since(self.started)), windowed)
    }
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        0.0
    } else {
        bytes as f64 / secs
    }
}

/// Ordered list of progress callbacks owned by a session.
#[derive(Clone, Default)]
pub struct Subscribers {
    inner: Arc<Mutex<SubscriberList>>,
}

#[derive(Default)]
struct SubscriberList {
    callbacks: Vec<ProgressCallback>,
    closed: bool,
}

impl Subscribers {
    pub fn add(&self, callback: ProgressCallback) {
        let mut list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !list.closed {
            list.callbacks.push(callback);
        }
    }

    /// Call every subscriber in subscription order.
    pub fn emit(&self, data: &ProgressData) {
        let callbacks = {
            let list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            list.callbacks.clone()
        };
        for callback in callbacks {
            callback(data);
        }
    }

    /// Drop all subscribers; later `add` and `emit` calls do nothing.
    pub fn close(&self) {
        let mut list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        list.closed = true;
        list.callbacks.clear();
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
