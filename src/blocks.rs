//! Block partitioning and the scheduler that hands blocks to workers.
//!
//! A block is identified by its index; its byte range is derived from the
//! blob size and block size and never stored.

use crate::state::BlockState;

pub fn block_count(blob_size: u64, block_size: u64) -> usize {
    if block_size == 0 {
        return 0;
    }
    blob_size.div_ceil(block_size) as usize
}

/// Inclusive byte range of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

pub fn block_range(index: usize, blob_size: u64, block_size: u64) -> BlockRange {
    let start = index as u64 * block_size;
    let end = (start + block_size).min(blob_size) - 1;
    BlockRange { index, start, end }
}

pub fn block_ranges(blob_size: u64, block_size: u64) -> impl Iterator<Item = BlockRange> {
    (0..block_count(blob_size, block_size)).map(move |i| block_range(i, blob_size, block_size))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCounts {
    pub pending: usize,
    pub downloading: usize,
    pub downloaded: usize,
}

/// Sole owner of the mutable block array of a session.
///
/// Callers hold the session mutex around every method call.
#[derive(Debug, Clone)]
pub struct BlockScheduler {
    blob_size: u64,
    block_size: u64,
    blocks: Vec<BlockState>,
}

impl BlockScheduler {
    pub fn new(blob_size: u64, block_size: u64) -> Self {
        Self {
            blob_size,
            block_size,
            blocks: vec![BlockState::Pending; block_count(blob_size, block_size)],
        }
    }

    /// Reuse a block array loaded from resume data. Any `Downloading` entry becomes `Pending`.
    pub fn from_blocks(blob_size: u64, block_size: u64, blocks: Vec<BlockState>) -> Self {
        debug_assert_eq!(blocks.len(), block_count(blob_size, block_size));
        let blocks = blocks
            .into_iter()
            .map(|state| match state {
                BlockState::Downloading => BlockState::Pending,
                other => other,
            })
            .collect();
        Self {
            blob_size,
            block_size,
            blocks,
        }
    }

    pub fn blob_size(&self) -> u64 {
        self.blob_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn blocks(&self) -> &[BlockState] {
        &self.blocks
    }

    pub fn range(&self, index: usize) -> BlockRange {
        block_range(index, self.blob_size, self.block_size)
    }

    /// First `Pending` block, lowest index first, flipped to `Downloading`.
    pub fn next_pending(&mut self) -> Option<usize> {
        let index = self
            .blocks
            .iter()
            .position(|state| *state == BlockState::Pending)?;
        self.blocks[index] = BlockState::Downloading;
        Some(index)
    }

    pub fn mark_downloaded(&mut self, index: usize) {
        debug_assert_eq!(self.blocks[index], BlockState::Downloading);
        self.blocks[index] = BlockState::Downloaded;
    }

    /// A failed block goes back to `Pending` and is retried by whichever worker asks next.
    pub fn mark_failed(&mut self, index: usize) {
        debug_assert_eq!(self.blocks[index], BlockState::Downloading);
        self.blocks[index] = BlockState::Pending;
    }

    pub fn has_pending(&self) -> bool {
        self.blocks.contains(&BlockState::Pending)
    }

    pub fn counts(&self) -> BlockCounts {
        let mut counts = BlockCounts::default();
        for state in &self.blocks {
            match state {
                BlockState::Pending => counts.pending += 1,
                BlockState::Downloading => counts.downloading += 1,
                BlockState::Downloaded => counts.downloaded += 1,
            }
        }
        counts
    }

    pub fn bytes_done(&self) -> u64 {
        bytes_downloaded(&self.blocks, self.blob_size, self.block_size)
    }

    /// Copy of the block array as it may be persisted: no `Downloading` entries.
    pub fn persistable_blocks(&self) -> Vec<BlockState> {
        self.blocks
            .iter()
            .map(|state| match state {
                BlockState::Downloading => BlockState::Pending,
                other => *other,
            })
            .collect()
    }
}

/// Bytes covered by `Downloaded` blocks.
pub fn bytes_downloaded(blocks: &[BlockState], blob_size: u64, block_size: u64) -> u64 {
    blocks
        .iter()
        .enumerate()
        .filter(|(_, state)| **state == BlockState::Downloaded)
        .map(|(i, _)| block_range(i, blob_size, block_size).len())
        .sum()
}
