//! # Heap Diagnostics
//!
//! Read-only views of a region: per-block iteration, aggregate counters,
//! a full consistency check, and a log dump of the chain.

use crate::block::{HEADER_SIZE, NO_NEXT};
use crate::error::{Corruption, HeapError};
use crate::region::HeapRegion;
use log::info;

/// One block of the chain as seen from outside.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block header.
    pub address: usize,
    /// Total block size, header included.
    pub size: usize,
    pub free: bool,
}

impl BlockInfo {
    /// Payload capacity of the block.
    #[inline]
    #[must_use]
    pub const fn payload_size(&self) -> usize {
        self.size.saturating_sub(HEADER_SIZE)
    }
}

/// Aggregate counters over the non-sentinel blocks of a region.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Region size, sentinels included.
    pub total: usize,
    /// Bytes in free blocks, headers included.
    pub free: usize,
    /// Bytes in live blocks, headers included.
    pub used: usize,
    pub free_blocks: usize,
    pub used_blocks: usize,
    /// Size of the largest free block, header included.
    pub largest_free: usize,
}

impl HeapRegion<'_> {
    /// Iterate over the blocks between the sentinels.
    ///
    /// The iterator yields an error and stops at the first invalid header.
    pub fn blocks(&self) -> impl Iterator<Item = Result<BlockInfo, HeapError>> + '_ {
        let start = self.start();
        self.chain()
            .filter(|entry| {
                entry
                    .as_ref()
                    .map_or(true, |(_, block)| !is_sentinel(block.size, block.is_free()))
            })
            .map(move |entry| {
                entry.map(|(offset, block)| BlockInfo {
                    address: start + offset,
                    size: block.size,
                    free: block.is_free(),
                })
            })
    }

    /// Count free and live blocks.
    ///
    /// # Errors
    /// [`HeapError::Uninitialized`] or [`HeapError::Corrupted`].
    pub fn stats(&self) -> Result<HeapStats, HeapError> {
        self.base()?;
        let mut stats = HeapStats {
            total: self.size(),
            ..HeapStats::default()
        };
        for block in self.blocks() {
            let block = block?;
            if block.free {
                stats.free += block.size;
                stats.free_blocks += 1;
                stats.largest_free = stats.largest_free.max(block.size);
            } else {
                stats.used += block.size;
                stats.used_blocks += 1;
            }
        }
        Ok(stats)
    }

    /// Walk the whole chain and verify every structural property:
    ///
    /// - every header is valid and links to its physical successor,
    /// - the chain starts with the head sentinel and ends with the tail sentinel,
    /// - no two free blocks are adjacent,
    /// - the free counter equals the sum of the free block sizes.
    ///
    /// # Errors
    /// [`HeapError::Uninitialized`] or [`HeapError::Corrupted`] naming the
    /// first offending block.
    pub fn check(&self) -> Result<HeapStats, HeapError> {
        self.base()?;
        let corrupted = |offset, reason| HeapError::Corrupted { offset, reason };

        let mut stats = HeapStats {
            total: self.size(),
            ..HeapStats::default()
        };
        let mut previous_free = false;
        let mut last = None;

        for entry in self.chain() {
            let (offset, block) = entry?;
            let free = block.is_free();

            if offset == 0 {
                if free || block.size != HEADER_SIZE {
                    return Err(corrupted(offset, Corruption::Sentinel));
                }
            } else if block.next == NO_NEXT {
                if free || block.size != HEADER_SIZE {
                    return Err(corrupted(offset, Corruption::Sentinel));
                }
            } else if free {
                if previous_free {
                    return Err(corrupted(offset, Corruption::AdjacentFree));
                }
                stats.free += block.size;
                stats.free_blocks += 1;
                stats.largest_free = stats.largest_free.max(block.size);
            } else {
                stats.used += block.size;
                stats.used_blocks += 1;
            }

            previous_free = free;
            last = Some(offset);
        }

        let tail = self.size() - HEADER_SIZE;
        if last != Some(tail) {
            return Err(corrupted(last.unwrap_or(0), Corruption::Sentinel));
        }
        if stats.free != self.free_bytes() {
            return Err(corrupted(0, Corruption::FreeCount));
        }
        Ok(stats)
    }

    /// Log every block of the chain at `info` level.
    pub fn dump(&self) {
        if !self.is_initialized() {
            info!("heap region: uninitialized");
            return;
        }
        info!(
            "heap region {:#x}..{:#x}: {} bytes, {} free",
            self.start(),
            self.end(),
            self.size(),
            self.free_bytes()
        );
        for entry in self.chain() {
            match entry {
                Ok((offset, block)) => info!(
                    "  {:#x}: {:>8} bytes {}",
                    self.start() + offset,
                    block.size,
                    if block.is_free() { "free" } else { "used" }
                ),
                Err(e) => {
                    info!("  {e}");
                    break;
                }
            }
        }
    }
}

/// Sentinels are the only live blocks that consist of a bare header.
const fn is_sentinel(size: usize, free: bool) -> bool {
    !free && size == HEADER_SIZE
}
