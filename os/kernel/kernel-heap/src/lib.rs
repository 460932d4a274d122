//! # Kernel Heap Allocator
//!
//! A `no_std` general-purpose heap for the kernel: variable-sized blocks with
//! in-band headers, best-fit placement, splitting, and coalescing in both
//! directions.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │   kernel_heap: KERNEL_HEAP, kmalloc/kfree, ...      │
//! │   KernelAllocator (GlobalAlloc)                     │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │   LockedHeap                                        │
//! │    • spin lock around one region                    │
//! │    • GlobalAlloc over Layout                        │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │   HeapRegion                                        │
//! │    • block chain between head and tail sentinels    │
//! │    • allocate / free / resize / calloc / aligned    │
//! │    • header validation on every walk                │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Block Chain
//!
//! A region is tiled by blocks in address order. Each block starts with a
//! header carrying its total size, the offset of the next header, a free flag,
//! and the magic [`HEAP_MAGIC`]. The first and last header are permanently
//! used sentinels, so every real block has a neighbor on both sides.
//!
//! - **Allocation** picks the smallest free block that fits and splits off the
//!   surplus if it can hold a [`MIN_BLOCK_SIZE`] block.
//! - **Freeing** marks the owning block free and merges it with free neighbors,
//!   so no two free blocks are ever adjacent.
//! - **Validation**: a header with a wrong magic, an impossible size, or a link
//!   that does not match its size stops the operation with
//!   [`HeapError::Corrupted`] before anything is modified.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_heap::HeapRegion;
//!
//! let mut arena = vec![0u8; 4096];
//! let mut heap = HeapRegion::new();
//! heap.create(&mut arena)?;
//!
//! let a = heap.allocate(100)?;
//! let b = heap.allocate(200)?;
//! heap.free(a)?;
//! let c = heap.allocate(50)?;
//! assert_eq!(a, c);
//!
//! heap.free(b)?;
//! heap.free(c)?;
//! assert_eq!(heap.check()?.free_blocks, 1);
//! # Ok::<(), kernel_heap::HeapError>(())
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod block;
mod error;
pub mod kernel_heap;
mod locked;
mod region;
mod resize;
mod stats;

pub use block::{HEADER_SIZE, HEAP_MAGIC, MIN_BLOCK_SIZE, WORD_SIZE};
pub use error::{Corruption, HeapError};
pub use kernel_heap::{
    KERNEL_HEAP, KernelAllocator, init_kernel_heap, kcalloc, kfree, kmalloc, kmalloc_aligned,
    krealloc,
};
pub use locked::LockedHeap;
pub use region::{HeapRegion, MIN_REGION_SIZE};
pub use stats::{BlockInfo, HeapStats};
