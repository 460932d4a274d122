//! # Kernel Configuration and Boot Interface
//!
//! Shared definitions between the boot path and the kernel subsystems that
//! consume boot data. Anything that several crates must agree on (memory
//! layout constants, the shape of the boot memory map) lives here.
//!
//! ## Architecture
//!
//! ### Boot Information ([`boot`])
//! * **Memory Map**: multiboot2-style entries of base, length and type
//! * **ABI Stability**: `#[repr(C)]` entries that can be read straight from
//!   the loader's buffer
//!
//! ### Memory Layout ([`memory`])
//! * **Load Address**: where the kernel image sits in physical memory
//! * **Kernel Heap**: the heap limit and the derivation of the heap range
//!   from the memory map
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000       ┌─────────────────────────────────┐
//!                   │     Low Memory (< 1MiB)         │
//!                   │  (BIOS, VGA, DMA buffers)       │
//! PHYS_LOAD         ├─────────────────────────────────┤ 0x0010_0000 (1 MiB)
//!                   │       Kernel Image              │
//! kernel end        ├─────────────────────────────────┤
//!                   │       Kernel Heap               │
//! KERNEL_HEAP_LIMIT ├─────────────────────────────────┤ 0x0200_0000 (32 MiB)
//!                   │    Remaining RAM                │
//!                   └─────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use kernel_info::boot::{BootMemoryInfo, MemoryKind, MemoryMapEntry};
//! use kernel_info::memory::{KERNEL_HEAP_LIMIT, heap_bounds};
//!
//! let entries = [MemoryMapEntry::new(0x10_0000, 0x7F0_0000, MemoryKind::AVAILABLE)];
//! let bounds = heap_bounds(0x20_0000, &BootMemoryInfo::new(&entries), KERNEL_HEAP_LIMIT)?;
//! assert_eq!(bounds.end, KERNEL_HEAP_LIMIT);
//! # Ok::<(), kernel_info::memory::HeapBoundsError>(())
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
