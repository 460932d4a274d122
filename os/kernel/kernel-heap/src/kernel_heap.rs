//! # Kernel Heap
//!
//! The process-wide heap of the kernel and its C-style entry points.
//!
//! ```text
//! boot info ──heap_bounds()──▶ HeapBounds ──init_kernel_heap()──▶ KERNEL_HEAP
//!                                                                   ▲
//!                         kmalloc / kfree / krealloc / kcalloc ─────┤
//!                         KernelAllocator (GlobalAlloc) ────────────┘
//! ```
//!
//! The kernel binary installs the allocator with
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;
//! ```
//!
//! and calls [`init_kernel_heap`] once the memory map is known. Until then
//! every allocation fails with a null pointer.

use crate::error::HeapError;
use crate::locked::LockedHeap;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_info::memory::HeapBounds;
use log::{debug, warn};

/// The kernel heap.
pub static KERNEL_HEAP: LockedHeap = LockedHeap::empty();

/// Set up [`KERNEL_HEAP`] over `bounds`.
///
/// # Errors
/// - [`HeapError::AlreadyInitialized`] on a second call.
/// - [`HeapError::InvalidRegion`] if the bounds are unusable.
///
/// # Safety
/// `bounds` must describe identity-mapped, writable RAM that is not used by
/// anything else for the rest of the kernel's lifetime.
pub unsafe fn init_kernel_heap(bounds: HeapBounds) -> Result<(), HeapError> {
    // Safety: forwarded to the caller.
    unsafe { KERNEL_HEAP.init(bounds) }?;
    debug!(
        "kernel heap at {:#x}..{:#x} ({} KiB)",
        bounds.start,
        bounds.end,
        bounds.len() / 1024
    );
    Ok(())
}

/// Allocate `size` bytes from the kernel heap. Returns null on failure.
#[must_use]
pub fn kmalloc(size: usize) -> *mut u8 {
    into_raw(KERNEL_HEAP.allocate(size))
}

/// Release memory obtained from the kernel heap. Null is ignored.
pub fn kfree(ptr: *mut u8) {
    let Some(ptr) = NonNull::new(ptr) else {
        return;
    };
    if let Err(e) = KERNEL_HEAP.free(ptr) {
        warn!("kfree({ptr:p}): {e}");
    }
}

/// Resize an allocation of the kernel heap.
///
/// A null `ptr` allocates; a zero `size` frees and returns null. On failure
/// null is returned and the original allocation stays valid.
#[must_use]
pub fn krealloc(ptr: *mut u8, size: usize) -> *mut u8 {
    match KERNEL_HEAP.resize(NonNull::new(ptr), size) {
        Ok(Some(ptr)) => ptr.as_ptr(),
        Ok(None) => ptr::null_mut(),
        Err(e) => {
            warn!("krealloc({ptr:p}, {size}): {e}");
            ptr::null_mut()
        }
    }
}

/// Allocate a zeroed array of `count` elements of `size` bytes.
#[must_use]
pub fn kcalloc(count: usize, size: usize) -> *mut u8 {
    into_raw(KERNEL_HEAP.calloc(count, size))
}

/// Allocate `size` bytes aligned to `alignment` (a power of two).
#[must_use]
pub fn kmalloc_aligned(size: usize, alignment: usize) -> *mut u8 {
    into_raw(KERNEL_HEAP.alloc_aligned(size, alignment))
}

fn into_raw(result: Result<NonNull<u8>, HeapError>) -> *mut u8 {
    result.map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// [`GlobalAlloc`] front end of [`KERNEL_HEAP`].
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Safety: forwarded to the caller.
        unsafe { KERNEL_HEAP.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Safety: forwarded to the caller.
        unsafe { KERNEL_HEAP.dealloc(ptr, layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // Safety: forwarded to the caller.
        unsafe { KERNEL_HEAP.alloc_zeroed(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // Safety: forwarded to the caller.
        unsafe { KERNEL_HEAP.realloc(ptr, layout, new_size) }
    }
}
