//! # Locked Heap
//!
//! [`LockedHeap`] puts a [`HeapRegion`] behind a spin lock so it can live in
//! a `static` and be shared between cores.
//!
//! The region is only ever reached through a closure ([`with_lock`] or
//! [`try_lock`]); no reference to it outlives the critical section. The lock:
//! - spins on a plain load while held and retries the `compare_exchange`
//!   once it reads free,
//! - is released when the closure returns or unwinds,
//! - does **not** mask interrupts; do not allocate from an interrupt
//!   handler that may preempt a lock holder on the same core.
//!
//! [`with_lock`]: LockedHeap::with_lock
//! [`try_lock`]: LockedHeap::try_lock

use crate::block::WORD_SIZE;
use crate::error::HeapError;
use crate::region::HeapRegion;
use crate::stats::HeapStats;
use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::memory::HeapBounds;
use log::warn;

/// A [`HeapRegion`] guarded by a spin lock.
pub struct LockedHeap {
    /// `true` while an operation is in progress.
    busy: AtomicBool,
    heap: UnsafeCell<HeapRegion<'static>>,
}

// Safety: `heap` is only touched between `acquire` and the matching release.
unsafe impl Sync for LockedHeap {}

impl Default for LockedHeap {
    fn default() -> Self {
        Self::empty()
    }
}

/// Clears the busy flag when the critical section ends, unwinding included.
struct Release<'a>(&'a AtomicBool);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl LockedHeap {
    /// An uninitialized heap, suitable for a `static`.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            busy: AtomicBool::new(false),
            heap: UnsafeCell::new(HeapRegion::new()),
        }
    }

    /// Lay out the heap over the physical range described by `bounds`.
    ///
    /// # Errors
    /// - [`HeapError::AlreadyInitialized`] if the heap was set up before.
    /// - [`HeapError::InvalidRegion`] if the bounds do not fit the address
    ///   space or are too small.
    ///
    /// # Safety
    /// The range must be identity-mapped, writable memory that nothing else
    /// uses for the rest of the program.
    pub unsafe fn init(&self, bounds: HeapBounds) -> Result<(), HeapError> {
        let start = usize::try_from(bounds.start).map_err(|_| HeapError::InvalidRegion)?;
        let end = usize::try_from(bounds.end).map_err(|_| HeapError::InvalidRegion)?;
        self.with_lock(|heap| {
            if heap.is_initialized() {
                return Err(HeapError::AlreadyInitialized);
            }
            // Safety: forwarded to the caller.
            unsafe { heap.create_raw(start, end) }
        })
    }

    /// Lay out the heap over a leaked or statically reserved buffer.
    ///
    /// # Errors
    /// As for [`init`](Self::init).
    pub fn init_with(&self, mem: &'static mut [u8]) -> Result<(), HeapError> {
        self.with_lock(|heap| {
            if heap.is_initialized() {
                return Err(HeapError::AlreadyInitialized);
            }
            heap.create(mem)
        })
    }

    /// Run `f` on the region, spinning until the lock is free.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut HeapRegion<'static>) -> R) -> R {
        while !self.acquire() {
            while self.busy.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        let _release = Release(&self.busy);
        // Safety: the busy flag was set by us and is cleared by `_release`.
        f(unsafe { &mut *self.heap.get() })
    }

    /// Run `f` on the region if the lock is free right now.
    pub fn try_lock<R>(&self, f: impl FnOnce(&mut HeapRegion<'static>) -> R) -> Option<R> {
        if !self.acquire() {
            return None;
        }
        let _release = Release(&self.busy);
        // Safety: as in `with_lock`.
        Some(f(unsafe { &mut *self.heap.get() }))
    }

    fn acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// See [`HeapRegion::allocate`].
    ///
    /// # Errors
    /// As for [`HeapRegion::allocate`].
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.with_lock(|heap| heap.allocate(size))
    }

    /// See [`HeapRegion::free`].
    ///
    /// # Errors
    /// As for [`HeapRegion::free`].
    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.with_lock(|heap| heap.free(ptr))
    }

    /// See [`HeapRegion::resize`].
    ///
    /// # Errors
    /// As for [`HeapRegion::resize`].
    pub fn resize(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        self.with_lock(|heap| heap.resize(ptr, new_size))
    }

    /// See [`HeapRegion::calloc`].
    ///
    /// # Errors
    /// As for [`HeapRegion::calloc`].
    pub fn calloc(&self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.with_lock(|heap| heap.calloc(count, size))
    }

    /// See [`HeapRegion::alloc_aligned`].
    ///
    /// # Errors
    /// As for [`HeapRegion::alloc_aligned`].
    pub fn alloc_aligned(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, HeapError> {
        self.with_lock(|heap| heap.alloc_aligned(size, alignment))
    }

    /// See [`HeapRegion::stats`].
    ///
    /// # Errors
    /// As for [`HeapRegion::stats`].
    pub fn stats(&self) -> Result<HeapStats, HeapError> {
        self.with_lock(|heap| heap.stats())
    }

    /// See [`HeapRegion::check`].
    ///
    /// # Errors
    /// As for [`HeapRegion::check`].
    pub fn check(&self) -> Result<HeapStats, HeapError> {
        self.with_lock(|heap| heap.check())
    }

    fn alloc_layout(heap: &mut HeapRegion<'_>, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        let size = layout.size().max(1);
        if layout.align() <= WORD_SIZE {
            heap.allocate(size)
        } else {
            heap.alloc_aligned(size, layout.align())
        }
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with_lock(|heap| Self::alloc_layout(heap, layout))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        if let Err(e) = self.free(ptr) {
            warn!("dealloc({ptr:p}): {e}");
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= WORD_SIZE {
            return self
                .calloc(1, layout.size().max(1))
                .map_or(ptr::null_mut(), NonNull::as_ptr);
        }
        // Safety: forwarded to the caller.
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() {
            // Safety: the allocation spans at least `layout.size()` bytes.
            unsafe { ptr.write_bytes(0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= WORD_SIZE {
            return match self.resize(NonNull::new(ptr), new_size.max(1)) {
                Ok(Some(moved)) => moved.as_ptr(),
                Ok(None) | Err(_) => ptr::null_mut(),
            };
        }

        // Over-aligned blocks may not move to an arbitrary address.
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        // Safety: forwarded to the caller.
        let moved = unsafe { self.alloc(new_layout) };
        if !moved.is_null() {
            // Safety: both allocations are live and at least this long.
            unsafe {
                ptr::copy_nonoverlapping(ptr, moved, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked(len: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; len].into_boxed_slice())
    }

    fn leaked_heap(len: usize) -> &'static LockedHeap {
        let heap = Box::leak(Box::new(LockedHeap::empty()));
        heap.init_with(leaked(len)).unwrap();
        heap
    }

    #[test]
    fn empty_heap_is_uninitialized() {
        let heap = LockedHeap::empty();
        assert_eq!(heap.allocate(8), Err(HeapError::Uninitialized));
        assert_eq!(heap.try_lock(|h| h.is_initialized()), Some(false));
    }

    #[test]
    fn init_twice_fails() {
        let heap = leaked_heap(1024);
        assert_eq!(heap.init_with(leaked(1024)), Err(HeapError::AlreadyInitialized));

        let mem = leaked(1024);
        let start = mem.as_mut_ptr().expose_provenance() as u64;
        let bounds = HeapBounds {
            start,
            end: start + 1024,
        };
        assert_eq!(
            unsafe { heap.init(bounds) },
            Err(HeapError::AlreadyInitialized)
        );
    }

    #[test]
    fn init_from_bounds() {
        let mem = leaked(2048);
        let start = mem.as_mut_ptr().expose_provenance() as u64;
        let heap = LockedHeap::empty();
        unsafe {
            heap.init(HeapBounds {
                start,
                end: start + 2048,
            })
        }
        .unwrap();

        let p = heap.allocate(64).unwrap();
        assert!(heap.with_lock(|h| h.contains(p)));
        heap.free(p).unwrap();
        assert_eq!(heap.check().unwrap().free_blocks, 1);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let heap = leaked_heap(512);
        let nested = heap.with_lock(|_| heap.try_lock(|_| ()));
        assert_eq!(nested, None);
        assert_eq!(heap.try_lock(|h| h.is_initialized()), Some(true));
        heap.check().unwrap();
    }

    #[test]
    fn lock_is_released_on_unwind() {
        let heap = leaked_heap(512);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            heap.with_lock(|h| assert!(!h.is_initialized(), "panics while holding the lock"));
        }));
        assert!(result.is_err());
        assert_eq!(heap.try_lock(|h| h.is_initialized()), Some(true));
    }

    #[test]
    fn global_alloc_respects_layout_alignment() {
        let heap = leaked_heap(8192);
        for align in [1, 8, 16, 64, 512] {
            let layout = Layout::from_size_align(24, align).unwrap();
            let p = unsafe { heap.alloc(layout) };
            assert!(!p.is_null());
            assert_eq!(p.addr() % align, 0);
            unsafe { heap.dealloc(p, layout) };
        }
        assert_eq!(heap.check().unwrap().free_blocks, 1);
    }

    #[test]
    fn global_alloc_zeroed_and_realloc() {
        let heap = leaked_heap(8192);

        let layout = Layout::from_size_align(32, 8).unwrap();
        let p = unsafe { heap.alloc_zeroed(layout) };
        let bytes = unsafe { core::slice::from_raw_parts_mut(p, 32) };
        assert!(bytes.iter().all(|&b| b == 0));
        bytes.fill(0x5A);

        let q = unsafe { heap.realloc(p, layout, 512) };
        assert!(!q.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(q, 32) };
        assert!(bytes.iter().all(|&b| b == 0x5A));
        unsafe { heap.dealloc(q, Layout::from_size_align(512, 8).unwrap()) };

        let wide = Layout::from_size_align(16, 128).unwrap();
        let p = unsafe { heap.alloc_zeroed(wide) };
        assert_eq!(p.addr() % 128, 0);
        unsafe { p.write_bytes(0x11, 16) };
        let q = unsafe { heap.realloc(p, wide, 300) };
        assert_eq!(q.addr() % 128, 0);
        assert_eq!(unsafe { q.read() }, 0x11);
        unsafe { heap.dealloc(q, Layout::from_size_align(300, 128).unwrap()) };

        assert_eq!(heap.check().unwrap().used_blocks, 0);
    }

    #[test]
    fn concurrent_allocations_keep_the_chain_consistent() {
        let heap = leaked_heap(64 * 1024);

        std::thread::scope(|s| {
            for t in 0..4u8 {
                s.spawn(move || {
                    for round in 0..200usize {
                        let size = 8 + (round * 13 + usize::from(t) * 7) % 120;
                        let p = heap.allocate(size).unwrap();
                        unsafe { p.write_bytes(t, size) };
                        let intact = heap.with_lock(|h| {
                            h.payload(p).unwrap()[..size].iter().all(|&b| b == t)
                        });
                        assert!(intact);
                        heap.free(p).unwrap();
                    }
                });
            }
        });

        let stats = heap.check().unwrap();
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.free_blocks, 1);
    }
}
