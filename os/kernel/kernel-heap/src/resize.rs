//! # Resizing, Zeroed and Aligned Allocation
//!
//! Extensions of the basic allocate/free pair. All of them keep the chain
//! invariants of [`HeapRegion`]: blocks tile the region, no two free blocks
//! are adjacent, and the free counter matches the free blocks.

use crate::block::{BlockHeader, MIN_BLOCK_SIZE, NO_NEXT, WORD_SIZE, align_up, block_size_for};
use crate::error::HeapError;
use crate::region::HeapRegion;
use core::ptr::{self, NonNull};
use log::trace;

impl HeapRegion<'_> {
    /// Change the size of the allocation owning `ptr`.
    ///
    /// - `ptr == None` allocates `new_size` bytes.
    /// - `new_size == 0` frees `ptr` and returns `Ok(None)`.
    /// - Shrinking keeps the block and returns the tail to the free pool.
    /// - Growing first absorbs free blocks directly behind the allocation; if
    ///   that is not enough, the payload is moved to a fresh allocation.
    ///
    /// `ptr` may point anywhere into the payload; the whole allocation is
    /// resized and the returned pointer is always the start of its payload.
    /// The payload is preserved up to the new size.
    ///
    /// # Errors
    /// - As for [`allocate`](Self::allocate) and [`free`](Self::free).
    /// - [`HeapError::OutOfMemory`] if neither in-place growth nor a move is
    ///   possible; the original allocation is left untouched.
    pub fn resize(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        let Some(ptr) = ptr else {
            return self.allocate(new_size).map(Some);
        };
        if new_size == 0 {
            self.free(ptr)?;
            return Ok(None);
        }

        let base = self.base()?;
        let (offset, block) = self.locate(ptr)?;
        let start = Self::payload_ptr(base, offset);
        let (payload, total) = block_size_for(new_size).ok_or(HeapError::SizeOverflow)?;

        if payload <= block.payload_size() {
            self.shrink(offset, block, total)?;
            return Ok(Some(start));
        }

        if self.grow_in_place(offset, block, total)? {
            trace!("resize({:#x}, {new_size}): grown in place", start.addr());
            return Ok(Some(start));
        }

        let moved = self.allocate(new_size)?;
        // Safety: both payloads are live blocks of this region.
        unsafe { ptr::copy_nonoverlapping(start.as_ptr(), moved.as_ptr(), block.payload_size()) };
        self.free(start)?;

        trace!(
            "resize({:#x}, {new_size}): moved to {:#x}",
            start.addr(),
            moved.addr()
        );
        Ok(Some(moved))
    }

    /// Allocate `count * size` bytes and zero the whole payload.
    ///
    /// # Errors
    /// - [`HeapError::ZeroSize`] if `count` or `size` is zero.
    /// - [`HeapError::SizeOverflow`] if `count * size` overflows.
    /// - As for [`allocate`](Self::allocate).
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.base()?;
        if count == 0 || size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let bytes = count.checked_mul(size).ok_or(HeapError::SizeOverflow)?;
        let ptr = self.allocate(bytes)?;
        let (_, block) = self.locate(ptr)?;
        // Safety: the payload of the fresh block is ours.
        unsafe { ptr.write_bytes(0, block.payload_size()) };
        Ok(ptr)
    }

    /// Allocate `size` bytes at an address that is a multiple of `alignment`.
    ///
    /// The allocation is over-sized by `alignment + MIN_BLOCK_SIZE`. The
    /// padding in front of the aligned address is split off as a free block,
    /// so the returned pointer heads a block of its own and can be passed to
    /// [`free`](Self::free) or [`resize`](Self::resize) like any other.
    ///
    /// # Errors
    /// - [`HeapError::ZeroSize`] / [`HeapError::SizeOverflow`] for bad requests.
    /// - [`HeapError::InvalidAlignment`] if `alignment` is not a power of two.
    /// - [`HeapError::OutOfBounds`] if the aligned span would leave the region.
    /// - As for [`allocate`](Self::allocate).
    pub fn alloc_aligned(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        self.base()?;
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        if !alignment.is_power_of_two() {
            return Err(HeapError::InvalidAlignment);
        }
        if alignment <= WORD_SIZE {
            return self.allocate(size);
        }

        let (_, total) = block_size_for(size).ok_or(HeapError::SizeOverflow)?;
        let padded = size
            .checked_add(alignment)
            .and_then(|s| s.checked_add(MIN_BLOCK_SIZE))
            .ok_or(HeapError::SizeOverflow)?;
        let raw = self.allocate(padded)?;
        let (offset, block) = self.locate(raw)?;

        let raw_addr = raw.addr().get();
        if raw_addr.is_multiple_of(alignment) {
            self.shrink(offset, block, total)?;
            return Ok(raw);
        }

        let block_end = self.start() + offset + block.size;
        let aligned = raw_addr
            .checked_add(MIN_BLOCK_SIZE)
            .and_then(|a| align_up(a, alignment))
            .filter(|&a| a.checked_add(size).is_some_and(|end| end <= block_end));
        let Some(aligned) = aligned else {
            self.free(raw)?;
            return Err(HeapError::OutOfBounds);
        };

        // Split the leading padding off as a free block.
        let prev = self.predecessor(offset)?;
        let gap = aligned - raw_addr;
        let moved_offset = offset + gap;
        let moved = BlockHeader::new(block.size - gap, block.next, false);
        let after = self.successor(&moved)?;
        self.write_block(moved_offset, moved);
        self.free += gap;
        self.merge(offset, BlockHeader::new(gap, moved_offset, true), None, prev);

        self.shrink_before(moved_offset, moved, total, after);
        trace!("alloc_aligned({size}, {alignment}): block {moved_offset:#x}, {gap} bytes of padding");

        // Safety: `aligned` is the payload address of the block at `moved_offset`.
        Ok(unsafe { raw.add(gap) })
    }

    /// Shrink the live block at `offset` to `total` bytes, returning the tail
    /// to the free pool and merging it with a free successor.
    fn shrink(&mut self, offset: usize, block: BlockHeader, total: usize) -> Result<(), HeapError> {
        let after = self.successor(&block)?;
        self.shrink_before(offset, block, total, after);
        Ok(())
    }

    /// [`shrink`](Self::shrink) with the successor `after` already validated.
    fn shrink_before(
        &mut self,
        offset: usize,
        mut block: BlockHeader,
        total: usize,
        after: Option<BlockHeader>,
    ) {
        let next = block.next;
        if let Some((tail, tail_size)) = self.split_off(offset, &mut block, total) {
            self.write_block(offset, block);
            self.free += tail_size;
            self.merge(tail, BlockHeader::new(tail_size, next, true), after, None);
        }
    }

    /// Absorb free successors of the live block at `offset` until it spans
    /// `total` bytes. Nothing is changed if that is not possible.
    fn grow_in_place(
        &mut self,
        offset: usize,
        mut block: BlockHeader,
        total: usize,
    ) -> Result<bool, HeapError> {
        let mut available = block.size;
        let mut next = block.next;
        while available < total && next != NO_NEXT {
            let candidate = self.block(next)?;
            if !candidate.is_free() {
                break;
            }
            available += candidate.size;
            next = candidate.next;
        }
        if available < total {
            return Ok(false);
        }

        let absorbed = available - block.size;
        block.size = available;
        block.next = next;
        self.free = self.free.saturating_sub(absorbed);
        if let Some((_, surplus)) = self.split_off(offset, &mut block, total) {
            self.free += surplus;
        }
        self.write_block(offset, block);
        Ok(true)
    }
}
