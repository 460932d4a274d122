//! # Heap Region
//!
//! A [`HeapRegion`] manages one contiguous span of memory as an address-ordered
//! chain of blocks. The span is treated as a byte arena: headers are read and
//! written by their offset from the region start, and every access is checked
//! against the region size before the arena is touched.
//!
//! ```text
//! start                                                               end
//! +------+---------------------+----------------------+-----+--------+
//! | head | block               | block                | ... | tail   |
//! | used | free / used         | free / used          |     | used   |
//! +------+---------------------+----------------------+-----+--------+
//!  ^ offset 0                                                ^ size - HEADER_SIZE
//! ```
//!
//! The head and tail sentinels are never free and never hold user data; they
//! only anchor the chain. Blocks tile the region without gaps, so the link of
//! every block is exactly `offset + size`.

use crate::block::{
    BlockHeader, HEADER_SIZE, MIN_BLOCK_SIZE, NO_NEXT, WORD_SIZE, align_down, align_up,
    block_size_for,
};
use crate::error::{Corruption, HeapError};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use log::{debug, trace, warn};

/// Smallest span that fits the head sentinel, one minimal free block, and the tail sentinel.
pub const MIN_REGION_SIZE: usize = 2 * HEADER_SIZE + MIN_BLOCK_SIZE;

/// One heap region: a span of memory and its block chain.
///
/// All operations take the region explicitly; there is no hidden global.
/// The region is single-owner: wrap it in a [`LockedHeap`](crate::LockedHeap)
/// to share it.
pub struct HeapRegion<'mem> {
    /// Pointer to the (word-aligned) region start; `None` while uninitialized.
    base: Option<NonNull<u8>>,
    /// Start address (inclusive).
    start: usize,
    /// End address (exclusive).
    end: usize,
    /// `end - start`.
    size: usize,
    /// Sum of the sizes of all free blocks, headers included.
    pub(crate) free: usize,
    _mem: PhantomData<&'mem mut [u8]>,
}

// Safety: the region exclusively owns its span; raw pointers are only used through `&self`/`&mut self`.
unsafe impl Send for HeapRegion<'_> {}

impl Default for HeapRegion<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'mem> HeapRegion<'mem> {
    /// Construct an uninitialized region. Every operation fails until [`create`](Self::create).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            base: None,
            start: 0,
            end: 0,
            size: 0,
            free: 0,
            _mem: PhantomData,
        }
    }

    /// Lay out a fresh block chain over `mem`.
    ///
    /// The span is trimmed to word boundaries, then a head sentinel, one free
    /// block covering the rest, and a tail sentinel are written.
    ///
    /// # Errors
    /// [`HeapError::InvalidRegion`] if the trimmed span is smaller than
    /// [`MIN_REGION_SIZE`]. The region is left untouched in that case.
    pub fn create(&mut self, mem: &'mem mut [u8]) -> Result<(), HeapError> {
        let len = mem.len();
        let base = NonNull::from(mem).cast::<u8>();
        // Safety: `mem` is borrowed mutably for `'mem`.
        unsafe { self.init_at(base, len) }
    }

    /// Lay out a fresh block chain over the raw address range `[start, end)`.
    ///
    /// # Errors
    /// [`HeapError::InvalidRegion`] if `start` is null, `start >= end`, or the
    /// trimmed span is smaller than [`MIN_REGION_SIZE`].
    ///
    /// # Safety
    /// - `[start, end)` must be valid, writable memory for `'mem`.
    /// - Nothing else may access the range while the region is alive.
    pub unsafe fn create_raw(&mut self, start: usize, end: usize) -> Result<(), HeapError> {
        if start >= end {
            return Err(HeapError::InvalidRegion);
        }
        let Some(base) = NonNull::new(ptr::with_exposed_provenance_mut::<u8>(start)) else {
            return Err(HeapError::InvalidRegion);
        };
        unsafe { self.init_at(base, end - start) }
    }

    /// # Safety
    /// `[base, base + len)` must be valid, writable, and exclusive for `'mem`.
    unsafe fn init_at(&mut self, base: NonNull<u8>, len: usize) -> Result<(), HeapError> {
        let raw_start = base.addr().get();
        let raw_end = raw_start.checked_add(len).ok_or(HeapError::InvalidRegion)?;
        let start = align_up(raw_start, WORD_SIZE).ok_or(HeapError::InvalidRegion)?;
        let end = align_down(raw_end, WORD_SIZE);
        if start >= end || end - start < MIN_REGION_SIZE {
            return Err(HeapError::InvalidRegion);
        }

        let size = end - start;
        // Safety: `start - raw_start < WORD_SIZE <= len` keeps the pointer in bounds.
        self.base = Some(unsafe { base.add(start - raw_start) });
        self.start = start;
        self.end = end;
        self.size = size;

        let tail = size - HEADER_SIZE;
        let usable = size - 2 * HEADER_SIZE;
        self.write_block(0, BlockHeader::new(HEADER_SIZE, HEADER_SIZE, false));
        self.write_block(HEADER_SIZE, BlockHeader::new(usable, tail, true));
        self.write_block(tail, BlockHeader::new(HEADER_SIZE, NO_NEXT, false));
        self.free = usable;

        debug!("heap region {start:#x}..{end:#x} created, {usable} bytes free");
        Ok(())
    }

    /// Reset the bookkeeping. The underlying memory is neither cleared nor released.
    pub fn destroy(&mut self) {
        if self.is_initialized() {
            debug!("heap region {:#x}..{:#x} destroyed", self.start, self.end);
        }
        *self = Self::new();
    }

    #[inline]
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.base.is_some()
    }

    /// Start address (inclusive).
    #[inline]
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// End address (exclusive).
    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    /// Total size of the region in bytes, sentinels included.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Bytes held by free blocks, their headers included.
    #[inline]
    #[must_use]
    pub const fn free_bytes(&self) -> usize {
        self.free
    }

    /// Whether `ptr` lies inside `[start, end)`.
    #[inline]
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.is_initialized() && (self.start..self.end).contains(&ptr.addr().get())
    }

    /// Allocate `size` bytes using best fit.
    ///
    /// The request is rounded up to the word size. The smallest free block that
    /// fits is chosen (lowest address on ties); a surplus of at least
    /// [`MIN_BLOCK_SIZE`] is split off as a new free block.
    ///
    /// # Errors
    /// - [`HeapError::ZeroSize`] / [`HeapError::SizeOverflow`] for bad requests.
    /// - [`HeapError::OutOfMemory`] if no free block is large enough.
    /// - [`HeapError::Corrupted`] if the walk hits an invalid header.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let base = self.base()?;
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let (payload, total) = block_size_for(size).ok_or(HeapError::SizeOverflow)?;

        let mut best: Option<(usize, BlockHeader)> = None;
        for entry in self.chain() {
            let (offset, block) = entry?;
            if block.is_free()
                && block.size >= total
                && best.is_none_or(|(_, b)| block.size < b.size)
            {
                best = Some((offset, block));
            }
        }

        let Some((offset, mut block)) = best else {
            trace!("allocate({size}): no free block of {total} bytes");
            return Err(HeapError::OutOfMemory);
        };

        // The payload must end inside the region.
        if offset + HEADER_SIZE + payload > self.size {
            return Err(HeapError::OutOfMemory);
        }

        let consumed = match self.split_off(offset, &mut block, total) {
            Some(_) => total,
            None => block.size,
        };
        block.set_free(false);
        self.write_block(offset, block);
        self.free = self.free.saturating_sub(consumed);

        trace!(
            "allocate({size}): block {offset:#x} of {} bytes",
            block.size
        );
        Ok(Self::payload_ptr(base, offset))
    }

    /// Release the block owning `ptr` and merge it with free neighbors.
    ///
    /// Both neighbors are validated before anything is written.
    ///
    /// # Errors
    /// - [`HeapError::OutOfBounds`] if `ptr` is outside the region.
    /// - [`HeapError::UnknownPointer`] if no live block owns `ptr` (double free
    ///   or foreign pointer). Nothing is changed.
    /// - [`HeapError::Corrupted`] if the owner or a neighbor has an invalid
    ///   header. Nothing is changed.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.base()?;
        let target = self.offset_of(ptr)?;
        let (offset, mut block) = self.owner_by_scan(target)?;
        let next = self.successor(&block)?;
        let prev = self.predecessor(offset)?;

        block.set_free(true);
        self.free += block.size;
        let merged = self.merge(offset, block, next, prev);
        trace!("free({:#x}): block {offset:#x} -> {merged:#x}", ptr.addr());
        Ok(())
    }

    /// Payload capacity of the live block owning `ptr`.
    ///
    /// # Errors
    /// As for [`free`](Self::free).
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        self.locate(ptr).map(|(_, block)| block.payload_size())
    }

    /// Bytes from `ptr` to the end of its live block.
    #[must_use]
    pub fn payload(&self, ptr: NonNull<u8>) -> Option<&[u8]> {
        let (offset, block) = self.locate(ptr).ok()?;
        let len = offset + block.size - self.offset_of(ptr).ok()?;
        // Safety: `[ptr, ptr + len)` lies inside a live block of this region.
        Some(unsafe { core::slice::from_raw_parts(ptr.as_ptr(), len) })
    }

    /// Mutable bytes from `ptr` to the end of its live block.
    #[must_use]
    pub fn payload_mut(&mut self, ptr: NonNull<u8>) -> Option<&mut [u8]> {
        let (offset, block) = self.locate(ptr).ok()?;
        let len = offset + block.size - self.offset_of(ptr).ok()?;
        // Safety: as above; `&mut self` excludes any other view.
        Some(unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), len) })
    }

    /// Find the live block owning `ptr`.
    ///
    /// Tries the header slot right in front of `ptr` first and falls back to a
    /// full walk.
    pub(crate) fn locate(&self, ptr: NonNull<u8>) -> Result<(usize, BlockHeader), HeapError> {
        self.base()?;
        let target = self.offset_of(ptr)?;
        if let Some(offset) = target.checked_sub(HEADER_SIZE)
            && let Ok(block) = self.read_block(offset)
            && !block.is_free()
            && target < offset + block.size
        {
            return Ok((offset, block));
        }
        self.owner_by_scan(target)
    }

    /// Walk the chain for the live block whose payload contains `target`.
    fn owner_by_scan(&self, target: usize) -> Result<(usize, BlockHeader), HeapError> {
        for entry in self.chain() {
            let (offset, block) = entry?;
            if !block.is_free() && (offset + HEADER_SIZE..offset + block.size).contains(&target) {
                return Ok((offset, block));
            }
        }
        Err(HeapError::UnknownPointer)
    }

    /// Write the free block at `offset`, absorbing `next` and folding into
    /// `prev` where those are free. Returns the offset of the resulting block.
    ///
    /// `next` and `prev` must be the validated physical neighbors of the block.
    pub(crate) fn merge(
        &mut self,
        offset: usize,
        mut block: BlockHeader,
        next: Option<BlockHeader>,
        prev: Option<(usize, BlockHeader)>,
    ) -> usize {
        if let Some(next) = next.filter(BlockHeader::is_free) {
            block.size += next.size;
            block.next = next.next;
        }
        match prev {
            Some((prev_offset, mut prev)) if prev.is_free() => {
                prev.size += block.size;
                prev.next = block.next;
                self.write_block(prev_offset, prev);
                prev_offset
            }
            _ => {
                self.write_block(offset, block);
                offset
            }
        }
    }

    /// The validated header following `block`, if any.
    pub(crate) fn successor(&self, block: &BlockHeader) -> Result<Option<BlockHeader>, HeapError> {
        if block.next == NO_NEXT {
            return Ok(None);
        }
        self.block(block.next).map(Some)
    }

    /// The block linking to `offset`, if any.
    pub(crate) fn predecessor(&self, offset: usize) -> Result<Option<(usize, BlockHeader)>, HeapError> {
        let mut prev = None;
        for entry in self.chain() {
            let (current, block) = entry?;
            if current == offset {
                return Ok(prev);
            }
            prev = Some((current, block));
        }
        Ok(None)
    }

    /// Shrink `block` to `keep` bytes if the surplus can hold a minimal block.
    ///
    /// Writes the new free remainder header and updates `block` in place; the
    /// caller writes `block` back. Returns the remainder's offset and size.
    pub(crate) fn split_off(
        &mut self,
        offset: usize,
        block: &mut BlockHeader,
        keep: usize,
    ) -> Option<(usize, usize)> {
        let surplus = block.size.checked_sub(keep)?;
        if surplus < MIN_BLOCK_SIZE {
            return None;
        }
        let remainder = offset + keep;
        self.write_block(remainder, BlockHeader::new(surplus, block.next, true));
        block.size = keep;
        block.next = remainder;
        Some((remainder, surplus))
    }

    /// Iterate over `(offset, header)` in chain order, validating each header.
    pub(crate) const fn chain(&self) -> Chain<'_, 'mem> {
        Chain {
            region: self,
            next: if self.base.is_some() { 0 } else { NO_NEXT },
        }
    }

    #[inline]
    pub(crate) fn base(&self) -> Result<NonNull<u8>, HeapError> {
        self.base.ok_or(HeapError::Uninitialized)
    }

    /// Region offset of `ptr`.
    #[inline]
    pub(crate) fn offset_of(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        let addr = ptr.addr().get();
        if addr < self.start || addr >= self.end {
            return Err(HeapError::OutOfBounds);
        }
        Ok(addr - self.start)
    }

    #[inline]
    pub(crate) const fn payload_ptr(base: NonNull<u8>, offset: usize) -> NonNull<u8> {
        // Safety: callers pass offsets of blocks inside the region.
        unsafe { base.add(offset + HEADER_SIZE) }
    }

    /// Read and validate the header at `offset`, logging corruption.
    pub(crate) fn block(&self, offset: usize) -> Result<BlockHeader, HeapError> {
        self.read_block(offset).map_err(|reason| {
            warn!("heap corruption at {offset:#x} in region {:#x}: {reason}", self.start);
            HeapError::Corrupted { offset, reason }
        })
    }

    /// Read and validate the header at `offset`.
    fn read_block(&self, offset: usize) -> Result<BlockHeader, Corruption> {
        let Some(base) = self.base else {
            return Err(Corruption::OutOfRegion);
        };
        if offset.checked_add(HEADER_SIZE).is_none_or(|end| end > self.size) {
            return Err(Corruption::OutOfRegion);
        }

        // Safety: the header lies inside the region; any bit pattern is a valid header.
        let block = unsafe { base.add(offset).cast::<BlockHeader>().read_unaligned() };

        if !block.has_valid_magic() {
            return Err(Corruption::BadMagic);
        }
        let block_end = offset
            .checked_add(block.size)
            .filter(|&end| block.size >= HEADER_SIZE && end <= self.size)
            .ok_or(Corruption::BadSize)?;
        let expected = if block_end == self.size {
            NO_NEXT
        } else {
            block_end
        };
        if block.next != expected {
            return Err(Corruption::BadLink);
        }
        Ok(block)
    }

    /// Write the header at `offset`.
    pub(crate) fn write_block(&mut self, offset: usize, block: BlockHeader) {
        debug_assert!(offset + HEADER_SIZE <= self.size);
        if let Some(base) = self.base {
            // Safety: the header lies inside the region, which we own exclusively.
            unsafe { base.add(offset).cast::<BlockHeader>().write_unaligned(block) };
        }
    }
}

/// Validating iterator over the block chain.
pub(crate) struct Chain<'r, 'mem> {
    region: &'r HeapRegion<'mem>,
    next: usize,
}

impl Iterator for Chain<'_, '_> {
    type Item = Result<(usize, BlockHeader), HeapError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NO_NEXT {
            return None;
        }
        let offset = self.next;
        match self.region.block(offset) {
            Ok(block) => {
                self.next = block.next;
                Some(Ok((offset, block)))
            }
            Err(e) => {
                // Nothing beyond a bad header can be trusted.
                self.next = NO_NEXT;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(16))]
    struct Arena<const N: usize>([u8; N]);

    fn region(mem: &mut [u8]) -> HeapRegion<'_> {
        let mut heap = HeapRegion::new();
        heap.create(mem).unwrap();
        heap
    }

    #[test]
    fn create_lays_out_sentinels() {
        let mut arena = Arena([0u8; 1024]);
        let heap = region(&mut arena.0);

        let blocks: Vec<_> = heap.chain().map(Result::unwrap).collect();
        assert_eq!(blocks.len(), 3);

        let (head, head_block) = blocks[0];
        assert_eq!(head, 0);
        assert!(!head_block.is_free());
        assert_eq!(head_block.size, HEADER_SIZE);

        let (free, free_block) = blocks[1];
        assert_eq!(free, HEADER_SIZE);
        assert!(free_block.is_free());
        assert_eq!(free_block.size, 1024 - 2 * HEADER_SIZE);

        let (tail, tail_block) = blocks[2];
        assert_eq!(tail, 1024 - HEADER_SIZE);
        assert!(!tail_block.is_free());

        assert_eq!(heap.free_bytes(), 1024 - 2 * HEADER_SIZE);
        heap.check().unwrap();
    }

    #[test]
    fn create_rejects_tiny_spans() {
        let mut small = Arena([0u8; MIN_REGION_SIZE]);
        let mut heap = HeapRegion::new();
        assert_eq!(
            heap.create(&mut small.0[..MIN_REGION_SIZE - WORD_SIZE]),
            Err(HeapError::InvalidRegion)
        );
        assert!(!heap.is_initialized());

        let mut exact = Arena([0u8; MIN_REGION_SIZE]);
        let mut heap = HeapRegion::new();
        assert!(heap.create(&mut exact.0).is_ok());
        assert_eq!(heap.free_bytes(), MIN_BLOCK_SIZE);
        heap.check().unwrap();
    }

    #[test]
    fn create_trims_to_words() {
        let mut arena = Arena([0u8; 256]);
        let heap = region(&mut arena.0[1..255]);
        assert_eq!(heap.start() % WORD_SIZE, 0);
        assert_eq!(heap.end() % WORD_SIZE, 0);
        assert_eq!(heap.size(), 256 - 2 * WORD_SIZE);
        heap.check().unwrap();
    }

    #[test]
    fn uninitialized_region_refuses_everything() {
        let mut heap = HeapRegion::new();
        assert_eq!(heap.allocate(8), Err(HeapError::Uninitialized));
        assert_eq!(heap.free(NonNull::dangling()), Err(HeapError::Uninitialized));
        assert_eq!(heap.chain().count(), 0);
    }

    #[test]
    fn allocate_splits_best_fit() {
        let mut arena = Arena([0u8; 1024]);
        let mut heap = region(&mut arena.0);

        let p = heap.allocate(10).unwrap();
        assert_eq!(p.addr().get(), heap.start() + 2 * HEADER_SIZE);

        let (payload, total) = block_size_for(10).unwrap();
        assert_eq!(heap.usable_size(p), Ok(payload));
        assert_eq!(heap.free_bytes(), 1024 - 2 * HEADER_SIZE - total);
        heap.check().unwrap();
    }

    #[test]
    fn allocate_takes_whole_block_without_room_to_split() {
        let mut arena = Arena([0u8; 512]);
        let mut heap = region(&mut arena.0);
        let usable = heap.free_bytes();

        // Leave less than a minimal block behind.
        let p = heap.allocate(usable - HEADER_SIZE - WORD_SIZE).unwrap();
        assert_eq!(heap.free_bytes(), 0);
        assert_eq!(heap.usable_size(p), Ok(usable - HEADER_SIZE));
        assert_eq!(heap.allocate(1), Err(HeapError::OutOfMemory));
        heap.check().unwrap();
    }

    #[test]
    fn free_rejects_foreign_and_interior_double_free() {
        let mut arena = Arena([0u8; 512]);
        let mut heap = region(&mut arena.0);
        let p = heap.allocate(32).unwrap();

        let mut other = [0u8; 8];
        assert_eq!(
            heap.free(NonNull::from(&mut other).cast()),
            Err(HeapError::OutOfBounds)
        );

        // Interior pointers resolve to their owning block.
        let interior = unsafe { p.add(8) };
        assert_eq!(heap.free(interior), Ok(()));
        assert_eq!(heap.free(p), Err(HeapError::UnknownPointer));
        heap.check().unwrap();
    }

    #[test]
    fn corrupted_magic_stops_the_walk() {
        let mut arena = Arena([0u8; 512]);
        let mut heap = region(&mut arena.0);
        let a = heap.allocate(16).unwrap();
        let _b = heap.allocate(16).unwrap();

        // Smash the magic of `a`'s header.
        unsafe { a.sub(4).write_bytes(0, 4) };
        assert!(matches!(
            heap.allocate(8),
            Err(HeapError::Corrupted {
                reason: Corruption::BadMagic,
                ..
            })
        ));
    }

    #[test]
    fn destroy_resets_bookkeeping() {
        let mut arena = Arena([0u8; 256]);
        let mut heap = region(&mut arena.0);
        heap.destroy();
        assert!(!heap.is_initialized());
        assert_eq!(heap.size(), 0);
        assert_eq!(heap.free_bytes(), 0);
        assert_eq!(heap.allocate(8), Err(HeapError::Uninitialized));
    }
}
