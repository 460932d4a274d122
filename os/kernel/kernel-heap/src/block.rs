//! # Block Headers
//!
//! Every block of a heap region begins with a [`BlockHeader`], immediately
//! followed by its payload:
//!
//! ```text
//! +-------------+----------------------+------------------------------+
//! | size: usize | next: usize (offset) | tag: BlockTag (free | magic) |  payload ...
//! +-------------+----------------------+------------------------------+
//! ^ header offset                                                     ^ header offset + HEADER_SIZE
//! ```
//!
//! - `size` counts the header **and** the payload.
//! - `next` is the region offset of the physically following header, or
//!   [`NO_NEXT`] for the tail sentinel.
//! - `tag` packs the free flag and the validation magic into one word.

use bitfield_struct::bitfield;

/// Validation magic stored in every block tag.
pub const HEAP_MAGIC: u32 = 0xDEAD_BEEF;

/// Platform word size; all requests are rounded up to a multiple of it.
pub const WORD_SIZE: usize = size_of::<usize>();

/// Size of one block header in bytes.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Smallest block worth splitting off: a header plus one payload word.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + WORD_SIZE;

/// `next` value of the tail sentinel.
pub(crate) const NO_NEXT: usize = usize::MAX;

const _: () = {
    assert!(HEADER_SIZE.is_multiple_of(WORD_SIZE));
    assert!(WORD_SIZE.is_power_of_two());
};

/// Free flag and validation magic of a block.
///
/// Layout (LSB→MSB):
/// - bit 0: free
/// - bits 1..31: reserved
/// - bits 32..63: magic
#[bitfield(u64)]
pub(crate) struct BlockTag {
    pub free: bool,
    #[bits(31)]
    __: u32,
    pub magic: u32,
}

/// In-memory block header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockHeader {
    /// Total block size (header + payload) in bytes.
    pub size: usize,
    /// Offset of the next header, or [`NO_NEXT`].
    pub next: usize,
    pub tag: BlockTag,
}

impl BlockHeader {
    #[inline]
    pub const fn new(size: usize, next: usize, free: bool) -> Self {
        Self {
            size,
            next,
            tag: BlockTag::new().with_free(free).with_magic(HEAP_MAGIC),
        }
    }

    #[inline]
    pub const fn is_free(&self) -> bool {
        self.tag.free()
    }

    #[inline]
    pub fn set_free(&mut self, free: bool) {
        self.tag.set_free(free);
    }

    #[inline]
    pub const fn has_valid_magic(&self) -> bool {
        self.tag.magic() == HEAP_MAGIC
    }

    /// Payload capacity of this block.
    #[inline]
    pub const fn payload_size(&self) -> usize {
        self.size.saturating_sub(HEADER_SIZE)
    }
}

/// Align `value` upwards to `align` (must be a power of two).
#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Align `value` downwards to `align` (must be a power of two).
#[inline]
pub(crate) const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Word-rounded payload size and total block size for a request of `size` bytes.
#[inline]
pub(crate) const fn block_size_for(size: usize) -> Option<(usize, usize)> {
    let Some(payload) = align_up(size, WORD_SIZE) else {
        return None;
    };
    match payload.checked_add(HEADER_SIZE) {
        Some(total) => Some((payload, total)),
        None => None,
    }
}
