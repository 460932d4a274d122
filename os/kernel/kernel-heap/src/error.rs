/// Reasons a header failed validation during a chain walk.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Corruption {
    /// The header does not fit inside the region.
    OutOfRegion,
    /// The validation magic does not match [`HEAP_MAGIC`](crate::HEAP_MAGIC).
    BadMagic,
    /// The recorded size is smaller than a header or runs past the region.
    BadSize,
    /// The link does not point at the physically following block.
    BadLink,
    /// A head or tail sentinel is missing, free, or mis-sized.
    Sentinel,
    /// Two free blocks are physically adjacent.
    AdjacentFree,
    /// The free counter disagrees with the free blocks.
    FreeCount,
}

impl core::fmt::Display for Corruption {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::OutOfRegion => "header outside of region",
            Self::BadMagic => "invalid magic",
            Self::BadSize => "invalid block size",
            Self::BadLink => "broken chain link",
            Self::Sentinel => "damaged sentinel",
            Self::AdjacentFree => "adjacent free blocks",
            Self::FreeCount => "free counter mismatch",
        })
    }
}

/// Errors reported by heap operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("heap region is not initialized")]
    Uninitialized,
    #[error("heap region is already initialized")]
    AlreadyInitialized,
    #[error("invalid heap bounds")]
    InvalidRegion,
    #[error("zero-sized request")]
    ZeroSize,
    #[error("request size overflows")]
    SizeOverflow,
    #[error("alignment is not a power of two")]
    InvalidAlignment,
    #[error("pointer outside of heap bounds")]
    OutOfBounds,
    #[error("out of memory")]
    OutOfMemory,
    #[error("pointer is not owned by a live block")]
    UnknownPointer,
    #[error("heap corruption at offset {offset:#x}: {reason}")]
    Corrupted { offset: usize, reason: Corruption },
}
