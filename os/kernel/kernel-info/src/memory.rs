//! # Memory Layout

use crate::boot::BootMemoryInfo;

/// Where the kernel image is placed in *physical* memory.
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// Upper bound of the kernel heap; the heap never extends past it.
pub const KERNEL_HEAP_LIMIT: u64 = 0x0200_0000; // 32 MiB

/// Alignment of the kernel heap start.
pub const KERNEL_HEAP_ALIGN: u64 = 16;

const _: () = {
    assert!(KERNEL_HEAP_LIMIT > PHYS_LOAD);
    assert!(KERNEL_HEAP_ALIGN.is_power_of_two());
};

/// Physical range `[start, end)` of the kernel heap.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapBounds {
    pub start: u64,
    pub end: u64,
}

impl HeapBounds {
    /// Length in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapBoundsError {
    #[error("no memory map available")]
    NoMemoryMap,
    #[error("kernel end {0:#x} is not in available memory")]
    KernelEndNotAvailable(u64),
    #[error("no memory between kernel end and heap limit")]
    EmptyRange,
}

/// Derive the kernel heap range from the boot memory map.
///
/// The heap starts right behind the kernel image (`kernel_end`, rounded up to
/// [`KERNEL_HEAP_ALIGN`]) and extends to `limit` or the end of the available
/// entry containing the start, whichever comes first.
///
/// # Errors
/// - [`HeapBoundsError::NoMemoryMap`] if the map is empty.
/// - [`HeapBoundsError::KernelEndNotAvailable`] if the start lies outside of
///   every available entry.
/// - [`HeapBoundsError::EmptyRange`] if nothing is left below `limit`.
pub fn heap_bounds(
    kernel_end: u64,
    info: &BootMemoryInfo<'_>,
    limit: u64,
) -> Result<HeapBounds, HeapBoundsError> {
    if info.is_empty() {
        return Err(HeapBoundsError::NoMemoryMap);
    }

    let start = kernel_end
        .checked_next_multiple_of(KERNEL_HEAP_ALIGN)
        .ok_or(HeapBoundsError::EmptyRange)?;
    let entry = info
        .available()
        .find(|e| e.contains(start))
        .ok_or(HeapBoundsError::KernelEndNotAvailable(start))?;

    let end = entry.end().min(limit);
    if end <= start {
        return Err(HeapBoundsError::EmptyRange);
    }
    Ok(HeapBounds { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{MemoryKind, MemoryMapEntry};

    const MIB: u64 = 1024 * 1024;

    fn map() -> [MemoryMapEntry; 4] {
        [
            MemoryMapEntry::new(0, 0x9_F000, MemoryKind::AVAILABLE),
            MemoryMapEntry::new(0x9_F000, 0x1000, MemoryKind::RESERVED),
            MemoryMapEntry::new(MIB, 127 * MIB, MemoryKind::AVAILABLE),
            MemoryMapEntry::new(128 * MIB, MIB, MemoryKind::ACPI_RECLAIMABLE),
        ]
    }

    #[test]
    fn clamps_to_limit() {
        let entries = map();
        let info = BootMemoryInfo::new(&entries);
        let bounds = heap_bounds(2 * MIB + 3, &info, KERNEL_HEAP_LIMIT).unwrap();
        assert_eq!(bounds.start, 2 * MIB + 16);
        assert_eq!(bounds.end, KERNEL_HEAP_LIMIT);
        assert_eq!(bounds.len(), KERNEL_HEAP_LIMIT - 2 * MIB - 16);
    }

    #[test]
    fn clamps_to_containing_entry() {
        let entries = [MemoryMapEntry::new(MIB, 7 * MIB, MemoryKind::AVAILABLE)];
        let info = BootMemoryInfo::new(&entries);
        let bounds = heap_bounds(2 * MIB, &info, KERNEL_HEAP_LIMIT).unwrap();
        assert_eq!(bounds, HeapBounds { start: 2 * MIB, end: 8 * MIB });
    }

    #[test]
    fn rejects_missing_map() {
        let info = BootMemoryInfo::default();
        assert_eq!(
            heap_bounds(2 * MIB, &info, KERNEL_HEAP_LIMIT),
            Err(HeapBoundsError::NoMemoryMap)
        );
    }

    #[test]
    fn rejects_kernel_end_in_reserved_memory() {
        let entries = map();
        let info = BootMemoryInfo::new(&entries);
        assert_eq!(
            heap_bounds(0x9_F800, &info, KERNEL_HEAP_LIMIT),
            Err(HeapBoundsError::KernelEndNotAvailable(0x9_F800))
        );
        assert_eq!(
            heap_bounds(128 * MIB, &info, u64::MAX),
            Err(HeapBoundsError::KernelEndNotAvailable(128 * MIB))
        );
    }

    #[test]
    fn rejects_kernel_end_past_limit() {
        let entries = map();
        let info = BootMemoryInfo::new(&entries);
        assert_eq!(
            heap_bounds(KERNEL_HEAP_LIMIT + MIB, &info, KERNEL_HEAP_LIMIT),
            Err(HeapBoundsError::EmptyRange)
        );
        assert_eq!(
            heap_bounds(u64::MAX - 3, &info, u64::MAX),
            Err(HeapBoundsError::EmptyRange)
        );
    }

    #[test]
    fn bounds_length() {
        let b = HeapBounds { start: 0x1000, end: 0x3000 };
        assert_eq!(b.len(), 0x2000);
        assert!(!b.is_empty());
        assert!(HeapBounds { start: 5, end: 5 }.is_empty());
    }
}
