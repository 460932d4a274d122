//! # Kernel Boot Information
//!
//! The parts of the boot loader handoff the kernel needs to place its heap:
//! the physical memory map, in the multiboot2 entry format.

/// Memory map handed over by the boot loader.
#[derive(Debug, Copy, Clone, Default)]
pub struct BootMemoryInfo<'a> {
    /// Memory map entries in the order the loader reported them.
    pub entries: &'a [MemoryMapEntry],
}

impl<'a> BootMemoryInfo<'a> {
    #[must_use]
    pub const fn new(entries: &'a [MemoryMapEntry]) -> Self {
        Self { entries }
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that describe usable RAM.
    pub fn available(&self) -> impl Iterator<Item = &'a MemoryMapEntry> + 'a {
        self.entries.iter().filter(|e| e.kind.is_available())
    }
}

/// One memory map entry.
///
/// Layout matches a multiboot2 `mmap` entry: 64-bit base, 64-bit length,
/// 32-bit type, 32-bit reserved.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryMapEntry {
    /// Physical base address.
    pub addr: u64,
    /// Length in **bytes**.
    pub len: u64,
    pub kind: MemoryKind,
    reserved: u32,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(addr: u64, len: u64, kind: MemoryKind) -> Self {
        Self {
            addr,
            len,
            kind,
            reserved: 0,
        }
    }

    /// Exclusive end address, saturated at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.addr.saturating_add(self.len)
    }

    /// Whether `addr` lies inside this entry.
    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.end()
    }
}

/// Memory type tag of a [`MemoryMapEntry`].
///
/// Kept as a raw `u32` since loaders may report types we do not know.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryKind(pub u32);

impl MemoryKind {
    /// Usable RAM.
    pub const AVAILABLE: Self = Self(1);
    /// Reserved by firmware or devices.
    pub const RESERVED: Self = Self(2);
    /// ACPI tables; reclaimable once parsed.
    pub const ACPI_RECLAIMABLE: Self = Self(3);
    /// ACPI non-volatile storage; must be preserved.
    pub const NVS: Self = Self(4);
    /// Defective RAM.
    pub const BAD: Self = Self(5);

    #[inline]
    #[must_use]
    pub const fn is_available(self) -> bool {
        self.0 == Self::AVAILABLE.0
    }
}

const _: () = {
    assert!(size_of::<MemoryMapEntry>() == 24);
};
