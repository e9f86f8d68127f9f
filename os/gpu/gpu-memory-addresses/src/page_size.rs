use crate::GRANULE_SHIFT;
use core::fmt;

/// Allocation page sizes supported by the physical memory allocator.
///
/// Unlike CPU page tables, the page size of a device allocation is a runtime
/// property of the request, so this is a plain enum rather than a marker type.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PageSize {
    /// 64 KiB (`65_536` bytes), one frame.
    Size64K,
    /// 128 KiB (`131_072` bytes).
    Size128K,
    /// 2 MiB (`2_097_152` bytes).
    Size2M,
    /// 512 MiB (`536_870_912` bytes).
    Size512M,
}

/// A byte count that is not one of the [`PageSize`] values.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("unsupported page size: {0:#x}")]
pub struct PageSizeError(pub u64);

impl PageSize {
    /// All supported sizes, smallest first.
    pub const ALL: [Self; 4] = [Self::Size64K, Self::Size128K, Self::Size2M, Self::Size512M];

    /// log2 of the page size.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Size64K => 16,
            Self::Size128K => 17,
            Self::Size2M => 21,
            Self::Size512M => 29,
        }
    }

    /// Page size in bytes (power of two).
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        1 << self.shift()
    }

    /// Number of 64 KiB frames covered by one page.
    #[inline]
    #[must_use]
    pub const fn frames(self) -> u64 {
        1 << (self.shift() - GRANULE_SHIFT)
    }

    /// Looks up the page size with exactly `bytes` bytes.
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Option<Self> {
        match bytes {
            0x1_0000 => Some(Self::Size64K),
            0x2_0000 => Some(Self::Size128K),
            0x20_0000 => Some(Self::Size2M),
            0x2000_0000 => Some(Self::Size512M),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Size64K => "64K",
            Self::Size128K => "128K",
            Self::Size2M => "2M",
            Self::Size512M => "512M",
        }
    }
}

impl TryFrom<u64> for PageSize {
    type Error = PageSizeError;

    fn try_from(bytes: u64) -> Result<Self, Self::Error> {
        Self::from_bytes(bytes).ok_or(PageSizeError(bytes))
    }
}

impl From<PageSize> for u64 {
    #[inline]
    fn from(value: PageSize) -> Self {
        value.bytes()
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}
