use crate::DeviceAddress;
use core::fmt;

/// A span `[base, base + size)` of device memory.
///
/// Used for scrub completions and for the block lists the allocator reports.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct DeviceRange {
    pub base: DeviceAddress,
    pub size: u64,
}

impl DeviceRange {
    #[inline]
    #[must_use]
    pub const fn new(base: DeviceAddress, size: u64) -> Self {
        Self { base, size }
    }

    /// Builds a range from an inclusive `[base, limit]` pair.
    #[inline]
    #[must_use]
    pub const fn from_inclusive(base: DeviceAddress, limit: DeviceAddress) -> Self {
        Self {
            base,
            size: limit.as_u64() - base.as_u64() + 1,
        }
    }

    /// Last byte of the range. Meaningless for empty ranges.
    #[inline]
    #[must_use]
    pub const fn limit(&self) -> DeviceAddress {
        DeviceAddress::new(self.base.as_u64() + self.size - 1)
    }

    /// One past the last byte.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> DeviceAddress {
        DeviceAddress::new(self.base.as_u64() + self.size)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: DeviceAddress) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() - self.base.as_u64() < self.size
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.base.as_u64() < other.end().as_u64()
            && other.base.as_u64() < self.end().as_u64()
    }

    /// The overlapping part of both ranges, if any.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if !self.overlaps(other) {
            return None;
        }
        let base = self.base.max(other.base);
        let end = self.end().min(other.end());
        Some(Self::new(base, end - base))
    }
}

impl fmt::Debug for DeviceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.base, self.end())
    }
}
