use crate::regmap::RegionMap;
use gpu_memory_addresses::{DeviceAddress, DeviceRange, GRANULE, bytes_to_frames};

/// Protection class of a region, passed to eviction callbacks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryProtection {
    Unprotected,
    Protected,
}

/// Describes a region of device memory at registration time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegionDescriptor {
    pub base: DeviceAddress,
    /// Last byte of the region (inclusive).
    pub limit: DeviceAddress,
    /// Higher is faster.
    pub performance: u32,
    pub protected: bool,
}

impl RegionDescriptor {
    #[must_use]
    pub const fn new(base: DeviceAddress, limit: DeviceAddress, performance: u32) -> Self {
        Self {
            base,
            limit,
            performance,
            protected: false,
        }
    }

    /// Unprotected region of `frames` frames starting at `base`.
    #[must_use]
    pub const fn with_frames(base: DeviceAddress, frames: u64, performance: u32) -> Self {
        Self::new(
            base,
            DeviceAddress::new(base.as_u64() + frames * GRANULE - 1),
            performance,
        )
    }

    #[must_use]
    pub const fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.limit.as_u64() - self.base.as_u64() + 1
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> u64 {
        bytes_to_frames(self.size())
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> DeviceRange {
        DeviceRange::from_inclusive(self.base, self.limit)
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: DeviceAddress) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() <= self.limit.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn protection(&self) -> MemoryProtection {
        if self.protected {
            MemoryProtection::Protected
        } else {
            MemoryProtection::Unprotected
        }
    }
}

/// A registered region: its descriptor plus the bitmap tracking its frames.
pub(crate) struct Region {
    pub desc: RegionDescriptor,
    pub map: RegionMap,
}

impl Region {
    pub fn new(desc: RegionDescriptor) -> Self {
        Self {
            map: RegionMap::new(desc.base, desc.frames()),
            desc,
        }
    }

    /// Frame index of `addr`, if it lies in this region.
    #[inline]
    pub fn frame_of(&self, addr: DeviceAddress) -> Option<u64> {
        self.desc
            .contains(addr)
            .then(|| addr.frame_offset_from(self.desc.base))
    }

    /// Frames of this region inside `window` as a half-open frame range, or
    /// the whole region when there is no window.
    pub fn frame_window(&self, window: Option<DeviceRange>) -> Option<core::ops::Range<u64>> {
        let Some(window) = window else {
            return Some(0..self.desc.frames());
        };
        let clipped = self.desc.range().intersection(&window)?;
        let first = clipped.base.frame_offset_from(self.desc.base);
        let end = bytes_to_frames(clipped.end() - self.desc.base);
        (first < end).then_some(first..end)
    }
}
