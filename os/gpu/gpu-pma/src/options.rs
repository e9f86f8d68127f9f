use crate::{AllocationFlags, AllocationResultFlags};
use gpu_memory_addresses::DeviceAddress;

/// Which half of a 2-way address stride an allocation must land in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StrideParity {
    Even,
    Odd,
}

impl StrideParity {
    #[inline]
    #[must_use]
    pub const fn bit(self) -> u64 {
        match self {
            Self::Even => 0,
            Self::Odd => 1,
        }
    }
}

/// Address-stride partition: memory is cut into `size`-byte blocks and only
/// blocks whose index has the requested parity are eligible. A run never
/// crosses a block boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Stride {
    /// Block size in bytes (power of two).
    pub size: u64,
    pub parity: StrideParity,
}

impl Stride {
    #[must_use]
    pub const fn new(size: u64, parity: StrideParity) -> Self {
        Self { size, parity }
    }

    /// Smallest address `>= addr` where a run of `len` bytes satisfies the
    /// stride, before any alignment is reapplied.
    #[must_use]
    pub(crate) const fn forward(self, addr: u64, len: u64) -> Option<u64> {
        let block = addr / self.size;
        if block & 1 != self.parity.bit() {
            (block + 1).checked_mul(self.size)
        } else if (addr + len - 1) / self.size != block {
            (block + 2).checked_mul(self.size)
        } else {
            Some(addr)
        }
    }

    /// Largest address `<= addr` where a run of `len` bytes satisfies the
    /// stride, before any alignment is reapplied.
    #[must_use]
    pub(crate) const fn reverse(self, addr: u64, len: u64) -> Option<u64> {
        let block = addr / self.size;
        if block & 1 != self.parity.bit() {
            // End of the previous block, which has the other parity.
            if block == 0 {
                return None;
            }
            (block * self.size).checked_sub(len)
        } else if (addr + len - 1) / self.size != block {
            Some((block + 1) * self.size - len)
        } else {
            Some(addr)
        }
    }
}

/// Request-scoped options for [`Pma::allocate_pages`](crate::Pma::allocate_pages).
///
/// The last two fields are outputs and are overwritten by every call.
#[derive(Debug, Clone, Default)]
pub struct AllocationOptions {
    pub flags: AllocationFlags,
    /// Only regions with at least this performance rank.
    pub min_performance: Option<u32>,
    /// Only addresses inside this inclusive `[begin, end]` window.
    pub range: Option<(DeviceAddress, DeviceAddress)>,
    /// Only this region.
    pub region_id: Option<usize>,
    /// Alignment in bytes; the effective alignment is at least the page size.
    pub alignment: Option<u64>,
    pub stride: Option<Stride>,

    /// Set on return.
    pub result_flags: AllocationResultFlags,
    /// Pages actually granted, set on return.
    pub num_pages_allocated: u64,
}

impl AllocationOptions {
    #[must_use]
    pub fn new(flags: AllocationFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn contiguous() -> Self {
        Self::new(AllocationFlags::new().with_contiguous(true))
    }

    #[must_use]
    pub const fn in_range(mut self, begin: DeviceAddress, end: DeviceAddress) -> Self {
        self.range = Some((begin, end));
        self
    }

    #[must_use]
    pub const fn in_region(mut self, id: usize) -> Self {
        self.region_id = Some(id);
        self
    }

    #[must_use]
    pub const fn aligned_to(mut self, alignment: u64) -> Self {
        self.alignment = Some(alignment);
        self
    }

    #[must_use]
    pub const fn with_min_performance(mut self, performance: u32) -> Self {
        self.min_performance = Some(performance);
        self
    }

    #[must_use]
    pub const fn with_stride(mut self, stride: Stride) -> Self {
        self.stride = Some(stride);
        self
    }
}
