use crate::{GRANULE, GRANULE_SHIFT, PageSize};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Device memory address.
///
/// A thin `u64` wrapper for addresses in the memory the allocator manages. It
/// is never dereferenced on the host; it only names a location.
///
/// ### Examples
/// ```rust
/// # use gpu_memory_addresses::*;
/// let a = DeviceAddress::new(0x0003_0000);
/// assert!(a.is_aligned(GRANULE));
/// assert_eq!((a + GRANULE).as_u64(), 0x0004_0000);
/// assert_eq!(a.frame_offset_from(DeviceAddress::new(0x0001_0000)), 2);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Align down to `align` bytes (power of two).
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two());
        Self(self.0 & !(align - 1))
    }

    /// Align up to `align` bytes (power of two); `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn checked_align_up(self, align: u64) -> Option<Self> {
        debug_assert!(align.is_power_of_two());
        match self.0.checked_add(align - 1) {
            Some(v) => Some(Self(v & !(align - 1))),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Returns `true` if the address is a multiple of `size`.
    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self, size: PageSize) -> bool {
        self.is_aligned(size.bytes())
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Number of whole frames between `base` and `self`.
    ///
    /// `self` must not be below `base`.
    #[inline]
    #[must_use]
    pub const fn frame_offset_from(self, base: Self) -> u64 {
        (self.0 - base.0) >> GRANULE_SHIFT
    }

    /// Address of frame `frame` counted from `self`.
    #[inline]
    #[must_use]
    pub const fn frame(self, frame: u64) -> Self {
        Self(self.0 + frame * GRANULE)
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for DeviceAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<DeviceAddress> for u64 {
    #[inline]
    fn from(v: DeviceAddress) -> Self {
        v.as_u64()
    }
}

impl Add<u64> for DeviceAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for DeviceAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// Distance in bytes.
impl Sub for DeviceAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}
