//! # Per-frame status word
//!
//! Every frame carries one [`PageStatus`]: a mutually exclusive [`FrameState`]
//! in bits 0..2 and five independent attribute bits.
//!
//! | Bit | Field           | Meaning                                                    |
//! |-----|-----------------|------------------------------------------------------------|
//! | 0   | state (UNPIN)   | allocated and evictable                                    |
//! | 1   | state (PIN)     | allocated and not evictable                                |
//! | 2   | `persistent`    | survives suspend/resume                                    |
//! | 3   | `scrubbing`     | waiting for the scrubber; excluded from allocation         |
//! | 4   | `evicting`      | chosen for an in-flight eviction                           |
//! | 5   | `blacklist`     | known bad; excluded from allocation                        |
//! | 6   | `reuse_pending` | evicted in OS-passthrough mode, held back from the OS      |
//!
//! Bit *i* of the word is stored in bit-plane *i* of the
//! [`RegionMap`](crate::RegionMap), so a status value doubles as a plane mask.
//! Updates pair a new value with a write mask: only bits set in the mask are
//! written.

use bitfield_struct::bitfield;
use core::ops::{BitAnd, BitOr, Not};

/// Number of bit-planes needed to store a [`PageStatus`].
pub const PLANE_COUNT: usize = 7;

/// Allocation state of a frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    Free = 0,
    Unpin = 1,
    Pin = 2,
}

impl FrameState {
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    /// Both state bits set cannot be produced by the allocator; it decodes as
    /// [`FrameState::Pin`] so such a frame is never handed out.
    #[must_use]
    pub const fn from_bits(value: u8) -> Self {
        match value & 0b11 {
            0 => Self::Free,
            1 => Self::Unpin,
            _ => Self::Pin,
        }
    }
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageStatus {
    /// State (bits 0..2).
    #[bits(2)]
    pub state: FrameState,
    /// Persistent (bit 2).
    pub persistent: bool,
    /// Scrubbing (bit 3).
    pub scrubbing: bool,
    /// Evicting (bit 4).
    pub evicting: bool,
    /// Blacklisted (bit 5).
    pub blacklist: bool,
    /// Reuse pending (bit 6).
    pub reuse_pending: bool,
    #[bits(25)]
    __: u32,
}

impl PageStatus {
    pub const FREE: Self = Self::new();
    pub const UNPIN: Self = Self::new().with_state(FrameState::Unpin);
    pub const PIN: Self = Self::new().with_state(FrameState::Pin);
    pub const PERSISTENT: Self = Self::new().with_persistent(true);
    pub const SCRUBBING: Self = Self::new().with_scrubbing(true);
    pub const EVICTING: Self = Self::new().with_evicting(true);
    pub const BLACKLIST: Self = Self::new().with_blacklist(true);
    pub const REUSE_PENDING: Self = Self::new().with_reuse_pending(true);

    /// Both state bits.
    pub const STATE_MASK: Self = Self::from_bits(0b000_0011);
    /// All attribute bits.
    pub const ATTRIB_MASK: Self = Self::from_bits(0b111_1100);
    /// Everything stored in the bitmap.
    pub const MAP_MASK: Self = Self::from_bits(0b111_1111);

    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() | other.into_bits())
    }

    #[inline]
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() & other.into_bits())
    }

    #[inline]
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() & !other.into_bits())
    }

    /// `true` if any bit of `other` is also set in `self`.
    #[inline]
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.into_bits() & other.into_bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.into_bits() & other.into_bits() == other.into_bits()
    }

    /// Applies `new` under `mask`: bits outside the mask keep their value.
    #[inline]
    #[must_use]
    pub const fn apply(self, new: Self, mask: Self) -> Self {
        let mask = mask.into_bits();
        Self::from_bits((self.into_bits() & !mask) | (new.into_bits() & mask))
    }

    /// `true` if the state is [`FrameState::Free`], whatever the attributes.
    #[inline]
    #[must_use]
    pub const fn is_free(self) -> bool {
        self.into_bits() & Self::STATE_MASK.into_bits() == 0
    }

    /// Plane indices whose bit is set in `self`.
    #[inline]
    #[must_use]
    pub(crate) const fn plane_bits(self) -> u8 {
        (self.into_bits() & Self::MAP_MASK.into_bits()) as u8
    }
}

impl BitOr for PageStatus {
    type Output = Self;
    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitAnd for PageStatus {
    type Output = Self;
    #[inline]
    fn bitand(self, rhs: Self) -> Self {
        self.intersection(rhs)
    }
}

impl Not for PageStatus {
    type Output = Self;
    #[inline]
    fn not(self) -> Self {
        Self::from_bits(!self.into_bits() & Self::MAP_MASK.into_bits())
    }
}

const _: () = {
    assert!(PageStatus::UNPIN.into_bits() == 1);
    assert!(PageStatus::PIN.into_bits() == 2);
    assert!(PageStatus::REUSE_PENDING.into_bits() == 1 << (PLANE_COUNT - 1));
    assert!(
        PageStatus::STATE_MASK.into_bits() | PageStatus::ATTRIB_MASK.into_bits()
            == PageStatus::MAP_MASK.into_bits()
    );
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_bits_decode() {
        assert_eq!(PageStatus::FREE.state(), FrameState::Free);
        assert_eq!(PageStatus::UNPIN.state(), FrameState::Unpin);
        assert_eq!(PageStatus::PIN.state(), FrameState::Pin);
        assert_eq!(PageStatus::from_bits(0b11).state(), FrameState::Pin);
        assert!(PageStatus::SCRUBBING.is_free());
        assert!(!(PageStatus::UNPIN | PageStatus::EVICTING).is_free());
    }

    #[test]
    fn apply_respects_mask() {
        let s = PageStatus::UNPIN | PageStatus::EVICTING | PageStatus::BLACKLIST;
        let freed = s.apply(
            PageStatus::SCRUBBING,
            PageStatus::MAP_MASK.difference(PageStatus::EVICTING | PageStatus::BLACKLIST),
        );
        assert_eq!(freed.state(), FrameState::Free);
        assert!(freed.scrubbing());
        assert!(freed.evicting());
        assert!(freed.blacklist());
        assert!(!freed.persistent());
    }

    #[test]
    fn set_operations() {
        let s = PageStatus::PIN | PageStatus::PERSISTENT;
        assert!(s.contains(PageStatus::PERSISTENT));
        assert!(s.intersects(PageStatus::STATE_MASK));
        assert!(!s.intersects(PageStatus::EVICTING));
        assert_eq!(s & PageStatus::STATE_MASK, PageStatus::PIN);
        assert_eq!(!PageStatus::STATE_MASK, PageStatus::ATTRIB_MASK);
    }
}
