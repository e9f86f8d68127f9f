//! # Region bitmap
//!
//! A [`RegionMap`] stores the [`PageStatus`] of every frame of one region as
//! [`PLANE_COUNT`] parallel bit-planes: plane *i* holds bit *i* of every
//! frame's status word, one `u64` per 64 frames.
//!
//! ```text
//!  frame:        0 1 2 3 4 5 ... 63 | 64 ...
//!  plane UNPIN   0 0 1 1 0 0 ...  0 | ...     word 0 | word 1 | ...
//!  plane PIN     1 1 0 0 0 0 ...  0 | ...
//!  plane SCRUB   0 0 0 0 1 0 ...  0 | ...
//!  ...
//! ```
//!
//! A frame is FREE iff its UNPIN and PIN bits are both clear. Searching for
//! usable frames ORs the relevant planes of one word into an *occupancy*
//! word and skips whole words with `trailing_zeros`/`leading_zeros`, so a
//! scan costs O(words) rather than O(frames).
//!
//! The map keeps two counters in sync with every mutation: free frames and
//! free large pages (2 MiB chunks of 32 frames, counted from frame 0). Both
//! are updated from a before/after XOR of the touched words inside
//! [`RegionMap::change_block_state_attrib`].
//!
//! All methods assume the caller holds the allocator's primary lock.

mod scan;

pub use scan::{ScanOutcome, ScanRequest};

use crate::status::{PLANE_COUNT, PageStatus};
use alloc::vec;
use alloc::vec::Vec;
use core::array;
use gpu_memory_addresses::{DeviceAddress, DeviceRange, FRAMES_PER_LARGE_PAGE, frames_to_bytes};

const WORD_BITS: u64 = u64::BITS as u64;
const HALF_WORD: u64 = 0xFFFF_FFFF;

const _: () = assert!(FRAMES_PER_LARGE_PAGE * 2 == WORD_BITS);

/// Which plane bits make a frame unusable for a particular search.
///
/// A frame is *occupied* if any plane in `blocked_by` is set, or any plane in
/// `requires` is clear.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Occupancy {
    blocked_by: u8,
    requires: u8,
}

impl Occupancy {
    /// Allocatable right now.
    pub const FREE: Self = Self::blocked_by(
        PageStatus::STATE_MASK
            .union(PageStatus::SCRUBBING)
            .union(PageStatus::EVICTING)
            .union(PageStatus::BLACKLIST)
            .union(PageStatus::REUSE_PENDING),
    );

    /// Allocatable once UNPIN frames are evicted.
    pub const EVICTABLE: Self = Self::blocked_by(
        PageStatus::PIN
            .union(PageStatus::SCRUBBING)
            .union(PageStatus::EVICTING)
            .union(PageStatus::BLACKLIST)
            .union(PageStatus::REUSE_PENDING),
    );

    /// Every frame UNPIN and idle: eviction target in OS-passthrough mode.
    pub const NUMA_EVICTABLE: Self = Self {
        blocked_by: Self::EVICTABLE.blocked_by,
        requires: PageStatus::UNPIN.plane_bits(),
    };

    /// Frames with any of `bits` set.
    const fn blocked_by(bits: PageStatus) -> Self {
        Self {
            blocked_by: bits.plane_bits(),
            requires: 0,
        }
    }

    /// Same search with BLACKLIST no longer blocking.
    #[must_use]
    pub const fn ignoring_blacklist(self) -> Self {
        Self {
            blocked_by: self.blocked_by & !PageStatus::BLACKLIST.plane_bits(),
            requires: self.requires,
        }
    }

    /// Frames with any bit of `bits` set count as occupied.
    pub const fn any_of(bits: PageStatus) -> Self {
        Self::blocked_by(bits)
    }
}

/// Per-frame status bitmap of one region.
pub struct RegionMap {
    base: DeviceAddress,
    frames: u64,
    planes: [Vec<u64>; PLANE_COUNT],
    free_frames: u64,
    free_large_pages: u64,
    evicting_frames: u64,
}

impl RegionMap {
    /// A map of `frames` frames at `base`, all FREE.
    #[must_use]
    pub fn new(base: DeviceAddress, frames: u64) -> Self {
        let words = usize::try_from(frames.div_ceil(WORD_BITS)).unwrap_or(usize::MAX);
        Self {
            base,
            frames,
            planes: array::from_fn(|_| vec![0; words]),
            free_frames: frames,
            free_large_pages: frames / FRAMES_PER_LARGE_PAGE,
            evicting_frames: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> DeviceAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn num_frames(&self) -> u64 {
        self.frames
    }

    /// Size of the region in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        frames_to_bytes(self.frames)
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.free_frames
    }

    #[inline]
    #[must_use]
    pub const fn free_large_pages(&self) -> u64 {
        self.free_large_pages
    }

    #[inline]
    #[must_use]
    pub const fn large_pages(&self) -> u64 {
        self.frames / FRAMES_PER_LARGE_PAGE
    }

    /// Frames currently handed to an eviction callback.
    #[inline]
    #[must_use]
    pub const fn evicting_frame_count(&self) -> u64 {
        self.evicting_frames
    }

    #[inline]
    pub const fn set_evicting_frame_count(&mut self, frames: u64) {
        self.evicting_frames = frames;
    }

    /// Address of `frame`.
    #[inline]
    #[must_use]
    pub const fn address_of(&self, frame: u64) -> DeviceAddress {
        self.base.frame(frame)
    }

    /// Frame holding `addr`. `addr` must lie in the region.
    #[inline]
    #[must_use]
    pub const fn frame_of(&self, addr: DeviceAddress) -> u64 {
        addr.frame_offset_from(self.base)
    }

    /// Status of `frame`; with `include_attribs == false` only the state bits.
    #[must_use]
    pub fn read(&self, frame: u64, include_attribs: bool) -> PageStatus {
        debug_assert!(frame < self.frames);
        let (word, bit) = Self::locate(frame);
        let planes = if include_attribs { PLANE_COUNT } else { 2 };
        let bits = (0..planes).fold(0u32, |acc, plane| {
            acc | (u32::from((self.planes[plane][word] >> bit) & 1 == 1) << plane)
        });
        PageStatus::from_bits(bits)
    }

    /// Writes `new` under `mask` to a single frame.
    #[inline]
    pub fn change_state_attrib(&mut self, frame: u64, new: PageStatus, mask: PageStatus) {
        self.change_block_state_attrib(frame, 1, new, mask);
    }

    /// Writes `new` under `mask` to the `frames_per_page` frames of one page.
    #[inline]
    pub fn change_page_state_attrib(
        &mut self,
        frame: u64,
        frames_per_page: u64,
        new: PageStatus,
        mask: PageStatus,
    ) {
        self.change_block_state_attrib(frame, frames_per_page, new, mask);
    }

    /// Writes `new` under `mask` to frames `[frame, frame + len)` and updates
    /// the free counters.
    pub fn change_block_state_attrib(
        &mut self,
        frame: u64,
        len: u64,
        new: PageStatus,
        mask: PageStatus,
    ) {
        if len == 0 {
            return;
        }
        debug_assert!(frame + len <= self.frames, "block outside the region");

        let mask = mask.plane_bits();
        let new = new.plane_bits();
        let last = frame + len - 1;
        let (first_word, first_bit) = Self::locate(frame);
        let (last_word, last_bit) = Self::locate(last);

        for word in first_word..=last_word {
            let lo = if word == first_word { first_bit } else { 0 };
            let hi = if word == last_word { last_bit } else { WORD_BITS - 1 };
            let bits = (u64::MAX >> (WORD_BITS - 1 - hi)) & (u64::MAX << lo);

            let before = self.free_word(word);
            for plane in 0..PLANE_COUNT {
                if mask & (1 << plane) == 0 {
                    continue;
                }
                if new & (1 << plane) == 0 {
                    self.planes[plane][word] &= !bits;
                } else {
                    self.planes[plane][word] |= bits;
                }
            }
            let after = self.free_word(word);
            self.account(word, before, after);
        }
    }

    /// Counter update for one word from its free bits before and after a write.
    fn account(&mut self, word: usize, before: u64, after: u64) {
        let changed = before ^ after;
        if changed == 0 {
            return;
        }
        let gained = u64::from((changed & after).count_ones());
        let lost = u64::from((changed & before).count_ones());
        self.free_frames = self.free_frames + gained - lost;

        let large_before = self.large_free_in(word, before);
        let large_after = self.large_free_in(word, after);
        self.free_large_pages = self.free_large_pages + large_after - large_before;
    }

    /// Number of fully free 32-frame chunks in `free_bits` of `word`.
    fn large_free_in(&self, word: usize, free_bits: u64) -> u64 {
        let total = self.large_pages();
        (0..2u64)
            .filter(|half| {
                let page = word as u64 * 2 + half;
                let chunk = (free_bits >> (half * FRAMES_PER_LARGE_PAGE)) & HALF_WORD;
                page < total && chunk == HALF_WORD
            })
            .count() as u64
    }

    /// Bits of `word` for frames that exist in the region.
    #[inline]
    fn valid_bits(&self, word: usize) -> u64 {
        let tail = self.frames % WORD_BITS;
        if word as u64 == self.frames / WORD_BITS && tail != 0 {
            (1 << tail) - 1
        } else if (word as u64) < self.frames.div_ceil(WORD_BITS) {
            u64::MAX
        } else {
            0
        }
    }

    /// Frames of `word` whose state is FREE.
    #[inline]
    fn free_word(&self, word: usize) -> u64 {
        !(self.planes[0][word] | self.planes[1][word]) & self.valid_bits(word)
    }

    #[inline]
    const fn locate(frame: u64) -> (usize, u64) {
        ((frame / WORD_BITS) as usize, frame % WORD_BITS)
    }

    /// Occupied frames of `word` under `occ`; frames past the end count as occupied.
    #[inline]
    fn occupied_word(&self, word: usize, occ: Occupancy) -> u64 {
        let mut bits = !self.valid_bits(word);
        for plane in 0..PLANE_COUNT {
            let bit = 1 << plane;
            if occ.blocked_by & bit != 0 {
                bits |= self.planes[plane][word];
            }
            if occ.requires & bit != 0 {
                bits |= !self.planes[plane][word];
            }
        }
        bits
    }

    /// First frame in `[from, to)` whose occupancy equals `occupied`.
    pub(crate) fn find_first(
        &self,
        occ: Occupancy,
        from: u64,
        to: u64,
        occupied: bool,
    ) -> Option<u64> {
        let to = to.min(self.frames);
        if from >= to {
            return None;
        }
        let (first_word, first_bit) = Self::locate(from);
        let (last_word, last_bit) = Self::locate(to - 1);
        for word in first_word..=last_word {
            let mut bits = self.occupied_word(word, occ);
            if !occupied {
                bits = !bits;
            }
            if word == first_word {
                bits &= u64::MAX << first_bit;
            }
            if word == last_word {
                bits &= u64::MAX >> (WORD_BITS - 1 - last_bit);
            }
            if bits != 0 {
                return Some(word as u64 * WORD_BITS + u64::from(bits.trailing_zeros()));
            }
        }
        None
    }

    /// Last frame in `[from, to)` whose occupancy equals `occupied`.
    pub(crate) fn find_last(
        &self,
        occ: Occupancy,
        from: u64,
        to: u64,
        occupied: bool,
    ) -> Option<u64> {
        let to = to.min(self.frames);
        if from >= to {
            return None;
        }
        let (first_word, first_bit) = Self::locate(from);
        let (last_word, last_bit) = Self::locate(to - 1);
        for word in (first_word..=last_word).rev() {
            let mut bits = self.occupied_word(word, occ);
            if !occupied {
                bits = !bits;
            }
            if word == first_word {
                bits &= u64::MAX << first_bit;
            }
            if word == last_word {
                bits &= u64::MAX >> (WORD_BITS - 1 - last_bit);
            }
            if bits != 0 {
                let top = WORD_BITS - 1 - u64::from(bits.leading_zeros());
                return Some(word as u64 * WORD_BITS + top);
            }
        }
        None
    }

    /// `true` if no frame of `[frame, frame + len)` is occupied under `occ`.
    #[inline]
    pub(crate) fn is_clear(&self, occ: Occupancy, frame: u64, len: u64) -> bool {
        frame + len <= self.frames && self.find_first(occ, frame, frame + len, true).is_none()
    }

    /// `true` if every frame of `[frame, frame + len)` can be allocated now.
    #[must_use]
    pub fn is_range_free(&self, frame: u64, len: u64) -> bool {
        self.is_clear(Occupancy::FREE, frame, len)
    }

    /// Maximal runs of frames whose status has any bit of `bits` set.
    #[must_use]
    pub fn runs(&self, bits: PageStatus) -> Vec<DeviceRange> {
        let occ = Occupancy::any_of(bits);
        let mut runs = Vec::new();
        let mut cursor = 0;
        while let Some(start) = self.find_first(occ, cursor, self.frames, true) {
            let end = self
                .find_first(occ, start, self.frames, false)
                .unwrap_or(self.frames);
            runs.push(DeviceRange::new(self.address_of(start), frames_to_bytes(end - start)));
            cursor = end;
        }
        runs
    }

    /// Longest run of allocatable frames as `(first frame, length)`.
    #[must_use]
    pub fn largest_free_run(&self) -> Option<(u64, u64)> {
        let mut best: Option<(u64, u64)> = None;
        let mut cursor = 0;
        while let Some(start) = self.find_first(Occupancy::FREE, cursor, self.frames, false) {
            let end = self
                .find_first(Occupancy::FREE, start, self.frames, true)
                .unwrap_or(self.frames);
            if best.is_none_or(|(_, len)| end - start > len) {
                best = Some((start, end - start));
            }
            cursor = end;
        }
        best
    }

    /// Size in bytes of the longest allocatable run.
    #[must_use]
    pub fn largest_free(&self) -> u64 {
        self.largest_free_run().map_or(0, |(_, len)| frames_to_bytes(len))
    }

    /// Recomputes `(free frames, free large pages)` from the state planes.
    #[must_use]
    pub fn recount(&self) -> (u64, u64) {
        (0..self.planes[0].len()).fold((0, 0), |(frames, large), word| {
            let free = self.free_word(word);
            (
                frames + u64::from(free.count_ones()),
                large + self.large_free_in(word, free),
            )
        })
    }

    /// `true` if the cached counters agree with [`RegionMap::recount`].
    #[must_use]
    pub fn counters_consistent(&self) -> bool {
        self.recount() == (self.free_frames, self.free_large_pages)
    }
}
