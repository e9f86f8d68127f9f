//! Free-run search over a [`RegionMap`].
//!
//! A [`Walk`] enumerates candidate runs of `len` frames in one direction,
//! honouring alignment (on absolute addresses) and the optional stride. Each
//! candidate is checked with one occupancy search; on a hit the walk jumps past
//! the blocking frame instead of stepping one alignment unit at a time.

use super::{Occupancy, RegionMap};
use crate::options::Stride;
use alloc::vec::Vec;
use core::ops::Range;
use gpu_memory_addresses::{DeviceAddress, GRANULE, GRANULE_SHIFT, PageSize};

/// Parameters of one scan over one region.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Frames of the region the result must lie in.
    pub frames: Range<u64>,
    pub num_pages: usize,
    pub page_size: PageSize,
    /// Effective alignment in bytes, at least the page size.
    pub alignment: u64,
    pub stride: Option<Stride>,
    pub reverse: bool,
    /// Report `NoMemory` instead of evictable candidates.
    pub skip_evict: bool,
    /// BLACKLIST frames count as free for this scan.
    pub ignore_blacklist: bool,
}

/// Result of a scan; the found page addresses are appended to the caller's
/// buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Every requested page is free.
    Free,
    /// The first `free` appended pages are free, the rest must be evicted
    /// first. A contiguous run always reports `free: 0`.
    Evict { free: usize },
    /// Not enough memory even with eviction; `free` free pages were appended.
    NoMemory { free: usize },
}

struct Walk<'a> {
    map: &'a RegionMap,
    occ: Occupancy,
    lo: u64,
    hi: u64,
    len: u64,
    /// Alignment in frames.
    align: u64,
    /// Absolute frame number of frame 0.
    base: u64,
    stride: Option<Stride>,
    reverse: bool,
}

impl<'a> Walk<'a> {
    fn new(map: &'a RegionMap, occ: Occupancy, req: &ScanRequest, len: u64) -> Self {
        Self {
            map,
            occ,
            lo: req.frames.start,
            hi: req.frames.end.min(map.num_frames()),
            len,
            align: (req.alignment >> GRANULE_SHIFT).max(1),
            base: map.base().as_u64() >> GRANULE_SHIFT,
            stride: req.stride,
            reverse: req.reverse,
        }
    }

    fn align_up(&self, frame: u64) -> Option<u64> {
        let abs = (self.base + frame).div_ceil(self.align).checked_mul(self.align)?;
        abs.checked_sub(self.base)
    }

    fn align_down(&self, frame: u64) -> Option<u64> {
        ((self.base + frame) / self.align * self.align).checked_sub(self.base)
    }

    fn stride_step(&self, stride: Stride, frame: u64) -> Option<u64> {
        let addr = self.map.address_of(frame).as_u64();
        let run = self.len * GRANULE;
        let moved = if self.reverse {
            stride.reverse(addr, run)?
        } else {
            stride.forward(addr, run)?
        };
        moved
            .checked_sub(self.map.base().as_u64())
            .map(|bytes| bytes >> GRANULE_SHIFT)
    }

    /// First acceptable run at or after (before, when reversed) `frame`.
    fn find(&self, mut frame: u64) -> Option<u64> {
        if self.reverse {
            self.find_reverse(frame)
        } else {
            loop {
                frame = self.align_up(frame)?;
                if let Some(stride) = self.stride {
                    let moved = self.stride_step(stride, frame)?;
                    if moved != frame {
                        frame = moved;
                        continue;
                    }
                }
                if frame.checked_add(self.len)? > self.hi {
                    return None;
                }
                match self.map.find_last(self.occ, frame, frame + self.len, true) {
                    None => return Some(frame),
                    Some(blocker) => {
                        frame = self.map.find_first(self.occ, blocker + 1, self.hi, false)?;
                    }
                }
            }
        }
    }

    fn find_reverse(&self, mut frame: u64) -> Option<u64> {
        loop {
            frame = self.align_down(frame)?;
            if frame < self.lo {
                return None;
            }
            if let Some(stride) = self.stride {
                let moved = self.stride_step(stride, frame)?;
                if moved != frame {
                    frame = moved;
                    continue;
                }
            }
            match self.map.find_first(self.occ, frame, frame + self.len, true) {
                None => return Some(frame),
                Some(blocker) => {
                    let top = self.map.find_last(self.occ, self.lo, blocker, false)?;
                    frame = (top + 1).checked_sub(self.len)?;
                }
            }
        }
    }

    fn first(&self) -> Option<u64> {
        if self.hi < self.lo.checked_add(self.len)? {
            return None;
        }
        if self.reverse {
            self.find(self.hi - self.len)
        } else {
            self.find(self.lo)
        }
    }

    fn after(&self, run: u64) -> Option<u64> {
        if self.reverse {
            self.find(run.checked_sub(self.len)?)
        } else {
            self.find(run + self.len)
        }
    }

    fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        core::iter::successors(self.first(), move |&run| self.after(run))
    }
}

impl ScanRequest {
    fn free_occupancy(&self) -> Occupancy {
        if self.ignore_blacklist {
            Occupancy::FREE.ignoring_blacklist()
        } else {
            Occupancy::FREE
        }
    }

    fn evict_occupancy(&self) -> Occupancy {
        if self.ignore_blacklist {
            Occupancy::EVICTABLE.ignoring_blacklist()
        } else {
            Occupancy::EVICTABLE
        }
    }

    fn run_frames(&self) -> Option<u64> {
        u64::try_from(self.num_pages)
            .ok()?
            .checked_mul(self.page_size.frames())
    }
}

impl RegionMap {
    /// Finds one run of `num_pages` pages; appends its first address.
    pub fn scan_contiguous(&self, req: &ScanRequest, out: &mut Vec<DeviceAddress>) -> ScanOutcome {
        let Some(len) = req.run_frames().filter(|&len| len > 0) else {
            return ScanOutcome::NoMemory { free: 0 };
        };

        if let Some(frame) = Walk::new(self, req.free_occupancy(), req, len).first() {
            out.push(self.address_of(frame));
            return ScanOutcome::Free;
        }
        if req.skip_evict {
            return ScanOutcome::NoMemory { free: 0 };
        }
        match Walk::new(self, req.evict_occupancy(), req, len).first() {
            Some(frame) => {
                out.push(self.address_of(frame));
                ScanOutcome::Evict { free: 0 }
            }
            None => ScanOutcome::NoMemory { free: 0 },
        }
    }

    /// Finds up to `num_pages` independent pages.
    ///
    /// Free pages are appended first; evictable pages follow in reverse scan
    /// order, so the two kinds never interleave.
    pub fn scan_discontiguous(
        &self,
        req: &ScanRequest,
        out: &mut Vec<DeviceAddress>,
    ) -> ScanOutcome {
        let len = req.page_size.frames();
        let mark = out.len();

        let free_walk = Walk::new(self, req.free_occupancy(), req, len);
        out.extend(
            free_walk
                .iter()
                .take(req.num_pages)
                .map(|frame| self.address_of(frame)),
        );
        let free = out.len() - mark;
        if free == req.num_pages {
            return ScanOutcome::Free;
        }
        if req.skip_evict {
            return ScanOutcome::NoMemory { free };
        }

        // Pass 1 collected every fully free page of the window; skip those.
        let free_occ = req.free_occupancy();
        let candidates: Vec<u64> = Walk::new(self, req.evict_occupancy(), req, len)
            .iter()
            .filter(|&frame| !self.is_clear(free_occ, frame, len))
            .take(req.num_pages - free)
            .collect();
        if free + candidates.len() < req.num_pages {
            return ScanOutcome::NoMemory { free };
        }

        out.extend(candidates.iter().rev().map(|&frame| self.address_of(frame)));
        ScanOutcome::Evict { free }
    }

    /// First run of `num_pages` pages whose frames are all UNPIN and idle.
    #[must_use]
    pub fn scan_contiguous_numa_eviction(&self, req: &ScanRequest) -> Option<DeviceAddress> {
        let len = req.run_frames().filter(|&len| len > 0)?;
        let walk = Walk::new(self, Occupancy::NUMA_EVICTABLE, req, len);
        walk.first().map(|frame| self.address_of(frame))
    }
}
