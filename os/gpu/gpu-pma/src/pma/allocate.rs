use super::{InitScrubState, Pma, PmaState, ScrubberSlot};
use crate::regmap::{ScanOutcome, ScanRequest};
use crate::selector::select_regions;
use crate::{
    AllocationOptions, AllocationResultFlags, InitFlags, PageStatus, PmaError, Stride, tracing,
};
use alloc::vec::Vec;
use gpu_memory_addresses::{DeviceAddress, DeviceRange, FRAMES_PER_LARGE_PAGE, GRANULE, PageSize};
use gpu_sync::{Backoff, SpinLockGuard};
use log::{debug, trace, warn};

/// A validated allocation request.
#[derive(Debug, Clone)]
pub(super) struct Request {
    pub count: usize,
    pub page_size: PageSize,
    pub contiguous: bool,
    /// Effective alignment in bytes.
    pub alignment: u64,
    pub window: Option<DeviceRange>,
    pub stride: Option<Stride>,
    pub reverse: bool,
    pub blacklist_off: bool,
    pub allow_partial: bool,
    pub protected: bool,
    /// Status written to granted frames.
    pub commit: PageStatus,
}

impl Request {
    pub fn validate(
        count: usize,
        page_size: PageSize,
        options: &AllocationOptions,
        init: InitFlags,
        scrub: bool,
    ) -> Result<Self, PmaError> {
        let flags = options.flags;
        if count == 0 {
            return Err(PmaError::InvalidArgument("page count is zero"));
        }
        if flags.turn_blacklist_off() && !flags.contiguous() {
            return Err(PmaError::InvalidArgument(
                "blacklist can only be turned off for contiguous allocations",
            ));
        }
        if flags.turn_blacklist_off() && scrub {
            return Err(PmaError::InvalidArgument(
                "blacklist cannot be turned off under scrub-on-free",
            ));
        }

        let window = match options.range {
            None => None,
            Some((begin, end)) => {
                let end_exclusive = end.as_u64().checked_add(1);
                if begin > end
                    || !begin.is_aligned(GRANULE)
                    || !end_exclusive.is_some_and(|e| DeviceAddress::new(e).is_aligned(GRANULE))
                {
                    return Err(PmaError::InvalidArgument("address range is empty or unaligned"));
                }
                Some(DeviceRange::from_inclusive(begin, end))
            }
        };

        let alignment = match options.alignment {
            None => page_size.bytes(),
            Some(align) if align.is_power_of_two() && align >= GRANULE => {
                align.max(page_size.bytes())
            }
            Some(_) => {
                return Err(PmaError::InvalidArgument(
                    "alignment must be a power of two of at least 64 KiB",
                ));
            }
        };
        if !flags.contiguous() && alignment > page_size.bytes() {
            return Err(PmaError::InvalidArgument(
                "discontiguous allocations cannot be aligned beyond the page size",
            ));
        }

        let run_bytes = u64::try_from(count)
            .ok()
            .and_then(|count| count.checked_mul(page_size.bytes()))
            .ok_or(PmaError::InvalidArgument("allocation size overflows"))?;

        if let Some(stride) = options.stride {
            let run = if flags.contiguous() { run_bytes } else { page_size.bytes() };
            if !stride.size.is_power_of_two() || stride.size < alignment || stride.size < run {
                return Err(PmaError::InvalidArgument(
                    "stride must be a power of two covering the alignment and the run",
                ));
            }
        }

        let state = if flags.pinned() {
            PageStatus::PIN
        } else {
            PageStatus::UNPIN
        };
        let persistent = flags.persistent() || init.force_persistence();
        let commit = if persistent {
            state | PageStatus::PERSISTENT
        } else {
            state
        };

        Ok(Self {
            count,
            page_size,
            contiguous: flags.contiguous(),
            alignment,
            window,
            stride: options.stride,
            reverse: flags.reverse(),
            blacklist_off: flags.turn_blacklist_off(),
            allow_partial: flags.allow_partial() && !flags.contiguous(),
            protected: flags.protected(),
            commit,
        })
    }

    pub const fn frames_per_page(&self) -> u64 {
        self.page_size.frames()
    }

    /// Frames of one contiguous run, or of one page when discontiguous.
    pub fn run_frames(&self) -> u64 {
        if self.contiguous {
            self.count as u64 * self.frames_per_page()
        } else {
            self.frames_per_page()
        }
    }

    /// Every page address of a contiguous run starting at `base`.
    pub fn expand(&self, base: DeviceAddress) -> Vec<DeviceAddress> {
        (0..self.count as u64)
            .map(|i| base + i * self.page_size.bytes())
            .collect()
    }
}

impl PmaState {
    /// `true` if the free frames of the requested protection class cannot
    /// possibly cover the request.
    fn predicts_oom(&self, req: &Request) -> bool {
        let (frames, large) = self
            .regions
            .iter()
            .filter(|r| r.desc.protected == req.protected)
            .fold((0u64, 0u64), |(frames, large), r| {
                (frames + r.map.free_frames(), large + r.map.free_large_pages())
            });
        let count = req.count as u64;
        if !req.contiguous && req.page_size >= PageSize::Size2M {
            large < count.saturating_mul(req.frames_per_page() / FRAMES_PER_LARGE_PAGE)
        } else {
            frames < count.saturating_mul(req.frames_per_page())
        }
    }
}

impl Pma {
    /// Allocates `count` pages of `page_size`.
    ///
    /// Contiguous requests return the address of every page of the run, in
    /// order. On success `options.num_pages_allocated` and
    /// `options.result_flags` describe the grant.
    ///
    /// # Errors
    /// - [`PmaError::InvalidArgument`] for malformed requests.
    /// - [`PmaError::NoMemory`] when neither free nor evictable memory suffices.
    /// - [`PmaError::InvalidState`] under scrub-on-free without a valid scrubber.
    /// - [`PmaError::ScrubberFailed`] if the scrubber failed during the call.
    pub fn allocate_pages(
        &self,
        count: usize,
        page_size: PageSize,
        options: &mut AllocationOptions,
    ) -> Result<Vec<DeviceAddress>, PmaError> {
        options.result_flags = AllocationResultFlags::new();
        options.num_pages_allocated = 0;

        if self.flags.numa() {
            return self.numa_allocate(count, page_size, options);
        }

        let scrub = self.flags.scrub_on_free() && !options.flags.no_zero();
        let req = Request::validate(count, page_size, options, self.flags, scrub)?;

        let _call = scrub.then(|| self.call_lock.enter());
        let slot_guard = scrub.then(|| self.scrubber.read());
        let slot = slot_guard.as_deref();
        if slot.is_some_and(|slot| !slot.is_valid()) {
            warn!("allocation refused: scrub-on-free is enabled but the scrubber is not valid");
            return Err(PmaError::InvalidState("scrubber is not valid"));
        }

        let mut try_evict = !options.flags.dont_evict();
        let mut try_scrub_wait = true;
        let mut pages = Vec::new();

        let (mut state, partial) = loop {
            if let Some(slot) = slot {
                self.collect_scrubbed(slot)?;
            }

            let mut state = self.state.lock();
            pages.clear();

            if !try_evict && state.predicts_oom(&req) {
                debug!("allocation of {count} x {page_size} pages: out of memory (predicted)");
                return Err(PmaError::NoMemory);
            }

            let order = select_regions(state.regions.iter().map(|r| &r.desc), options);
            self.try_regions(&mut state, &order, &req, try_evict, slot, &mut pages)?;

            if pages.len() == req.count {
                break (state, false);
            }

            if self.init_scrub_state() == InitScrubState::InProgress {
                drop(state);
                debug!("allocation waits for the initial scrub to finish");
                let mut backoff = Backoff::new();
                while self.init_scrub_state() != InitScrubState::Done {
                    backoff.snooze();
                }
                continue;
            }

            if req.allow_partial && !pages.is_empty() && (slot.is_none() || !try_scrub_wait) {
                break (state, true);
            }

            if let Some(slot) = slot
                && try_scrub_wait
            {
                drop(state);
                self.wait_for_scrub(slot, req.count - pages.len(), page_size)?;
                try_scrub_wait = false;
                try_evict = false;
                continue;
            }

            debug!("allocation of {count} x {page_size} pages: out of memory");
            return Err(PmaError::NoMemory);
        };

        // An eviction callback may have freed pages while the scrubber failed.
        if slot.is_some_and(|slot| !slot.is_valid()) {
            drop(state);
            warn!("allocation failed: scrubber became invalid during the call");
            return Err(PmaError::ScrubberFailed);
        }

        let granted = Self::commit(&mut state, &req, &pages);
        state.notify();
        drop(state);

        options.num_pages_allocated = granted.len() as u64;
        options.result_flags = AllocationResultFlags::new()
            .with_is_zero(slot.is_some())
            .with_partial(partial);
        debug!(
            "allocated {} of {count} x {page_size} pages{} starting at {:?}",
            granted.len(),
            if req.contiguous { " (contiguous)" } else { "" },
            granted.first()
        );
        Ok(granted)
    }

    /// Scans the candidate regions in order, evicting where allowed, until
    /// `pages` holds the whole request.
    ///
    /// Only a scrubber failure is an error; anything else leaves `pages`
    /// short.
    fn try_regions(
        &self,
        state: &mut SpinLockGuard<'_, PmaState>,
        order: &[usize],
        req: &Request,
        try_evict: bool,
        slot: Option<&ScrubberSlot>,
        pages: &mut Vec<DeviceAddress>,
    ) -> Result<(), PmaError> {
        for &id in order {
            let region = &state.regions[id];
            let Some(frames) = region.frame_window(req.window) else {
                continue;
            };
            let scan = ScanRequest {
                frames,
                num_pages: if req.contiguous {
                    req.count
                } else {
                    req.count - pages.len()
                },
                page_size: req.page_size,
                alignment: req.alignment,
                stride: req.stride,
                reverse: req.reverse,
                skip_evict: !try_evict,
                ignore_blacklist: req.blacklist_off,
            };

            let mark = pages.len();
            let outcome = if req.contiguous {
                region.map.scan_contiguous(&scan, pages)
            } else {
                region.map.scan_discontiguous(&scan, pages)
            };
            trace!("region {id}: scan {outcome:?}, {} pages", pages.len() - mark);

            match outcome {
                ScanOutcome::Free => return Ok(()),
                ScanOutcome::NoMemory { .. } => {}
                ScanOutcome::Evict { free } => {
                    tracing::log_region(id, &state.regions[id]);
                    let result = if req.contiguous {
                        self.evict_contiguous(state, id, pages[mark], req, slot)
                    } else {
                        self.evict_pages(state, id, pages, mark + free, req, slot)
                    };
                    match result {
                        Ok(()) => return Ok(()),
                        Err(PmaError::ScrubberFailed) => return Err(PmaError::ScrubberFailed),
                        Err(err) => {
                            debug!("region {id}: eviction did not free the target: {err}");
                            pages.truncate(mark + free);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Blocks until the scrubber has finished `count` pages, then clears the
    /// completed ranges.
    fn wait_for_scrub(
        &self,
        slot: &ScrubberSlot,
        count: usize,
        page_size: PageSize,
    ) -> Result<(), PmaError> {
        let Some(scrubber) = slot.active() else {
            return Err(PmaError::ScrubberFailed);
        };
        debug!("waiting for the scrubber to finish {count} x {page_size} pages");
        match scrubber.check_and_wait_for_size(count, page_size) {
            Ok(done) => {
                if !done.is_empty() {
                    self.state.lock().clear_scrubbing(&done);
                }
                Ok(())
            }
            Err(err) => {
                warn!("scrub wait failed: {err}");
                Self::scrub_fatal(slot);
                Err(PmaError::ScrubberFailed)
            }
        }
    }

    /// Writes the final status to every granted frame and returns the page
    /// addresses handed to the caller.
    fn commit(state: &mut PmaState, req: &Request, pages: &[DeviceAddress]) -> Vec<DeviceAddress> {
        if req.contiguous {
            let base = pages[0];
            let run = DeviceRange::new(base, req.run_frames() * GRANULE);
            if let Some((id, frame)) = state.locate(base) {
                if req.blacklist_off {
                    let lifted = state.blacklist.lift(run);
                    if !lifted.is_empty() {
                        debug!("blacklist-off grant includes {} blacklisted frames", lifted.len());
                    }
                }
                state.regions[id].map.change_block_state_attrib(
                    frame,
                    req.run_frames(),
                    req.commit,
                    PageStatus::MAP_MASK,
                );
            }
            req.expand(base)
        } else {
            for &page in pages {
                if let Some((id, frame)) = state.locate(page) {
                    state.regions[id].map.change_page_state_attrib(
                        frame,
                        req.frames_per_page(),
                        req.commit,
                        PageStatus::MAP_MASK,
                    );
                }
            }
            pages.to_vec()
        }
    }
}
