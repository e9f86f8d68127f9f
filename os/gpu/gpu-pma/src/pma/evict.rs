use super::allocate::Request;
use super::{Pma, PmaState, ScrubberSlot};
use crate::journal::FrameJournal;
use crate::regmap::Occupancy;
use crate::{PageStatus, PmaError};
use alloc::vec::Vec;
use gpu_memory_addresses::{DeviceAddress, frames_to_bytes};
use gpu_sync::SpinLockGuard;
use log::{debug, warn};

impl Pma {
    /// Evicts the contiguous run at `begin` found by a scan.
    ///
    /// The whole run is EVICTING while the client runs. Succeeds only if
    /// every frame of the run is free afterwards.
    pub(super) fn evict_contiguous(
        &self,
        state: &mut SpinLockGuard<'_, PmaState>,
        region: usize,
        begin: DeviceAddress,
        req: &Request,
        slot: Option<&ScrubberSlot>,
    ) -> Result<(), PmaError> {
        let Some(client) = state.evictor.clone() else {
            debug!("no eviction client registered");
            return Err(PmaError::NoMemory);
        };

        let len = req.run_frames();
        let frame = state.regions[region].map.frame_of(begin);
        let end = begin + (frames_to_bytes(len) - 1);
        let protection = state.regions[region].desc.protection();

        Self::mark_evicting(state, region, &[(frame, len)], true);
        debug!("evicting range {begin}..={end}");

        let result = SpinLockGuard::unlocked(state, || {
            client.evict_range(begin, end, protection).map_err(|err| {
                warn!("range eviction {begin}..={end} failed: {err}");
                PmaError::from(err)
            })?;
            Self::wait_scrubbed(slot, frames_to_bytes(len), &[begin])
        });

        Self::mark_evicting(state, region, &[(frame, len)], false);
        result?;

        let map = &mut state.regions[region].map;
        if slot.is_some() {
            map.change_block_state_attrib(frame, len, PageStatus::FREE, PageStatus::SCRUBBING);
        }
        if map.is_clear(occupancy(req), frame, len) {
            Ok(())
        } else {
            debug!("range {begin}..={end} still in use after eviction");
            Err(PmaError::NoMemory)
        }
    }

    /// Evicts `pages[granted..]`, all in `region`, for a discontiguous request.
    ///
    /// `pages[..granted]` are free pages already chosen for this request; they
    /// are pinned for the duration of the callback and put back afterwards.
    /// Any of them that stopped being allocatable meanwhile (blacklisted by
    /// the client, say) is dropped from `pages` and the eviction fails. On
    /// failure `pages` holds only the surviving chosen pages.
    pub(super) fn evict_pages(
        &self,
        state: &mut SpinLockGuard<'_, PmaState>,
        region: usize,
        pages: &mut Vec<DeviceAddress>,
        granted: usize,
        req: &Request,
        slot: Option<&ScrubberSlot>,
    ) -> Result<(), PmaError> {
        let Some(client) = state.evictor.clone() else {
            debug!("no eviction client registered");
            return Err(PmaError::NoMemory);
        };

        let frames_per_page = req.frames_per_page();
        let mut journal = FrameJournal::new();
        for &page in &pages[..granted] {
            if let Some((id, frame)) = state.locate(page) {
                journal.change(
                    &mut state.regions,
                    id,
                    frame,
                    frames_per_page,
                    PageStatus::PIN,
                    PageStatus::STATE_MASK,
                );
            }
        }

        let victims = &pages[granted..];
        let blocks: Vec<(u64, u64)> = victims
            .iter()
            .map(|&page| (state.regions[region].map.frame_of(page), frames_per_page))
            .collect();
        Self::mark_evicting(state, region, &blocks, true);

        let desc = state.regions[region].desc;
        let window = req
            .window
            .and_then(|w| w.intersection(&desc.range()))
            .unwrap_or_else(|| desc.range());
        let (begin, end) = (window.base, window.limit());
        debug!("evicting {} x {} pages in {begin}..={end}", victims.len(), req.page_size);

        let result = SpinLockGuard::unlocked(state, || {
            client
                .evict_pages(req.page_size, victims, begin, end, desc.protection())
                .map_err(|err| {
                    warn!("page eviction in {begin}..={end} failed: {err}");
                    PmaError::from(err)
                })?;
            Self::wait_scrubbed(slot, req.page_size.bytes(), victims)
        });

        Self::mark_evicting(state, region, &blocks, false);
        journal.rollback(&mut state.regions);

        let occ = occupancy(req);
        let chosen = Self::retain_allocatable(state, pages, granted, occ, frames_per_page);
        if let Err(err) = result {
            pages.truncate(chosen);
            return Err(err);
        }
        if chosen < granted {
            debug!("{} chosen pages changed state during eviction", granted - chosen);
            pages.truncate(chosen);
            return Err(PmaError::NoMemory);
        }

        let map = &mut state.regions[region].map;
        if slot.is_some() {
            for &(frame, len) in &blocks {
                map.change_block_state_attrib(frame, len, PageStatus::FREE, PageStatus::SCRUBBING);
            }
        }
        if blocks.iter().all(|&(frame, len)| map.is_clear(occ, frame, len)) {
            Ok(())
        } else {
            debug!("evicted pages still in use after eviction");
            pages.truncate(chosen);
            Err(PmaError::NoMemory)
        }
    }

    /// Drops the pages of `pages[..granted]` that `occ` no longer admits and
    /// returns how many of them are left. Pages past `granted` are kept.
    fn retain_allocatable(
        state: &PmaState,
        pages: &mut Vec<DeviceAddress>,
        granted: usize,
        occ: Occupancy,
        frames_per_page: u64,
    ) -> usize {
        let mut index = 0;
        pages.retain(|&page| {
            let keep = index >= granted
                || state.locate(page).is_some_and(|(id, frame)| {
                    state.regions[id].map.is_clear(occ, frame, frames_per_page)
                });
            index += 1;
            keep
        });
        granted - (index - pages.len())
    }

    /// Sets or clears EVICTING on `blocks` of `region` and keeps the
    /// in-flight eviction counter in step.
    pub(super) fn mark_evicting(
        state: &mut PmaState,
        region: usize,
        blocks: &[(u64, u64)],
        on: bool,
    ) {
        let map = &mut state.regions[region].map;
        let total: u64 = blocks.iter().map(|&(_, len)| len).sum();
        let status = if on {
            PageStatus::EVICTING
        } else {
            PageStatus::FREE
        };
        for &(frame, len) in blocks {
            map.change_block_state_attrib(frame, len, status, PageStatus::EVICTING);
        }
        let count = if on {
            map.evicting_frame_count() + total
        } else {
            map.evicting_frame_count().saturating_sub(total)
        };
        map.set_evicting_frame_count(count);
    }

    /// Waits for the scrubber to finish freshly evicted pages.
    fn wait_scrubbed(
        slot: Option<&ScrubberSlot>,
        page_bytes: u64,
        pages: &[DeviceAddress],
    ) -> Result<(), PmaError> {
        let Some(slot) = slot else {
            return Ok(());
        };
        let Some(scrubber) = slot.active() else {
            return Err(PmaError::ScrubberFailed);
        };
        scrubber.wait_pages(page_bytes, pages).map_err(|err| {
            warn!("waiting for scrubbed pages failed: {err}");
            Self::scrub_fatal(slot);
            PmaError::ScrubberFailed
        })
    }
}

/// Frames of an evicted target must be allocatable again; BLACKLIST is
/// ignored for blacklist-off requests.
fn occupancy(req: &Request) -> Occupancy {
    if req.blacklist_off {
        Occupancy::FREE.ignoring_blacklist()
    } else {
        Occupancy::FREE
    }
}
