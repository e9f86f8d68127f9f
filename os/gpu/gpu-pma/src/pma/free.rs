use super::{Pma, PmaState, ScrubberSlot};
use crate::journal::FrameJournal;
use crate::{FrameState, FreeFlags, PageStatus, PmaError};
use alloc::vec::Vec;
use gpu_memory_addresses::{DeviceAddress, DeviceRange, GRANULE, PageSize, is_granule_aligned};
use log::{debug, warn};

impl Pma {
    /// Frees the `size`-byte blocks at `pages`.
    ///
    /// `size` is a page size, or any granule multiple when a single block (a
    /// whole contiguous allocation) is freed. EVICTING and BLACKLIST survive
    /// the free. Under scrub-on-free the frames stay SCRUBBING until the
    /// scrubber reports them done.
    ///
    /// # Errors
    /// - [`PmaError::InvalidArgument`] if a block is not inside one region.
    /// - [`PmaError::ScrubberFailed`] if the scrubber rejected the pages. The
    ///   pages are freed anyway, unscrubbed.
    pub fn free_pages(
        &self,
        pages: &[DeviceAddress],
        size: u64,
        flags: FreeFlags,
    ) -> Result<(), PmaError> {
        if pages.is_empty() {
            return Ok(());
        }
        let frames_per_block = block_frames(pages.len(), size)?;

        if self.flags.numa() {
            return self.numa_free(pages, frames_per_block);
        }

        let want_scrub = self.flags.scrub_on_free() && !flags.skip_scrub();
        let slot_guard = want_scrub.then(|| self.scrubber.read());
        let mut slot: Option<&ScrubberSlot> = slot_guard.as_deref();
        if let Some(s) = slot {
            if !s.is_valid() {
                debug!("freeing without scrub: no valid scrubber");
                slot = None;
            } else if self.collect_scrubbed(s).is_err() {
                slot = None;
            }
        }

        let status = if slot.is_some() {
            PageStatus::SCRUBBING
        } else {
            PageStatus::FREE
        };
        let mask = PageStatus::MAP_MASK.difference(PageStatus::EVICTING | PageStatus::BLACKLIST);

        {
            let mut state = self.state.lock();
            let blocks = locate_all(&state, pages, frames_per_block)?;
            for (&page, &(id, frame)) in pages.iter().zip(&blocks) {
                let block = DeviceRange::new(page, frames_per_block * GRANULE);
                for chunk in state.blacklist.restore(block) {
                    let chunk_frame = state.regions[id].map.frame_of(chunk);
                    state.regions[id].map.change_state_attrib(
                        chunk_frame,
                        PageStatus::BLACKLIST,
                        PageStatus::BLACKLIST,
                    );
                }
                state.regions[id]
                    .map
                    .change_page_state_attrib(frame, frames_per_block, status, mask);
            }
            state.notify();
        }
        debug!("freed {} blocks of {size:#x} bytes", pages.len());

        let Some(slot) = slot else {
            return Ok(());
        };
        let Some(scrubber) = slot.active() else {
            return Ok(());
        };
        match scrubber.submit_pages(size, pages) {
            Ok(done) => {
                if !done.is_empty() {
                    self.state.lock().clear_scrubbing(&done);
                }
                Ok(())
            }
            Err(err) => {
                warn!("scrub submission failed: {err}");
                Self::scrub_fatal(slot);
                let ranges: Vec<DeviceRange> = pages
                    .iter()
                    .map(|&page| DeviceRange::new(page, frames_per_block * GRANULE))
                    .collect();
                self.state.lock().clear_scrubbing(&ranges);
                Err(PmaError::ScrubberFailed)
            }
        }
    }

    /// Turns UNPIN pages into PIN pages.
    ///
    /// # Errors
    /// - [`PmaError::InUse`] if a page is being evicted.
    /// - [`PmaError::InvalidState`] if a page is not allocated unpinned.
    /// - [`PmaError::InvalidArgument`] if a page is not inside one region.
    ///
    /// On error no page changes.
    pub fn pin_pages(&self, pages: &[DeviceAddress], page_size: PageSize) -> Result<(), PmaError> {
        if pages.is_empty() {
            return Err(PmaError::InvalidArgument("no pages to pin"));
        }
        let frames_per_page = page_size.frames();

        let mut state = self.state.lock();
        let blocks = locate_all(&state, pages, frames_per_page)?;
        let mut journal = FrameJournal::new();
        for &(id, frame) in &blocks {
            if let Err(err) = check_unpinned(&state, id, frame, frames_per_page) {
                if err != PmaError::InUse {
                    warn!("pin of frame {frame} in region {id} failed: {err}");
                }
                journal.rollback(&mut state.regions);
                return Err(err);
            }
            journal.change(
                &mut state.regions,
                id,
                frame,
                frames_per_page,
                PageStatus::PIN,
                PageStatus::STATE_MASK,
            );
        }
        Ok(())
    }
}

/// Frames per freed block.
fn block_frames(count: usize, size: u64) -> Result<u64, PmaError> {
    if count == 1 && size != 0 && is_granule_aligned(size) {
        return Ok(size / GRANULE);
    }
    Ok(PageSize::try_from(size)?.frames())
}

/// Region and first frame of every block; all or nothing.
pub(super) fn locate_all(
    state: &PmaState,
    pages: &[DeviceAddress],
    frames: u64,
) -> Result<Vec<(usize, u64)>, PmaError> {
    pages
        .iter()
        .map(|&page| {
            if !page.is_aligned(GRANULE) {
                return Err(PmaError::InvalidArgument("page address is not frame aligned"));
            }
            state
                .locate_block(page, frames)
                .ok_or(PmaError::InvalidArgument("page is outside every region"))
        })
        .collect()
}

fn check_unpinned(state: &PmaState, region: usize, frame: u64, len: u64) -> Result<(), PmaError> {
    let map = &state.regions[region].map;
    for f in frame..frame + len {
        let status = map.read(f, true);
        if status.evicting() {
            return Err(PmaError::InUse);
        }
        if status.state() != FrameState::Unpin {
            return Err(PmaError::InvalidState("page is not allocated unpinned"));
        }
    }
    Ok(())
}
