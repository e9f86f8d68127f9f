use super::{InitScrubState, Pma, ScrubberSlot};
use crate::blacklist::BlacklistTracker;
use crate::consts::{MAX_BLACKLIST_ENTRIES, MAX_REGION_FRAMES, MAX_REGIONS};
use crate::region::Region;
use crate::{
    EvictionClient, FreeCountObserver, PageStatus, PmaError, RegionDescriptor, Scrubber, tracing,
};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use gpu_memory_addresses::{DeviceAddress, GRANULE};
use gpu_sync::Backoff;
use log::{debug, info, warn};

impl Pma {
    /// Adds region `id` described by `desc`.
    ///
    /// Ids are dense: the next region must use the current region count as its
    /// id. `blacklist` lists frames known to be bad; they are never handed out
    /// unless a blacklist-off allocation asks for them. With `async_scrub` the
    /// whole region stays SCRUBBING until [`Pma::scrub_complete`].
    ///
    /// # Errors
    /// - [`PmaError::InvalidArgument`] for a bad id, misaligned or oversized
    ///   region, overlap with a registered region, or blacklist entries outside
    ///   the region.
    /// - [`PmaError::InvalidState`] for `async_scrub` after the initial scrub
    ///   completed.
    /// - [`PmaError::NoMemory`] if the blacklist is full.
    pub fn register_region(
        &self,
        id: usize,
        async_scrub: bool,
        desc: &RegionDescriptor,
        blacklist: &[DeviceAddress],
    ) -> Result<(), PmaError> {
        validate_descriptor(id, desc)?;
        if blacklist.iter().any(|&addr| !desc.contains(addr)) {
            return Err(PmaError::InvalidArgument("blacklisted frame outside the region"));
        }
        if async_scrub && self.init_scrub_state() == InitScrubState::Done {
            return Err(PmaError::InvalidState("initial scrub already completed"));
        }

        let mut region = Region::new(*desc);
        if async_scrub {
            region.map.change_block_state_attrib(
                0,
                desc.frames(),
                PageStatus::SCRUBBING,
                PageStatus::SCRUBBING,
            );
        }

        let mut frames: Vec<DeviceAddress> = blacklist
            .iter()
            .map(|addr| addr.align_down(GRANULE))
            .collect();
        frames.sort_unstable();
        frames.dedup();

        let mut state = self.state.lock();
        if id != state.regions.len() {
            return Err(PmaError::InvalidArgument("region ids must be registered in order"));
        }
        if state.regions.iter().any(|r| r.desc.range().overlaps(&desc.range())) {
            return Err(PmaError::InvalidArgument("region overlaps a registered region"));
        }
        let new_entries = frames.iter().filter(|&&addr| !state.blacklist.contains(addr)).count();
        if new_entries > state.blacklist.remaining() {
            warn!("region {id}: {new_entries} blacklist entries do not fit");
            return Err(PmaError::NoMemory);
        }

        for &addr in &frames {
            state.blacklist.insert(addr, false)?;
            let frame = region.map.frame_of(addr);
            region
                .map
                .change_state_attrib(frame, PageStatus::BLACKLIST, PageStatus::BLACKLIST);
        }

        if async_scrub {
            let _ = self.init_scrub.compare_exchange(
                InitScrubState::Initialize as u8,
                InitScrubState::InProgress as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }

        state.regions.push(region);
        state.notify();
        info!(
            "registered region {id}: {}..={} perf={} {:?}, {} blacklisted frames{}",
            desc.base,
            desc.limit,
            desc.performance,
            desc.protection(),
            frames.len(),
            if async_scrub { ", scrubbing" } else { "" }
        );
        tracing::log_region(id, &state.regions[id]);
        Ok(())
    }

    /// Installs the eviction client.
    ///
    /// # Errors
    /// [`PmaError::InvalidState`] if a client is already registered.
    pub fn register_eviction_client(
        &self,
        client: Arc<dyn EvictionClient>,
    ) -> Result<(), PmaError> {
        let _registration = self.eviction_registration.enter();
        let mut state = self.state.lock();
        if state.evictor.is_some() {
            return Err(PmaError::InvalidState("an eviction client is already registered"));
        }
        state.evictor = Some(client);
        info!("eviction client registered");
        Ok(())
    }

    /// Removes the eviction client and waits for in-flight evictions to
    /// drain. No new eviction starts once this returns.
    pub fn unregister_eviction_client(&self) {
        let _registration = self.eviction_registration.enter();
        self.state.lock().evictor = None;

        let mut backoff = Backoff::new();
        while self.state.lock().evictions_pending() {
            backoff.snooze();
        }
        info!("eviction client unregistered");
    }

    /// Installs `scrubber` and reenables scrub-on-free after a failure.
    ///
    /// # Errors
    /// [`PmaError::InvalidState`] if scrub-on-free was not requested at
    /// initialization.
    pub fn register_scrubber(&self, scrubber: Arc<dyn Scrubber>) -> Result<(), PmaError> {
        if !self.flags.scrub_on_free() {
            return Err(PmaError::InvalidState("scrub-on-free is not enabled"));
        }
        let mut slot = self.scrubber.write();
        *slot = ScrubberSlot {
            scrubber: Some(scrubber),
            valid: AtomicBool::new(true),
        };
        info!("scrubber registered");
        Ok(())
    }

    /// Removes the scrubber after collecting its completed ranges.
    /// Allocations under scrub-on-free fail until another one is registered.
    pub fn unregister_scrubber(&self) {
        let mut slot = self.scrubber.write();
        if let Some(scrubber) = slot.active() {
            match scrubber.check() {
                Ok(done) if !done.is_empty() => self.state.lock().clear_scrubbing(&done),
                Ok(_) => {}
                Err(err) => warn!("final scrub check failed: {err}"),
            }
        }
        *slot = ScrubberSlot::default();
        info!("scrubber unregistered");
    }

    /// Installs the free-count observer and reports the current count to it
    /// at once.
    pub fn register_update_stats_callback(&self, observer: Arc<dyn FreeCountObserver>) {
        let mut state = self.state.lock();
        state.observer = Some(observer);
        state.notify();
        debug!("free-count observer registered");
    }

    pub fn unregister_update_stats_callback(&self) {
        self.state.lock().observer = None;
    }

    /// Ends the initial asynchronous scrub: every SCRUBBING frame becomes
    /// allocatable.
    ///
    /// # Errors
    /// [`PmaError::InvalidState`] unless the initial scrub is in progress.
    pub fn scrub_complete(&self) -> Result<(), PmaError> {
        if self.init_scrub_state() != InitScrubState::InProgress {
            return Err(PmaError::InvalidState("no initial scrub in progress"));
        }

        let mut state = self.state.lock();
        for region in &mut state.regions {
            let frames = region.map.num_frames();
            region
                .map
                .change_block_state_attrib(0, frames, PageStatus::FREE, PageStatus::SCRUBBING);
        }
        state.notify();
        drop(state);

        self.set_init_scrub_state(InitScrubState::Done);
        info!("initial scrub complete");
        Ok(())
    }

    /// Drops every region and blacklist entry.
    ///
    /// # Errors
    /// [`PmaError::InvalidState`] while an eviction client is registered.
    pub fn destroy(&self) -> Result<(), PmaError> {
        if self.state.lock().evictor.is_some() {
            return Err(PmaError::InvalidState("eviction client still registered"));
        }
        if self.init_scrub_state() == InitScrubState::InProgress {
            self.scrub_complete()?;
        }

        let mut state = self.state.lock();
        if state.numa.onlined {
            warn!("destroying the allocator while NUMA node {} is onlined", state.numa.node);
        }
        let regions = state.regions.len();
        state.regions.clear();
        state.blacklist = BlacklistTracker::new(MAX_BLACKLIST_ENTRIES);
        state.notify();
        info!("PMA destroyed ({regions} regions released)");
        Ok(())
    }

    /// Marks NUMA node `node` as online; OS-passthrough allocations may start.
    ///
    /// # Errors
    /// [`PmaError::InvalidState`] outside OS-passthrough mode.
    pub fn numa_onlined(&self, node: u32) -> Result<(), PmaError> {
        if !self.flags.numa() {
            return Err(PmaError::InvalidState("NUMA mode is not enabled"));
        }
        let mut state = self.state.lock();
        state.numa.onlined = true;
        state.numa.node = node;
        info!("NUMA node {node} onlined");
        Ok(())
    }

    /// Marks the NUMA node offline; later OS-passthrough allocations fail.
    ///
    /// # Errors
    /// [`PmaError::InvalidState`] outside OS-passthrough mode.
    pub fn numa_offlined(&self) -> Result<(), PmaError> {
        if !self.flags.numa() {
            return Err(PmaError::InvalidState("NUMA mode is not enabled"));
        }
        let mut state = self.state.lock();
        state.numa.onlined = false;
        info!("NUMA node {} offlined", state.numa.node);
        Ok(())
    }
}

fn validate_descriptor(id: usize, desc: &RegionDescriptor) -> Result<(), PmaError> {
    if id >= MAX_REGIONS {
        return Err(PmaError::InvalidArgument("too many regions"));
    }
    if desc.limit < desc.base {
        return Err(PmaError::InvalidArgument("region limit below its base"));
    }
    let end_aligned = desc
        .limit
        .as_u64()
        .checked_add(1)
        .is_some_and(|end| DeviceAddress::new(end).is_aligned(GRANULE));
    if !desc.base.is_aligned(GRANULE) || !end_aligned {
        return Err(PmaError::InvalidArgument("region is not frame aligned"));
    }
    if desc.frames() > MAX_REGION_FRAMES {
        return Err(PmaError::InvalidArgument("region is too large"));
    }
    Ok(())
}
