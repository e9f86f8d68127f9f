use super::{Pma, PmaState};
use crate::{ConfigQuery, PageStatus, PmaStats, RegionDescriptor, RegionMap};
use alloc::vec::Vec;
use gpu_memory_addresses::{DeviceAddress, DeviceRange, frames_to_bytes};
use log::debug;

impl PmaState {
    fn frames_where(&self, protected: bool, count: impl Fn(&RegionMap) -> u64) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.desc.protected == protected)
            .map(|r| count(&r.map))
            .sum()
    }

    fn ranges_with(&self, bits: PageStatus) -> Vec<DeviceRange> {
        self.regions.iter().flat_map(|r| r.map.runs(bits)).collect()
    }
}

impl Pma {
    /// Answers the configuration bits set in `mask`; bits not asked for are
    /// clear in the result.
    #[must_use]
    pub fn query_configs(&self, mask: ConfigQuery) -> ConfigQuery {
        let scrub_valid = self.flags.scrub_on_free() && self.scrubber.read().is_valid();
        let numa_onlined = self.flags.numa() && self.state.lock().numa.onlined;
        let answer = ConfigQuery::new()
            .with_scrub_enabled(self.flags.scrub_on_free())
            .with_scrub_valid(scrub_valid)
            .with_numa_enabled(self.flags.numa())
            .with_numa_onlined(numa_onlined);
        ConfigQuery::from_bits(answer.into_bits() & mask.into_bits())
    }

    /// Free bytes over all regions. In OS-passthrough mode with the node
    /// online, the backend's count.
    #[must_use]
    pub fn free_memory(&self) -> u64 {
        let state = self.state.lock();
        if state.numa.onlined
            && let Some(backend) = &self.numa_backend
        {
            let node = state.numa.node;
            drop(state);
            return backend.memory_usage(node).1;
        }
        frames_to_bytes(state.free_frames())
    }

    #[must_use]
    pub fn total_memory(&self) -> u64 {
        self.state.lock().regions.iter().map(|r| r.map.size()).sum()
    }

    /// Descriptors of all registered regions, by id.
    #[must_use]
    pub fn region_info(&self) -> Vec<RegionDescriptor> {
        self.state.lock().regions.iter().map(|r| r.desc).collect()
    }

    /// Size and address of the longest allocatable run of any region.
    /// `(0, 0x0)` when nothing is free.
    #[must_use]
    pub fn largest_free(&self) -> (u64, DeviceAddress) {
        let state = self.state.lock();
        state
            .regions
            .iter()
            .filter_map(|r| {
                r.map
                    .largest_free_run()
                    .map(|(frame, len)| (frames_to_bytes(len), r.map.address_of(frame)))
            })
            .max_by_key(|&(bytes, _)| bytes)
            .unwrap_or((0, DeviceAddress::zero()))
    }

    #[must_use]
    pub fn total_protected_memory(&self) -> u64 {
        frames_to_bytes(self.state.lock().frames_where(true, |m| m.num_frames()))
    }

    #[must_use]
    pub fn total_unprotected_memory(&self) -> u64 {
        frames_to_bytes(self.state.lock().frames_where(false, |m| m.num_frames()))
    }

    #[must_use]
    pub fn free_protected_memory(&self) -> u64 {
        frames_to_bytes(self.state.lock().frames_where(true, |m| m.free_frames()))
    }

    #[must_use]
    pub fn free_unprotected_memory(&self) -> u64 {
        frames_to_bytes(self.state.lock().frames_where(false, |m| m.free_frames()))
    }

    #[must_use]
    pub fn stats(&self) -> PmaStats {
        let state = self.state.lock();
        let mut stats = PmaStats::default();
        for region in &state.regions {
            let map = &region.map;
            stats.num_frames_total += map.num_frames();
            stats.num_free_frames += map.free_frames();
            stats.num_large_pages += map.large_pages();
            stats.num_free_large_pages += map.free_large_pages();
            if region.desc.protected {
                stats.num_frames_total_protected += map.num_frames();
                stats.num_free_frames_protected += map.free_frames();
                stats.num_large_pages_protected += map.large_pages();
                stats.num_free_large_pages_protected += map.free_large_pages();
            }
        }
        stats
    }

    /// Coalesced ranges of persistent frames.
    #[must_use]
    pub fn persistent_list(&self) -> Vec<DeviceRange> {
        self.state.lock().ranges_with(PageStatus::PERSISTENT)
    }

    /// Coalesced ranges of allocated (PIN or UNPIN) frames.
    #[must_use]
    pub fn allocated_blocks_list(&self) -> Vec<DeviceRange> {
        self.state.lock().ranges_with(PageStatus::STATE_MASK)
    }

    /// Clears SCRUBBING on every region lying entirely inside
    /// `base..=limit`. Regions only partly covered are left alone.
    pub fn clear_scrub_range(&self, base: DeviceAddress, limit: DeviceAddress) {
        let mut state = self.state.lock();
        let mut cleared = 0;
        for region in &mut state.regions {
            let covered = region.desc.base >= base && region.desc.limit <= limit;
            if !covered {
                continue;
            }
            let frames = region.map.num_frames();
            region
                .map
                .change_block_state_attrib(0, frames, PageStatus::FREE, PageStatus::SCRUBBING);
            cleared += 1;
        }
        state.notify();
        debug!("cleared scrub state of {cleared} regions inside {base}..={limit}");
    }

    /// `true` if every region's cached counters match its bitmap.
    #[must_use]
    pub fn state_check(&self) -> bool {
        self.state.lock().state_check()
    }
}
