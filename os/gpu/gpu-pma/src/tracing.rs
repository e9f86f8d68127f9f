//! # Region tracing helpers

use crate::PageStatus;
use crate::region::Region;
use log::{Level, debug, log_enabled};

/// Dumps one region's layout and counters at debug level.
pub(crate) fn log_region(id: usize, region: &Region) {
    if !log_enabled!(Level::Debug) {
        return;
    }

    let map = &region.map;
    let allocated = map.runs(PageStatus::STATE_MASK);
    debug!(
        concat!(
            "Region {id}:\n",
            "  range    = {base}..={limit}, perf = {perf}, protection = {prot:?}\n",
            "  frames   = {frames}, free = {free}, ",
            "large pages = {large}, free large = {free_large}\n",
            "  evicting = {evicting}, scrubbing runs = {scrubbing}, ",
            "blacklisted runs = {blacklisted}, allocated runs = {runs}"
        ),
        id = id,
        base = region.desc.base,
        limit = region.desc.limit,
        perf = region.desc.performance,
        prot = region.desc.protection(),
        frames = map.num_frames(),
        free = map.free_frames(),
        large = map.large_pages(),
        free_large = map.free_large_pages(),
        evicting = map.evicting_frame_count(),
        scrubbing = map.runs(PageStatus::SCRUBBING).len(),
        blacklisted = map.runs(PageStatus::BLACKLIST).len(),
        runs = allocated.len(),
    );
    for run in allocated.iter().take(8) {
        debug!("  allocated {run:?}");
    }
}
