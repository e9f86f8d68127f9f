//! # Region selection
//!
//! Orders the registered regions for one allocation request. A region is a
//! candidate if it passes every filter of [`AllocationOptions`]:
//!
//! - `region_id`: only that region;
//! - `min_performance`: performance rank at least this value;
//! - `flags.protected`: protected regions only, otherwise unprotected only;
//! - `range`: the region overlaps the inclusive address window.
//!
//! Candidates are tried fastest first, or slowest first with
//! `flags.prefer_slower`. Ties keep registration order.

use crate::{AllocationOptions, RegionDescriptor};
use alloc::vec::Vec;
use gpu_memory_addresses::DeviceRange;

/// Indices of the candidate regions for `options`, in the order to try them.
#[must_use]
pub fn select_regions<'a, I>(regions: I, options: &AllocationOptions) -> Vec<usize>
where
    I: IntoIterator<Item = &'a RegionDescriptor>,
{
    let window = options
        .range
        .map(|(begin, end)| DeviceRange::from_inclusive(begin, end));

    let mut candidates: Vec<(usize, u32)> = regions
        .into_iter()
        .enumerate()
        .filter(|&(id, _)| options.region_id.is_none_or(|wanted| wanted == id))
        .filter(|(_, desc)| options.min_performance.is_none_or(|floor| desc.performance >= floor))
        .filter(|(_, desc)| desc.protected == options.flags.protected())
        .filter(|(_, desc)| window.is_none_or(|window| desc.range().overlaps(&window)))
        .map(|(id, desc)| (id, desc.performance))
        .collect();

    if options.flags.prefer_slower() {
        candidates.sort_by_key(|&(_, performance)| performance);
    } else {
        candidates.sort_by_key(|&(_, performance)| core::cmp::Reverse(performance));
    }
    candidates.into_iter().map(|(id, _)| id).collect()
}
