//! Allocator limits.

use gpu_memory_addresses::GRANULE;

/// Maximum number of regions one allocator can track.
pub const MAX_REGIONS: usize = 32;

/// Maximum number of blacklisted frames, static and dynamic combined.
pub const MAX_BLACKLIST_ENTRIES: usize = 512;

/// Reference count an OS-passthrough page has while only the allocator holds it.
pub const NUMA_EXPECTED_REF_COUNT: u32 = 1;

/// Largest region the bitmap can describe (2^32 frames).
pub const MAX_REGION_FRAMES: u64 = 1 << 32;

const _: () = {
    assert!(MAX_REGIONS > 0);
    assert!(MAX_REGION_FRAMES.checked_mul(GRANULE).is_some());
};
