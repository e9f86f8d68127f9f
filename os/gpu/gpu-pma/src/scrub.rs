//! Scrub-on-free interface.
//!
//! Freed frames are parked SCRUBBING and handed to a [`Scrubber`], which
//! overwrites them asynchronously. Every call may report ranges whose scrub has
//! completed; the allocator clears SCRUBBING on those and they become
//! allocatable again.

use alloc::vec::Vec;
use gpu_memory_addresses::{DeviceAddress, DeviceRange, PageSize};

/// Scrubber failure. Any failure invalidates the scrubber until a new one is
/// registered.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScrubError {
    #[error("scrubber is out of resources")]
    OutOfResources,
    #[error("scrub engine failure")]
    Engine,
}

pub trait Scrubber: Send + Sync {
    /// Queues the `page_bytes`-sized blocks at `pages` for scrubbing; returns
    /// ranges already completed.
    fn submit_pages(
        &self,
        page_bytes: u64,
        pages: &[DeviceAddress],
    ) -> Result<Vec<DeviceRange>, ScrubError>;

    /// Blocks until every `page_bytes`-sized block at `pages` is scrubbed.
    fn wait_pages(&self, page_bytes: u64, pages: &[DeviceAddress]) -> Result<(), ScrubError>;

    /// Blocks until at least `count` pages of `page_size` have completed;
    /// returns the completed ranges.
    fn check_and_wait_for_size(
        &self,
        count: usize,
        page_size: PageSize,
    ) -> Result<Vec<DeviceRange>, ScrubError>;

    /// Ranges completed since the last call.
    fn check(&self) -> Result<Vec<DeviceRange>, ScrubError>;
}
