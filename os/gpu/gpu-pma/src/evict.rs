//! Eviction client interface.

use crate::MemoryProtection;
use gpu_memory_addresses::{DeviceAddress, PageSize};

/// Why an eviction callback could not free its target.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvictionError {
    #[error("eviction failed")]
    Failed,
    /// The owning allocation cannot be moved right now.
    #[error("allocation is busy")]
    Busy,
}

/// The memory manager owning UNPIN allocations.
///
/// Callbacks run without the allocator's primary lock and are expected to
/// move the affected allocations elsewhere and release the frames with
/// [`Pma::free_pages`](crate::Pma::free_pages) before returning. Frames under
/// eviction keep their EVICTING bit until the callback returns, so nothing else
/// can claim them meanwhile.
pub trait EvictionClient: Send + Sync {
    /// Evicts the allocations backing `pages` (each `page_size` bytes).
    ///
    /// `begin..=end` is the address window of the originating request.
    fn evict_pages(
        &self,
        page_size: PageSize,
        pages: &[DeviceAddress],
        begin: DeviceAddress,
        end: DeviceAddress,
        protection: MemoryProtection,
    ) -> Result<(), EvictionError>;

    /// Evicts every allocation overlapping `begin..=end`.
    fn evict_range(
        &self,
        begin: DeviceAddress,
        end: DeviceAddress,
        protection: MemoryProtection,
    ) -> Result<(), EvictionError>;
}
