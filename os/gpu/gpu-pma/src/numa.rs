//! OS-passthrough backend.
//!
//! In NUMA mode the operating system owns every free frame. The allocator
//! borrows pages from the backend, records them in its bitmap and gives them
//! back on free.

use alloc::vec::Vec;
use gpu_memory_addresses::{DeviceAddress, PageSize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NumaError {
    #[error("NUMA node has no memory left")]
    OutOfMemory,
    #[error("NUMA node is offline")]
    Offline,
}

pub trait NumaBackend: Send + Sync {
    /// Takes `count` pages from `node`. With `contiguous` the result is the
    /// single base address of a run of `count` pages.
    fn allocate_pages(
        &self,
        node: u32,
        page_size: PageSize,
        count: usize,
        contiguous: bool,
    ) -> Result<Vec<DeviceAddress>, NumaError>;

    /// Gives `pages` back to the OS.
    fn free_pages(&self, page_size: PageSize, pages: &[DeviceAddress]);

    /// References the OS holds on the frame at `address`.
    fn page_ref_count(&self, address: DeviceAddress) -> u32;

    /// Permanently withdraws the frame at `address` from the OS.
    fn offline_pages(&self, address: DeviceAddress) -> Result<(), NumaError>;

    /// `(total, free)` bytes of `node`.
    fn memory_usage(&self, node: u32) -> (u64, u64);
}
