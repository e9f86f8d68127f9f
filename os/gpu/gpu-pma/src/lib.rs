//! # Physical Memory Allocator (PMA)
//!
//! Tracks every 64 KiB frame of device memory as FREE, UNPIN (allocated,
//! evictable) or PIN (allocated, not evictable) and hands out pages of
//! 64 KiB, 128 KiB, 2 MiB or 512 MiB.
//!
//! ```text
//!     ┌──────────────────────────── Pma ────────────────────────────┐
//!     │  eviction-registration lock      per-call lock (scrub)      │
//!     │  scrubber RwLock ──▶ Scrubber    primary SpinLock ──┐       │
//!     │                                                    ▼       │
//!     │   ┌── Region 0 ──┐  ┌── Region 1 ──┐      BlacklistTracker   │
//!     │   │  RegionMap   │  │  RegionMap   │ ...                     │
//!     │   └──────────────┘  └──────────────┘                         │
//!     └──────────────┬───────────────────────────────┬──────────────┘
//!                    ▼                               ▼
//!             EvictionClient                  FreeCountObserver
//! ```
//!
//! An allocation selects candidate regions ([`selector`]), scans each
//! [`RegionMap`] for free frames, falls back to asking the registered
//! [`EvictionClient`] to move unpinned allocations out of the way, and under
//! scrub-on-free waits for the [`Scrubber`] to sanitize freed frames before
//! retrying. The primary lock is never held while a collaborator runs.
//!
//! With [`InitFlags::numa`] the allocator runs in OS-passthrough mode: a
//! [`NumaBackend`] owns free memory and the bitmap only records what was
//! handed out and picks eviction victims.

#![cfg_attr(not(any(test, doctest, feature = "std")), no_std)]

extern crate alloc;

mod blacklist;
pub mod consts;
mod error;
mod evict;
mod flags;
mod journal;
mod numa;
mod options;
mod pma;
mod region;
pub mod regmap;
mod scrub;
pub mod selector;
mod stats;
mod status;
mod tracing;

pub use blacklist::{BlacklistChunk, BlacklistSize, BlacklistTracker};
pub use error::{ErrorClass, PmaError};
pub use evict::{EvictionClient, EvictionError};
pub use flags::{AllocationFlags, AllocationResultFlags, ConfigQuery, FreeFlags, InitFlags};
pub use gpu_memory_addresses::{DeviceAddress, DeviceRange, GRANULE, PageSize};
pub use numa::{NumaBackend, NumaError};
pub use options::{AllocationOptions, Stride, StrideParity};
pub use pma::{InitScrubState, Pma, PmaConfig};
pub use region::{MemoryProtection, RegionDescriptor};
pub use regmap::RegionMap;
pub use scrub::{ScrubError, Scrubber};
pub use stats::{FreeCountObserver, PmaStats};
pub use status::{FrameState, PageStatus};
