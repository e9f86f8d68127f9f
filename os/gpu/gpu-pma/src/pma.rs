//! # Allocator core
//!
//! Locks, outer to inner:
//!
//! | Lock                    | Type          | Guards                                        |
//! |-------------------------|---------------|-----------------------------------------------|
//! | `eviction_registration` | [`CallLock`]  | register/unregister of the eviction client    |
//! | `call_lock`             | [`CallLock`]  | one allocation at a time under scrub-on-free  |
//! | `scrubber`              | [`RwSpinLock`]| scrubber object and its validity              |
//! | `state`                 | [`SpinLock`]  | regions, bitmaps, blacklist, callbacks        |
//!
//! The primary `state` lock is never held while a collaborator runs: every
//! callback goes through
//! [`SpinLockGuard::unlocked`](gpu_sync::SpinLockGuard::unlocked), and
//! frames that must not move meanwhile are marked EVICTING or pinned first.
//!
//! `free_pages` does not take `call_lock`, since eviction clients free pages
//! from inside their callback while the allocating thread holds it.

mod allocate;
mod blacklist;
mod evict;
mod free;
mod numa;
mod query;
mod register;

use crate::blacklist::BlacklistTracker;
use crate::consts::MAX_BLACKLIST_ENTRIES;
use crate::region::Region;
use crate::{
    EvictionClient, FreeCountObserver, InitFlags, NumaBackend, PageStatus, PmaError, Scrubber,
};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use gpu_memory_addresses::{DeviceAddress, DeviceRange};
use gpu_sync::{CallLock, RwSpinLock, SpinLock};
use log::error;

/// Allocator construction parameters.
#[derive(Clone, Default)]
pub struct PmaConfig {
    pub flags: InitFlags,
    /// Required with [`InitFlags::numa`].
    pub numa_backend: Option<Arc<dyn NumaBackend>>,
}

impl PmaConfig {
    #[must_use]
    pub fn new(flags: InitFlags) -> Self {
        Self {
            flags,
            numa_backend: None,
        }
    }

    #[must_use]
    pub fn with_numa_backend(mut self, backend: Arc<dyn NumaBackend>) -> Self {
        self.numa_backend = Some(backend);
        self
    }
}

/// Progress of the asynchronous scrub of freshly registered regions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum InitScrubState {
    Initialize = 0,
    InProgress = 1,
    Done = 2,
}

impl InitScrubState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initialize,
            1 => Self::InProgress,
            _ => Self::Done,
        }
    }
}

/// The registered scrubber and whether it can still be trusted.
///
/// `valid` is only ever set under the write lock; clearing it after a
/// failure happens under the read lock, so it is atomic.
#[derive(Default)]
pub(crate) struct ScrubberSlot {
    scrubber: Option<Arc<dyn Scrubber>>,
    valid: AtomicBool,
}

impl ScrubberSlot {
    /// The scrubber, if one is registered and has not failed.
    pub fn active(&self) -> Option<&dyn Scrubber> {
        if self.valid.load(Ordering::Acquire) {
            self.scrubber.as_deref()
        } else {
            None
        }
    }

    pub fn is_valid(&self) -> bool {
        self.active().is_some()
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct NumaNode {
    pub onlined: bool,
    pub node: u32,
}

/// Everything guarded by the primary lock.
pub(crate) struct PmaState {
    pub regions: Vec<Region>,
    pub blacklist: BlacklistTracker,
    pub evictor: Option<Arc<dyn EvictionClient>>,
    pub observer: Option<Arc<dyn FreeCountObserver>>,
    pub numa: NumaNode,
}

impl PmaState {
    fn new() -> Self {
        Self {
            regions: Vec::new(),
            blacklist: BlacklistTracker::new(MAX_BLACKLIST_ENTRIES),
            evictor: None,
            observer: None,
            numa: NumaNode::default(),
        }
    }

    /// Region index and frame of `addr`.
    pub fn locate(&self, addr: DeviceAddress) -> Option<(usize, u64)> {
        self.regions
            .iter()
            .enumerate()
            .find_map(|(id, region)| region.frame_of(addr).map(|frame| (id, frame)))
    }

    /// Region index and first frame of the `frames`-frame block at `addr`,
    /// if the whole block lies in one region.
    pub fn locate_block(&self, addr: DeviceAddress, frames: u64) -> Option<(usize, u64)> {
        let (id, frame) = self.locate(addr)?;
        let fits = frame
            .checked_add(frames)
            .is_some_and(|end| end <= self.regions[id].map.num_frames());
        fits.then_some((id, frame))
    }

    pub fn free_frames(&self) -> u64 {
        self.regions.iter().map(|r| r.map.free_frames()).sum()
    }

    pub fn evictions_pending(&self) -> bool {
        self.regions.iter().any(|r| r.map.evicting_frame_count() != 0)
    }

    /// Clears SCRUBBING on every frame inside `ranges`.
    pub fn clear_scrubbing(&mut self, ranges: &[DeviceRange]) {
        for range in ranges {
            for region in &mut self.regions {
                let Some(frames) = region.frame_window(Some(*range)) else {
                    continue;
                };
                region.map.change_block_state_attrib(
                    frames.start,
                    frames.end - frames.start,
                    PageStatus::FREE,
                    PageStatus::SCRUBBING,
                );
            }
        }
    }

    /// Reports the free frame count to the observer.
    pub fn notify(&self) {
        #[cfg(feature = "state-check")]
        debug_assert!(self.state_check(), "free counters out of sync with the bitmap");

        if let Some(observer) = &self.observer {
            observer.update_free_count(self.free_frames());
        }
    }

    pub fn state_check(&self) -> bool {
        self.regions.iter().all(|r| r.map.counters_consistent())
    }
}

/// Physical memory allocator for device memory.
///
/// All methods take `&self`; share the allocator between threads with an
/// [`Arc`].
pub struct Pma {
    flags: InitFlags,
    numa_backend: Option<Arc<dyn NumaBackend>>,
    eviction_registration: CallLock,
    call_lock: CallLock,
    scrubber: RwSpinLock<ScrubberSlot>,
    state: SpinLock<PmaState>,
    init_scrub: AtomicU8,
}

impl Pma {
    /// Creates an allocator without regions.
    ///
    /// # Errors
    /// [`PmaError::InvalidArgument`] if NUMA mode is requested without a backend.
    pub fn new(config: PmaConfig) -> Result<Self, PmaError> {
        if config.flags.numa() && config.numa_backend.is_none() {
            return Err(PmaError::InvalidArgument("NUMA mode needs a NUMA backend"));
        }

        log::info!(
            "PMA initialized: scrub-on-free={}, force-persistence={}, numa={}",
            config.flags.scrub_on_free(),
            config.flags.force_persistence(),
            config.flags.numa()
        );

        Ok(Self {
            flags: config.flags,
            numa_backend: config.numa_backend,
            eviction_registration: CallLock::new(),
            call_lock: CallLock::new(),
            scrubber: RwSpinLock::new(ScrubberSlot::default()),
            state: SpinLock::new(PmaState::new()),
            init_scrub: AtomicU8::new(InitScrubState::Initialize as u8),
        })
    }

    #[must_use]
    pub const fn flags(&self) -> InitFlags {
        self.flags
    }

    #[must_use]
    pub fn init_scrub_state(&self) -> InitScrubState {
        InitScrubState::from_u8(self.init_scrub.load(Ordering::Acquire))
    }

    fn set_init_scrub_state(&self, state: InitScrubState) {
        self.init_scrub.store(state as u8, Ordering::Release);
    }

    /// Gives up on the scrubber after a failure; scrub-on-free stays off until
    /// a scrubber is registered again.
    fn scrub_fatal(slot: &ScrubberSlot) {
        error!("scrubber failed; disabling scrub-on-free until a scrubber is registered");
        slot.invalidate();
    }

    /// Applies scrub completions reported by `check`.
    fn collect_scrubbed(&self, slot: &ScrubberSlot) -> Result<(), PmaError> {
        let Some(scrubber) = slot.active() else {
            return Ok(());
        };
        match scrubber.check() {
            Ok(done) => {
                if !done.is_empty() {
                    self.state.lock().clear_scrubbing(&done);
                }
                Ok(())
            }
            Err(err) => {
                log::warn!("scrub check failed: {err}");
                Self::scrub_fatal(slot);
                Err(PmaError::ScrubberFailed)
            }
        }
    }
}
