//! Flag words for initialization, allocation, free and configuration queries.

use bitfield_struct::bitfield;

/// Allocator-wide behavior chosen at initialization.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct InitFlags {
    /// Every allocation is marked persistent.
    pub force_persistence: bool,
    /// Freed frames are scrubbed before they can be allocated again.
    pub scrub_on_free: bool,
    /// OS-passthrough mode: a [`NumaBackend`](crate::NumaBackend) owns free memory.
    pub numa: bool,
    /// The NUMA node is onlined automatically by the OS.
    pub numa_auto_online: bool,
    #[bits(28)]
    __: u32,
}

/// Request flags for [`Pma::allocate_pages`](crate::Pma::allocate_pages).
///
/// [`AllocationFlags::new`] is a pinned, discontiguous, evicting request.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct AllocationFlags {
    /// All pages form one physically contiguous run.
    pub contiguous: bool,
    /// Granted frames become PIN rather than UNPIN.
    #[bits(default = true)]
    pub pinned: bool,
    pub persistent: bool,
    /// Never evict; fail with out-of-memory instead.
    pub dont_evict: bool,
    /// Allocate from protected regions only (otherwise unprotected only).
    pub protected: bool,
    /// Contiguous only: blacklisted frames in the window may be granted.
    pub turn_blacklist_off: bool,
    /// Discontiguous only: return fewer pages instead of failing.
    pub allow_partial: bool,
    /// Skip scrub-on-free for this request; the pages may hold stale data.
    pub no_zero: bool,
    /// Scan from high addresses down.
    pub reverse: bool,
    /// Visit slower regions first.
    pub prefer_slower: bool,
    #[bits(22)]
    __: u32,
}

/// Output flags of an allocation.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct AllocationResultFlags {
    /// The granted pages were scrubbed and read as zero.
    pub is_zero: bool,
    /// Fewer pages than requested were granted.
    pub partial: bool,
    #[bits(30)]
    __: u32,
}

/// Flags for [`Pma::free_pages`](crate::Pma::free_pages).
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct FreeFlags {
    /// Free straight to FREE even under scrub-on-free.
    pub skip_scrub: bool,
    #[bits(31)]
    __: u32,
}

/// Query/answer word for [`Pma::query_configs`](crate::Pma::query_configs).
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct ConfigQuery {
    pub scrub_enabled: bool,
    pub scrub_valid: bool,
    pub numa_enabled: bool,
    pub numa_onlined: bool,
    #[bits(28)]
    __: u32,
}

impl ConfigQuery {
    /// Every known query bit.
    #[must_use]
    pub const fn all() -> Self {
        Self::new()
            .with_scrub_enabled(true)
            .with_scrub_valid(true)
            .with_numa_enabled(true)
            .with_numa_onlined(true)
    }
}
