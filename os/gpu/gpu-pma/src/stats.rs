/// Frame and large-page counters, aggregated over all regions.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PmaStats {
    pub num_frames_total: u64,
    pub num_free_frames: u64,
    pub num_large_pages: u64,
    pub num_free_large_pages: u64,
    pub num_frames_total_protected: u64,
    pub num_free_frames_protected: u64,
    pub num_large_pages_protected: u64,
    pub num_free_large_pages_protected: u64,
}

/// Receives the total free frame count after every change.
///
/// Called with the primary lock held; must not call back into the allocator.
pub trait FreeCountObserver: Send + Sync {
    fn update_free_count(&self, free_frames: u64);
}

impl<F> FreeCountObserver for F
where
    F: Fn(u64) + Send + Sync,
{
    fn update_free_count(&self, free_frames: u64) {
        self(free_frames);
    }
}
