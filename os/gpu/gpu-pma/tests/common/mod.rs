#![allow(dead_code)]

use gpu_pma::{
    AllocationFlags, AllocationOptions, DeviceAddress, DeviceRange, EvictionClient, EvictionError,
    FreeFlags, GRANULE, InitFlags, MemoryProtection, PageSize, Pma, PmaConfig, RegionDescriptor,
    ScrubError, Scrubber,
};
use log::{LevelFilter, Log, Metadata, Record};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};

/// Base address of the first test region.
pub const BASE: u64 = 0x1_0000_0000;

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

/// Routes allocator logging to stderr; shown for failing tests.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(LevelFilter::Debug);
    });
}

pub fn addr(frame: u64) -> DeviceAddress {
    DeviceAddress::new(BASE + frame * GRANULE)
}

/// Last byte before frame `frame`; the inclusive end of a window ending there.
pub fn last(frame: u64) -> DeviceAddress {
    DeviceAddress::new(BASE + frame * GRANULE - 1)
}

pub fn frames_of(pages: &[DeviceAddress]) -> Vec<u64> {
    pages.iter().map(|p| (p.as_u64() - BASE) / GRANULE).collect()
}

pub fn pma(flags: InitFlags) -> Arc<Pma> {
    init_logging();
    Arc::new(Pma::new(PmaConfig::new(flags)).expect("allocator"))
}

/// Allocator with one unprotected region of `frames` frames at [`BASE`].
pub fn single_region(flags: InitFlags, frames: u64) -> Arc<Pma> {
    let pma = pma(flags);
    pma.register_region(0, false, &RegionDescriptor::with_frames(addr(0), frames, 0), &[])
        .expect("region");
    pma
}

pub fn free_frames(pma: &Pma) -> u64 {
    pma.free_memory() / GRANULE
}

/// Allocates one unpinned 64K page at `frame`.
pub fn unpinned_at(pma: &Pma, frame: u64) -> DeviceAddress {
    let mut options =
        AllocationOptions::new(AllocationFlags::new().with_pinned(false))
            .in_range(addr(frame), last(frame + 1));
    let pages = pma
        .allocate_pages(1, PageSize::Size64K, &mut options)
        .expect("unpinned page");
    assert_eq!(frames_of(&pages), [frame]);
    pages[0]
}

/// Allocates the whole `[first, first + frames)` range as one unpinned run.
pub fn unpinned_run(pma: &Pma, first: u64, frames: usize) -> DeviceAddress {
    let flags = AllocationFlags::new().with_contiguous(true).with_pinned(false);
    let mut options =
        AllocationOptions::new(flags).in_range(addr(first), last(first + frames as u64));
    let pages = pma
        .allocate_pages(frames, PageSize::Size64K, &mut options)
        .expect("unpinned run");
    pages[0]
}

/// One eviction callback invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictCall {
    Range { begin: DeviceAddress, end: DeviceAddress },
    Pages { pages: Vec<DeviceAddress>, begin: DeviceAddress, end: DeviceAddress },
}

/// Memory manager stub owning unpinned allocations it frees on eviction.
pub struct StubEvictor {
    pma: Weak<Pma>,
    /// Owned allocations as `(base, bytes)`.
    owned: Mutex<Vec<(DeviceAddress, u64)>>,
    pub calls: Mutex<Vec<EvictCall>>,
    pub fail: AtomicBool,
    /// While set, callbacks free nothing and pretend success.
    pub leave_in_place: AtomicBool,
}

impl StubEvictor {
    pub fn register(pma: &Arc<Pma>) -> Arc<Self> {
        let evictor = Arc::new(Self {
            pma: Arc::downgrade(pma),
            owned: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            leave_in_place: AtomicBool::new(false),
        });
        pma.register_eviction_client(evictor.clone()).expect("evictor");
        evictor
    }

    pub fn track(&self, base: DeviceAddress, bytes: u64) {
        self.owned.lock().unwrap().push((base, bytes));
    }

    pub fn calls(&self) -> Vec<EvictCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn owned(&self) -> usize {
        self.owned.lock().unwrap().len()
    }

    fn release(&self, hit: impl Fn(DeviceRange) -> bool) -> Result<(), EvictionError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EvictionError::Failed);
        }
        if self.leave_in_place.load(Ordering::SeqCst) {
            return Ok(());
        }
        let victims: Vec<(DeviceAddress, u64)> = {
            let mut owned = self.owned.lock().unwrap();
            let (victims, kept) = owned
                .drain(..)
                .partition(|&(base, bytes)| hit(DeviceRange::new(base, bytes)));
            *owned = kept;
            victims
        };
        let pma = self.pma.upgrade().ok_or(EvictionError::Failed)?;
        for (base, bytes) in victims {
            pma.free_pages(&[base], bytes, FreeFlags::new())
                .map_err(|_| EvictionError::Failed)?;
        }
        Ok(())
    }
}

impl EvictionClient for StubEvictor {
    fn evict_pages(
        &self,
        page_size: PageSize,
        pages: &[DeviceAddress],
        begin: DeviceAddress,
        end: DeviceAddress,
        _protection: MemoryProtection,
    ) -> Result<(), EvictionError> {
        self.calls.lock().unwrap().push(EvictCall::Pages {
            pages: pages.to_vec(),
            begin,
            end,
        });
        let targets: Vec<DeviceRange> = pages
            .iter()
            .map(|&p| DeviceRange::new(p, page_size.bytes()))
            .collect();
        self.release(|owned| targets.iter().any(|t| t.overlaps(&owned)))
    }

    fn evict_range(
        &self,
        begin: DeviceAddress,
        end: DeviceAddress,
        _protection: MemoryProtection,
    ) -> Result<(), EvictionError> {
        self.calls.lock().unwrap().push(EvictCall::Range { begin, end });
        let target = DeviceRange::from_inclusive(begin, end);
        self.release(|owned| target.overlaps(&owned))
    }
}

/// Scrubber stub.
///
/// Submitted blocks stay pending until a waiting call completes them, unless
/// `immediate` is set.
#[derive(Default)]
pub struct StubScrubber {
    pending: Mutex<Vec<DeviceRange>>,
    pub immediate: AtomicBool,
    pub fail_submit: AtomicBool,
    pub fail_check: AtomicBool,
    pub submitted: AtomicUsize,
    pub waits: AtomicUsize,
}

impl StubScrubber {
    pub fn register(pma: &Pma) -> Arc<Self> {
        let scrubber = Arc::new(Self::default());
        pma.register_scrubber(scrubber.clone()).expect("scrubber");
        scrubber
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn take_all(&self) -> Vec<DeviceRange> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }
}

impl Scrubber for StubScrubber {
    fn submit_pages(
        &self,
        page_bytes: u64,
        pages: &[DeviceAddress],
    ) -> Result<Vec<DeviceRange>, ScrubError> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(ScrubError::Engine);
        }
        self.submitted.fetch_add(pages.len(), Ordering::SeqCst);
        let ranges: Vec<DeviceRange> = pages
            .iter()
            .map(|&p| DeviceRange::new(p, page_bytes))
            .collect();
        if self.immediate.load(Ordering::SeqCst) {
            return Ok(ranges);
        }
        self.pending.lock().unwrap().extend(ranges);
        Ok(Vec::new())
    }

    fn wait_pages(&self, page_bytes: u64, pages: &[DeviceAddress]) -> Result<(), ScrubError> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|r| {
            !pages
                .iter()
                .any(|&p| DeviceRange::new(p, page_bytes).overlaps(r))
        });
        Ok(())
    }

    fn check_and_wait_for_size(
        &self,
        _count: usize,
        _page_size: PageSize,
    ) -> Result<Vec<DeviceRange>, ScrubError> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        Ok(self.take_all())
    }

    fn check(&self) -> Result<Vec<DeviceRange>, ScrubError> {
        if self.fail_check.load(Ordering::SeqCst) {
            return Err(ScrubError::Engine);
        }
        Ok(Vec::new())
    }
}
