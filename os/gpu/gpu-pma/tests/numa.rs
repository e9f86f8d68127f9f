mod common;

use common::{BASE, StubEvictor, addr, frames_of, last};
use gpu_pma::{
    AllocationFlags, AllocationOptions, ConfigQuery, DeviceAddress, FreeFlags, GRANULE, InitFlags,
    NumaBackend, NumaError, PageSize, Pma, PmaConfig, PmaError, RegionDescriptor,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

const FRAMES: u64 = 8;

/// OS stand-in owning the free frames of the single test region.
struct StubNode {
    free: Mutex<BTreeSet<u64>>,
    ref_count: AtomicU32,
    offlined: Mutex<Vec<DeviceAddress>>,
}

impl StubNode {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new((0..FRAMES).collect()),
            ref_count: AtomicU32::new(1),
            offlined: Mutex::new(Vec::new()),
        })
    }

    fn free_frames(&self) -> u64 {
        self.free.lock().unwrap().len() as u64
    }

    fn frame(address: DeviceAddress) -> u64 {
        (address.as_u64() - BASE) / GRANULE
    }
}

impl NumaBackend for StubNode {
    fn allocate_pages(
        &self,
        _node: u32,
        page_size: PageSize,
        count: usize,
        contiguous: bool,
    ) -> Result<Vec<DeviceAddress>, NumaError> {
        let per_page = page_size.frames();
        let (runs, run_len) = if contiguous {
            (1, count as u64 * per_page)
        } else {
            (count, per_page)
        };
        let mut free = self.free.lock().unwrap();
        let mut taken = Vec::new();
        for _ in 0..runs {
            let start = (0..FRAMES)
                .step_by(per_page as usize)
                .find(|&s| s + run_len <= FRAMES && (s..s + run_len).all(|f| free.contains(&f)));
            let Some(start) = start else {
                for &base in &taken {
                    free.extend(base..base + run_len);
                }
                return Err(NumaError::OutOfMemory);
            };
            for f in start..start + run_len {
                free.remove(&f);
            }
            taken.push(start);
        }
        Ok(taken.into_iter().map(addr).collect())
    }

    fn free_pages(&self, page_size: PageSize, pages: &[DeviceAddress]) {
        let mut free = self.free.lock().unwrap();
        for &page in pages {
            let first = Self::frame(page);
            free.extend(first..first + page_size.frames());
        }
    }

    fn page_ref_count(&self, _address: DeviceAddress) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    fn offline_pages(&self, address: DeviceAddress) -> Result<(), NumaError> {
        self.offlined.lock().unwrap().push(address);
        Ok(())
    }

    fn memory_usage(&self, _node: u32) -> (u64, u64) {
        (FRAMES * GRANULE, self.free_frames() * GRANULE)
    }
}

fn numa_pma() -> (Arc<Pma>, Arc<StubNode>) {
    common::init_logging();
    let node = StubNode::new();
    let config = PmaConfig::new(InitFlags::new().with_numa(true)).with_numa_backend(node.clone());
    let pma = Arc::new(Pma::new(config).expect("allocator"));
    pma.register_region(0, false, &RegionDescriptor::with_frames(addr(0), FRAMES, 0), &[])
        .expect("region");
    (pma, node)
}

fn onlined() -> (Arc<Pma>, Arc<StubNode>) {
    let (pma, node) = numa_pma();
    pma.numa_onlined(0).expect("online");
    (pma, node)
}

/// Takes the whole node as one unpinned run; ranges are not available here.
fn unpinned_node(pma: &Pma) -> DeviceAddress {
    let mut options =
        AllocationOptions::new(AllocationFlags::new().with_contiguous(true).with_pinned(false));
    let pages = pma
        .allocate_pages(FRAMES as usize, PageSize::Size64K, &mut options)
        .expect("unpinned run");
    pages[0]
}

#[test]
fn numa_mode_needs_a_backend() {
    let config = PmaConfig::new(InitFlags::new().with_numa(true));
    assert!(matches!(Pma::new(config), Err(PmaError::InvalidArgument(_))));
}

#[test]
fn node_must_be_onlined_first() {
    let (pma, _node) = numa_pma();
    let mut options = AllocationOptions::default();
    assert!(matches!(
        pma.allocate_pages(1, PageSize::Size64K, &mut options),
        Err(PmaError::InvalidState(_))
    ));
    assert!(!pma.query_configs(ConfigQuery::all()).numa_onlined());

    pma.numa_onlined(0).expect("online");
    let config = pma.query_configs(ConfigQuery::all());
    assert!(config.numa_enabled() && config.numa_onlined());
    pma.numa_offlined().expect("offline");
    assert!(!pma.query_configs(ConfigQuery::all()).numa_onlined());

    let plain = common::pma(InitFlags::new());
    assert!(matches!(plain.numa_onlined(0), Err(PmaError::InvalidState(_))));
}

#[test]
fn unsupported_requests_are_rejected() {
    let (pma, node) = onlined();
    let reject = |mut options: AllocationOptions| {
        matches!(
            pma.allocate_pages(1, PageSize::Size64K, &mut options),
            Err(PmaError::InvalidArgument(_))
        )
    };
    assert!(reject(AllocationOptions::new(AllocationFlags::new().with_reverse(true))));
    assert!(reject(AllocationOptions::default().in_range(addr(0), last(4))));
    assert!(reject(AllocationOptions::new(
        AllocationFlags::new().with_contiguous(true).with_turn_blacklist_off(true)
    )));
    assert_eq!(node.free_frames(), FRAMES);
}

#[test]
fn pages_come_from_and_return_to_the_os() {
    let (pma, node) = onlined();
    let mut options = AllocationOptions::default();
    let pages = pma.allocate_pages(3, PageSize::Size64K, &mut options).expect("alloc");
    assert_eq!(frames_of(&pages), [0, 1, 2]);
    assert_eq!(node.free_frames(), 5);
    assert_eq!(pma.free_memory(), 5 * GRANULE);
    assert_eq!(pma.allocated_blocks_list().len(), 1);

    let mut options = AllocationOptions::contiguous();
    let run = pma.allocate_pages(4, PageSize::Size64K, &mut options).expect("run");
    assert_eq!(frames_of(&run), [3, 4, 5, 6]);

    pma.free_pages(&pages, GRANULE, FreeFlags::new()).expect("free");
    pma.free_pages(&run[..1], 4 * GRANULE, FreeFlags::new()).expect("free run");
    assert_eq!(node.free_frames(), FRAMES);
    assert!(pma.allocated_blocks_list().is_empty());
    assert!(pma.state_check());
}

#[test]
fn partial_grants_only_when_allowed() {
    let (pma, node) = onlined();
    let mut options = AllocationOptions::default();
    assert_eq!(
        pma.allocate_pages(9, PageSize::Size64K, &mut options),
        Err(PmaError::NoMemory)
    );
    assert_eq!(node.free_frames(), FRAMES);

    let mut options = AllocationOptions::new(AllocationFlags::new().with_allow_partial(true));
    let pages = pma.allocate_pages(9, PageSize::Size64K, &mut options).expect("partial");
    assert_eq!(pages.len(), 8);
    assert!(options.result_flags.partial());
    assert_eq!(node.free_frames(), 0);
}

#[test]
fn eviction_reuses_the_evicted_frames() {
    let (pma, node) = onlined();
    let evictor = StubEvictor::register(&pma);
    evictor.track(unpinned_node(&pma), FRAMES * GRANULE);
    assert_eq!(node.free_frames(), 0);

    let mut options = AllocationOptions::contiguous();
    let pages = pma.allocate_pages(4, PageSize::Size64K, &mut options).expect("evicted");
    assert_eq!(frames_of(&pages), [0, 1, 2, 3]);
    // Only the frames outside the evicted run went back to the OS.
    assert_eq!(node.free_frames(), 4);
    assert_eq!(evictor.owned(), 0);
    assert!(pma.state_check());
    pma.unregister_eviction_client();
}

#[test]
fn referenced_frames_are_handed_back() {
    let (pma, node) = onlined();
    let evictor = StubEvictor::register(&pma);
    evictor.track(unpinned_node(&pma), FRAMES * GRANULE);
    node.ref_count.store(2, Ordering::SeqCst);

    let mut options = AllocationOptions::contiguous();
    assert_eq!(
        pma.allocate_pages(4, PageSize::Size64K, &mut options),
        Err(PmaError::NoMemory)
    );
    assert_eq!(node.free_frames(), FRAMES);
    assert!(pma.allocated_blocks_list().is_empty());
    assert!(pma.state_check());

    node.ref_count.store(1, Ordering::SeqCst);
    let mut options = AllocationOptions::contiguous();
    let pages = pma.allocate_pages(4, PageSize::Size64K, &mut options).expect("from the OS");
    assert_eq!(frames_of(&pages), [0, 1, 2, 3]);
    pma.unregister_eviction_client();
}

#[test]
fn blacklisting_offlines_the_frame() {
    let (pma, node) = onlined();
    pma.add_to_blacklist_tracking(addr(5)).expect("blacklist");
    assert_eq!(*node.offlined.lock().unwrap(), [addr(5)]);
}
