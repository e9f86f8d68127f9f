mod common;

use common::{BASE, addr, free_frames, frames_of, last, single_region};
use gpu_pma::{
    AllocationFlags, AllocationOptions, DeviceAddress, DeviceRange, FreeFlags, GRANULE, InitFlags,
    PageSize, PmaError, RegionDescriptor, Stride, StrideParity,
};

const MB2: u64 = 2 << 20;

#[test]
fn contiguous_run_honours_alignment() {
    let pma = single_region(InitFlags::new(), 256);
    // Occupy frame 0 so the first aligned slot is taken.
    let mut one = AllocationOptions::contiguous();
    pma.allocate_pages(1, PageSize::Size64K, &mut one).expect("frame 0");

    let mut options = AllocationOptions::contiguous().aligned_to(MB2);
    let pages = pma
        .allocate_pages(3, PageSize::Size64K, &mut options)
        .expect("aligned run");
    assert!(pages[0].is_aligned(MB2));
    assert_eq!(frames_of(&pages), [32, 33, 34]);
}

#[test]
fn large_pages_are_page_aligned() {
    let pma = single_region(InitFlags::new(), 128);
    let mut options = AllocationOptions::default();
    let pages = pma
        .allocate_pages(3, PageSize::Size2M, &mut options)
        .expect("2M pages");
    assert_eq!(pages.len(), 3);
    assert!(pages.iter().all(|p| p.is_aligned(MB2)));
    assert_eq!(free_frames(&pma), 32);
    assert_eq!(pma.stats().num_free_large_pages, 1);
    assert_eq!(pma.stats().num_large_pages, 4);

    pma.free_pages(&pages, MB2, FreeFlags::new()).expect("free");
    assert_eq!(pma.stats().num_free_large_pages, 4);
}

#[test]
fn reverse_allocation_comes_from_the_top() {
    let pma = single_region(InitFlags::new(), 16);
    let mut options =
        AllocationOptions::new(AllocationFlags::new().with_contiguous(true).with_reverse(true));
    let pages = pma
        .allocate_pages(2, PageSize::Size64K, &mut options)
        .expect("reverse run");
    assert_eq!(frames_of(&pages), [14, 15]);

    let mut options = AllocationOptions::new(AllocationFlags::new().with_reverse(true));
    let pages = pma
        .allocate_pages(2, PageSize::Size64K, &mut options)
        .expect("reverse pages");
    assert_eq!(frames_of(&pages), [13, 12]);
}

#[test]
fn range_restricts_the_search() {
    let pma = single_region(InitFlags::new(), 64);
    let mut options = AllocationOptions::default().in_range(addr(10), last(14));
    let pages = pma
        .allocate_pages(4, PageSize::Size64K, &mut options)
        .expect("ranged");
    assert_eq!(frames_of(&pages), [10, 11, 12, 13]);

    let mut options = AllocationOptions::default().in_range(addr(10), last(14));
    assert_eq!(
        pma.allocate_pages(1, PageSize::Size64K, &mut options),
        Err(PmaError::NoMemory)
    );
}

#[test]
fn partial_allocation_grants_what_is_free() {
    let pma = single_region(InitFlags::new(), 8);
    let mut options = AllocationOptions::new(AllocationFlags::new().with_allow_partial(true));
    let pages = pma
        .allocate_pages(12, PageSize::Size64K, &mut options)
        .expect("partial");
    assert_eq!(pages.len(), 8);
    assert_eq!(options.num_pages_allocated, 8);
    assert!(options.result_flags.partial());

    let mut options = AllocationOptions::new(AllocationFlags::new().with_allow_partial(true));
    assert_eq!(
        pma.allocate_pages(1, PageSize::Size64K, &mut options),
        Err(PmaError::NoMemory)
    );
}

#[test]
fn failed_discontiguous_request_changes_nothing() {
    let pma = single_region(InitFlags::new(), 8);
    let mut options = AllocationOptions::default();
    assert_eq!(
        pma.allocate_pages(9, PageSize::Size64K, &mut options),
        Err(PmaError::NoMemory)
    );
    assert_eq!(free_frames(&pma), 8);
    assert_eq!(options.num_pages_allocated, 0);
    assert!(pma.allocated_blocks_list().is_empty());
}

#[test]
fn stride_selects_blocks_of_one_parity() {
    let pma = single_region(InitFlags::new(), 64);
    let stride = Stride::new(8 * GRANULE, StrideParity::Odd);
    let mut options = AllocationOptions::contiguous().with_stride(stride);
    let pages = pma
        .allocate_pages(4, PageSize::Size64K, &mut options)
        .expect("strided");
    // BASE is block-aligned, so the first odd block starts at frame 8.
    assert_eq!(frames_of(&pages), [8, 9, 10, 11]);
}

#[test]
fn faster_regions_are_preferred() {
    let pma = common::pma(InitFlags::new());
    let slow = RegionDescriptor::with_frames(addr(0), 16, 1);
    let fast = RegionDescriptor::with_frames(addr(64), 16, 9);
    let protected = RegionDescriptor::with_frames(addr(128), 16, 20).protected();
    pma.register_region(0, false, &slow, &[]).expect("slow");
    pma.register_region(1, false, &fast, &[]).expect("fast");
    pma.register_region(2, false, &protected, &[]).expect("protected");

    let mut options = AllocationOptions::contiguous();
    let pages = pma.allocate_pages(1, PageSize::Size64K, &mut options).expect("fast");
    assert_eq!(frames_of(&pages), [64]);

    let mut options = AllocationOptions::new(AllocationFlags::new().with_prefer_slower(true));
    let pages = pma.allocate_pages(1, PageSize::Size64K, &mut options).expect("slow");
    assert_eq!(frames_of(&pages), [0]);

    let mut options = AllocationOptions::new(AllocationFlags::new().with_protected(true));
    let pages = pma.allocate_pages(1, PageSize::Size64K, &mut options).expect("protected");
    assert_eq!(frames_of(&pages), [128]);

    assert_eq!(pma.total_protected_memory(), 16 * GRANULE);
    assert_eq!(pma.free_protected_memory(), 15 * GRANULE);
    assert_eq!(pma.total_unprotected_memory(), 32 * GRANULE);
    assert_eq!(pma.free_unprotected_memory(), 30 * GRANULE);
    let stats = pma.stats();
    assert_eq!(stats.num_frames_total, 48);
    assert_eq!(stats.num_frames_total_protected, 16);
    assert_eq!(stats.num_free_frames_protected, 15);
}

#[test]
fn persistence_is_reported() {
    let pma = single_region(InitFlags::new().with_force_persistence(true), 16);
    let mut options = AllocationOptions::contiguous();
    pma.allocate_pages(2, PageSize::Size64K, &mut options).expect("persistent");
    assert_eq!(pma.persistent_list(), [DeviceRange::new(addr(0), 2 * GRANULE)]);

    let pma = single_region(InitFlags::new(), 16);
    let mut options = AllocationOptions::new(AllocationFlags::new().with_persistent(true));
    pma.allocate_pages(1, PageSize::Size64K, &mut options).expect("persistent");
    let mut options = AllocationOptions::default();
    pma.allocate_pages(1, PageSize::Size64K, &mut options).expect("plain");
    assert_eq!(pma.persistent_list(), [DeviceRange::new(addr(0), GRANULE)]);
    assert_eq!(pma.allocated_blocks_list(), [DeviceRange::new(addr(0), 2 * GRANULE)]);
}

#[test]
fn largest_free_tracks_the_longest_run() {
    let pma = single_region(InitFlags::new(), 32);
    let mut options = AllocationOptions::contiguous().in_range(addr(4), last(5));
    pma.allocate_pages(1, PageSize::Size64K, &mut options).expect("split");
    assert_eq!(pma.largest_free(), (27 * GRANULE, addr(5)));
}

#[test]
fn malformed_requests_are_rejected() {
    let pma = single_region(InitFlags::new(), 64);
    let reject = |count: usize, size: PageSize, mut options: AllocationOptions| {
        matches!(
            pma.allocate_pages(count, size, &mut options),
            Err(PmaError::InvalidArgument(_))
        )
    };

    assert!(reject(0, PageSize::Size64K, AllocationOptions::default()));
    assert!(reject(
        1,
        PageSize::Size64K,
        AllocationOptions::new(AllocationFlags::new().with_turn_blacklist_off(true))
    ));
    assert!(reject(1, PageSize::Size64K, AllocationOptions::contiguous().aligned_to(3 * GRANULE)));
    assert!(reject(1, PageSize::Size64K, AllocationOptions::default().aligned_to(MB2)));
    assert!(reject(1, PageSize::Size64K, AllocationOptions::default().in_range(addr(8), last(4))));
    assert!(reject(
        1,
        PageSize::Size64K,
        AllocationOptions::default().in_range(DeviceAddress::new(BASE + 1), last(4))
    ));
    assert_eq!(free_frames(&pma), 64);
}

#[test]
fn free_accepts_whole_runs_and_checks_addresses() {
    let pma = single_region(InitFlags::new(), 16);
    let mut options = AllocationOptions::contiguous();
    let pages = pma.allocate_pages(3, PageSize::Size64K, &mut options).expect("run");
    assert_eq!(free_frames(&pma), 13);

    assert!(matches!(
        pma.free_pages(&[addr(40)], GRANULE, FreeFlags::new()),
        Err(PmaError::InvalidArgument(_))
    ));
    assert!(matches!(
        pma.free_pages(&[addr(0), addr(1)], 3 * GRANULE, FreeFlags::new()),
        Err(PmaError::InvalidArgument(_))
    ));

    pma.free_pages(&pages[..1], 3 * GRANULE, FreeFlags::new()).expect("free run");
    assert_eq!(free_frames(&pma), 16);
    assert!(pma.free_pages(&[], GRANULE, FreeFlags::new()).is_ok());
}

#[test]
fn observer_sees_every_change() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    let pma = single_region(InitFlags::new(), 16);
    let seen = Arc::new(AtomicU64::new(u64::MAX));
    let sink = seen.clone();
    pma.register_update_stats_callback(Arc::new(move |free: u64| {
        sink.store(free, Ordering::SeqCst);
    }));
    assert_eq!(seen.load(Ordering::SeqCst), 16);

    let mut options = AllocationOptions::default();
    let pages = pma.allocate_pages(5, PageSize::Size64K, &mut options).expect("alloc");
    assert_eq!(seen.load(Ordering::SeqCst), 11);

    pma.free_pages(&pages, GRANULE, FreeFlags::new()).expect("free");
    assert_eq!(seen.load(Ordering::SeqCst), 16);
}
