mod common;

use common::{
    EvictCall, StubEvictor, addr, free_frames, frames_of, last, single_region, unpinned_at,
    unpinned_run,
};
use gpu_pma::{
    AllocationFlags, AllocationOptions, DeviceRange, ErrorClass, FreeFlags, GRANULE, InitFlags,
    PageSize, PmaError, RegionDescriptor,
};

#[test]
fn contiguous_allocation_starts_at_region_base() {
    let pma = single_region(InitFlags::new(), 16);
    assert_eq!(free_frames(&pma), 16);

    let mut options = AllocationOptions::contiguous();
    let pages = pma
        .allocate_pages(4, PageSize::Size64K, &mut options)
        .expect("allocation");

    assert_eq!(frames_of(&pages), [0, 1, 2, 3]);
    assert_eq!(options.num_pages_allocated, 4);
    assert!(!options.result_flags.partial());
    assert_eq!(free_frames(&pma), 12);
    assert_eq!(pma.allocated_blocks_list(), [DeviceRange::new(addr(0), 4 * GRANULE)]);
    // Pinned frames cannot be pinned again.
    assert!(matches!(
        pma.pin_pages(&pages, PageSize::Size64K),
        Err(PmaError::InvalidState(_))
    ));
    assert!(pma.state_check());
}

#[test]
fn pinned_region_without_eviction_is_out_of_memory() {
    let pma = single_region(InitFlags::new(), 16);
    let mut fill = AllocationOptions::contiguous();
    pma.allocate_pages(16, PageSize::Size64K, &mut fill)
        .expect("fill");

    let mut options = AllocationOptions::new(AllocationFlags::new().with_dont_evict(true));
    let err = pma
        .allocate_pages(1, PageSize::Size64K, &mut options)
        .unwrap_err();
    assert_eq!(err, PmaError::NoMemory);
    assert_eq!(err.class(), ErrorClass::ResourceExhaustion);

    // Pinned frames are not evictable either.
    let _evictor = StubEvictor::register(&pma);
    let mut options = AllocationOptions::default();
    assert_eq!(
        pma.allocate_pages(1, PageSize::Size64K, &mut options),
        Err(PmaError::NoMemory)
    );
    assert_eq!(free_frames(&pma), 0);
}

#[test]
fn unpinned_region_is_evicted_for_a_single_page() {
    let pma = single_region(InitFlags::new(), 16);
    let evictor = StubEvictor::register(&pma);
    let run = unpinned_run(&pma, 0, 16);
    evictor.track(run, 16 * GRANULE);
    assert_eq!(free_frames(&pma), 0);

    let mut options = AllocationOptions::contiguous();
    let pages = pma
        .allocate_pages(1, PageSize::Size64K, &mut options)
        .expect("allocation after eviction");

    assert_eq!(frames_of(&pages), [0]);
    assert_eq!(
        evictor.calls(),
        [EvictCall::Range {
            begin: addr(0),
            end: last(1)
        }]
    );
    // The evicted allocation released all 16 frames; one is granted again.
    assert_eq!(free_frames(&pma), 15);
    assert!(matches!(
        pma.pin_pages(&pages, PageSize::Size64K),
        Err(PmaError::InvalidState(_))
    ));
    assert!(pma.state_check());

    pma.unregister_eviction_client();
}

#[test]
fn discontiguous_request_uses_free_pages_then_evicts() {
    let pma = single_region(InitFlags::new(), 16);
    let evictor = StubEvictor::register(&pma);

    let mut fill = AllocationOptions::default();
    let all = pma
        .allocate_pages(16, PageSize::Size64K, &mut fill)
        .expect("fill");
    for frame in [0, 1, 5] {
        pma.free_pages(&all[frame..=frame], GRANULE, FreeFlags::new())
            .expect("free");
    }
    let victim = unpinned_at(&pma, 5);
    evictor.track(victim, GRANULE);
    assert_eq!(free_frames(&pma), 2);

    let mut options = AllocationOptions::default();
    let pages = pma
        .allocate_pages(3, PageSize::Size64K, &mut options)
        .expect("allocation");

    assert_eq!(frames_of(&pages), [0, 1, 5]);
    assert_eq!(
        evictor.calls(),
        [EvictCall::Pages {
            pages: vec![addr(5)],
            begin: addr(0),
            end: last(16)
        }]
    );
    assert_eq!(evictor.owned(), 0);
    assert_eq!(free_frames(&pma), 0);
    assert!(pma.state_check());

    pma.unregister_eviction_client();
}

#[test]
fn region_ids_must_be_dense() {
    let pma = common::pma(InitFlags::new());
    pma.register_region(0, false, &RegionDescriptor::with_frames(addr(0), 16, 0), &[])
        .expect("region 0");

    let err = pma
        .register_region(2, false, &RegionDescriptor::with_frames(addr(64), 16, 0), &[])
        .unwrap_err();
    assert!(matches!(err, PmaError::InvalidArgument(_)));
    assert_eq!(err.class(), ErrorClass::CallerError);
    assert_eq!(pma.region_info().len(), 1);
}
