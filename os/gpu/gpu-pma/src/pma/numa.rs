use super::Pma;
use super::allocate::Request;
use super::free::locate_all;
use crate::consts::NUMA_EXPECTED_REF_COUNT;
use crate::regmap::ScanRequest;
use crate::selector::select_regions;
use crate::{AllocationOptions, AllocationResultFlags, NumaBackend, NumaError, PageStatus, PmaError};
use alloc::vec;
use alloc::vec::Vec;
use gpu_memory_addresses::{DeviceAddress, PageSize, frames_to_bytes};
use gpu_sync::SpinLockGuard;
use log::{debug, warn};

impl Pma {
    fn backend(&self) -> Result<&dyn NumaBackend, PmaError> {
        self.numa_backend
            .as_deref()
            .ok_or(PmaError::InvalidState("no NUMA backend"))
    }

    /// Allocation in OS-passthrough mode: pages come from the backend and are
    /// only recorded in the bitmap.
    pub(super) fn numa_allocate(
        &self,
        count: usize,
        page_size: PageSize,
        options: &mut AllocationOptions,
    ) -> Result<Vec<DeviceAddress>, PmaError> {
        let flags = options.flags;
        if flags.reverse() || flags.turn_blacklist_off() || options.range.is_some() {
            return Err(PmaError::InvalidArgument(
                "reverse, blacklist-off and ranged allocations are not supported in NUMA mode",
            ));
        }
        let req = Request::validate(count, page_size, options, self.flags, false)?;
        let backend = self.backend()?;
        let node = {
            let state = self.state.lock();
            if !state.numa.onlined {
                return Err(PmaError::InvalidState("NUMA node is not onlined"));
            }
            state.numa.node
        };
        let try_evict = !flags.dont_evict();

        let pages = if req.contiguous {
            let base = match backend.allocate_pages(node, page_size, count, true) {
                Ok(pages) => pages.first().copied().ok_or(PmaError::NoMemory)?,
                Err(NumaError::OutOfMemory) if try_evict => self.numa_evict(&req, options)?,
                Err(err) => return Err(err.into()),
            };
            if !base.is_aligned(req.alignment) {
                warn!("NUMA backend returned misaligned run at {base}");
                self.numa_release(&req, &[base]);
                return Err(PmaError::NoMemory);
            }
            vec![base]
        } else {
            let single = Request {
                count: 1,
                contiguous: true,
                ..req.clone()
            };
            let mut pages = Vec::with_capacity(count);
            while pages.len() < count {
                let page = match backend.allocate_pages(node, page_size, 1, false) {
                    Ok(got) => got.first().copied(),
                    Err(NumaError::OutOfMemory) if try_evict => {
                        self.numa_evict(&single, options).ok()
                    }
                    Err(_) => None,
                };
                let Some(page) = page else {
                    break;
                };
                pages.push(page);
            }
            pages
        };

        let partial = pages.len() < count && !req.contiguous;
        if partial && (!req.allow_partial || pages.is_empty()) {
            debug!("NUMA allocation of {count} x {page_size} pages: out of memory");
            self.numa_release(&req, &pages);
            return Err(PmaError::NoMemory);
        }

        let block = req.run_frames();
        let keep_blacklist = PageStatus::MAP_MASK.difference(PageStatus::BLACKLIST);
        let mut state = self.state.lock();
        let blocks = match locate_all(&state, &pages, block) {
            Ok(blocks) => blocks,
            Err(err) => {
                drop(state);
                warn!("NUMA backend returned memory outside every region");
                self.numa_release(&req, &pages);
                return Err(err);
            }
        };
        for &(id, frame) in &blocks {
            state.regions[id]
                .map
                .change_block_state_attrib(frame, block, req.commit, keep_blacklist);
        }
        state.notify();
        drop(state);

        let granted = if req.contiguous {
            req.expand(pages[0])
        } else {
            pages
        };
        options.num_pages_allocated = granted.len() as u64;
        options.result_flags = AllocationResultFlags::new().with_partial(partial);
        debug!("NUMA allocated {} of {count} x {page_size} pages", granted.len());
        Ok(granted)
    }

    /// Evicts an all-UNPIN run for `req` and keeps its frames from going back
    /// to the OS. On success the run is FREE and REUSE-PENDING.
    fn numa_evict(
        &self,
        req: &Request,
        options: &AllocationOptions,
    ) -> Result<DeviceAddress, PmaError> {
        let backend = self.backend()?;
        let mut state = self.state.lock();
        let Some(client) = state.evictor.clone() else {
            return Err(PmaError::NoMemory);
        };

        let order = select_regions(state.regions.iter().map(|r| &r.desc), options);
        let found = order.into_iter().find_map(|id| {
            let region = &state.regions[id];
            let scan = ScanRequest {
                frames: region.frame_window(None)?,
                num_pages: req.count,
                page_size: req.page_size,
                alignment: req.alignment,
                stride: req.stride,
                reverse: false,
                skip_evict: false,
                ignore_blacklist: false,
            };
            region.map.scan_contiguous_numa_eviction(&scan).map(|begin| (id, begin))
        });
        let Some((id, begin)) = found else {
            debug!("no evictable run for {} x {} pages", req.count, req.page_size);
            return Err(PmaError::NoMemory);
        };

        let len = req.run_frames();
        let frame = state.regions[id].map.frame_of(begin);
        let end = begin + (frames_to_bytes(len) - 1);
        let protection = state.regions[id].desc.protection();
        Self::mark_evicting(&mut state, id, &[(frame, len)], true);
        debug!("NUMA evicting range {begin}..={end}");

        let evicted =
            SpinLockGuard::unlocked(&mut state, || client.evict_range(begin, end, protection));
        if let Err(err) = &evicted {
            warn!("NUMA range eviction {begin}..={end} failed: {err}");
        }

        let map = &state.regions[id].map;
        let parked = (frame..frame + len).all(|f| {
            let status = map.read(f, true);
            status.is_free() && status.reuse_pending()
        });
        Self::mark_evicting(&mut state, id, &[(frame, len)], false);
        drop(state);

        let referenced = parked
            && evicted.is_ok()
            && req
                .expand(begin)
                .into_iter()
                .any(|page| backend.page_ref_count(page) != NUMA_EXPECTED_REF_COUNT);

        if evicted.is_err() || !parked || referenced {
            if referenced {
                warn!("NUMA eviction {begin}..={end}: frames still referenced by the OS");
            }
            self.numa_return_parked(id, frame, len);
            return Err(PmaError::NoMemory);
        }
        Ok(begin)
    }

    /// Hands every REUSE-PENDING frame of `[frame, frame + len)` of region
    /// `id` back to the OS.
    fn numa_return_parked(&self, id: usize, frame: u64, len: u64) {
        let mut state = self.state.lock();
        let Some(region) = state.regions.get_mut(id) else {
            return;
        };
        let map = &mut region.map;
        let parked: Vec<DeviceAddress> = (frame..frame + len)
            .filter(|&f| map.read(f, true).reuse_pending())
            .map(|f| map.address_of(f))
            .collect();
        for &addr in &parked {
            let f = map.frame_of(addr);
            map.change_state_attrib(f, PageStatus::FREE, PageStatus::REUSE_PENDING);
        }
        drop(state);

        if !parked.is_empty()
            && let Ok(backend) = self.backend()
        {
            backend.free_pages(PageSize::Size64K, &parked);
        }
    }

    /// Gives pages obtained for a failed request back to the OS, including
    /// frames parked by an eviction.
    fn numa_release(&self, req: &Request, pages: &[DeviceAddress]) {
        if pages.is_empty() {
            return;
        }
        let block = req.run_frames();
        {
            let mut state = self.state.lock();
            for &page in pages {
                if let Some((id, frame)) = state.locate_block(page, block) {
                    state.regions[id].map.change_block_state_attrib(
                        frame,
                        block,
                        PageStatus::FREE,
                        PageStatus::REUSE_PENDING,
                    );
                }
            }
        }
        let all: Vec<DeviceAddress> = if req.contiguous {
            pages.iter().flat_map(|&base| req.expand(base)).collect()
        } else {
            pages.to_vec()
        };
        if let Ok(backend) = self.backend() {
            backend.free_pages(req.page_size, &all);
        }
    }

    /// Free in OS-passthrough mode.
    ///
    /// Frames under eviction are parked REUSE-PENDING for the evicting
    /// allocation; the rest go back to the OS unless blacklisted.
    pub(super) fn numa_free(
        &self,
        pages: &[DeviceAddress],
        frames_per_block: u64,
    ) -> Result<(), PmaError> {
        let backend = self.backend()?;
        let mut returned = Vec::new();
        {
            let mut state = self.state.lock();
            let blocks = locate_all(&state, pages, frames_per_block)?;
            for (id, first) in blocks {
                let map = &mut state.regions[id].map;
                for f in first..first + frames_per_block {
                    let status = map.read(f, true);
                    if status.evicting() {
                        map.change_state_attrib(
                            f,
                            PageStatus::REUSE_PENDING,
                            PageStatus::STATE_MASK | PageStatus::REUSE_PENDING,
                        );
                    } else {
                        map.change_state_attrib(
                            f,
                            PageStatus::FREE,
                            PageStatus::MAP_MASK.difference(PageStatus::BLACKLIST),
                        );
                        if !status.blacklist() {
                            returned.push(map.address_of(f));
                        }
                    }
                }
            }
            state.notify();
        }

        if !returned.is_empty() {
            backend.free_pages(PageSize::Size64K, &returned);
        }
        debug!("NUMA freed {} blocks, {} frames returned to the OS", pages.len(), returned.len());
        Ok(())
    }
}
