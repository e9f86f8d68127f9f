use super::Pma;
use crate::{BlacklistSize, PageStatus, PmaError};
use alloc::vec::Vec;
use gpu_memory_addresses::{DeviceAddress, GRANULE};
use log::{info, warn};

impl Pma {
    /// Blacklists the frame containing `address` at run time.
    ///
    /// Adding a frame that is already tracked does nothing. An allocated
    /// frame keeps its owner; it is excluded once freed. In OS-passthrough
    /// mode the frame is also offlined in the OS.
    ///
    /// # Errors
    /// - [`PmaError::InvalidArgument`] if `address` is outside every region.
    /// - [`PmaError::NoMemory`] if the blacklist is full.
    pub fn add_to_blacklist_tracking(&self, address: DeviceAddress) -> Result<(), PmaError> {
        let frame_addr = address.align_down(GRANULE);

        let mut state = self.state.lock();
        let (id, frame) = state
            .locate(frame_addr)
            .ok_or(PmaError::InvalidArgument("address is outside every region"))?;
        if !state.blacklist.insert(frame_addr, true)? {
            return Ok(());
        }
        state.regions[id]
            .map
            .change_state_attrib(frame, PageStatus::BLACKLIST, PageStatus::BLACKLIST);
        state.notify();
        let offline = state.numa.onlined;
        drop(state);
        info!("frame {frame_addr} blacklisted in region {id}");

        if offline
            && let Some(backend) = &self.numa_backend
            && let Err(err) = backend.offline_pages(frame_addr)
        {
            warn!("offlining blacklisted frame {frame_addr} failed: {err}");
        }
        Ok(())
    }

    /// Blacklisted frames currently owned by blacklist-off allocations.
    #[must_use]
    pub fn client_blacklisted_pages(&self) -> Vec<DeviceAddress> {
        self.state.lock().blacklist.client_pages()
    }

    #[must_use]
    pub fn blacklist_size(&self) -> BlacklistSize {
        self.state.lock().blacklist.size()
    }
}
