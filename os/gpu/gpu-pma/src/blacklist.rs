//! Bad-frame tracking.
//!
//! Every blacklisted frame has one [`BlacklistChunk`]. While a chunk is
//! `valid` its frame carries the BLACKLIST bit in the region bitmap. A
//! blacklist-off allocation hands blacklisted frames to a client; their chunks
//! become invalid until the allocation is freed.

use crate::PmaError;
use alloc::vec::Vec;
use gpu_memory_addresses::{DeviceAddress, DeviceRange, GRANULE};

/// One blacklisted frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlacklistChunk {
    /// Frame-aligned address.
    pub address: DeviceAddress,
    /// Added at run time rather than at region registration.
    pub dynamic: bool,
    /// `false` while the frame is handed out by a blacklist-off allocation.
    pub valid: bool,
}

/// Bytes excluded by the blacklist, by origin.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct BlacklistSize {
    pub static_bytes: u64,
    pub dynamic_bytes: u64,
}

impl BlacklistSize {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.static_bytes + self.dynamic_bytes
    }
}

/// Fixed-capacity list of blacklisted frames.
#[derive(Debug, Clone)]
pub struct BlacklistTracker {
    chunks: Vec<BlacklistChunk>,
    capacity: usize,
}

impl BlacklistTracker {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: Vec::new(),
            capacity,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Entries that can still be added.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.chunks.len()
    }

    #[must_use]
    pub fn chunks(&self) -> &[BlacklistChunk] {
        &self.chunks
    }

    #[must_use]
    pub fn contains(&self, address: DeviceAddress) -> bool {
        let address = address.align_down(GRANULE);
        self.chunks.iter().any(|chunk| chunk.address == address)
    }

    /// Tracks the frame holding `address`.
    ///
    /// Returns `Ok(false)` if the frame is already tracked and
    /// [`PmaError::NoMemory`] if the tracker is full.
    pub fn insert(&mut self, address: DeviceAddress, dynamic: bool) -> Result<bool, PmaError> {
        if self.contains(address) {
            return Ok(false);
        }
        if self.remaining() == 0 {
            return Err(PmaError::NoMemory);
        }
        self.chunks.push(BlacklistChunk {
            address: address.align_down(GRANULE),
            dynamic,
            valid: true,
        });
        Ok(true)
    }

    /// Invalidates every valid chunk inside `range`; returns their addresses.
    pub fn lift(&mut self, range: DeviceRange) -> Vec<DeviceAddress> {
        self.flip(range, true)
    }

    /// Revalidates every lifted chunk inside `range`; returns their addresses.
    pub fn restore(&mut self, range: DeviceRange) -> Vec<DeviceAddress> {
        self.flip(range, false)
    }

    fn flip(&mut self, range: DeviceRange, from_valid: bool) -> Vec<DeviceAddress> {
        self.chunks
            .iter_mut()
            .filter(|chunk| chunk.valid == from_valid && range.contains(chunk.address))
            .map(|chunk| {
                chunk.valid = !from_valid;
                chunk.address
            })
            .collect()
    }

    /// Blacklisted frames currently owned by a client allocation.
    #[must_use]
    pub fn client_pages(&self) -> Vec<DeviceAddress> {
        self.chunks
            .iter()
            .filter(|chunk| !chunk.valid)
            .map(|chunk| chunk.address)
            .collect()
    }

    #[must_use]
    pub fn size(&self) -> BlacklistSize {
        self.chunks.iter().fold(BlacklistSize::default(), |mut size, chunk| {
            if chunk.dynamic {
                size.dynamic_bytes += GRANULE;
            } else {
                size.static_bytes += GRANULE;
            }
            size
        })
    }
}
