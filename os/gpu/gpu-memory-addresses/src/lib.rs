//! # Device Memory Address Types
//!
//! Strongly typed wrappers for device (video) memory addresses, address ranges
//! and the page sizes the physical memory allocator hands out.
//!
//! ## Overview
//!
//! | Type              | Description                                                         |
//! |-------------------|---------------------------------------------------------------------|
//! | [`DeviceAddress`] | A raw 64-bit address in device memory.                              |
//! | [`DeviceRange`]   | A `[base, base + size)` span of device memory.                      |
//! | [`PageSize`]      | One of the four allocation page sizes (64K, 128K, 2M, 512M).        |
//!
//! ## Granularity
//!
//! Device memory is tracked in frames of [`GRANULE`] bytes (64 KiB). Every page
//! size is a whole number of frames, and every region base and limit the
//! allocator accepts is granule aligned.
//!
//! | Page size          | Bytes           | Frames    |
//! |--------------------|-----------------|-----------|
//! | [`PageSize::Size64K`]  | `65_536`        | 1         |
//! | [`PageSize::Size128K`] | `131_072`       | 2         |
//! | [`PageSize::Size2M`]   | `2_097_152`     | 32        |
//! | [`PageSize::Size512M`] | `536_870_912`   | 8192      |
//!
//! ## Typical Usage
//!
//! ```rust
//! # use gpu_memory_addresses::*;
//! let addr = DeviceAddress::new(0x0020_1234);
//! assert_eq!(addr.align_down(PageSize::Size2M.bytes()).as_u64(), 0x0020_0000);
//!
//! let size = PageSize::try_from(0x2_0000).unwrap();
//! assert_eq!(size, PageSize::Size128K);
//! assert_eq!(size.frames(), 2);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod device_address;
mod device_range;
mod page_size;

pub use device_address::DeviceAddress;
pub use device_range::DeviceRange;
pub use page_size::{PageSize, PageSizeError};

/// log2 of the frame granule.
pub const GRANULE_SHIFT: u32 = 16;

/// Size of one tracked frame in bytes (64 KiB).
pub const GRANULE: u64 = 1 << GRANULE_SHIFT;

/// Number of frames in one 2 MiB large page.
pub const FRAMES_PER_LARGE_PAGE: u64 = PageSize::Size2M.frames();

const _: () = {
    assert!(GRANULE == PageSize::Size64K.bytes());
    assert!(FRAMES_PER_LARGE_PAGE == 32);
};

/// Returns `true` if `value` is a multiple of [`GRANULE`].
#[inline]
#[must_use]
pub const fn is_granule_aligned(value: u64) -> bool {
    value & (GRANULE - 1) == 0
}

/// Converts a byte count to a frame count, rounding down.
#[inline]
#[must_use]
pub const fn bytes_to_frames(bytes: u64) -> u64 {
    bytes >> GRANULE_SHIFT
}

/// Converts a frame count to a byte count.
#[inline]
#[must_use]
pub const fn frames_to_bytes(frames: u64) -> u64 {
    frames << GRANULE_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granule_helpers() {
        assert!(is_granule_aligned(0));
        assert!(is_granule_aligned(0x3_0000));
        assert!(!is_granule_aligned(0x3_0001));
        assert_eq!(bytes_to_frames(0x10_0000), 16);
        assert_eq!(frames_to_bytes(16), 0x10_0000);
    }
}
