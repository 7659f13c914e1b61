//! Fills and copies on registered buffers
//!
//! Every runtime-side address must fall inside a registered allocation that is
//! still in use, and the whole byte range must fit in it; the runtime is only
//! called once that holds.

use super::allocator::CachingAllocator;
use super::AllocationRecord;
use crate::error::{DevCacheError, DevCacheResult};

impl CachingAllocator {
    /// Zero `len` bytes starting at `address`
    pub fn clear(&self, address: usize, len: usize) -> DevCacheResult<()> {
        self.check_range(address, len)?;
        self.runtime().memset_zero(address, len)
    }

    /// Upload `src` to `dst`
    pub fn copy_to_device(&self, dst: usize, src: &[u8]) -> DevCacheResult<()> {
        self.check_range(dst, src.len())?;
        self.runtime().copy_from_host(dst, src)
    }

    /// Download `dst.len()` bytes from `src`
    pub fn copy_to_host(&self, dst: &mut [u8], src: usize) -> DevCacheResult<()> {
        self.check_range(src, dst.len())?;
        self.runtime().copy_to_host(dst, src)
    }

    /// Copy `len` bytes between registered buffers
    pub fn copy(&self, dst: usize, src: usize, len: usize) -> DevCacheResult<()> {
        self.check_range(src, len)?;
        self.check_range(dst, len)?;
        self.runtime().copy(dst, src, len)
    }

    /// Copy a `[width, height]` block of bytes between pitched buffers
    ///
    /// Row `i` starts at `src + i * src_pitch` and lands at `dst + i * dst_pitch`.
    pub fn copy_strided(
        &self,
        shape: [usize; 2],
        dst: usize,
        dst_pitch: usize,
        src: usize,
        src_pitch: usize,
    ) -> DevCacheResult<()> {
        let [width, height] = shape;
        if width == 0 || height == 0 {
            return Ok(());
        }

        self.check_range(src, pitched_extent(width, height, src_pitch))?;
        self.check_range(dst, pitched_extent(width, height, dst_pitch))?;
        self.runtime()
            .copy_2d(dst, dst_pitch, src, src_pitch, width, height)
    }

    fn check_range(&self, address: usize, len: usize) -> DevCacheResult<AllocationRecord> {
        let record = self
            .lookup(address)
            .ok_or_else(|| self.violation(DevCacheError::UnknownAddress { address }))?;

        // Cached buffers may be handed to another worker at any moment.
        if record.free {
            return Err(self.violation(DevCacheError::UseAfterRelease {
                address,
                base: record.address,
            }));
        }

        if address.checked_add(len).map_or(true, |end| end > record.end()) {
            return Err(self.violation(DevCacheError::OutOfBounds {
                address,
                len,
                base: record.address,
                length: record.length,
            }));
        }
        Ok(record)
    }
}

/// Bytes spanned by `height` rows of `width` bytes at `pitch`
fn pitched_extent(width: usize, height: usize, pitch: usize) -> usize {
    (height - 1) * pitch + width
}
