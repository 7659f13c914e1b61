//! Device runtime interface
//!
//! The allocator never talks to a driver directly; it goes through
//! [`DeviceRuntime`]. Two implementations ship with the crate:
//!
//! - [`HostRuntime`]: host-memory stand-in for tests and GPU-less machines
//! - `HipRuntime` (feature `rocm`): AMD HIP runtime via FFI
//!
//! Addresses are plain `usize` values. `0` is the null address and is never
//! handed out by a runtime.

pub mod host_runtime;

#[cfg(feature = "rocm")]
pub mod hip;

pub use host_runtime::{HostRuntime, RuntimeStats};

#[cfg(feature = "rocm")]
pub use hip::HipRuntime;

use std::fmt::Debug;

use crate::device::DeviceId;
use crate::error::DevCacheResult;

/// Free and total memory of one device, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryInfo {
    pub free: usize,
    pub total: usize,
}

impl MemoryInfo {
    /// Bytes currently allocated on the device
    pub fn used(&self) -> usize {
        self.total.saturating_sub(self.free)
    }
}

/// Physical operations of an accelerator runtime
///
/// Implementations must be callable from any thread. `malloc`/`free` take the
/// target device explicitly so callers never depend on the runtime's own notion
/// of a current device.
pub trait DeviceRuntime: Send + Sync + Debug {
    /// Short runtime name for logs
    fn name(&self) -> &'static str;

    /// Number of visible devices
    fn device_count(&self) -> DevCacheResult<usize>;

    /// Make `device` current for the calling thread
    fn set_device(&self, device: DeviceId) -> DevCacheResult<()>;

    /// Can `device` directly address memory owned by `peer`
    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> DevCacheResult<bool>;

    /// Let `device` address memory owned by `peer`; already-enabled is success
    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> DevCacheResult<()>;

    /// Free and total memory of `device`
    fn memory_info(&self, device: DeviceId) -> DevCacheResult<MemoryInfo>;

    /// Allocate `size` bytes of device memory on `device`
    fn malloc(&self, device: DeviceId, size: usize) -> DevCacheResult<usize>;

    /// Release device memory previously returned by `malloc`
    fn free(&self, device: DeviceId, address: usize) -> DevCacheResult<()>;

    /// Allocate `size` bytes of page-locked host memory
    fn host_alloc(&self, size: usize) -> DevCacheResult<usize>;

    /// Release memory previously returned by `host_alloc`
    fn host_free(&self, address: usize) -> DevCacheResult<()>;

    /// Zero `len` bytes starting at `address`
    fn memset_zero(&self, address: usize, len: usize) -> DevCacheResult<()>;

    /// Copy `src` into memory starting at `dst`
    fn copy_from_host(&self, dst: usize, src: &[u8]) -> DevCacheResult<()>;

    /// Copy `dst.len()` bytes starting at `src` into `dst`
    fn copy_to_host(&self, dst: &mut [u8], src: usize) -> DevCacheResult<()>;

    /// Copy `len` bytes between two runtime-owned regions
    fn copy(&self, dst: usize, src: usize, len: usize) -> DevCacheResult<()>;

    /// Copy `height` rows of `width` bytes between pitched regions
    fn copy_2d(
        &self,
        dst: usize,
        dst_pitch: usize,
        src: usize,
        src_pitch: usize,
        width: usize,
        height: usize,
    ) -> DevCacheResult<()> {
        for row in 0..height {
            self.copy(dst + row * dst_pitch, src + row * src_pitch, width)?;
        }
        Ok(())
    }

    /// Release every device allocation and reset device state
    fn reset(&self) -> DevCacheResult<()>;
}
