//! Device memory caching and residency tracking
//!
//! - [`registry`]: process-wide record of every live device and pinned-host buffer
//! - [`allocator`]: caching allocate/release façade over a [`DeviceRuntime`]
//! - [`reclaim`]: physical release of cached buffers (`clear_cache`, `shutdown`)
//! - [`transfer`]: fills and copies on registered buffers
//!
//! [`DeviceRuntime`]: crate::backend::DeviceRuntime

pub mod allocator;
pub mod reclaim;
pub mod registry;
pub mod transfer;

pub use allocator::{AllocatorStats, CachingAllocator};
pub use reclaim::{ReclaimStats, ShutdownReport};
pub use registry::{RegistryStats, ResidencyRegistry};

use std::fmt;

use crate::device::{DeviceId, WorkerId};

/// Memory space a buffer lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    /// Accelerator memory
    Device,
    /// Page-locked host memory
    HostPinned,
}

impl fmt::Display for Residency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Residency::Device => write!(f, "device"),
            Residency::HostPinned => write!(f, "pinned-host"),
        }
    }
}

/// One live or cached buffer known to the registry
///
/// Only `free` and `owning_thread` change after creation. `free` is only ever
/// set on device records; pinned-host buffers are never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub address: usize,
    pub length: usize,
    pub residency: Residency,
    pub free: bool,
    pub owning_device: DeviceId,
    pub owning_thread: WorkerId,
}

impl AllocationRecord {
    /// New in-use record
    pub fn new(
        address: usize,
        length: usize,
        residency: Residency,
        owning_device: DeviceId,
        owning_thread: WorkerId,
    ) -> Self {
        Self {
            address,
            length,
            residency,
            free: false,
            owning_device,
            owning_thread,
        }
    }

    /// One past the last byte
    pub fn end(&self) -> usize {
        self.address + self.length
    }

    /// Half-open containment: `address <= ptr < address + length`
    pub fn contains(&self, ptr: usize) -> bool {
        ptr >= self.address && ptr < self.end()
    }

    /// Device record available for reuse
    pub fn is_cached(&self) -> bool {
        self.free && self.residency == Residency::Device
    }
}

/// Restricts a registry scan to one worker's records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadFilter {
    /// Any owner
    Any,
    /// Records owned by this worker only
    Only(WorkerId),
}

impl ThreadFilter {
    /// Does `owner` pass the filter
    pub fn matches(&self, owner: WorkerId) -> bool {
        match self {
            ThreadFilter::Any => true,
            ThreadFilter::Only(worker) => *worker == owner,
        }
    }
}

/// Restricts a registry scan to one device's records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFilter {
    /// Any device
    Any,
    /// Records on this device only
    Only(DeviceId),
}

impl DeviceFilter {
    /// Does `device` pass the filter
    pub fn matches(&self, device: DeviceId) -> bool {
        match self {
            DeviceFilter::Any => true,
            DeviceFilter::Only(id) => *id == device,
        }
    }
}
