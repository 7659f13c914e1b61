//! devcache - device memory caching allocator and residency tracker
//!
//! Every device and pinned-host allocation goes through a [`CachingAllocator`].
//! Released device buffers are cached for reuse instead of being handed back to
//! the runtime, and any pointer can be asked whether it is device-resident or
//! known at all, which is how kernel tables choose between device and host code.
//!
//! The accelerator itself sits behind the [`DeviceRuntime`] trait: a host-memory
//! simulation ships by default, the HIP runtime with the `rocm` feature.

pub mod backend;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod global;
pub mod logging;
pub mod memory;

pub use backend::{DeviceRuntime, HostRuntime, MemoryInfo};
pub use config::{CacheConfig, ConsistencyPolicy};
pub use device::{DeviceContext, DeviceId, PeerAccessMatrix, WorkerId};
pub use dispatch::ExecutionPath;
pub use error::{DevCacheError, DevCacheResult, ErrorCategory};
pub use memory::{
    AllocationRecord, AllocatorStats, CachingAllocator, ReclaimStats, RegistryStats, Residency,
    ShutdownReport,
};

#[cfg(feature = "rocm")]
pub use backend::HipRuntime;
