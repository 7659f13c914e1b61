//! Process-wide allocator
//!
//! One registry and one caching switch per process. Install a configured
//! allocator up front with [`install`], or let the first use build one from
//! [`CacheConfig::from_env`]:
//!
//! - feature `rocm`: over [`HipRuntime`](crate::backend::HipRuntime)
//! - otherwise: over a single-device [`HostRuntime`]
//!
//! The free functions forward to that instance.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::backend::DeviceRuntime;
use crate::config::CacheConfig;
use crate::device::DeviceId;
use crate::error::{DevCacheError, DevCacheResult};
use crate::memory::{CachingAllocator, ReclaimStats, ShutdownReport};

static GLOBAL_ALLOCATOR: OnceCell<CachingAllocator> = OnceCell::new();

/// Install `allocator` as the process-wide instance
///
/// # Errors
///
/// `AlreadyInstalled` if an instance exists, whether installed explicitly or
/// created lazily by an earlier call.
pub fn install(allocator: CachingAllocator) -> DevCacheResult<&'static CachingAllocator> {
    GLOBAL_ALLOCATOR
        .try_insert(allocator)
        .map_err(|_| DevCacheError::AlreadyInstalled)
}

/// The process-wide allocator, created from the environment on first use
pub fn allocator() -> DevCacheResult<&'static CachingAllocator> {
    GLOBAL_ALLOCATOR.get_or_try_init(|| {
        let config = CacheConfig::from_env()?;
        let runtime = default_runtime()?;
        tracing::info!(runtime = runtime.name(), caching = config.caching, "installing process-wide allocator");
        Ok(CachingAllocator::new(runtime, config))
    })
}

/// Has a process-wide allocator been created
pub fn is_installed() -> bool {
    GLOBAL_ALLOCATOR.get().is_some()
}

#[cfg(feature = "rocm")]
fn default_runtime() -> DevCacheResult<Arc<dyn DeviceRuntime>> {
    Ok(Arc::new(crate::backend::HipRuntime::new()?))
}

#[cfg(not(feature = "rocm"))]
fn default_runtime() -> DevCacheResult<Arc<dyn DeviceRuntime>> {
    Ok(Arc::new(crate::backend::HostRuntime::default()))
}

/// [`CachingAllocator::allocate`] on the process-wide allocator
pub fn allocate(size: usize) -> DevCacheResult<usize> {
    allocator()?.allocate(size)
}

/// [`CachingAllocator::release`] on the process-wide allocator
pub fn release(address: usize) -> DevCacheResult<()> {
    allocator()?.release(address)
}

/// [`CachingAllocator::allocate_pinned_host`] on the process-wide allocator
pub fn allocate_pinned_host(size: usize) -> DevCacheResult<usize> {
    allocator()?.allocate_pinned_host(size)
}

/// [`CachingAllocator::release_pinned_host`] on the process-wide allocator
pub fn release_pinned_host(address: usize) -> DevCacheResult<()> {
    allocator()?.release_pinned_host(address)
}

/// [`CachingAllocator::is_device_resident`]; `false` if no allocator can be created
pub fn is_device_resident(address: usize) -> bool {
    allocator().map_or(false, |a| a.is_device_resident(address))
}

/// [`CachingAllocator::is_reachable`]; `false` if no allocator can be created
pub fn is_reachable(address: usize) -> bool {
    allocator().map_or(false, |a| a.is_reachable(address))
}

/// [`CachingAllocator::select_device`] on the process-wide allocator
pub fn select_device(device: DeviceId) -> DevCacheResult<()> {
    allocator()?.select_device(device)
}

/// [`CachingAllocator::device_count`] on the process-wide allocator
pub fn device_count() -> DevCacheResult<usize> {
    allocator()?.device_count()
}

/// [`CachingAllocator::disable_caching`] on the process-wide allocator
pub fn disable_caching() -> DevCacheResult<()> {
    allocator()?.disable_caching()
}

/// [`CachingAllocator::clear_cache`] on the process-wide allocator
pub fn clear_cache() -> DevCacheResult<ReclaimStats> {
    allocator()?.clear_cache()
}

/// [`CachingAllocator::shutdown`] on the process-wide allocator
pub fn shutdown() -> DevCacheResult<ShutdownReport> {
    allocator()?.shutdown()
}
