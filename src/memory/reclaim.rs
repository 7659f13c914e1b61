//! Reclaim sweep
//!
//! Physically releases cached device buffers. Sweeps are scoped to the calling
//! worker so no thread frees a buffer another thread might be about to claim.

use std::sync::atomic::Ordering;

use super::allocator::CachingAllocator;
use super::{AllocationRecord, DeviceFilter, ThreadFilter};
use crate::device::WorkerId;
use crate::error::DevCacheResult;

/// Outcome of a sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Buffers returned to the runtime
    pub buffers: usize,
    /// Bytes returned to the runtime
    pub bytes: usize,
}

/// Outcome of [`CachingAllocator::shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// What the final sweep released
    pub reclaimed: ReclaimStats,
    /// Records still in logical use when the runtime was torn down
    pub leaked: Vec<AllocationRecord>,
}

impl ShutdownReport {
    /// True if every buffer had been released before shutdown
    pub fn is_clean(&self) -> bool {
        self.leaked.is_empty()
    }
}

impl CachingAllocator {
    /// Release every buffer the calling thread has cached, on all devices
    ///
    /// Afterwards no cached record owned by this thread remains, so the next
    /// allocation from this thread goes to the runtime. Other threads' cached
    /// buffers are untouched. Without caching there is nothing to sweep, unless
    /// a release raced `disable_caching`.
    pub fn clear_cache(&self) -> DevCacheResult<ReclaimStats> {
        self.sweep(DeviceFilter::Any, ThreadFilter::Only(WorkerId::current()))
    }

    /// Final sweep for the calling thread, then tear down the runtime
    ///
    /// Buffers still in use are reported, not released: a caller may still hold
    /// them. The runtime reset invalidates them regardless. With caching off,
    /// cached records of every thread are swept too, since no worker can claim
    /// them any more.
    pub fn shutdown(&self) -> DevCacheResult<ShutdownReport> {
        let mut reclaimed = self.clear_cache()?;
        if !self.is_caching_enabled() {
            let stranded = self.sweep(DeviceFilter::Any, ThreadFilter::Any)?;
            reclaimed.buffers += stranded.buffers;
            reclaimed.bytes += stranded.bytes;
        }

        let leaked: Vec<AllocationRecord> = self
            .registry()
            .snapshot()
            .map_err(|e| self.violation(e))?
            .into_iter()
            .filter(|r| !r.free)
            .collect();

        for record in &leaked {
            tracing::warn!(
                address = record.address,
                length = record.length,
                residency = %record.residency,
                device = record.owning_device,
                owner = %record.owning_thread,
                "buffer still in use at shutdown"
            );
        }

        self.runtime().reset()?;
        tracing::info!(
            reclaimed_buffers = reclaimed.buffers,
            reclaimed_bytes = reclaimed.bytes,
            leaked = leaked.len(),
            "device runtime shut down"
        );

        Ok(ShutdownReport { reclaimed, leaked })
    }

    /// Unlink and release cached records matching both filters until none remain
    pub(crate) fn sweep(&self, device: DeviceFilter, thread: ThreadFilter) -> DevCacheResult<ReclaimStats> {
        let mut stats = ReclaimStats::default();

        while let Some(record) = self
            .registry()
            .mark_free_and_unlink(device, thread)
            .map_err(|e| self.violation(e))?
        {
            self.release_or_restore(record)?;
            stats.buffers += 1;
            stats.bytes += record.length;
        }

        self.counters
            .reclaimed_bytes
            .fetch_add(stats.bytes, Ordering::Relaxed);
        if stats.buffers > 0 {
            tracing::debug!(
                buffers = stats.buffers,
                bytes = stats.bytes,
                ?device,
                ?thread,
                "reclaim sweep"
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::{DeviceRuntime, HostRuntime};
    use crate::config::CacheConfig;

    #[test]
    fn test_clear_cache_releases_own_buffers() {
        let runtime = Arc::new(HostRuntime::new(2));
        let alloc = CachingAllocator::with_defaults(runtime.clone());

        let a = alloc.allocate(100).unwrap();
        alloc.select_device(1).unwrap();
        let b = alloc.allocate(200).unwrap();
        let kept = alloc.allocate(300).unwrap();
        alloc.release(a).unwrap();
        alloc.release(b).unwrap();

        let stats = alloc.clear_cache().unwrap();
        assert_eq!(stats, ReclaimStats { buffers: 2, bytes: 300 });
        assert_eq!(runtime.live_blocks(), 1);
        assert_eq!(alloc.registry().len(), 1);
        assert!(alloc.is_device_resident(kept));
        assert_eq!(alloc.stats().reclaimed_bytes, 300);

        // Nothing left to sweep
        assert_eq!(alloc.clear_cache().unwrap(), ReclaimStats::default());
    }

    #[test]
    fn test_clear_cache_noop_without_caching() {
        let runtime = Arc::new(HostRuntime::new(1));
        let alloc = CachingAllocator::new(runtime, CacheConfig::new().with_caching(false));
        alloc.allocate(8).unwrap();
        assert_eq!(alloc.clear_cache().unwrap(), ReclaimStats::default());
    }

    #[test]
    fn test_failed_sweep_keeps_cached_record() {
        let runtime = Arc::new(HostRuntime::new(1));
        let alloc = CachingAllocator::with_defaults(runtime.clone());
        let p = alloc.allocate(64).unwrap();
        alloc.release(p).unwrap();

        runtime.reset().unwrap();
        assert!(alloc.clear_cache().is_err());

        let stats = alloc.registry_stats().unwrap();
        assert_eq!(stats.device_cached, 1);
        assert_eq!(alloc.lookup(p).map(|r| r.free), Some(true));
    }

    #[test]
    fn test_shutdown_sweeps_stranded_records_without_caching() {
        let runtime = Arc::new(HostRuntime::new(1));
        let alloc = Arc::new(CachingAllocator::with_defaults(runtime.clone()));

        let worker = Arc::clone(&alloc);
        let p = std::thread::spawn(move || worker.allocate(64).unwrap())
            .join()
            .unwrap();
        alloc.disable_caching().unwrap();
        // A release by that worker that lost the race with the drain
        alloc.registry().mark_free(p).unwrap();

        assert_eq!(alloc.clear_cache().unwrap(), ReclaimStats::default());

        let report = alloc.shutdown().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.reclaimed, ReclaimStats { buffers: 1, bytes: 64 });
        assert!(alloc.registry().is_empty());
        assert_eq!(runtime.stats().free_count, 1);
    }

    #[test]
    fn test_shutdown_reports_leaks() {
        let runtime = Arc::new(HostRuntime::new(1));
        let alloc = CachingAllocator::with_defaults(runtime.clone());

        let cached = alloc.allocate(64).unwrap();
        let leaked = alloc.allocate(128).unwrap();
        alloc.release(cached).unwrap();

        let report = alloc.shutdown().unwrap();
        assert_eq!(report.reclaimed.buffers, 1);
        assert!(!report.is_clean());
        assert_eq!(report.leaked.len(), 1);
        assert_eq!(report.leaked[0].address, leaked);
        assert_eq!(runtime.stats().reset_count, 1);
        assert_eq!(runtime.live_blocks(), 0);
    }

    #[test]
    fn test_clean_shutdown() {
        let runtime = Arc::new(HostRuntime::new(1));
        let alloc = CachingAllocator::with_defaults(runtime);
        let p = alloc.allocate(64).unwrap();
        alloc.release(p).unwrap();

        let report = alloc.shutdown().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.reclaimed, ReclaimStats { buffers: 1, bytes: 64 });
    }
}
