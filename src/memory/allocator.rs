//! Caching allocator
//!
//! Released device buffers are not returned to the runtime. They stay registered
//! with `free = true` and satisfy later requests on the same device (first fit,
//! any owner). Pinned host memory is never cached.
//!
//! Runtime calls (`malloc`, `free`, ...) always happen outside the registry lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::registry::{RegistryStats, ResidencyRegistry};
use super::{AllocationRecord, DeviceFilter, Residency, ThreadFilter};
use crate::backend::DeviceRuntime;
use crate::config::{CacheConfig, ConsistencyPolicy};
use crate::device::{DeviceContext, DeviceId, PeerAccessMatrix, WorkerId};
use crate::error::{DevCacheError, DevCacheResult};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) cache_hits: AtomicUsize,
    pub(crate) cache_misses: AtomicUsize,
    pub(crate) physical_allocations: AtomicUsize,
    pub(crate) physical_releases: AtomicUsize,
    pub(crate) reclaimed_bytes: AtomicUsize,
}

/// Device allocator with a free-buffer cache and a residency registry
#[derive(Debug)]
pub struct CachingAllocator {
    context: DeviceContext,
    registry: ResidencyRegistry,
    caching: AtomicBool,
    policy: ConsistencyPolicy,
    pub(crate) counters: Counters,
}

impl CachingAllocator {
    /// Create an allocator over `runtime`
    pub fn new(runtime: Arc<dyn DeviceRuntime>, config: CacheConfig) -> Self {
        tracing::debug!(
            runtime = runtime.name(),
            caching = config.caching,
            consistency = ?config.consistency,
            default_device = config.default_device,
            "creating caching allocator"
        );

        Self {
            context: DeviceContext::new(runtime, config.default_device),
            registry: ResidencyRegistry::new(),
            caching: AtomicBool::new(config.caching),
            policy: config.consistency,
            counters: Counters::default(),
        }
    }

    /// Allocator with [`CacheConfig::default`]
    pub fn with_defaults(runtime: Arc<dyn DeviceRuntime>) -> Self {
        Self::new(runtime, CacheConfig::default())
    }

    /// Allocate `size` bytes on the calling thread's active device
    ///
    /// A cached buffer of at least `size` bytes on that device is reused when
    /// caching is enabled; otherwise exactly `size` bytes are allocated.
    ///
    /// # Errors
    ///
    /// `ZeroSizedAllocation`, or the runtime's `OutOfMemory`/device error. On
    /// `OutOfMemory` the caller may run [`clear_cache`](Self::clear_cache) and retry.
    pub fn allocate(&self, size: usize) -> DevCacheResult<usize> {
        if size == 0 {
            return Err(DevCacheError::ZeroSizedAllocation);
        }

        let device = self.context.active_device();
        let worker = WorkerId::current();

        if self.is_caching_enabled() {
            if let Some(record) =
                self.registry
                    .find_reusable(device, size, ThreadFilter::Any, worker)
                    .map_err(|e| self.violation(e))?
            {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    address = record.address,
                    requested = size,
                    length = record.length,
                    device,
                    %worker,
                    "cache hit"
                );
                return Ok(record.address);
            }
            self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let address = self.context.runtime().malloc(device, size)?;
        let record = AllocationRecord::new(address, size, Residency::Device, device, worker);
        self.register(record)?;

        self.counters
            .physical_allocations
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(address, size, device, %worker, "allocated device buffer");
        Ok(address)
    }

    /// Release a device buffer returned by [`allocate`](Self::allocate)
    ///
    /// With caching enabled the buffer is only marked reusable; otherwise it is
    /// unregistered and physically freed.
    ///
    /// # Errors
    ///
    /// Consistency errors: `UnknownAddress`, `InteriorPointer`,
    /// `ResidencyMismatch` (pinned host buffer), `DoubleFree`. A runtime error
    /// from the physical release leaves the buffer registered.
    pub fn release(&self, address: usize) -> DevCacheResult<()> {
        if self.is_caching_enabled() {
            let record = self
                .registry
                .mark_free(address)
                .map_err(|e| self.violation(e))?;
            tracing::trace!(address, length = record.length, device = record.owning_device, "cached device buffer");

            // `disable_caching` may have drained the cache between the flag
            // check and `mark_free`; nothing would ever sweep this record.
            if !self.is_caching_enabled() {
                if let Some(record) = self
                    .registry
                    .unlink_cached(address)
                    .map_err(|e| self.violation(e))?
                {
                    self.release_or_restore(record)?;
                }
            }
            return Ok(());
        }

        let record = self
            .registry
            .unlink_exact(address, Residency::Device)
            .map_err(|e| self.violation(e))?;
        self.release_or_restore(record)
    }

    /// Allocate `size` bytes of pinned host memory
    pub fn allocate_pinned_host(&self, size: usize) -> DevCacheResult<usize> {
        if size == 0 {
            return Err(DevCacheError::ZeroSizedAllocation);
        }

        let device = self.context.active_device();
        let worker = WorkerId::current();
        let address = self.context.runtime().host_alloc(size)?;
        self.register(AllocationRecord::new(
            address,
            size,
            Residency::HostPinned,
            device,
            worker,
        ))?;

        self.counters
            .physical_allocations
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(address, size, %worker, "allocated pinned host buffer");
        Ok(address)
    }

    /// Unregister and physically free a pinned host buffer
    pub fn release_pinned_host(&self, address: usize) -> DevCacheResult<()> {
        let record = self
            .registry
            .unlink_exact(address, Residency::HostPinned)
            .map_err(|e| self.violation(e))?;
        self.release_or_restore(record)
    }

    /// Is `address` inside a device buffer that is in logical use
    ///
    /// Never fails: null, unknown, pinned-host and cached pointers are all `false`.
    pub fn is_device_resident(&self, address: usize) -> bool {
        self.registry
            .find_exact(address, false)
            .ok()
            .flatten()
            .map_or(false, |r| r.residency == Residency::Device && !r.free)
    }

    /// Is `address` inside any registered buffer, device or pinned host
    pub fn is_reachable(&self, address: usize) -> bool {
        self.registry
            .find_exact(address, false)
            .ok()
            .flatten()
            .is_some()
    }

    /// Registered record containing `address`
    pub fn lookup(&self, address: usize) -> Option<AllocationRecord> {
        self.registry.find_exact(address, false).ok().flatten()
    }

    /// Switch the free-buffer cache off
    ///
    /// Legal only before the calling thread selects a device. Buffers already
    /// cached (by any thread) are physically released.
    ///
    /// # Errors
    ///
    /// `CachingLocked` once the calling thread has selected a device.
    pub fn disable_caching(&self) -> DevCacheResult<()> {
        if self.context.has_selected_device() {
            return Err(self.violation(DevCacheError::CachingLocked));
        }

        if self.caching.swap(false, Ordering::SeqCst) {
            let drained = self.sweep(DeviceFilter::Any, ThreadFilter::Any)?;
            tracing::info!(
                buffers = drained.buffers,
                bytes = drained.bytes,
                "buffer caching disabled"
            );
        }
        Ok(())
    }

    /// Is the free-buffer cache on
    pub fn is_caching_enabled(&self) -> bool {
        self.caching.load(Ordering::SeqCst)
    }

    /// Consistency policy in force
    pub fn consistency_policy(&self) -> ConsistencyPolicy {
        self.policy
    }

    // ========== Device Context ==========

    /// Make `device` the calling thread's active device
    pub fn select_device(&self, device: DeviceId) -> DevCacheResult<()> {
        self.context.select_device(device)
    }

    /// Device the calling thread allocates on
    pub fn active_device(&self) -> DeviceId {
        self.context.active_device()
    }

    /// Number of visible devices
    pub fn device_count(&self) -> DevCacheResult<usize> {
        self.context.device_count()
    }

    /// Peer access table for `n == device_count()` devices
    pub fn peer_access_matrix(&self, n: usize) -> DevCacheResult<PeerAccessMatrix> {
        self.context.peer_access_matrix(n)
    }

    /// Let `device` address `peer`'s memory
    pub fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> DevCacheResult<()> {
        self.context.enable_peer_access(device, peer)
    }

    /// Select the device with the most free memory
    pub fn select_device_with_most_memory(&self) -> DevCacheResult<DeviceId> {
        self.context.select_device_with_most_memory()
    }

    /// Device context
    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    /// Underlying runtime
    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        self.context.runtime()
    }

    /// Residency registry
    pub fn registry(&self) -> &ResidencyRegistry {
        &self.registry
    }

    // ========== Statistics ==========

    /// Counter snapshot
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            physical_allocations: self.counters.physical_allocations.load(Ordering::Relaxed),
            physical_releases: self.counters.physical_releases.load(Ordering::Relaxed),
            reclaimed_bytes: self.counters.reclaimed_bytes.load(Ordering::Relaxed),
        }
    }

    /// Registry occupancy
    pub fn registry_stats(&self) -> DevCacheResult<RegistryStats> {
        self.registry.stats().map_err(|e| self.violation(e))
    }

    // ========== Internals ==========

    /// Release a record's memory through the runtime; the record is already unlinked
    pub(crate) fn physical_release(&self, record: &AllocationRecord) -> DevCacheResult<()> {
        let runtime = self.context.runtime();
        match record.residency {
            Residency::Device => runtime.free(record.owning_device, record.address)?,
            Residency::HostPinned => runtime.host_free(record.address)?,
        }

        self.counters
            .physical_releases
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            address = record.address,
            length = record.length,
            residency = %record.residency,
            device = record.owning_device,
            "released buffer"
        );
        Ok(())
    }

    /// Physically release an unlinked record, re-registering it if the runtime refuses
    ///
    /// A record the runtime could not free stays visible for a later retry or
    /// for the shutdown report.
    pub(crate) fn release_or_restore(&self, record: AllocationRecord) -> DevCacheResult<()> {
        let err = match self.physical_release(&record) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        tracing::warn!(
            address = record.address,
            length = record.length,
            residency = %record.residency,
            error = %err,
            "runtime release failed, record kept"
        );
        if let Err(insert_err) = self.registry.insert(record) {
            tracing::error!(address = record.address, error = %insert_err, "could not re-register buffer");
        }
        Err(err)
    }

    /// Apply the consistency policy to `err`
    ///
    /// Non-consistency errors pass through untouched.
    pub(crate) fn violation(&self, err: DevCacheError) -> DevCacheError {
        if err.is_consistency_violation() {
            tracing::error!(error = %err, worker = %WorkerId::current(), "allocator consistency violation");
            if self.policy == ConsistencyPolicy::Abort {
                std::process::abort();
            }
        }
        err
    }

    fn register(&self, record: AllocationRecord) -> DevCacheResult<()> {
        if let Err(err) = self.registry.insert(record) {
            // Unregistered memory could never be released again.
            if let Err(release_err) = self.physical_release(&record) {
                tracing::warn!(
                    address = record.address,
                    error = %release_err,
                    "could not release buffer after failed registration"
                );
            }
            return Err(self.violation(err));
        }
        Ok(())
    }
}

/// Allocator activity counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Requests satisfied from the cache
    pub cache_hits: usize,
    /// Requests that found no cached buffer (caching enabled)
    pub cache_misses: usize,
    /// Runtime allocations, device and pinned host
    pub physical_allocations: usize,
    /// Runtime releases, device and pinned host
    pub physical_releases: usize,
    /// Bytes returned to the runtime by reclaim sweeps
    pub reclaimed_bytes: usize,
}

impl AllocatorStats {
    /// Fraction of cached-path requests served from the cache
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

impl fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AllocatorStats {{ hits: {}, misses: {}, hit rate: {:.1}%, allocations: {}, releases: {}, reclaimed: {:.2} MB }}",
            self.cache_hits,
            self.cache_misses,
            self.hit_rate() * 100.0,
            self.physical_allocations,
            self.physical_releases,
            self.reclaimed_bytes as f64 / 1024.0 / 1024.0
        )
    }
}
