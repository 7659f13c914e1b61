//! Caching allocator behaviour on a simulated multi-device runtime

mod common;

use common::Fixture;
use devcache::backend::HostRuntime;
use devcache::{CacheConfig, DevCacheError, ErrorCategory};

// ============================================================================
// Cache hits and misses
// ============================================================================

#[test]
fn test_release_then_smaller_allocate_hits_cache() -> anyhow::Result<()> {
    let fixture = Fixture::new(1);
    let alloc = &fixture.allocator;

    let p = alloc.allocate(1024)?;
    alloc.release(p)?;
    let records_before = alloc.registry().len();

    let q = alloc.allocate(512)?;
    assert_eq!(q, p, "cached 1024-byte buffer should satisfy a 512-byte request");
    assert_eq!(alloc.registry().len(), records_before, "cache hit must not add a record");
    assert_eq!(fixture.mallocs(), 1);

    alloc.release(q)?;
    fixture.assert_no_leak();
    Ok(())
}

#[test]
fn test_device_switch_misses_cache() -> anyhow::Result<()> {
    let fixture = Fixture::new(2);
    let alloc = &fixture.allocator;

    alloc.select_device(0)?;
    let p = alloc.allocate(256)?;
    alloc.release(p)?;

    alloc.select_device(1)?;
    let q = alloc.allocate(256)?;

    assert_ne!(p, q, "device 0 buffer must not be reused on device 1");
    assert_eq!(alloc.registry().len(), 2);
    assert_eq!(alloc.lookup(q).map(|r| r.owning_device), Some(1));
    assert_eq!(fixture.runtime.device_bytes_in_use(0), 256);
    assert_eq!(fixture.runtime.device_bytes_in_use(1), 256);
    Ok(())
}

#[test]
fn test_first_registered_fit_wins() -> anyhow::Result<()> {
    let fixture = Fixture::new(1);
    let alloc = &fixture.allocator;

    let small = alloc.allocate(128)?;
    let large = alloc.allocate(4096)?;
    alloc.release(small)?;
    alloc.release(large)?;

    // Both fit; scans start from the most recently registered record.
    assert_eq!(alloc.allocate(64)?, large);
    assert_eq!(alloc.allocate(64)?, small);
    assert_eq!(fixture.mallocs(), 2);
    Ok(())
}

#[test]
fn test_never_returns_undersized_buffer() -> anyhow::Result<()> {
    let fixture = Fixture::new(1);
    let alloc = &fixture.allocator;

    let p = alloc.allocate(100)?;
    alloc.release(p)?;

    let q = alloc.allocate(101)?;
    assert_ne!(p, q);
    assert!(alloc.lookup(q).map_or(false, |r| r.length >= 101));
    Ok(())
}

#[test]
fn test_reuse_across_threads_moves_ownership() -> anyhow::Result<()> {
    let fixture = Fixture::new(1);
    let alloc = &fixture.allocator;

    let p = std::thread::scope(|s| {
        s.spawn(|| {
            let p = alloc.allocate(512).unwrap();
            alloc.release(p).unwrap();
            p
        })
        .join()
        .unwrap()
    });

    let q = alloc.allocate(512)?;
    assert_eq!(p, q, "cache reuse is not restricted to the releasing thread");
    assert_eq!(
        alloc.lookup(q).map(|r| r.owning_thread),
        Some(devcache::WorkerId::current())
    );
    Ok(())
}

// ============================================================================
// Residency queries
// ============================================================================

#[test]
fn test_queries_on_unknown_pointers_are_false() {
    let fixture = Fixture::new(1);
    let alloc = &fixture.allocator;

    let on_stack = 0u64;
    let stack_addr = &on_stack as *const u64 as usize;

    for address in [0usize, 1, 0xdead_beef, stack_addr] {
        assert!(!alloc.is_device_resident(address));
        assert!(!alloc.is_reachable(address));
    }
}

#[test]
fn test_queries_are_idempotent() -> anyhow::Result<()> {
    let fixture = Fixture::new(1);
    let alloc = &fixture.allocator;

    let d = alloc.allocate(64)?;
    let h = alloc.allocate_pinned_host(64)?;

    for _ in 0..3 {
        assert!(alloc.is_device_resident(d + 10));
        assert!(alloc.is_reachable(d + 10));
        assert!(!alloc.is_device_resident(h));
        assert!(alloc.is_reachable(h));
    }
    Ok(())
}

// ============================================================================
// Consistency errors
// ============================================================================

#[test]
fn test_double_release_is_consistency_error() -> anyhow::Result<()> {
    let fixture = Fixture::new(1);
    let alloc = &fixture.allocator;

    let p = alloc.allocate(32)?;
    alloc.release(p)?;

    let err = alloc.release(p).unwrap_err();
    assert_eq!(err, DevCacheError::DoubleFree { address: p });
    assert_eq!(err.category(), ErrorCategory::Consistency);
    Ok(())
}

#[test]
fn test_release_of_unknown_pointer() {
    let fixture = Fixture::new(1);
    let err = fixture.allocator.release(0x4000).unwrap_err();
    assert_eq!(err, DevCacheError::UnknownAddress { address: 0x4000 });
    assert!(err.is_consistency_violation());

    assert!(fixture.allocator.release(0).is_err());
}

#[test]
fn test_pinned_buffer_through_device_path() -> anyhow::Result<()> {
    let fixture = Fixture::new(1);
    let alloc = &fixture.allocator;

    let h = alloc.allocate_pinned_host(64)?;
    assert!(matches!(
        alloc.release(h),
        Err(DevCacheError::ResidencyMismatch { .. })
    ));

    let d = alloc.allocate(64)?;
    assert!(matches!(
        alloc.release_pinned_host(d),
        Err(DevCacheError::ResidencyMismatch { .. })
    ));
    Ok(())
}

#[test]
fn test_disable_caching_only_before_device_selection() -> anyhow::Result<()> {
    let fixture = Fixture::new(2);
    let alloc = &fixture.allocator;

    // Another thread's selection does not lock this thread out.
    std::thread::scope(|s| {
        s.spawn(|| alloc.select_device(1).unwrap()).join().unwrap();
    });
    alloc.disable_caching()?;
    assert!(!alloc.is_caching_enabled());

    let fixture = Fixture::new(2);
    fixture.allocator.select_device(0)?;
    assert_eq!(
        fixture.allocator.disable_caching(),
        Err(DevCacheError::CachingLocked)
    );
    Ok(())
}

// ============================================================================
// Caching disabled
// ============================================================================

#[test]
fn test_uncached_release_is_physical() -> anyhow::Result<()> {
    let fixture = Fixture::with(HostRuntime::new(1), CacheConfig::new().with_caching(false));
    let alloc = &fixture.allocator;

    let p = alloc.allocate(1024)?;
    alloc.release(p)?;
    let q = alloc.allocate(1024)?;

    assert_ne!(p, q);
    assert!(!alloc.is_reachable(p));
    assert_eq!(fixture.mallocs(), 2);
    assert_eq!(fixture.runtime.stats().free_count, 1);
    Ok(())
}

// ============================================================================
// Memory pressure
// ============================================================================

#[test]
fn test_out_of_memory_then_clear_cache_and_retry() -> anyhow::Result<()> {
    let fixture = Fixture::with(
        HostRuntime::new(1).with_capacity(4096),
        CacheConfig::default(),
    );
    let alloc = &fixture.allocator;

    let a = alloc.allocate(2048)?;
    let b = alloc.allocate(2048)?;
    alloc.release(a)?;
    alloc.release(b)?;

    // Cached buffers are too small and hold all device memory.
    let err = alloc.allocate(4096).unwrap_err();
    assert!(err.is_recoverable(), "{}", err);

    alloc.clear_cache()?;
    let c = alloc.allocate(4096)?;
    assert!(alloc.is_device_resident(c));
    Ok(())
}

#[test]
fn test_unreachable_runtime() {
    let fixture = Fixture::with(HostRuntime::unreachable(), CacheConfig::default());
    let err = fixture.allocator.allocate(16).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Device);
    assert!(!err.is_recoverable());
    assert!(fixture.allocator.registry().is_empty());
}

#[test]
fn test_stats_track_hits_and_misses() -> anyhow::Result<()> {
    let fixture = Fixture::new(1);
    let alloc = &fixture.allocator;

    let p = alloc.allocate(64)?;
    alloc.release(p)?;
    let p = alloc.allocate(64)?;
    alloc.release(p)?;
    alloc.clear_cache()?;

    let stats = alloc.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.physical_allocations, 1);
    assert_eq!(stats.physical_releases, 1);
    assert_eq!(stats.reclaimed_bytes, 64);

    let registry = alloc.registry_stats()?;
    assert_eq!(registry.records, 0);
    Ok(())
}
