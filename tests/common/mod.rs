//! Common test fixtures
//!
//! Every integration test runs against a [`HostRuntime`], so the suite needs no
//! GPU. Each fixture owns its own allocator; device selections made through one
//! fixture are invisible to the others.
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::Fixture;
//!
//! #[test]
//! fn my_test() {
//!     let fixture = Fixture::new(2);
//!     let p = fixture.allocator.allocate(64).unwrap();
//!     fixture.allocator.release(p).unwrap();
//!     fixture.assert_no_leak();
//! }
//! ```

#![allow(dead_code)]

use std::sync::Arc;

use devcache::backend::HostRuntime;
use devcache::{CacheConfig, CachingAllocator};

#[allow(unused_imports)]
pub use serial_test::serial;

/// Allocator over a simulated runtime, with the runtime kept for inspection
pub struct Fixture {
    pub runtime: Arc<HostRuntime>,
    pub allocator: CachingAllocator,
}

impl Fixture {
    /// `devices` simulated devices with unlimited memory, caching on
    pub fn new(devices: usize) -> Self {
        Self::with(HostRuntime::new(devices), CacheConfig::default())
    }

    /// Custom runtime and configuration
    pub fn with(runtime: HostRuntime, config: CacheConfig) -> Self {
        devcache::logging::init_logging_default();
        let runtime = Arc::new(runtime);
        let allocator = CachingAllocator::new(runtime.clone(), config);
        Self { runtime, allocator }
    }

    /// Physical `malloc` calls so far; a cache hit leaves this unchanged
    pub fn mallocs(&self) -> usize {
        self.runtime.stats().malloc_count
    }

    /// Sweep the calling thread's cache and check nothing is left on any device
    ///
    /// # Panics
    ///
    /// Panics if device blocks survive the sweep.
    pub fn assert_no_leak(&self) {
        self.allocator
            .clear_cache()
            .expect("clear_cache failed during leak check");
        let live = self.runtime.live_blocks();
        assert_eq!(
            live, 0,
            "{} device block(s) still live: {:?}",
            live,
            self.allocator.registry().snapshot()
        );
    }
}
