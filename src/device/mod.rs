//! Device selection and worker identity
//!
//! The active device is per thread, like the HIP/CUDA runtime's own notion of a
//! current device. Registry records remember which device and which worker
//! created them, so reuse can stay on the same device.

pub mod context;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub use context::{DeviceContext, PeerAccessMatrix};

/// Accelerator device ordinal, in `[0, device_count)`
pub type DeviceId = usize;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static WORKER_ID: WorkerId = WorkerId(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed));
}

/// Identifier of a worker thread
///
/// Assigned lazily on first use and stable for the life of the thread.
/// Ids are never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Id of the calling thread
    pub fn current() -> Self {
        WORKER_ID.with(|id| *id)
    }

    /// Wrap a raw id (for driving the registry on behalf of another worker)
    pub const fn from_raw(raw: u64) -> Self {
        WorkerId(raw)
    }

    /// Raw id value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}
