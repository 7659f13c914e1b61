//! Per-thread device context
//!
//! **The active device is PER-THREAD, not global.** Selecting a device only
//! affects the calling thread; other workers keep their own selection. Each
//! [`DeviceContext`] keeps its own selections, so two allocators living in the
//! same process never observe each other's choice.
//!
//! A thread that never selected a device works on the configured default device.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::DeviceRuntime;
use crate::device::DeviceId;
use crate::error::{DevCacheError, DevCacheResult};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// context id -> device selected by this thread
    static ACTIVE_DEVICES: RefCell<HashMap<u64, DeviceId>> = RefCell::new(HashMap::new());
}

/// Device selection front-end over a [`DeviceRuntime`]
#[derive(Debug)]
pub struct DeviceContext {
    id: u64,
    runtime: Arc<dyn DeviceRuntime>,
    default_device: DeviceId,
}

impl DeviceContext {
    /// Create a context over `runtime`; unselected threads use `default_device`
    pub fn new(runtime: Arc<dyn DeviceRuntime>, default_device: DeviceId) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            runtime,
            default_device,
        }
    }

    /// Underlying device runtime
    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    /// Number of visible devices
    pub fn device_count(&self) -> DevCacheResult<usize> {
        self.runtime.device_count()
    }

    /// Make `device` the calling thread's active device
    ///
    /// # Errors
    ///
    /// `InvalidDevice` if `device` is outside `[0, device_count)`, or the
    /// runtime's error if it cannot switch.
    pub fn select_device(&self, device: DeviceId) -> DevCacheResult<()> {
        self.check_device(device)?;
        self.runtime.set_device(device)?;

        ACTIVE_DEVICES.with(|devices| {
            devices.borrow_mut().insert(self.id, device);
        });

        tracing::debug!(device, runtime = self.runtime.name(), "selected device");
        Ok(())
    }

    /// Device explicitly selected by the calling thread, if any
    pub fn selected_device(&self) -> Option<DeviceId> {
        ACTIVE_DEVICES.with(|devices| devices.borrow().get(&self.id).copied())
    }

    /// True once the calling thread has selected a device
    pub fn has_selected_device(&self) -> bool {
        self.selected_device().is_some()
    }

    /// Device the calling thread allocates on
    pub fn active_device(&self) -> DeviceId {
        self.selected_device().unwrap_or(self.default_device)
    }

    /// Peer access table for all `n` devices
    ///
    /// `n` must equal `device_count()`; entry `[i][j]` is true iff device `i`
    /// can directly address device `j`'s memory.
    pub fn peer_access_matrix(&self, n: usize) -> DevCacheResult<PeerAccessMatrix> {
        let count = self.device_count()?;
        if n != count {
            return Err(DevCacheError::InvalidConfiguration(format!(
                "peer matrix of size {} requested, {} device(s) visible",
                n, count
            )));
        }

        let mut cells = Vec::with_capacity(n * n);
        for device in 0..n {
            for peer in 0..n {
                cells.push(self.runtime.can_access_peer(device, peer)?);
            }
        }

        Ok(PeerAccessMatrix { n, cells })
    }

    /// Let `device` address `peer`'s memory; idempotent
    pub fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> DevCacheResult<()> {
        self.check_device(device)?;
        self.check_device(peer)?;

        if !self.runtime.can_access_peer(device, peer)? {
            return Err(DevCacheError::PeerAccessUnsupported { device, peer });
        }

        self.runtime.enable_peer_access(device, peer)?;
        tracing::debug!(device, peer, "peer access enabled");
        Ok(())
    }

    /// Select the device with the most free memory for the calling thread
    ///
    /// With a single device this is device 0 and no memory query is made.
    pub fn select_device_with_most_memory(&self) -> DevCacheResult<DeviceId> {
        let count = self.device_count()?;
        if count == 0 {
            return Err(DevCacheError::DeviceUnavailable(
                "no devices visible".to_string(),
            ));
        }

        let mut best = 0;
        if count > 1 {
            let mut best_free = 0;
            for device in 0..count {
                let info = self.runtime.memory_info(device)?;
                tracing::trace!(device, free = info.free, total = info.total, "device memory");
                if info.free > best_free {
                    best_free = info.free;
                    best = device;
                }
            }
        }

        self.select_device(best)?;
        Ok(best)
    }

    fn check_device(&self, device: DeviceId) -> DevCacheResult<()> {
        let count = self.device_count()?;
        if device >= count {
            return Err(DevCacheError::InvalidDevice { device, count });
        }
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        // Other threads' entries go away with their thread-local maps.
        let _ = ACTIVE_DEVICES.try_with(|devices| devices.borrow_mut().remove(&self.id));
    }
}

/// Square table of which devices can address which
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAccessMatrix {
    n: usize,
    cells: Vec<bool>,
}

impl PeerAccessMatrix {
    /// Number of devices (rows and columns)
    pub fn len(&self) -> usize {
        self.n
    }

    /// True for a system without devices
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Can `device` directly address `peer`'s memory
    pub fn can_access(&self, device: DeviceId, peer: DeviceId) -> bool {
        device < self.n && peer < self.n && self.cells[device * self.n + peer]
    }

    /// Row `device` of the table, `None` past the last device
    pub fn row(&self, device: DeviceId) -> Option<&[bool]> {
        if device >= self.n {
            return None;
        }
        self.cells.get(device * self.n..(device + 1) * self.n)
    }
}
