//! Host-memory device runtime
//!
//! Emulates a multi-device accelerator in ordinary host memory so the caching
//! allocator can be exercised without a GPU.
//!
//! # Behaviour
//!
//! - **Fake address space**: addresses are bump-allocated from `BASE_ADDRESS`
//!   and never reused, so a repeated address always means a cache hit upstream
//! - **Real storage**: every block is backed by a zeroed byte buffer, so
//!   transfers move actual data
//! - **Per-device capacity**: exceeding it yields `OutOfMemory`
//! - **Statistics**: every physical call is counted for tests
//!
//! # Usage
//!
//! ```rust
//! use devcache::backend::{DeviceRuntime, HostRuntime};
//!
//! let runtime = HostRuntime::new(2).with_capacity(1 << 20);
//! let ptr = runtime.malloc(1, 4096).unwrap();
//! assert_eq!(runtime.device_bytes_in_use(1), 4096);
//! runtime.free(1, ptr).unwrap();
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::backend::{DeviceRuntime, MemoryInfo};
use crate::device::DeviceId;
use crate::error::{DevCacheError, DevCacheResult};

/// First address handed out; keeps `0` (null) and small integers invalid
const BASE_ADDRESS: usize = 0x1000_0000;

/// Allocation granularity of the fake address space
const ALIGNMENT: usize = 256;

/// Status code reported for invalid pointers and ranges
const INVALID_VALUE: i32 = 1;

/// Who owns a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Device(DeviceId),
    PinnedHost,
}

#[derive(Debug)]
struct HostBlock {
    data: Box<[u8]>,
    kind: BlockKind,
}

/// Physical call counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Successful `malloc` calls
    pub malloc_count: usize,
    /// Successful `free` calls
    pub free_count: usize,
    /// Successful `host_alloc` calls
    pub host_alloc_count: usize,
    /// Successful `host_free` calls
    pub host_free_count: usize,
    /// Bytes ever obtained through `malloc`
    pub total_allocated_bytes: usize,
    /// Fills and copies of any direction
    pub transfer_count: usize,
    /// `set_device` calls
    pub set_device_count: usize,
    /// `reset` calls
    pub reset_count: usize,
}

#[derive(Debug)]
struct HostState {
    blocks: BTreeMap<usize, HostBlock>,
    next_address: usize,
    used: Vec<usize>,
    host_used: usize,
    enabled_peers: HashSet<(DeviceId, DeviceId)>,
    stats: RuntimeStats,
}

/// Host-backed [`DeviceRuntime`]
#[derive(Debug)]
pub struct HostRuntime {
    device_count: usize,
    capacity: usize,
    host_capacity: usize,
    peer_support: HashSet<(DeviceId, DeviceId)>,
    reachable: bool,
    state: Mutex<HostState>,
}

impl HostRuntime {
    /// Runtime with `device_count` devices of unlimited capacity
    pub fn new(device_count: usize) -> Self {
        Self {
            device_count,
            capacity: usize::MAX,
            host_capacity: usize::MAX,
            peer_support: HashSet::new(),
            reachable: true,
            state: Mutex::new(HostState {
                blocks: BTreeMap::new(),
                next_address: BASE_ADDRESS,
                used: vec![0; device_count],
                host_used: 0,
                enabled_peers: HashSet::new(),
                stats: RuntimeStats::default(),
            }),
        }
    }

    /// Runtime whose every call fails with `DeviceUnavailable`
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::new(0)
        }
    }

    /// Limit each device to `bytes` of memory
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = bytes;
        self
    }

    /// Limit pinned host memory to `bytes`
    pub fn with_host_capacity(mut self, bytes: usize) -> Self {
        self.host_capacity = bytes;
        self
    }

    /// Declare that `device` can address `peer`'s memory
    pub fn with_peer_support(mut self, device: DeviceId, peer: DeviceId) -> Self {
        self.peer_support.insert((device, peer));
        self
    }

    /// Snapshot of the call counters
    pub fn stats(&self) -> RuntimeStats {
        self.lock().map(|s| s.stats.clone()).unwrap_or_default()
    }

    /// Number of live device blocks on all devices
    pub fn live_blocks(&self) -> usize {
        self.lock()
            .map(|s| {
                s.blocks
                    .values()
                    .filter(|b| matches!(b.kind, BlockKind::Device(_)))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Number of live pinned host blocks
    pub fn live_host_blocks(&self) -> usize {
        self.lock()
            .map(|s| {
                s.blocks
                    .values()
                    .filter(|b| b.kind == BlockKind::PinnedHost)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Bytes currently allocated on `device`
    pub fn device_bytes_in_use(&self, device: DeviceId) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.used.get(device).copied())
            .unwrap_or(0)
    }

    /// Has peer access from `device` to `peer` been enabled
    pub fn is_peer_enabled(&self, device: DeviceId, peer: DeviceId) -> bool {
        self.lock()
            .map(|s| s.enabled_peers.contains(&(device, peer)))
            .unwrap_or(false)
    }

    fn lock(&self) -> DevCacheResult<MutexGuard<'_, HostState>> {
        Ok(self.state.lock()?)
    }

    fn ensure_reachable(&self) -> DevCacheResult<()> {
        if self.reachable {
            Ok(())
        } else {
            Err(DevCacheError::DeviceUnavailable(
                "host runtime configured as unreachable".to_string(),
            ))
        }
    }

    fn check_device(&self, device: DeviceId) -> DevCacheResult<()> {
        self.ensure_reachable()?;
        if device >= self.device_count {
            return Err(DevCacheError::InvalidDevice {
                device,
                count: self.device_count,
            });
        }
        Ok(())
    }

    fn carve(state: &mut HostState, size: usize, kind: BlockKind) -> usize {
        let address = state.next_address;
        let span = size.div_ceil(ALIGNMENT) * ALIGNMENT;
        state.next_address += span.max(ALIGNMENT);
        state.blocks.insert(
            address,
            HostBlock {
                data: vec![0u8; size].into_boxed_slice(),
                kind,
            },
        );
        address
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new(1)
    }
}

impl HostState {
    /// Locate `[address, address + len)` inside a single block
    fn locate(&mut self, op: &'static str, address: usize, len: usize) -> DevCacheResult<(&mut HostBlock, usize)> {
        let (base, block) = self
            .blocks
            .range_mut(..=address)
            .next_back()
            .ok_or_else(|| invalid(op, address, len))?;

        let offset = address - *base;
        if offset.checked_add(len).map_or(true, |end| end > block.data.len()) {
            return Err(invalid(op, address, len));
        }
        Ok((block, offset))
    }
}

fn invalid(op: &'static str, address: usize, len: usize) -> DevCacheError {
    DevCacheError::runtime(
        op,
        INVALID_VALUE,
        format!("invalid range {:#x}+{}", address, len),
    )
}

impl DeviceRuntime for HostRuntime {
    fn name(&self) -> &'static str {
        "host"
    }

    fn device_count(&self) -> DevCacheResult<usize> {
        self.ensure_reachable()?;
        Ok(self.device_count)
    }

    fn set_device(&self, device: DeviceId) -> DevCacheResult<()> {
        self.check_device(device)?;
        self.lock()?.stats.set_device_count += 1;
        Ok(())
    }

    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> DevCacheResult<bool> {
        self.check_device(device)?;
        self.check_device(peer)?;
        Ok(device != peer && self.peer_support.contains(&(device, peer)))
    }

    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> DevCacheResult<()> {
        if !self.can_access_peer(device, peer)? {
            return Err(DevCacheError::PeerAccessUnsupported { device, peer });
        }
        self.lock()?.enabled_peers.insert((device, peer));
        Ok(())
    }

    fn memory_info(&self, device: DeviceId) -> DevCacheResult<MemoryInfo> {
        self.check_device(device)?;
        let state = self.lock()?;
        Ok(MemoryInfo {
            free: self.capacity.saturating_sub(state.used[device]),
            total: self.capacity,
        })
    }

    fn malloc(&self, device: DeviceId, size: usize) -> DevCacheResult<usize> {
        self.check_device(device)?;
        let mut state = self.lock()?;

        let available = self.capacity.saturating_sub(state.used[device]);
        if size > available {
            return Err(DevCacheError::OutOfMemory {
                device,
                requested: size,
                available,
            });
        }

        let address = Self::carve(&mut state, size, BlockKind::Device(device));
        state.used[device] += size;
        state.stats.malloc_count += 1;
        state.stats.total_allocated_bytes += size;
        Ok(address)
    }

    fn free(&self, device: DeviceId, address: usize) -> DevCacheResult<()> {
        self.check_device(device)?;
        let mut state = self.lock()?;

        match state.blocks.get(&address) {
            Some(block) if block.kind == BlockKind::Device(device) => {}
            _ => {
                return Err(DevCacheError::runtime(
                    "free",
                    INVALID_VALUE,
                    format!("{:#x} is not a device {} allocation", address, device),
                ))
            }
        }

        if let Some(block) = state.blocks.remove(&address) {
            state.used[device] -= block.data.len();
        }
        state.stats.free_count += 1;
        Ok(())
    }

    fn host_alloc(&self, size: usize) -> DevCacheResult<usize> {
        self.ensure_reachable()?;
        let mut state = self.lock()?;

        if size > self.host_capacity.saturating_sub(state.host_used) {
            return Err(DevCacheError::HostAllocationFailed {
                requested: size,
                message: "pinned host capacity exhausted".to_string(),
            });
        }

        let address = Self::carve(&mut state, size, BlockKind::PinnedHost);
        state.host_used += size;
        state.stats.host_alloc_count += 1;
        Ok(address)
    }

    fn host_free(&self, address: usize) -> DevCacheResult<()> {
        self.ensure_reachable()?;
        let mut state = self.lock()?;

        match state.blocks.get(&address) {
            Some(block) if block.kind == BlockKind::PinnedHost => {}
            _ => {
                return Err(DevCacheError::runtime(
                    "host_free",
                    INVALID_VALUE,
                    format!("{:#x} is not a pinned host allocation", address),
                ))
            }
        }

        if let Some(block) = state.blocks.remove(&address) {
            state.host_used -= block.data.len();
        }
        state.stats.host_free_count += 1;
        Ok(())
    }

    fn memset_zero(&self, address: usize, len: usize) -> DevCacheResult<()> {
        self.ensure_reachable()?;
        let mut state = self.lock()?;
        let (block, offset) = state.locate("memset", address, len)?;
        block.data[offset..offset + len].fill(0);
        state.stats.transfer_count += 1;
        Ok(())
    }

    fn copy_from_host(&self, dst: usize, src: &[u8]) -> DevCacheResult<()> {
        self.ensure_reachable()?;
        let mut state = self.lock()?;
        let (block, offset) = state.locate("copy_from_host", dst, src.len())?;
        block.data[offset..offset + src.len()].copy_from_slice(src);
        state.stats.transfer_count += 1;
        Ok(())
    }

    fn copy_to_host(&self, dst: &mut [u8], src: usize) -> DevCacheResult<()> {
        self.ensure_reachable()?;
        let mut state = self.lock()?;
        let len = dst.len();
        let (block, offset) = state.locate("copy_to_host", src, len)?;
        dst.copy_from_slice(&block.data[offset..offset + len]);
        state.stats.transfer_count += 1;
        Ok(())
    }

    fn copy(&self, dst: usize, src: usize, len: usize) -> DevCacheResult<()> {
        self.ensure_reachable()?;
        let mut state = self.lock()?;

        let staged = {
            let (block, offset) = state.locate("copy", src, len)?;
            block.data[offset..offset + len].to_vec()
        };
        let (block, offset) = state.locate("copy", dst, len)?;
        block.data[offset..offset + len].copy_from_slice(&staged);

        state.stats.transfer_count += 1;
        Ok(())
    }

    fn reset(&self) -> DevCacheResult<()> {
        self.ensure_reachable()?;
        let mut state = self.lock()?;

        state
            .blocks
            .retain(|_, block| block.kind == BlockKind::PinnedHost);
        state.used.iter_mut().for_each(|used| *used = 0);
        state.enabled_peers.clear();
        state.stats.reset_count += 1;
        Ok(())
    }
}
