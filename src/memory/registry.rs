//! Residency registry
//!
//! Every live device and pinned-host buffer has exactly one [`AllocationRecord`]
//! here until it is physically released.
//!
//! # Layout
//!
//! Records sit in an indexed arena (`Vec<Option<Node>>`) threaded by a singly
//! linked list of slot indices. New records are pushed at the head, so scans
//! see the most recently registered buffers first. Vacated slots are recycled.
//!
//! # Locking
//!
//! One mutex guards the whole structure. Every primitive runs entirely under
//! it, so no caller observes a half-linked or half-updated record, and two
//! threads racing for the same cached record get mutually exclusive outcomes.
//! No primitive calls into a device runtime.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use super::{AllocationRecord, DeviceFilter, Residency, ThreadFilter};
use crate::device::{DeviceId, WorkerId};
use crate::error::{DevCacheError, DevCacheResult};

#[derive(Debug)]
struct Node {
    record: AllocationRecord,
    next: Option<usize>,
}

#[derive(Debug, Default)]
struct Arena {
    slots: Vec<Option<Node>>,
    vacant: Vec<usize>,
    head: Option<usize>,
    len: usize,
}

/// Position of a linked node: its slot and its predecessor's slot
#[derive(Debug, Clone, Copy)]
struct Link {
    prev: Option<usize>,
    slot: usize,
}

impl Arena {
    fn node(&self, slot: usize) -> Option<&Node> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    fn push_front(&mut self, record: AllocationRecord) {
        let node = Node {
            record,
            next: self.head,
        };
        let slot = match self.vacant.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.head = Some(slot);
        self.len += 1;
    }

    /// First node, in list order, whose record satisfies `pred`
    fn find<P>(&self, mut pred: P) -> Option<Link>
    where
        P: FnMut(&AllocationRecord) -> bool,
    {
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let node = self.node(slot)?;
            if pred(&node.record) {
                return Some(Link { prev, slot });
            }
            prev = Some(slot);
            cursor = node.next;
        }
        None
    }

    fn unlink(&mut self, link: Link) -> Option<AllocationRecord> {
        let node = self.slots.get_mut(link.slot)?.take()?;
        match link.prev {
            Some(prev) => {
                if let Some(prev_node) = self.node_mut(prev) {
                    prev_node.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        self.vacant.push(link.slot);
        self.len -= 1;
        Some(node.record)
    }

    fn iter(&self) -> ArenaIter<'_> {
        ArenaIter {
            arena: self,
            cursor: self.head,
        }
    }
}

struct ArenaIter<'a> {
    arena: &'a Arena,
    cursor: Option<usize>,
}

impl<'a> Iterator for ArenaIter<'a> {
    type Item = &'a AllocationRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.arena.node(self.cursor?)?;
        self.cursor = node.next;
        Some(&node.record)
    }
}

/// Process-wide registry of live allocations
#[derive(Debug, Default)]
pub struct ResidencyRegistry {
    inner: Mutex<Arena>,
}

impl ResidencyRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> DevCacheResult<MutexGuard<'_, Arena>> {
        Ok(self.inner.lock()?)
    }

    /// Register a freshly allocated buffer
    pub fn insert(&self, record: AllocationRecord) -> DevCacheResult<()> {
        let mut arena = self.lock()?;
        arena.push_front(record);
        tracing::trace!(
            address = record.address,
            length = record.length,
            residency = %record.residency,
            device = record.owning_device,
            records = arena.len,
            "registered allocation"
        );
        Ok(())
    }

    /// Record whose range contains `address`, optionally unlinking it
    ///
    /// Sub-buffer pointers resolve to their containing allocation. `None` is the
    /// normal answer for addresses the allocator never handed out.
    pub fn find_exact(&self, address: usize, remove: bool) -> DevCacheResult<Option<AllocationRecord>> {
        if address == 0 {
            return Ok(None);
        }

        let mut arena = self.lock()?;
        let Some(link) = arena.find(|r| r.contains(address)) else {
            return Ok(None);
        };

        if remove {
            Ok(arena.unlink(link))
        } else {
            Ok(arena.node(link.slot).map(|n| n.record))
        }
    }

    /// Claim the first cached device buffer of at least `min_length` bytes
    ///
    /// First fit in list order over records that are free, device-resident, on
    /// `device` and owned by a worker passing `thread`. The claimed record is
    /// marked in use and handed to `claimant` before the lock is released.
    pub fn find_reusable(
        &self,
        device: DeviceId,
        min_length: usize,
        thread: ThreadFilter,
        claimant: WorkerId,
    ) -> DevCacheResult<Option<AllocationRecord>> {
        let mut arena = self.lock()?;
        let Some(link) = arena.find(|r| {
            r.is_cached()
                && r.owning_device == device
                && r.length >= min_length
                && thread.matches(r.owning_thread)
        }) else {
            return Ok(None);
        };

        Ok(arena.node_mut(link.slot).map(|node| {
            node.record.free = false;
            node.record.owning_thread = claimant;
            node.record
        }))
    }

    /// Flip a device buffer to cached
    ///
    /// # Errors
    ///
    /// Checked in this order: `UnknownAddress`, `InteriorPointer`,
    /// `ResidencyMismatch` (pinned-host buffer), `DoubleFree`.
    pub fn mark_free(&self, address: usize) -> DevCacheResult<AllocationRecord> {
        let mut arena = self.lock()?;
        let link = Self::locate_base(&arena, address, Residency::Device)?;

        let node = arena
            .node_mut(link.slot)
            .ok_or(DevCacheError::UnknownAddress { address })?;
        node.record.free = true;
        Ok(node.record)
    }

    /// Unlink the in-use record based at `address` for immediate physical release
    ///
    /// Same checks and order as [`mark_free`](Self::mark_free), against `expected`.
    pub fn unlink_exact(&self, address: usize, expected: Residency) -> DevCacheResult<AllocationRecord> {
        let mut arena = self.lock()?;
        let link = Self::locate_base(&arena, address, expected)?;
        arena
            .unlink(link)
            .ok_or(DevCacheError::UnknownAddress { address })
    }

    /// Unlink the record based at `address` if it is still cached
    ///
    /// `None` if a sweep already took it or a worker reclaimed it.
    pub fn unlink_cached(&self, address: usize) -> DevCacheResult<Option<AllocationRecord>> {
        let mut arena = self.lock()?;
        let link = arena.find(|r| r.address == address && r.is_cached());
        Ok(link.and_then(|link| arena.unlink(link)))
    }

    /// Unlink one cached record matching both filters
    ///
    /// Used by the reclaim sweep; the caller physically releases the result.
    pub fn mark_free_and_unlink(
        &self,
        device: DeviceFilter,
        thread: ThreadFilter,
    ) -> DevCacheResult<Option<AllocationRecord>> {
        let mut arena = self.lock()?;
        let link = arena.find(|r| {
            r.is_cached() && device.matches(r.owning_device) && thread.matches(r.owning_thread)
        });
        Ok(link.and_then(|link| arena.unlink(link)))
    }

    /// Copy of every record, most recently registered first
    pub fn snapshot(&self) -> DevCacheResult<Vec<AllocationRecord>> {
        Ok(self.lock()?.iter().copied().collect())
    }

    /// Number of registered records
    pub fn len(&self) -> usize {
        self.lock().map(|arena| arena.len).unwrap_or(0)
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate counts over all records
    pub fn stats(&self) -> DevCacheResult<RegistryStats> {
        let arena = self.lock()?;
        let mut stats = RegistryStats::default();
        for record in arena.iter() {
            stats.records += 1;
            match (record.residency, record.free) {
                (Residency::Device, true) => {
                    stats.device_cached += 1;
                    stats.cached_bytes += record.length;
                }
                (Residency::Device, false) => {
                    stats.device_in_use += 1;
                    stats.in_use_bytes += record.length;
                }
                (Residency::HostPinned, _) => {
                    stats.host_pinned += 1;
                    stats.in_use_bytes += record.length;
                }
            }
        }
        Ok(stats)
    }

    fn locate_base(arena: &Arena, address: usize, expected: Residency) -> DevCacheResult<Link> {
        let link = match address {
            0 => None,
            _ => arena.find(|r| r.contains(address)),
        }
        .ok_or(DevCacheError::UnknownAddress { address })?;

        let record = arena
            .node(link.slot)
            .map(|n| n.record)
            .ok_or(DevCacheError::UnknownAddress { address })?;

        if record.address != address {
            return Err(DevCacheError::InteriorPointer {
                address,
                base: record.address,
            });
        }
        if record.residency != expected {
            return Err(DevCacheError::ResidencyMismatch {
                address,
                expected,
                actual: record.residency,
            });
        }
        if record.free {
            return Err(DevCacheError::DoubleFree { address });
        }
        Ok(link)
    }
}

/// Registry occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// All records
    pub records: usize,
    /// Device buffers in logical use
    pub device_in_use: usize,
    /// Device buffers cached for reuse
    pub device_cached: usize,
    /// Pinned host buffers
    pub host_pinned: usize,
    /// Bytes held by cached device buffers
    pub cached_bytes: usize,
    /// Bytes held by in-use device and pinned host buffers
    pub in_use_bytes: usize,
}

impl fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RegistryStats {{ records: {}, device in use: {}, cached: {}, pinned host: {}, \
             in use: {:.2} MB, cached: {:.2} MB }}",
            self.records,
            self.device_in_use,
            self.device_cached,
            self.host_pinned,
            self.in_use_bytes as f64 / 1024.0 / 1024.0,
            self.cached_bytes as f64 / 1024.0 / 1024.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W1: WorkerId = WorkerId::from_raw(1);
    const W2: WorkerId = WorkerId::from_raw(2);

    fn device_record(address: usize, length: usize, device: DeviceId, thread: WorkerId) -> AllocationRecord {
        AllocationRecord::new(address, length, Residency::Device, device, thread)
    }

    fn registry_with(records: &[AllocationRecord]) -> ResidencyRegistry {
        let registry = ResidencyRegistry::new();
        for record in records {
            registry.insert(*record).unwrap();
        }
        registry
    }

    #[test]
    fn test_find_exact_resolves_interior_pointers() {
        let registry = registry_with(&[device_record(0x1000, 0x100, 0, W1)]);

        let found = registry.find_exact(0x1080, false).unwrap().unwrap();
        assert_eq!(found.address, 0x1000);
        assert_eq!(registry.find_exact(0x1100, false).unwrap(), None);
        assert_eq!(registry.find_exact(0, false).unwrap(), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_find_exact_remove_unlinks() {
        let registry = registry_with(&[
            device_record(0x1000, 0x100, 0, W1),
            device_record(0x2000, 0x100, 0, W1),
            device_record(0x3000, 0x100, 0, W1),
        ]);

        // Middle of the list
        let removed = registry.find_exact(0x2000, true).unwrap().unwrap();
        assert_eq!(removed.address, 0x2000);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find_exact(0x2000, false).unwrap(), None);

        // Head of the list
        registry.find_exact(0x3000, true).unwrap().unwrap();
        let remaining: Vec<usize> = registry.snapshot().unwrap().iter().map(|r| r.address).collect();
        assert_eq!(remaining, vec![0x1000]);
    }

    #[test]
    fn test_vacant_slots_are_recycled() {
        let registry = registry_with(&[device_record(0x1000, 8, 0, W1)]);
        registry.find_exact(0x1000, true).unwrap();
        registry.insert(device_record(0x2000, 8, 0, W1)).unwrap();

        let arena = registry.inner.lock().unwrap();
        assert_eq!(arena.slots.len(), 1);
        assert!(arena.vacant.is_empty());
    }

    #[test]
    fn test_find_reusable_first_fit_and_claim() {
        let registry = registry_with(&[
            device_record(0x1000, 256, 0, W1),
            device_record(0x2000, 4096, 0, W1),
        ]);
        registry.mark_free(0x1000).unwrap();
        registry.mark_free(0x2000).unwrap();

        // Head is the most recent insert (0x2000), which fits first.
        let hit = registry.find_reusable(0, 128, ThreadFilter::Any, W2).unwrap().unwrap();
        assert_eq!(hit.address, 0x2000);
        assert!(!hit.free);
        assert_eq!(hit.owning_thread, W2);

        let hit = registry.find_reusable(0, 128, ThreadFilter::Any, W2).unwrap().unwrap();
        assert_eq!(hit.address, 0x1000);

        assert_eq!(registry.find_reusable(0, 1, ThreadFilter::Any, W2).unwrap(), None);
    }

    #[test]
    fn test_find_reusable_filters() {
        let registry = registry_with(&[
            device_record(0x1000, 256, 1, W1),
            device_record(0x2000, 64, 0, W1),
            device_record(0x3000, 256, 0, W2),
        ]);
        for address in [0x1000, 0x2000, 0x3000] {
            registry.mark_free(address).unwrap();
        }

        // Wrong device
        assert_eq!(registry.find_reusable(2, 1, ThreadFilter::Any, W1).unwrap(), None);
        // Too small
        assert_eq!(
            registry.find_reusable(0, 128, ThreadFilter::Only(W1), W1).unwrap(),
            None
        );
        // Thread filter
        let hit = registry.find_reusable(0, 128, ThreadFilter::Only(W2), W1).unwrap().unwrap();
        assert_eq!(hit.address, 0x3000);
        assert_eq!(hit.owning_thread, W1);
    }

    #[test]
    fn test_pinned_records_never_reused() {
        let registry = registry_with(&[AllocationRecord::new(0x1000, 64, Residency::HostPinned, 0, W1)]);
        assert_eq!(registry.find_reusable(0, 1, ThreadFilter::Any, W1).unwrap(), None);
    }

    #[test]
    fn test_mark_free_consistency_checks() {
        let registry = registry_with(&[
            device_record(0x1000, 64, 0, W1),
            AllocationRecord::new(0x2000, 64, Residency::HostPinned, 0, W1),
        ]);

        assert_eq!(
            registry.mark_free(0x9000).unwrap_err(),
            DevCacheError::UnknownAddress { address: 0x9000 }
        );
        assert_eq!(
            registry.mark_free(0).unwrap_err(),
            DevCacheError::UnknownAddress { address: 0 }
        );
        assert_eq!(
            registry.mark_free(0x1008).unwrap_err(),
            DevCacheError::InteriorPointer {
                address: 0x1008,
                base: 0x1000
            }
        );
        assert_eq!(
            registry.mark_free(0x2000).unwrap_err(),
            DevCacheError::ResidencyMismatch {
                address: 0x2000,
                expected: Residency::Device,
                actual: Residency::HostPinned
            }
        );

        assert!(registry.mark_free(0x1000).unwrap().free);
        assert_eq!(
            registry.mark_free(0x1000).unwrap_err(),
            DevCacheError::DoubleFree { address: 0x1000 }
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unlink_exact() {
        let registry = registry_with(&[
            device_record(0x1000, 64, 0, W1),
            AllocationRecord::new(0x2000, 64, Residency::HostPinned, 0, W1),
        ]);

        assert!(matches!(
            registry.unlink_exact(0x1000, Residency::HostPinned),
            Err(DevCacheError::ResidencyMismatch { .. })
        ));
        let record = registry.unlink_exact(0x2000, Residency::HostPinned).unwrap();
        assert_eq!(record.residency, Residency::HostPinned);
        assert_eq!(registry.len(), 1);
        assert!(matches!(
            registry.unlink_exact(0x2000, Residency::HostPinned),
            Err(DevCacheError::UnknownAddress { address: 0x2000 })
        ));
    }

    #[test]
    fn test_unlink_cached_only_takes_cached_base() {
        let registry = registry_with(&[device_record(0x1000, 0x100, 0, W1)]);

        assert_eq!(registry.unlink_cached(0x1000).unwrap(), None);
        registry.mark_free(0x1000).unwrap();
        assert_eq!(registry.unlink_cached(0x1080).unwrap(), None);

        let record = registry.unlink_cached(0x1000).unwrap().unwrap();
        assert_eq!(record.address, 0x1000);
        assert!(registry.is_empty());
        assert_eq!(registry.unlink_cached(0x1000).unwrap(), None);
    }

    #[test]
    fn test_mark_free_and_unlink_filters() {
        let registry = registry_with(&[
            device_record(0x1000, 64, 0, W1),
            device_record(0x2000, 64, 1, W1),
            device_record(0x3000, 64, 0, W2),
            device_record(0x4000, 64, 0, W1),
        ]);
        for address in [0x1000, 0x2000, 0x3000] {
            registry.mark_free(address).unwrap();
        }

        let mut swept = Vec::new();
        while let Some(record) = registry
            .mark_free_and_unlink(DeviceFilter::Any, ThreadFilter::Only(W1))
            .unwrap()
        {
            swept.push(record.address);
        }
        swept.sort_unstable();
        assert_eq!(swept, vec![0x1000, 0x2000]);

        // W2's cached record and W1's in-use record survive
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry
                .mark_free_and_unlink(DeviceFilter::Only(1), ThreadFilter::Any)
                .unwrap(),
            None
        );
        let other = registry
            .mark_free_and_unlink(DeviceFilter::Only(0), ThreadFilter::Any)
            .unwrap()
            .unwrap();
        assert_eq!(other.address, 0x3000);
    }

    #[test]
    fn test_stats() {
        let registry = registry_with(&[
            device_record(0x1000, 1024, 0, W1),
            device_record(0x2000, 2048, 0, W1),
            AllocationRecord::new(0x3000, 512, Residency::HostPinned, 0, W1),
        ]);
        registry.mark_free(0x2000).unwrap();

        let stats = registry.stats().unwrap();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.device_in_use, 1);
        assert_eq!(stats.device_cached, 1);
        assert_eq!(stats.host_pinned, 1);
        assert_eq!(stats.cached_bytes, 2048);
        assert_eq!(stats.in_use_bytes, 1536);

        let display = stats.to_string();
        assert!(display.contains("records: 3"));
        assert!(display.contains("pinned host: 1"));
    }
}
