//! Residency-driven kernel dispatch
//!
//! Point-wise kernel tables and linear-algebra wrappers pick a device or a host
//! implementation by asking the allocator where their operands live, and
//! allocate their `f32` vectors through it.

use std::mem::size_of;

use crate::error::{DevCacheError, DevCacheResult};
use crate::memory::CachingAllocator;

/// Where a kernel over a set of operands must run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    /// All operands are device-resident
    Device,
    /// No operand is device-resident
    Host,
}

impl ExecutionPath {
    /// Choose the path for `operands`
    ///
    /// Null operands are ignored. With no non-null operand the host path is
    /// chosen.
    ///
    /// # Errors
    ///
    /// `MixedOperands` if some operands are device-resident and others are not.
    pub fn for_operands(allocator: &CachingAllocator, operands: &[usize]) -> DevCacheResult<Self> {
        let mut device_operand = None;
        let mut host_operand = None;

        for &address in operands.iter().filter(|&&a| a != 0) {
            if allocator.is_device_resident(address) {
                device_operand.get_or_insert(address);
            } else {
                host_operand.get_or_insert(address);
            }
        }

        match (device_operand, host_operand) {
            (Some(device_operand), Some(host_operand)) => Err(allocator.violation(
                DevCacheError::MixedOperands {
                    device_operand,
                    host_operand,
                },
            )),
            (Some(_), None) => Ok(ExecutionPath::Device),
            (None, _) => Ok(ExecutionPath::Host),
        }
    }

    /// True when the kernel should run on the device
    pub fn is_device(&self) -> bool {
        matches!(self, ExecutionPath::Device)
    }
}

/// Allocate a device vector of `n` floats
pub fn allocate_f32(allocator: &CachingAllocator, n: usize) -> DevCacheResult<usize> {
    allocator.allocate(f32_bytes(n)?)
}

/// Release a vector from [`allocate_f32`]
pub fn release_f32(allocator: &CachingAllocator, address: usize) -> DevCacheResult<()> {
    allocator.release(address)
}

/// Zero `n` floats at `address`
pub fn clear_f32(allocator: &CachingAllocator, n: usize, address: usize) -> DevCacheResult<()> {
    allocator.clear(address, f32_bytes(n)?)
}

/// Copy `n` floats from `src` to `dst`
pub fn copy_f32(allocator: &CachingAllocator, n: usize, dst: usize, src: usize) -> DevCacheResult<()> {
    allocator.copy(dst, src, f32_bytes(n)?)
}

fn f32_bytes(n: usize) -> DevCacheResult<usize> {
    n.checked_mul(size_of::<f32>()).ok_or_else(|| {
        DevCacheError::InvalidConfiguration(format!("{} f32 elements overflow the address space", n))
    })
}
