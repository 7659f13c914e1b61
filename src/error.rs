//! Unified error handling for devcache
//!
//! Every fallible operation in the crate returns [`DevCacheError`]. Variants are
//! grouped into categories that decide how a caller reacts:
//! - Device errors (runtime unreachable, bad device id or peer pair): fatal to the operation
//! - Allocation errors (device or pinned-host memory exhausted): retry after `clear_cache()`
//! - Consistency errors (double free, unknown or wrong-residency pointer): programmer error
//!
//! Residency and reachability queries never produce errors; an unknown pointer is
//! a negative answer, not a failure.

use std::fmt;

use crate::memory::Residency;

/// Unified error type for devcache
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DevCacheError {
    // ========== Device Errors ==========
    /// The accelerator runtime cannot be reached
    #[error("device runtime unavailable: {0}")]
    DeviceUnavailable(String),

    /// Device id outside `[0, count)`
    #[error("invalid device {device}: {count} device(s) visible")]
    InvalidDevice { device: usize, count: usize },

    /// Device pair cannot address each other's memory
    #[error("peer access from device {device} to device {peer} is not supported")]
    PeerAccessUnsupported { device: usize, peer: usize },

    /// A runtime call failed with a raw status code
    #[error("{op} failed with code {code}: {message}")]
    Runtime {
        op: &'static str,
        code: i32,
        message: String,
    },

    // ========== Allocation Errors ==========
    /// Device memory exhausted
    #[error("out of memory on device {device}: {requested} bytes requested, {available} bytes available")]
    OutOfMemory {
        device: usize,
        requested: usize,
        available: usize,
    },

    /// Pinned host memory could not be allocated
    #[error("pinned host allocation of {requested} bytes failed: {message}")]
    HostAllocationFailed { requested: usize, message: String },

    /// Zero-byte request (a zero-length range can never be looked up again)
    #[error("zero-sized allocation requested")]
    ZeroSizedAllocation,

    // ========== Consistency Errors ==========
    /// Buffer released twice while caching is enabled
    #[error("double free of {address:#x}")]
    DoubleFree { address: usize },

    /// Pointer never handed out by the allocator (or already physically released)
    #[error("address {address:#x} is not registered")]
    UnknownAddress { address: usize },

    /// Pointer released through the wrong residency path
    #[error("address {address:#x} is {actual} memory, expected {expected}")]
    ResidencyMismatch {
        address: usize,
        expected: Residency,
        actual: Residency,
    },

    /// Access to a buffer that was released and now sits in the cache
    #[error("address {address:#x} lies in the released buffer at {base:#x}")]
    UseAfterRelease { address: usize, base: usize },

    /// Pointer lies inside an allocation but is not its base
    #[error("address {address:#x} is interior to the allocation at {base:#x}")]
    InteriorPointer { address: usize, base: usize },

    /// Byte range runs past the end of its containing allocation
    #[error("range {address:#x}+{len} exceeds the {length}-byte allocation at {base:#x}")]
    OutOfBounds {
        address: usize,
        len: usize,
        base: usize,
        length: usize,
    },

    /// Kernel operands live in different memory spaces
    #[error("operand {device_operand:#x} is device memory but {host_operand:#x} is not")]
    MixedOperands {
        device_operand: usize,
        host_operand: usize,
    },

    /// Caching switched off after the thread already selected a device
    #[error("caching can only be disabled before the calling thread selects a device")]
    CachingLocked,

    /// Registry lock poisoned by a panicking thread
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),

    // ========== Internal Errors ==========
    /// A process-wide allocator is already installed
    #[error("a process-wide allocator is already installed")]
    AlreadyInstalled,

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl DevCacheError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            DevCacheError::DeviceUnavailable(_)
            | DevCacheError::InvalidDevice { .. }
            | DevCacheError::PeerAccessUnsupported { .. }
            | DevCacheError::Runtime { .. } => ErrorCategory::Device,

            DevCacheError::OutOfMemory { .. }
            | DevCacheError::HostAllocationFailed { .. }
            | DevCacheError::ZeroSizedAllocation => ErrorCategory::Allocation,

            DevCacheError::DoubleFree { .. }
            | DevCacheError::UnknownAddress { .. }
            | DevCacheError::ResidencyMismatch { .. }
            | DevCacheError::InteriorPointer { .. }
            | DevCacheError::UseAfterRelease { .. }
            | DevCacheError::OutOfBounds { .. }
            | DevCacheError::MixedOperands { .. }
            | DevCacheError::CachingLocked
            | DevCacheError::LockPoisoned(_) => ErrorCategory::Consistency,

            DevCacheError::AlreadyInstalled | DevCacheError::InvalidConfiguration(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Check if the caller may retry (after reclaiming cached memory)
    ///
    /// Only memory exhaustion qualifies. Device errors are never retried and
    /// consistency errors must not be masked.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Allocation)
            && !matches!(self, DevCacheError::ZeroSizedAllocation)
    }

    /// Check if this error reports a broken allocator contract
    pub fn is_consistency_violation(&self) -> bool {
        matches!(self.category(), ErrorCategory::Consistency)
    }

    /// Build a runtime error from a raw status code
    pub fn runtime(op: &'static str, code: i32, message: impl Into<String>) -> Self {
        DevCacheError::Runtime {
            op,
            code,
            message: message.into(),
        }
    }
}

/// Error category for handling decisions
///
/// - Device: fatal to the calling operation, never retried internally
/// - Allocation: caller may `clear_cache()` and retry once
/// - Consistency: programmer error, never silently recovered
/// - Internal: setup or configuration mistakes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Device runtime or device id failure
    Device,
    /// Memory exhausted
    Allocation,
    /// Allocator contract violated
    Consistency,
    /// Setup or configuration problem
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Device => write!(f, "Device"),
            ErrorCategory::Allocation => write!(f, "Allocation"),
            ErrorCategory::Consistency => write!(f, "Consistency"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for DevCacheError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DevCacheError::LockPoisoned(err.to_string())
    }
}

/// Result type using [`DevCacheError`]
pub type DevCacheResult<T> = std::result::Result<T, DevCacheError>;
