//! HIP FFI bindings
//!
//! Only the memory-management and device-selection subset of the HIP API.

use std::ffi::c_void;

#[link(name = "amdhip64")]
extern "C" {
    pub fn hipInit(flags: u32) -> i32;
    pub fn hipGetDeviceCount(count: *mut i32) -> i32;
    pub fn hipSetDevice(deviceId: i32) -> i32;
    pub fn hipDeviceCanAccessPeer(canAccessPeer: *mut i32, deviceId: i32, peerDeviceId: i32) -> i32;
    pub fn hipDeviceEnablePeerAccess(peerDeviceId: i32, flags: u32) -> i32;
    pub fn hipMemGetInfo(free: *mut usize, total: *mut usize) -> i32;
    pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub fn hipFree(ptr: *mut c_void) -> i32;
    pub fn hipHostMalloc(ptr: *mut *mut c_void, size: usize, flags: u32) -> i32;
    pub fn hipHostFree(ptr: *mut c_void) -> i32;
    pub fn hipMemset(dst: *mut c_void, value: i32, count: usize) -> i32;
    pub fn hipMemcpy(dst: *mut c_void, src: *const c_void, count: usize, kind: i32) -> i32;
    pub fn hipMemcpy2D(
        dst: *mut c_void,
        dpitch: usize,
        src: *const c_void,
        spitch: usize,
        width: usize,
        height: usize,
        kind: i32,
    ) -> i32;
    pub fn hipDeviceReset() -> i32;
    pub fn hipGetErrorString(error: i32) -> *const i8;
}

/// HIP success code
pub const HIP_SUCCESS: i32 = 0;

/// `hipErrorOutOfMemory`
pub const HIP_ERROR_OUT_OF_MEMORY: i32 = 2;

/// `hipErrorPeerAccessAlreadyEnabled`
pub const HIP_ERROR_PEER_ACCESS_ALREADY_ENABLED: i32 = 704;

/// Direction inferred from unified virtual addressing
pub const HIP_MEMCPY_DEFAULT: i32 = 4;

/// `hipHostMallocDefault`
pub const HIP_HOST_MALLOC_DEFAULT: u32 = 0x0;
