//! [`DeviceRuntime`] over the HIP runtime API

use std::ffi::{c_void, CStr};

use super::ffi;
use crate::backend::{DeviceRuntime, MemoryInfo};
use crate::device::DeviceId;
use crate::error::{DevCacheError, DevCacheResult};

/// Human-readable message for a HIP status code
fn get_error_string(error: i32) -> String {
    unsafe {
        let error_ptr = ffi::hipGetErrorString(error);
        if error_ptr.is_null() {
            "Unknown error".to_string()
        } else {
            CStr::from_ptr(error_ptr).to_string_lossy().into_owned()
        }
    }
}

fn check(op: &'static str, code: i32) -> DevCacheResult<()> {
    if code == ffi::HIP_SUCCESS {
        Ok(())
    } else {
        Err(DevCacheError::runtime(op, code, get_error_string(code)))
    }
}

/// HIP-backed device runtime
///
/// `hipSetDevice` is per host thread, so every device-scoped call selects its
/// device first and no runtime-wide lock is needed.
#[derive(Debug)]
pub struct HipRuntime {
    device_count: usize,
}

impl HipRuntime {
    /// Initialize HIP and count the visible devices
    ///
    /// # Errors
    ///
    /// `DeviceUnavailable` if the driver cannot be initialized or no device is
    /// visible.
    pub fn new() -> DevCacheResult<Self> {
        let code = unsafe { ffi::hipInit(0) };
        if code != ffi::HIP_SUCCESS {
            return Err(DevCacheError::DeviceUnavailable(format!(
                "hipInit failed: {}",
                get_error_string(code)
            )));
        }

        let mut count: i32 = 0;
        let code = unsafe { ffi::hipGetDeviceCount(&mut count) };
        if code != ffi::HIP_SUCCESS || count <= 0 {
            return Err(DevCacheError::DeviceUnavailable(format!(
                "no HIP device visible (code {})",
                code
            )));
        }

        tracing::info!(devices = count, "HIP runtime initialized");
        Ok(Self {
            device_count: count as usize,
        })
    }

    fn check_device(&self, device: DeviceId) -> DevCacheResult<()> {
        if device >= self.device_count {
            return Err(DevCacheError::InvalidDevice {
                device,
                count: self.device_count,
            });
        }
        Ok(())
    }

    fn use_device(&self, device: DeviceId) -> DevCacheResult<()> {
        self.check_device(device)?;
        check("hipSetDevice", unsafe { ffi::hipSetDevice(device as i32) })
    }
}

impl DeviceRuntime for HipRuntime {
    fn name(&self) -> &'static str {
        "hip"
    }

    fn device_count(&self) -> DevCacheResult<usize> {
        Ok(self.device_count)
    }

    fn set_device(&self, device: DeviceId) -> DevCacheResult<()> {
        self.use_device(device)
    }

    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> DevCacheResult<bool> {
        self.check_device(device)?;
        self.check_device(peer)?;
        if device == peer {
            return Ok(false);
        }

        let mut can_access: i32 = 0;
        check("hipDeviceCanAccessPeer", unsafe {
            ffi::hipDeviceCanAccessPeer(&mut can_access, device as i32, peer as i32)
        })?;
        Ok(can_access != 0)
    }

    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> DevCacheResult<()> {
        self.check_device(peer)?;
        self.use_device(device)?;

        let code = unsafe { ffi::hipDeviceEnablePeerAccess(peer as i32, 0) };
        if code == ffi::HIP_ERROR_PEER_ACCESS_ALREADY_ENABLED {
            return Ok(());
        }
        check("hipDeviceEnablePeerAccess", code)
    }

    fn memory_info(&self, device: DeviceId) -> DevCacheResult<MemoryInfo> {
        self.use_device(device)?;

        let mut free: usize = 0;
        let mut total: usize = 0;
        check("hipMemGetInfo", unsafe {
            ffi::hipMemGetInfo(&mut free, &mut total)
        })?;
        Ok(MemoryInfo { free, total })
    }

    fn malloc(&self, device: DeviceId, size: usize) -> DevCacheResult<usize> {
        self.use_device(device)?;

        let mut ptr: *mut c_void = std::ptr::null_mut();
        let code = unsafe { ffi::hipMalloc(&mut ptr, size) };
        if code == ffi::HIP_ERROR_OUT_OF_MEMORY {
            let available = self.memory_info(device).map(|m| m.free).unwrap_or(0);
            return Err(DevCacheError::OutOfMemory {
                device,
                requested: size,
                available,
            });
        }
        check("hipMalloc", code)?;

        if ptr.is_null() {
            return Err(DevCacheError::runtime("hipMalloc", code, "null pointer returned"));
        }
        Ok(ptr as usize)
    }

    fn free(&self, device: DeviceId, address: usize) -> DevCacheResult<()> {
        self.use_device(device)?;
        check("hipFree", unsafe { ffi::hipFree(address as *mut c_void) })
    }

    fn host_alloc(&self, size: usize) -> DevCacheResult<usize> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        let code = unsafe { ffi::hipHostMalloc(&mut ptr, size, ffi::HIP_HOST_MALLOC_DEFAULT) };
        if code != ffi::HIP_SUCCESS || ptr.is_null() {
            return Err(DevCacheError::HostAllocationFailed {
                requested: size,
                message: get_error_string(code),
            });
        }
        Ok(ptr as usize)
    }

    fn host_free(&self, address: usize) -> DevCacheResult<()> {
        check("hipHostFree", unsafe {
            ffi::hipHostFree(address as *mut c_void)
        })
    }

    fn memset_zero(&self, address: usize, len: usize) -> DevCacheResult<()> {
        check("hipMemset", unsafe {
            ffi::hipMemset(address as *mut c_void, 0, len)
        })
    }

    fn copy_from_host(&self, dst: usize, src: &[u8]) -> DevCacheResult<()> {
        check("hipMemcpy", unsafe {
            ffi::hipMemcpy(
                dst as *mut c_void,
                src.as_ptr() as *const c_void,
                src.len(),
                ffi::HIP_MEMCPY_DEFAULT,
            )
        })
    }

    fn copy_to_host(&self, dst: &mut [u8], src: usize) -> DevCacheResult<()> {
        check("hipMemcpy", unsafe {
            ffi::hipMemcpy(
                dst.as_mut_ptr() as *mut c_void,
                src as *const c_void,
                dst.len(),
                ffi::HIP_MEMCPY_DEFAULT,
            )
        })
    }

    fn copy(&self, dst: usize, src: usize, len: usize) -> DevCacheResult<()> {
        check("hipMemcpy", unsafe {
            ffi::hipMemcpy(
                dst as *mut c_void,
                src as *const c_void,
                len,
                ffi::HIP_MEMCPY_DEFAULT,
            )
        })
    }

    fn copy_2d(
        &self,
        dst: usize,
        dst_pitch: usize,
        src: usize,
        src_pitch: usize,
        width: usize,
        height: usize,
    ) -> DevCacheResult<()> {
        check("hipMemcpy2D", unsafe {
            ffi::hipMemcpy2D(
                dst as *mut c_void,
                dst_pitch,
                src as *const c_void,
                src_pitch,
                width,
                height,
                ffi::HIP_MEMCPY_DEFAULT,
            )
        })
    }

    fn reset(&self) -> DevCacheResult<()> {
        for device in 0..self.device_count {
            self.use_device(device)?;
            check("hipDeviceReset", unsafe { ffi::hipDeviceReset() })?;
        }
        Ok(())
    }
}
