//! ROCm/HIP device runtime
//!
//! Compiled only with the `rocm` feature; links against `libamdhip64`.

mod ffi;
mod runtime;

pub use runtime::HipRuntime;
