//! WGPU decode attention kernels.

mod dispatch;
mod kernel;
mod utils;

pub use kernel::{SdpaVectorError, SdpaVectorKernel};
pub(crate) use kernel::SHADER_DIM_LANES;
