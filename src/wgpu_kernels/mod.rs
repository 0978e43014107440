//! WGPU kernels (cross-platform GPU backend).

pub mod sdpa_vector;

pub use sdpa_vector::{SdpaVectorError, SdpaVectorKernel};
