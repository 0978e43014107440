//! Kernel-related types shared across backends.

use thiserror::Error;

/// Errors surfaced by the kernel entry points.
///
/// The numerical kernels themselves are unguarded once shapes are validated;
/// everything here is detectable before any arithmetic runs.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Invalid launch or shape configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// WGPU driver error or initialization failure.
    #[error("wgpu error: {0}")]
    Wgpu(String),
    /// Unsupported device or element-type capability.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Float type identifier for const-time kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatType {
    F32,
    F16,
    BF16,
}

/// Trait for kernel-compatible floating point types.
/// Implemented for f32, half::f16, and half::bf16. Zero-cost via monomorphization.
pub trait KernelFloat: Copy + Default + Send + Sync + 'static {
    /// Compile-time type identifier for zero-cost kernel selection.
    const TYPE_ID: FloatType;

    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
    fn zero() -> Self;
}

impl KernelFloat for f32 {
    const TYPE_ID: FloatType = FloatType::F32;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v
    }
    #[inline(always)]
    fn zero() -> Self {
        0.0
    }
}

impl KernelFloat for half::f16 {
    const TYPE_ID: FloatType = FloatType::F16;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        half::f16::to_f32(self)
    }
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        half::f16::from_f32(v)
    }
    #[inline(always)]
    fn zero() -> Self {
        half::f16::ZERO
    }
}

impl KernelFloat for half::bf16 {
    const TYPE_ID: FloatType = FloatType::BF16;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        half::bf16::to_f32(self)
    }
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        half::bf16::from_f32(v)
    }
    #[inline(always)]
    fn zero() -> Self {
        half::bf16::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_float_roundtrip() {
        assert_eq!(f32::from_f32(1.5).to_f32(), 1.5);
        assert!((half::f16::from_f32(1.5).to_f32() - 1.5).abs() < 1e-3);
        assert!((half::bf16::from_f32(1.5).to_f32() - 1.5).abs() < 1e-2);
        assert_eq!(half::f16::zero().to_f32(), 0.0);
    }
}
