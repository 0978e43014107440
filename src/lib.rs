//! sdpa-kernels: single-step (decode) attention kernels for LLM inference.
//!
//! This crate computes one step of scaled dot-product attention — one query
//! vector per head against a growing KV cache — with:
//! - **Runtime Backend Selection**: WGPU when a usable adapter exists, CPU
//!   reference kernels otherwise (and as the fallback for any GPU failure)
//! - **Streaming Softmax**: numerically stable online max/sum-exp rescaling,
//!   no materialized score vector
//! - **Quantized KV Caches**: 4-bit and 8-bit affine group codes with
//!   dequantization fused into the score and output accumulation
//! - **Grouped-Query Attention**: query heads share KV heads via
//!   `num_heads / num_kv_heads`
//!
//! # Quick Start
//!
//! ```ignore
//! use sdpa_kernels::{KernelDispatcher, DecodeAttentionConfig};
//!
//! let dispatcher = KernelDispatcher::new(); // Auto-detect backend
//! dispatcher.decode_attention(q, k_cache, v_cache, &mut output, config)?;
//! ```

pub mod cpu_kernels;
pub mod kernel_types;
pub mod quant;
pub mod validation;

// WGPU kernels (cross-platform); CPU fallback covers missing adapters.
pub mod wgpu_kernels;

// Runtime backend detection.
pub mod runtime_detection;

// Kernel dispatcher.
pub mod kernel_dispatcher;

pub use runtime_detection::{detect_backend, BackendType};

pub use kernel_dispatcher::{
    DecodeAttentionConfig, KernelDispatcher, QuantizedDecodeAttentionConfig,
};

pub use kernel_types::{FloatType, KernelError, KernelFloat, KernelResult};

pub use quant::{dequantize_affine, quantize_affine, QuantBits};

pub use wgpu_kernels::{SdpaVectorError, SdpaVectorKernel};
