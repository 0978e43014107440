//! Zero-cost kernel dispatcher with runtime backend selection.

use std::sync::OnceLock;

use crate::cpu_kernels;
use crate::kernel_types::{FloatType, KernelError, KernelFloat, KernelResult};
use crate::quant::QuantBits;
use crate::runtime_detection::{detect_backend, BackendType};
use crate::validation::{
    validate_buffers, validate_decode_dims, validate_k_stride, validate_partition,
    validate_quant_buffers, validate_quant_groups, QUAD_LANES,
};
use crate::wgpu_kernels::sdpa_vector::{SdpaVectorKernel, SHADER_DIM_LANES};

static WGPU_KERNEL: OnceLock<Option<SdpaVectorKernel>> = OnceLock::new();

fn get_wgpu_kernel() -> Option<&'static SdpaVectorKernel> {
    WGPU_KERNEL
        .get_or_init(|| match SdpaVectorKernel::create_default() {
            Ok(kernel) => Some(kernel),
            Err(e) => {
                log::warn!("Failed to initialize WGPU decode attention kernel: {}", e);
                None
            }
        })
        .as_ref()
}

/// Configuration for the full-precision decode attention kernel.
#[derive(Clone, Debug)]
pub struct DecodeAttentionConfig {
    /// Batch size.
    pub batch_size: usize,
    /// Number of query heads.
    pub num_heads: usize,
    /// Number of KV heads; `num_heads` must be a multiple of this.
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Number of cached key/value positions. May be zero.
    pub seq_len: usize,
    /// Optional score scale (default: 1/sqrt(head_dim)).
    pub scale: Option<f32>,
    /// Element stride between consecutive KV heads in the caches
    /// (default: `seq_len * head_dim`; larger for over-allocated caches).
    pub k_stride: Option<usize>,
    /// Worker-groups the sequence is strided across on the CPU path. The
    /// GPU shader uses its own fixed decomposition; results agree within
    /// float reassociation tolerance.
    pub seq_groups: usize,
    /// Lanes per worker-group on the CPU path (default: the largest power
    /// of two up to 32 dividing `head_dim`). Must divide `head_dim`.
    pub dim_lanes: Option<usize>,
}

impl Default for DecodeAttentionConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            num_heads: 1,
            num_kv_heads: 1,
            head_dim: 64,
            seq_len: 0,
            scale: None,
            k_stride: None,
            seq_groups: 32,
            dim_lanes: None,
        }
    }
}

impl DecodeAttentionConfig {
    pub fn gqa_factor(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    pub fn resolved_scale(&self) -> f32 {
        self.scale
            .unwrap_or_else(|| 1.0 / (self.head_dim as f32).sqrt())
    }

    pub fn resolved_k_stride(&self) -> usize {
        self.k_stride.unwrap_or(self.seq_len * self.head_dim)
    }

    pub fn resolved_dim_lanes(&self) -> usize {
        self.dim_lanes.unwrap_or_else(|| {
            let mut lanes = 32;
            while lanes > 1 && self.head_dim % lanes != 0 {
                lanes /= 2;
            }
            lanes
        })
    }
}

/// Configuration for the quantized-cache decode attention kernel.
#[derive(Clone, Debug)]
pub struct QuantizedDecodeAttentionConfig {
    /// Batch size.
    pub batch_size: usize,
    /// Number of query heads.
    pub num_heads: usize,
    /// Number of KV heads; `num_heads` must be a multiple of this.
    pub num_kv_heads: usize,
    /// Dimension per head. Must be a multiple of `group_size`, and each of
    /// the four lane slices (`head_dim / 4` elements) must cover whole
    /// packed words and sit inside a single quantization group.
    pub head_dim: usize,
    /// Number of cached key/value positions. May be zero.
    pub seq_len: usize,
    /// Optional score scale (default: 1/sqrt(head_dim)).
    pub scale: Option<f32>,
    /// Element stride between consecutive KV heads (default:
    /// `seq_len * head_dim`). Must be a multiple of the pack factor and of
    /// `group_size`.
    pub k_stride: Option<usize>,
    /// Worker-groups (quads) the sequence is strided across on the CPU
    /// path.
    pub seq_groups: usize,
    /// Code width of the packed caches.
    pub bits: QuantBits,
    /// Elements per quantization scale/bias pair.
    pub group_size: usize,
    /// Stride between consecutive KV heads in the scale/bias arrays, in
    /// groups (default: `k_stride / group_size`).
    pub group_stride: Option<usize>,
}

impl Default for QuantizedDecodeAttentionConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            num_heads: 1,
            num_kv_heads: 1,
            head_dim: 64,
            seq_len: 0,
            scale: None,
            k_stride: None,
            seq_groups: 32,
            bits: QuantBits::Four,
            group_size: 64,
            group_stride: None,
        }
    }
}

impl QuantizedDecodeAttentionConfig {
    pub fn gqa_factor(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    pub fn resolved_scale(&self) -> f32 {
        self.scale
            .unwrap_or_else(|| 1.0 / (self.head_dim as f32).sqrt())
    }

    pub fn resolved_k_stride(&self) -> usize {
        self.k_stride.unwrap_or(self.seq_len * self.head_dim)
    }

    pub fn k_stride_words(&self) -> usize {
        self.resolved_k_stride() / self.bits.pack_factor()
    }

    pub fn resolved_group_stride(&self) -> usize {
        self.group_stride
            .unwrap_or(self.resolved_k_stride() / self.group_size)
    }
}

/// Kernel dispatcher with runtime backend selection.
///
/// # Example
///
/// ```
/// use sdpa_kernels::{DecodeAttentionConfig, KernelDispatcher};
///
/// let dispatcher = KernelDispatcher::new();
///
/// let q = vec![1.0f32; 64];
/// let k_cache = vec![0.5f32; 8 * 64];
/// let v_cache = vec![2.0f32; 8 * 64];
/// let mut output = vec![0.0f32; 64];
///
/// dispatcher
///     .decode_attention(
///         &q,
///         &k_cache,
///         &v_cache,
///         &mut output,
///         DecodeAttentionConfig {
///             head_dim: 64,
///             seq_len: 8,
///             ..Default::default()
///         },
///     )
///     .unwrap();
/// ```
pub struct KernelDispatcher {
    backend: BackendType,
}

impl KernelDispatcher {
    /// Create a new dispatcher with auto-detected backend.
    pub fn new() -> Self {
        Self {
            backend: detect_backend(),
        }
    }

    /// Create a dispatcher with a specific backend.
    pub fn with_backend(backend: BackendType) -> Self {
        Self { backend }
    }

    /// Get the current backend type.
    #[inline]
    pub fn backend(&self) -> BackendType {
        self.backend
    }

    /// Single-step decode attention over a full-precision KV cache.
    ///
    /// Computes `softmax(scale * q . k^T) . v` per (batch, head) without
    /// materializing the score vector. `seq_len = 0` produces zeros.
    pub fn decode_attention<T: KernelFloat>(
        &self,
        q: &[T],
        k_cache: &[T],
        v_cache: &[T],
        output: &mut [T],
        config: DecodeAttentionConfig,
    ) -> KernelResult<()> {
        validate_decode_dims(
            config.batch_size,
            config.num_heads,
            config.num_kv_heads,
            config.head_dim,
        )
        .map_err(KernelError::InvalidConfig)?;
        validate_partition(
            config.head_dim,
            config.seq_groups,
            config.resolved_dim_lanes(),
        )
        .map_err(KernelError::InvalidConfig)?;
        let k_stride = config.resolved_k_stride();
        validate_k_stride(k_stride, config.seq_len, config.head_dim)
            .map_err(KernelError::InvalidConfig)?;
        validate_buffers(
            q.len(),
            k_cache.len(),
            v_cache.len(),
            output.len(),
            config.batch_size,
            config.num_heads,
            config.num_kv_heads,
            config.head_dim,
            k_stride,
        )
        .map_err(KernelError::InvalidConfig)?;

        match self.backend {
            BackendType::Wgpu => {
                if let Some(kernel) = get_wgpu_kernel() {
                    if wgpu_decode_attention(kernel, q, k_cache, v_cache, output, &config) {
                        return Ok(());
                    }
                    log::debug!("WGPU decode attention dispatch failed, falling back to CPU");
                }
                cpu_kernels::decode_attention(q, k_cache, v_cache, output, &config);
            }
            BackendType::Cpu => {
                cpu_kernels::decode_attention(q, k_cache, v_cache, output, &config);
            }
        }
        Ok(())
    }

    /// Single-step decode attention over an affine-quantized KV cache.
    ///
    /// Keys and values are 4- or 8-bit codes packed into little-endian u32
    /// words with one `(scale, bias)` pair per `group_size` elements;
    /// dequantization is fused into the score and output accumulation.
    #[allow(clippy::too_many_arguments)]
    pub fn quantized_decode_attention<T: KernelFloat>(
        &self,
        q: &[T],
        k_codes: &[u32],
        k_scales: &[T],
        k_biases: &[T],
        v_codes: &[u32],
        v_scales: &[T],
        v_biases: &[T],
        output: &mut [T],
        config: QuantizedDecodeAttentionConfig,
    ) -> KernelResult<()> {
        validate_decode_dims(
            config.batch_size,
            config.num_heads,
            config.num_kv_heads,
            config.head_dim,
        )
        .map_err(KernelError::InvalidConfig)?;
        validate_partition(config.head_dim, config.seq_groups, QUAD_LANES)
            .map_err(KernelError::InvalidConfig)?;
        validate_quant_groups(config.head_dim, config.group_size, config.bits)
            .map_err(KernelError::InvalidConfig)?;

        let k_stride = config.resolved_k_stride();
        validate_k_stride(k_stride, config.seq_len, config.head_dim)
            .map_err(KernelError::InvalidConfig)?;
        if k_stride % config.bits.pack_factor() != 0 || k_stride % config.group_size != 0 {
            return Err(KernelError::InvalidConfig(format!(
                "k_stride {} not aligned to pack factor {} and group_size {}",
                k_stride,
                config.bits.pack_factor(),
                config.group_size
            )));
        }
        let group_stride = config.resolved_group_stride();
        if group_stride < config.seq_len * config.head_dim / config.group_size {
            return Err(KernelError::InvalidConfig(format!(
                "group_stride {} smaller than seq_len * head_dim / group_size",
                group_stride
            )));
        }
        validate_quant_buffers(
            q.len(),
            k_codes.len().min(v_codes.len()),
            k_scales.len().min(v_scales.len()),
            k_biases.len().min(v_biases.len()),
            output.len(),
            config.batch_size,
            config.num_heads,
            config.num_kv_heads,
            config.head_dim,
            config.k_stride_words(),
            group_stride,
        )
        .map_err(KernelError::InvalidConfig)?;

        match self.backend {
            BackendType::Wgpu => {
                if let Some(kernel) = get_wgpu_kernel() {
                    if wgpu_quantized_decode_attention(
                        kernel, q, k_codes, k_scales, k_biases, v_codes, v_scales, v_biases,
                        output, &config,
                    ) {
                        return Ok(());
                    }
                    log::debug!(
                        "WGPU quantized decode attention dispatch failed, falling back to CPU"
                    );
                }
                cpu_kernels::quantized_decode_attention(
                    q, k_codes, k_scales, k_biases, v_codes, v_scales, v_biases, output, &config,
                );
            }
            BackendType::Cpu => {
                cpu_kernels::quantized_decode_attention(
                    q, k_codes, k_scales, k_biases, v_codes, v_scales, v_biases, output, &config,
                );
            }
        }
        Ok(())
    }
}

impl Default for KernelDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Reinterpret a `&[T]` as `&[f32]`.
/// Safety: caller must check `T::TYPE_ID == FloatType::F32` first.
fn as_f32_slice<T: KernelFloat>(slice: &[T]) -> &[f32] {
    unsafe { std::slice::from_raw_parts(slice.as_ptr() as *const f32, slice.len()) }
}

/// Try the WGPU full-precision kernel; false means "use the CPU path".
fn wgpu_decode_attention<T: KernelFloat>(
    kernel: &SdpaVectorKernel,
    q: &[T],
    k_cache: &[T],
    v_cache: &[T],
    output: &mut [T],
    config: &DecodeAttentionConfig,
) -> bool {
    if T::TYPE_ID != FloatType::F32 {
        return false;
    }
    if config.seq_len == 0 || config.head_dim % SHADER_DIM_LANES != 0 {
        return false;
    }

    match kernel.forward_f32(
        as_f32_slice(q),
        as_f32_slice(k_cache),
        as_f32_slice(v_cache),
        config.batch_size,
        config.num_heads,
        config.num_kv_heads,
        config.head_dim,
        config.seq_len,
        config.resolved_k_stride(),
        config.resolved_scale(),
    ) {
        Ok(result) => {
            for (o, r) in output.iter_mut().zip(result) {
                *o = T::from_f32(r);
            }
            true
        }
        Err(e) => {
            log::debug!("WGPU decode attention error: {}", e);
            false
        }
    }
}

/// Try the WGPU quantized kernel; false means "use the CPU path".
#[allow(clippy::too_many_arguments)]
fn wgpu_quantized_decode_attention<T: KernelFloat>(
    kernel: &SdpaVectorKernel,
    q: &[T],
    k_codes: &[u32],
    k_scales: &[T],
    k_biases: &[T],
    v_codes: &[u32],
    v_scales: &[T],
    v_biases: &[T],
    output: &mut [T],
    config: &QuantizedDecodeAttentionConfig,
) -> bool {
    if T::TYPE_ID != FloatType::F32 {
        return false;
    }
    if config.seq_len == 0 {
        return false;
    }

    match kernel.forward_quantized_f32(
        as_f32_slice(q),
        k_codes,
        as_f32_slice(k_scales),
        as_f32_slice(k_biases),
        v_codes,
        as_f32_slice(v_scales),
        as_f32_slice(v_biases),
        config.batch_size,
        config.num_heads,
        config.num_kv_heads,
        config.head_dim,
        config.seq_len,
        config.k_stride_words(),
        config.resolved_group_stride(),
        config.group_size,
        config.resolved_scale(),
        config.bits,
    ) {
        Ok(result) => {
            for (o, r) in output.iter_mut().zip(result) {
                *o = T::from_f32(r);
            }
            true
        }
        Err(e) => {
            log::debug!("WGPU quantized decode attention error: {}", e);
            false
        }
    }
}
