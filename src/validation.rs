//! Validation utilities for kernel launch parameters.
//!
//! All functions return `Result<(), String>` so each entry point can wrap the
//! message into its own error type. Only caller-checkable shape preconditions
//! live here; numeric behavior past validation is unguarded.

use crate::quant::QuantBits;

/// Maximum supported head dimension for attention kernels.
pub const MAX_HEAD_DIM: usize = 256;

/// Lanes per worker-group in the quantized kernel (the "quad" tier).
pub const QUAD_LANES: usize = 4;

/// Validate the shared decode-attention dimensions.
///
/// `seq_len` may be zero: an empty cache is defined to produce a zero output.
#[inline]
pub fn validate_decode_dims(
    batch_size: usize,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
) -> Result<(), String> {
    if batch_size == 0 || num_heads == 0 || num_kv_heads == 0 || head_dim == 0 {
        return Err("dimensions must be > 0".into());
    }
    if head_dim > MAX_HEAD_DIM {
        return Err(format!(
            "head_dim {} exceeds MAX_HEAD_DIM {}",
            head_dim, MAX_HEAD_DIM
        ));
    }
    if num_heads % num_kv_heads != 0 {
        return Err(format!(
            "num_heads {} not divisible by num_kv_heads {}",
            num_heads, num_kv_heads
        ));
    }
    Ok(())
}

/// Validate the worker-group partition of the full-precision kernel.
#[inline]
pub fn validate_partition(
    head_dim: usize,
    seq_groups: usize,
    dim_lanes: usize,
) -> Result<(), String> {
    if seq_groups == 0 {
        return Err("seq_groups must be > 0".into());
    }
    if dim_lanes == 0 || head_dim % dim_lanes != 0 {
        return Err(format!(
            "head_dim {} not divisible by dim_lanes {}",
            head_dim, dim_lanes
        ));
    }
    Ok(())
}

/// Validate the quantization-group layout of the quantized kernel.
///
/// Each of the four lanes owns a contiguous `head_dim / 4` slice, and the
/// kernel reads exactly one scale/bias pair per lane per position, so a lane
/// slice must never straddle two groups and a group must never straddle two
/// packed words.
#[inline]
pub fn validate_quant_groups(
    head_dim: usize,
    group_size: usize,
    bits: QuantBits,
) -> Result<(), String> {
    if group_size == 0 || head_dim % group_size != 0 {
        return Err(format!(
            "head_dim {} not divisible by group_size {}",
            head_dim, group_size
        ));
    }
    let elem_per_lane = head_dim / QUAD_LANES;
    if head_dim % QUAD_LANES != 0 || elem_per_lane % bits.pack_factor() != 0 {
        return Err(format!(
            "head_dim {} not partitionable into {} lanes of whole {}-bit words",
            head_dim,
            QUAD_LANES,
            bits.bits()
        ));
    }
    if group_size % elem_per_lane != 0 {
        return Err(format!(
            "lane slice of {} elements straddles group_size {}",
            elem_per_lane, group_size
        ));
    }
    Ok(())
}

/// Validate a KV-head stride against the logical row extent.
#[inline]
pub fn validate_k_stride(k_stride: usize, seq_len: usize, head_dim: usize) -> Result<(), String> {
    let min = seq_len
        .checked_mul(head_dim)
        .ok_or_else(|| "kv extent overflow".to_string())?;
    if k_stride < min {
        return Err(format!(
            "k_stride {} smaller than seq_len * head_dim = {}",
            k_stride, min
        ));
    }
    Ok(())
}

/// Validate flat buffer lengths for the full-precision kernel.
#[allow(clippy::too_many_arguments)]
#[inline]
pub fn validate_buffers(
    q_len: usize,
    k_len: usize,
    v_len: usize,
    out_len: usize,
    batch_size: usize,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    k_stride: usize,
) -> Result<(), String> {
    let q_expected = batch_size
        .checked_mul(num_heads)
        .and_then(|v| v.checked_mul(head_dim))
        .ok_or_else(|| "query extent overflow".to_string())?;
    if q_len != q_expected {
        return Err(format!("query length {} != {}", q_len, q_expected));
    }
    if out_len != q_expected {
        return Err(format!("output length {} != {}", out_len, q_expected));
    }
    let kv_expected = batch_size
        .checked_mul(num_kv_heads)
        .and_then(|v| v.checked_mul(k_stride))
        .ok_or_else(|| "kv extent overflow".to_string())?;
    if k_len < kv_expected {
        return Err(format!("key cache length {} < {}", k_len, kv_expected));
    }
    if v_len < kv_expected {
        return Err(format!("value cache length {} < {}", v_len, kv_expected));
    }
    Ok(())
}

/// Validate flat buffer lengths for the quantized kernel.
#[allow(clippy::too_many_arguments)]
#[inline]
pub fn validate_quant_buffers(
    q_len: usize,
    codes_len: usize,
    scales_len: usize,
    biases_len: usize,
    out_len: usize,
    batch_size: usize,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    k_stride_words: usize,
    group_stride: usize,
) -> Result<(), String> {
    let q_expected = batch_size
        .checked_mul(num_heads)
        .and_then(|v| v.checked_mul(head_dim))
        .ok_or_else(|| "query extent overflow".to_string())?;
    if q_len != q_expected {
        return Err(format!("query length {} != {}", q_len, q_expected));
    }
    if out_len != q_expected {
        return Err(format!("output length {} != {}", out_len, q_expected));
    }
    let codes_expected = batch_size
        .checked_mul(num_kv_heads)
        .and_then(|v| v.checked_mul(k_stride_words))
        .ok_or_else(|| "packed extent overflow".to_string())?;
    if codes_len < codes_expected {
        return Err(format!("packed cache length {} < {}", codes_len, codes_expected));
    }
    let groups_expected = batch_size
        .checked_mul(num_kv_heads)
        .and_then(|v| v.checked_mul(group_stride))
        .ok_or_else(|| "group extent overflow".to_string())?;
    if scales_len < groups_expected {
        return Err(format!("scales length {} < {}", scales_len, groups_expected));
    }
    if biases_len < groups_expected {
        return Err(format!("biases length {} < {}", biases_len, groups_expected));
    }
    Ok(())
}
