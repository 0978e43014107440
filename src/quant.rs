//! Packed affine group quantization for KV caches.
//!
//! Each run of `group_size` elements shares one `(scale, bias)` pair such
//! that `dequantized = code * scale + bias`. Codes are unsigned, `bits` wide,
//! and packed little-endian into `u32` words: code `e` of a word lives at bit
//! `bits * e`, so the byte/nibble order seen by the kernels' unpack helpers
//! matches the order produced here.

/// Supported code widths for the quantized KV cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantBits {
    Four,
    Eight,
}

impl QuantBits {
    /// Code width in bits.
    pub const fn bits(self) -> usize {
        match self {
            Self::Four => 4,
            Self::Eight => 8,
        }
    }

    /// Codes per packed `u32` word.
    pub const fn pack_factor(self) -> usize {
        32 / self.bits()
    }

    /// Largest representable code (`2^bits - 1`).
    pub const fn levels(self) -> usize {
        (1 << self.bits()) - 1
    }
}

/// Affine group quantization of a flat slice.
///
/// `values.len()` must be a multiple of `group_size`, and `group_size` a
/// multiple of the pack factor so groups never straddle a packed word.
/// Returns `(packed_words, scales, biases)` with one scale/bias per group.
pub fn quantize_affine(
    values: &[f32],
    group_size: usize,
    bits: QuantBits,
) -> (Vec<u32>, Vec<f32>, Vec<f32>) {
    assert!(group_size > 0, "group_size must be > 0");
    assert_eq!(
        values.len() % group_size,
        0,
        "input length {} not a multiple of group_size {}",
        values.len(),
        group_size
    );
    assert_eq!(
        group_size % bits.pack_factor(),
        0,
        "group_size {} not a multiple of pack factor {}",
        group_size,
        bits.pack_factor()
    );

    let pack_factor = bits.pack_factor();
    let levels = bits.levels() as f32;
    let num_groups = values.len() / group_size;

    let mut packed = vec![0u32; values.len() / pack_factor];
    let mut scales = Vec::with_capacity(num_groups);
    let mut biases = Vec::with_capacity(num_groups);

    for (g, group) in values.chunks_exact(group_size).enumerate() {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &v in group {
            min = min.min(v);
            max = max.max(v);
        }
        let range = max - min;
        let scale = if range > 0.0 { range / levels } else { 1.0 };
        let bias = min;
        scales.push(scale);
        biases.push(bias);

        let word_base = g * group_size / pack_factor;
        for (t, &v) in group.iter().enumerate() {
            let code = (((v - bias) / scale).round()).clamp(0.0, levels) as u32;
            let word = word_base + t / pack_factor;
            let shift = (t % pack_factor) * bits.bits();
            packed[word] |= code << shift;
        }
    }

    (packed, scales, biases)
}

/// Inverse of [`quantize_affine`]: expands packed codes back to floats.
pub fn dequantize_affine(
    packed: &[u32],
    scales: &[f32],
    biases: &[f32],
    group_size: usize,
    bits: QuantBits,
) -> Vec<f32> {
    let pack_factor = bits.pack_factor();
    let mask = bits.levels() as u32;
    let total = packed.len() * pack_factor;
    assert_eq!(total % group_size, 0);
    assert_eq!(scales.len(), total / group_size);
    assert_eq!(biases.len(), total / group_size);

    let mut out = Vec::with_capacity(total);
    for t in 0..total {
        let word = packed[t / pack_factor];
        let shift = (t % pack_factor) * bits.bits();
        let code = (word >> shift) & mask;
        let g = t / group_size;
        out.push(code as f32 * scales[g] + biases[g]);
    }
    out
}

/// Worst-case absolute reconstruction error for one group: half a step.
pub fn group_error_bound(scale: f32) -> f32 {
    0.5 * scale
}
