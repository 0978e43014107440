//! CPU reference kernels for single-step (decode) attention.
//!
//! Always available; every GPU dispatch path falls back here. The kernels
//! simulate the parallel decomposition of the compute-shader variants
//! deterministically: sequence positions are strided across `seq_groups`
//! worker-groups, each group keeps running (max, sum-of-exp, weighted-output)
//! statistics, lane partial sums and group statistics merge in ascending
//! index order. Identical inputs give bit-identical outputs regardless of
//! how rayon schedules the (batch, head) grid, because each grid cell is
//! self-contained.
//!
//! # Fused dequantization contract
//!
//! [`load_keys`] and [`load_query`] form a single unit for the 4-bit path:
//! `load_keys` leaves each nibble at its packed bit position (masked with
//! `0x000f/0x00f0/0x0f00/0xf000`, never shifted right), and `load_query`
//! stores `/16`, `/256`, `/4096` copies of the query at the three indices
//! after each group-of-4 base so the products `q[i] * k[i]` reconstruct
//! `query * code` at the correct magnitude. Changing either side without the
//! other silently corrupts every 4-bit score.

use rayon::prelude::*;

use crate::kernel_dispatcher::{DecodeAttentionConfig, QuantizedDecodeAttentionConfig};
use crate::kernel_types::KernelFloat;
use crate::quant::QuantBits;
use crate::validation::QUAD_LANES;

/// Per-worker-group streaming softmax state.
///
/// Invariant: after any number of [`fold_score`](Self::fold_score) /
/// accumulate steps, `accum[i] / sum_exp` is the softmax-weighted average of
/// the values folded in so far, for every `i`.
struct RunningStats {
    max_score: f32,
    sum_exp: f32,
    accum: Vec<f32>,
}

impl RunningStats {
    fn new(head_dim: usize) -> Self {
        Self {
            max_score: f32::NEG_INFINITY,
            sum_exp: 0.0,
            accum: vec![0.0; head_dim],
        }
    }

    /// Online-softmax update for one raw score.
    ///
    /// Rescales `sum_exp` and `accum` by `exp(old_max - new_max)` and returns
    /// `exp(score - new_max)` for the caller to weight the value row with.
    fn fold_score(&mut self, score: f32) -> f32 {
        let new_max = self.max_score.max(score);
        let factor = (self.max_score - new_max).exp();
        let exp_score = (score - new_max).exp();
        self.max_score = new_max;
        self.sum_exp = self.sum_exp * factor + exp_score;
        for acc in &mut self.accum {
            *acc *= factor;
        }
        exp_score
    }
}

/// Two-phase merge of all worker-group statistics into the output row.
///
/// Phase A combines (max, sum_exp) across groups; phase B combines the
/// weighted accumulators per dimension. Groups that saw no positions carry
/// `max_score = -inf, sum_exp = 0` and contribute a zero factor. An empty
/// sequence leaves `combined <= 0` and produces a zero output rather than
/// 0/0.
fn merge_groups<T: KernelFloat>(groups: &[RunningStats], out_row: &mut [T]) {
    let mut new_max = f32::NEG_INFINITY;
    for g in groups {
        new_max = new_max.max(g.max_score);
    }

    let factors: Vec<f32> = groups
        .iter()
        .map(|g| {
            if g.max_score == f32::NEG_INFINITY {
                0.0
            } else {
                (g.max_score - new_max).exp()
            }
        })
        .collect();

    let mut combined = 0.0f32;
    for (g, &f) in groups.iter().zip(&factors) {
        combined += g.sum_exp * f;
    }

    if combined <= 0.0 {
        for o in out_row.iter_mut() {
            *o = T::zero();
        }
        return;
    }

    let inv = 1.0 / combined;
    for (i, o) in out_row.iter_mut().enumerate() {
        let mut sum = 0.0f32;
        for (g, &f) in groups.iter().zip(&factors) {
            sum += g.accum[i] * f;
        }
        *o = T::from_f32(sum * inv);
    }
}

/// Full-precision decode attention over the (batch, head) grid.
///
/// Shapes and strides must already be validated; see
/// [`KernelDispatcher::decode_attention`](crate::KernelDispatcher::decode_attention)
/// for the checked entry point.
pub fn decode_attention<T: KernelFloat>(
    q: &[T],
    k_cache: &[T],
    v_cache: &[T],
    output: &mut [T],
    config: &DecodeAttentionConfig,
) {
    let d = config.head_dim;
    let gqa_factor = config.gqa_factor();
    let scale = config.resolved_scale();
    let k_stride = config.resolved_k_stride();
    let seq_groups = config.seq_groups;
    let dim_lanes = config.resolved_dim_lanes();

    output
        .par_chunks_mut(d)
        .enumerate()
        .for_each(|(idx, out_row)| {
            let b = idx / config.num_heads;
            let h = idx % config.num_heads;
            let kv_h = h / gqa_factor;
            let q_row = &q[idx * d..idx * d + d];
            let kv_base = (b * config.num_kv_heads + kv_h) * k_stride;
            decode_single(
                q_row,
                &k_cache[kv_base..],
                &v_cache[kv_base..],
                out_row,
                config.seq_len,
                scale,
                seq_groups,
                dim_lanes,
            );
        });
}

/// One (batch, head) instance of the full-precision kernel.
#[allow(clippy::too_many_arguments)]
fn decode_single<T: KernelFloat>(
    q_row: &[T],
    k_head: &[T],
    v_head: &[T],
    out_row: &mut [T],
    seq_len: usize,
    scale: f32,
    seq_groups: usize,
    dim_lanes: usize,
) {
    let d = q_row.len();
    let elem_per_lane = d / dim_lanes;

    let q_scaled: Vec<f32> = q_row.iter().map(|v| scale * v.to_f32()).collect();

    let mut groups: Vec<RunningStats> = (0..seq_groups).map(|_| RunningStats::new(d)).collect();

    for (g, stats) in groups.iter_mut().enumerate() {
        let mut pos = g;
        while pos < seq_len {
            let row = pos * d;
            let k_row = &k_head[row..row + d];

            // Lane partials reduce in ascending lane order; this order is the
            // reproducibility contract shared with the GPU tree reduction.
            let mut score = 0.0f32;
            for lane in 0..dim_lanes {
                let s = lane * elem_per_lane;
                let mut partial = 0.0f32;
                for e in 0..elem_per_lane {
                    partial += q_scaled[s + e] * k_row[s + e].to_f32();
                }
                score += partial;
            }

            let exp_score = stats.fold_score(score);
            let v_row = &v_head[row..row + d];
            for (acc, vv) in stats.accum.iter_mut().zip(v_row) {
                *acc += exp_score * vv.to_f32();
            }

            pos += seq_groups;
        }
    }

    merge_groups(&groups, out_row);
}

/// Quantized-cache decode attention over the (batch, head) grid.
#[allow(clippy::too_many_arguments)]
pub fn quantized_decode_attention<T: KernelFloat>(
    q: &[T],
    k_codes: &[u32],
    k_scales: &[T],
    k_biases: &[T],
    v_codes: &[u32],
    v_scales: &[T],
    v_biases: &[T],
    output: &mut [T],
    config: &QuantizedDecodeAttentionConfig,
) {
    let d = config.head_dim;
    let gqa_factor = config.gqa_factor();
    let scale = config.resolved_scale();
    let k_stride_words = config.k_stride_words();
    let group_stride = config.resolved_group_stride();

    output
        .par_chunks_mut(d)
        .enumerate()
        .for_each(|(idx, out_row)| {
            let b = idx / config.num_heads;
            let h = idx % config.num_heads;
            let kv_h = h / gqa_factor;
            let q_row = &q[idx * d..idx * d + d];
            let word_base = (b * config.num_kv_heads + kv_h) * k_stride_words;
            let group_base = (b * config.num_kv_heads + kv_h) * group_stride;
            quantized_decode_single(
                q_row,
                &k_codes[word_base..],
                &k_scales[group_base..],
                &k_biases[group_base..],
                &v_codes[word_base..],
                &v_scales[group_base..],
                &v_biases[group_base..],
                out_row,
                config.seq_len,
                scale,
                config.seq_groups,
                config.bits,
                config.group_size,
            );
        });
}

/// One (batch, head) instance of the quantized kernel.
///
/// Each worker-group is one quad of [`QUAD_LANES`] lanes; lane partial scores
/// merge 4-wide into the group statistic before the cross-group merge, and
/// each lane corrects its raw integer dot product with the scale/bias of the
/// single quantization group containing its slice:
/// `score += raw_dot * key_scale + query_sum * key_bias`.
#[allow(clippy::too_many_arguments)]
fn quantized_decode_single<T: KernelFloat>(
    q_row: &[T],
    k_codes: &[u32],
    k_scales: &[T],
    k_biases: &[T],
    v_codes: &[u32],
    v_scales: &[T],
    v_biases: &[T],
    out_row: &mut [T],
    seq_len: usize,
    scale: f32,
    seq_groups: usize,
    bits: QuantBits,
    group_size: usize,
) {
    let d = q_row.len();
    let elem_per_lane = d / QUAD_LANES;
    let pack_factor = bits.pack_factor();
    let words_per_lane = elem_per_lane / pack_factor;

    let mut q_lanes = vec![0.0f32; d];
    let mut q_sums = [0.0f32; QUAD_LANES];
    for lane in 0..QUAD_LANES {
        let s = lane * elem_per_lane;
        q_sums[lane] = load_query(
            &q_row[s..s + elem_per_lane],
            scale,
            bits,
            &mut q_lanes[s..s + elem_per_lane],
        );
    }

    let mut k_lane = vec![0.0f32; elem_per_lane];
    let mut v_lane = vec![0.0f32; elem_per_lane];
    let mut groups: Vec<RunningStats> = (0..seq_groups).map(|_| RunningStats::new(d)).collect();

    for (g, stats) in groups.iter_mut().enumerate() {
        let mut pos = g;
        while pos < seq_len {
            let row_word = pos * d / pack_factor;
            let row_group = pos * d / group_size;

            let mut score = 0.0f32;
            for lane in 0..QUAD_LANES {
                let s = lane * elem_per_lane;
                let wb = row_word + s / pack_factor;
                load_keys(&k_codes[wb..wb + words_per_lane], bits, &mut k_lane);

                let gi = row_group + s / group_size;
                let key_scale = k_scales[gi].to_f32();
                let key_bias = k_biases[gi].to_f32();

                let mut raw = 0.0f32;
                for e in 0..elem_per_lane {
                    raw += q_lanes[s + e] * k_lane[e];
                }
                score += raw * key_scale + q_sums[lane] * key_bias;
            }

            let exp_score = stats.fold_score(score);
            for lane in 0..QUAD_LANES {
                let s = lane * elem_per_lane;
                let wb = row_word + s / pack_factor;
                let gi = row_group + s / group_size;
                load_values(
                    &v_codes[wb..wb + words_per_lane],
                    bits,
                    v_scales[gi].to_f32(),
                    v_biases[gi].to_f32(),
                    &mut v_lane,
                );
                for e in 0..elem_per_lane {
                    stats.accum[s + e] += exp_score * v_lane[e];
                }
            }

            pos += seq_groups;
        }
    }

    merge_groups(&groups, out_row);
}

/// Scale one lane's query slice and return its element sum.
///
/// The returned `query_sum` folds the quantization bias into the score
/// analytically (`sum(q_i * (c_i*scale + bias)) = scale*sum(q_i*c_i) +
/// bias*sum(q_i)`), so it is accumulated from the undivided values only. In
/// 4-bit mode the three entries after each group-of-4 base hold `/16`,
/// `/256`, `/4096` copies; see the module docs for the pairing with
/// [`load_keys`].
pub(crate) fn load_query<T: KernelFloat>(
    q_slice: &[T],
    scale: f32,
    bits: QuantBits,
    q_out: &mut [f32],
) -> f32 {
    let mut query_sum = 0.0f32;
    match bits {
        QuantBits::Four => {
            for (qs, out) in q_slice.chunks_exact(4).zip(q_out.chunks_exact_mut(4)) {
                out[0] = scale * qs[0].to_f32();
                out[1] = scale * qs[1].to_f32();
                out[2] = scale * qs[2].to_f32();
                out[3] = scale * qs[3].to_f32();
                query_sum += out[0] + out[1] + out[2] + out[3];
                out[1] /= 16.0;
                out[2] /= 256.0;
                out[3] /= 4096.0;
            }
        }
        QuantBits::Eight => {
            for (qs, out) in q_slice.iter().zip(q_out.iter_mut()) {
                *out = scale * qs.to_f32();
                query_sum += *out;
            }
        }
    }
    query_sum
}

/// Unpack one lane's key codes into float lanes.
///
/// 4-bit codes are masked at their packed nibble positions and left
/// unshifted; the pre-divided query copies from [`load_query`] restore the
/// magnitude inside the dot product.
pub(crate) fn load_keys(words: &[u32], bits: QuantBits, k_out: &mut [f32]) {
    match bits {
        QuantBits::Four => {
            let mut i = 0;
            for &word in words {
                for half in [word & 0xffff, word >> 16] {
                    k_out[i] = (half & 0x000f) as f32;
                    k_out[i + 1] = (half & 0x00f0) as f32;
                    k_out[i + 2] = (half & 0x0f00) as f32;
                    k_out[i + 3] = (half & 0xf000) as f32;
                    i += 4;
                }
            }
        }
        QuantBits::Eight => {
            let mut i = 0;
            for &word in words {
                k_out[i] = (word & 0xff) as f32;
                k_out[i + 1] = ((word >> 8) & 0xff) as f32;
                k_out[i + 2] = ((word >> 16) & 0xff) as f32;
                k_out[i + 3] = (word >> 24) as f32;
                i += 4;
            }
        }
    }
}

/// Unpack one lane's value codes with true affine dequantization.
///
/// Values are used additively, not inside a further linear reduction, so no
/// bias folding applies here. The 4-bit path reuses the packed-word layout
/// convention via the `(scale, scale/16)` pair for even/odd nibbles.
pub(crate) fn load_values(
    words: &[u32],
    bits: QuantBits,
    value_scale: f32,
    value_bias: f32,
    v_out: &mut [f32],
) {
    match bits {
        QuantBits::Four => {
            let s = [value_scale, value_scale / 16.0];
            let mut i = 0;
            for &word in words {
                for byte in [
                    word & 0xff,
                    (word >> 8) & 0xff,
                    (word >> 16) & 0xff,
                    word >> 24,
                ] {
                    v_out[i] = s[0] * (byte & 0x0f) as f32 + value_bias;
                    v_out[i + 1] = s[1] * (byte & 0xf0) as f32 + value_bias;
                    i += 2;
                }
            }
        }
        QuantBits::Eight => {
            let mut i = 0;
            for &word in words {
                v_out[i] = value_scale * (word & 0xff) as f32 + value_bias;
                v_out[i + 1] = value_scale * ((word >> 8) & 0xff) as f32 + value_bias;
                v_out[i + 2] = value_scale * ((word >> 16) & 0xff) as f32 + value_bias;
                v_out[i + 3] = value_scale * (word >> 24) as f32 + value_bias;
                i += 4;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::{dequantize_affine, quantize_affine};

    #[test]
    fn running_stats_matches_direct_softmax() {
        let scores = [1.0f32, -2.0, 3.5, 0.25];
        let values = [10.0f32, 20.0, -5.0, 0.5];

        let mut stats = RunningStats::new(1);
        for (&s, &v) in scores.iter().zip(&values) {
            let e = stats.fold_score(s);
            stats.accum[0] += e * v;
        }

        let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let denom: f32 = scores.iter().map(|s| (s - max).exp()).sum();
        let expected: f32 = scores
            .iter()
            .zip(&values)
            .map(|(s, v)| (s - max).exp() / denom * v)
            .sum();

        assert!((stats.accum[0] / stats.sum_exp - expected).abs() < 1e-6);
    }

    #[test]
    fn merge_of_empty_groups_is_zero() {
        let groups: Vec<RunningStats> = (0..8).map(|_| RunningStats::new(4)).collect();
        let mut out = [1.0f32; 4];
        merge_groups(&groups, &mut out);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn merge_ignores_idle_groups() {
        // One populated group among empties must reproduce its own average.
        let mut groups: Vec<RunningStats> = (0..4).map(|_| RunningStats::new(1)).collect();
        let e = groups[2].fold_score(1.5);
        groups[2].accum[0] += e * 7.0;
        let mut out = [0.0f32; 1];
        merge_groups(&groups, &mut out);
        assert!((out[0] - 7.0).abs() < 1e-6);
    }

    #[test]
    fn fused_key_query_product_reconstructs_codes() {
        // Quantize a known slice, then check that sum(q_pre * k_masked)
        // equals sum(q * code) computed directly from unpacked codes.
        let raw: Vec<f32> = (0..16).map(|i| i as f32 * 0.3 - 2.0).collect();
        let (words, _scales, _biases) = quantize_affine(&raw, 16, QuantBits::Four);

        let q: Vec<f32> = (0..16).map(|i| (i as f32 * 0.711).sin()).collect();
        let mut q_pre = vec![0.0f32; 16];
        let query_sum = load_query(&q, 1.0, QuantBits::Four, &mut q_pre);

        let mut k_masked = vec![0.0f32; 16];
        load_keys(&words, QuantBits::Four, &mut k_masked);

        let fused: f32 = q_pre.iter().zip(&k_masked).map(|(a, b)| a * b).sum();

        let mut direct = 0.0f32;
        for t in 0..16 {
            let code = (words[t / 8] >> (4 * (t % 8))) & 0xf;
            direct += q[t] * code as f32;
        }

        assert!(
            (fused - direct).abs() < 1e-3 * direct.abs().max(1.0),
            "fused {} vs direct {}",
            fused,
            direct
        );
        let plain_sum: f32 = q.iter().sum();
        assert!((query_sum - plain_sum).abs() < 1e-5);
    }

    #[test]
    fn value_loader_matches_dequantize() {
        for bits in [QuantBits::Four, QuantBits::Eight] {
            let raw: Vec<f32> = (0..32).map(|i| (i as f32 - 11.0) * 0.17).collect();
            let (words, scales, biases) = quantize_affine(&raw, 32, bits);
            let expected = dequantize_affine(&words, &scales, &biases, 32, bits);

            let mut v = vec![0.0f32; 32];
            load_values(&words, bits, scales[0], biases[0], &mut v);
            for (a, b) in v.iter().zip(&expected) {
                assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn key_loader_eight_bit_is_plain_codes() {
        let raw: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let (words, scales, biases) = quantize_affine(&raw, 8, QuantBits::Eight);
        let mut k = vec![0.0f32; 8];
        load_keys(&words, QuantBits::Eight, &mut k);
        for (t, &code) in k.iter().enumerate() {
            let rec = code * scales[0] + biases[0];
            assert!((rec - raw[t]).abs() <= 0.5 * scales[0] + 1e-6);
        }
    }
}
