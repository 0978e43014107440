//! Randomized properties of the decode attention kernels.

use proptest::prelude::*;

use sdpa_kernels::{
    quantize_affine, BackendType, DecodeAttentionConfig, KernelDispatcher, QuantBits,
    QuantizedDecodeAttentionConfig,
};

/// Naive reference: softmax(scale * q . k^T) . v for one head.
fn reference_single(q: &[f32], k: &[f32], v: &[f32], seq_len: usize, scale: f32) -> Vec<f32> {
    let head_dim = q.len();
    let mut out = vec![0.0f32; head_dim];
    if seq_len == 0 {
        return out;
    }

    let scores: Vec<f32> = (0..seq_len)
        .map(|pos| {
            let mut dot = 0.0f32;
            for d in 0..head_dim {
                dot += q[d] * k[pos * head_dim + d];
            }
            dot * scale
        })
        .collect();

    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let denom: f32 = scores.iter().map(|s| (s - max).exp()).sum();
    for (pos, &s) in scores.iter().enumerate() {
        let w = (s - max).exp() / denom;
        for d in 0..head_dim {
            out[d] += w * v[pos * head_dim + d];
        }
    }
    out
}

fn float_vec(len: usize) -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-2.0f32..2.0f32, len)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn kernel_matches_reference(
        head_dim_pow in 2usize..5,   // head_dim 16, 32 or 64
        seq_len in 1usize..80,
        seq_groups in 1usize..48,
        data in float_vec(3),
    ) {
        let head_dim = 16 << (head_dim_pow - 2);
        let q: Vec<f32> = (0..head_dim)
            .map(|i| data[0] + (i as f32 * 0.37).sin())
            .collect();
        let k: Vec<f32> = (0..seq_len * head_dim)
            .map(|i| data[1] + (i as f32 * 0.11).cos())
            .collect();
        let v: Vec<f32> = (0..seq_len * head_dim)
            .map(|i| data[2] + (i as f32 * 0.23).sin())
            .collect();

        let dispatcher = KernelDispatcher::with_backend(BackendType::Cpu);
        let config = DecodeAttentionConfig {
            head_dim,
            seq_len,
            seq_groups,
            ..Default::default()
        };
        let scale = config.resolved_scale();

        let mut output = vec![0.0f32; head_dim];
        dispatcher.decode_attention(&q, &k, &v, &mut output, config).unwrap();

        let expected = reference_single(&q, &k, &v, seq_len, scale);
        for (o, e) in output.iter().zip(&expected) {
            prop_assert!((o - e).abs() <= 1e-4 + 1e-4 * e.abs(),
                "kernel {} vs reference {}", o, e);
        }
    }

    #[test]
    fn quantized_kernel_stays_within_step_bound(
        seq_len in 1usize..40,
        group_pow in 0usize..2,       // group_size 32 or 64
        use_eight_bits in any::<bool>(),
        offset in -1.0f32..1.0f32,
    ) {
        let head_dim = 64;
        let group_size = 32 << group_pow;
        let bits = if use_eight_bits { QuantBits::Eight } else { QuantBits::Four };

        let q: Vec<f32> = (0..head_dim).map(|i| offset + (i as f32 * 0.31).sin()).collect();
        let k: Vec<f32> = (0..seq_len * head_dim)
            .map(|i| offset + (i as f32 * 0.17).cos())
            .collect();
        let v: Vec<f32> = (0..seq_len * head_dim)
            .map(|i| offset + (i as f32 * 0.13).sin())
            .collect();

        let dispatcher = KernelDispatcher::with_backend(BackendType::Cpu);

        let mut full = vec![0.0f32; head_dim];
        dispatcher.decode_attention(&q, &k, &v, &mut full, DecodeAttentionConfig {
            head_dim,
            seq_len,
            ..Default::default()
        }).unwrap();

        let (k_codes, k_scales, k_biases) = quantize_affine(&k, group_size, bits);
        let (v_codes, v_scales, v_biases) = quantize_affine(&v, group_size, bits);
        let mut quantized = vec![0.0f32; head_dim];
        dispatcher.quantized_decode_attention(
            &q, &k_codes, &k_scales, &k_biases,
            &v_codes, &v_scales, &v_biases,
            &mut quantized,
            QuantizedDecodeAttentionConfig {
                head_dim,
                seq_len,
                bits,
                group_size,
                ..Default::default()
            },
        ).unwrap();

        // Values span at most ~[-2, 2]: one code step per group is bounded
        // by range / 2^bits, and softmax weights are a convex combination.
        let step = 4.0 / (1u32 << bits.bits()) as f32;
        let bound = 4.0 * step + 0.1;
        for (qo, fo) in quantized.iter().zip(&full) {
            prop_assert!(qo.is_finite());
            prop_assert!((qo - fo).abs() <= bound,
                "quantized {} vs full {} exceeds bound {}", qo, fo, bound);
        }
    }

    #[test]
    fn partition_choice_never_changes_the_result(
        seq_len in 0usize..64,
        groups_a in 1usize..64,
        groups_b in 1usize..64,
    ) {
        let head_dim = 32;
        let q: Vec<f32> = (0..head_dim).map(|i| (i as f32 * 0.7).sin()).collect();
        let k: Vec<f32> = (0..seq_len * head_dim).map(|i| (i as f32 * 0.19).cos()).collect();
        let v: Vec<f32> = (0..seq_len * head_dim).map(|i| (i as f32 * 0.41).sin()).collect();

        let dispatcher = KernelDispatcher::with_backend(BackendType::Cpu);
        let run = |seq_groups: usize| {
            let mut output = vec![0.0f32; head_dim];
            dispatcher.decode_attention(&q, &k, &v, &mut output, DecodeAttentionConfig {
                head_dim,
                seq_len,
                seq_groups,
                ..Default::default()
            }).unwrap();
            output
        };

        let a = run(groups_a);
        let b = run(groups_b);
        for (x, y) in a.iter().zip(&b) {
            prop_assert!((x - y).abs() <= 1e-4 + 1e-4 * y.abs());
        }
    }
}
