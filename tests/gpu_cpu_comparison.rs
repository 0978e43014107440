//! WGPU vs CPU comparison tests for the decode attention kernels.
//!
//! The GPU kernels use a fixed workgroup decomposition while the CPU path
//! simulates its own, so the comparison tolerance covers float
//! reassociation on top of fp32 arithmetic. Tests skip when no adapter is
//! available.

use sdpa_kernels::{
    quantize_affine, BackendType, DecodeAttentionConfig, KernelDispatcher, QuantBits,
    QuantizedDecodeAttentionConfig, SdpaVectorKernel,
};

fn generate_test_data(size: usize, seed: u64) -> Vec<f32> {
    let mut data = Vec::with_capacity(size);
    let mut state = seed;
    for _ in 0..size {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let val = ((state >> 33) as f32) / (u32::MAX as f32) * 2.0 - 1.0;
        data.push(val);
    }
    data
}

fn assert_close_f32(actual: &[f32], expected: &[f32], rtol: f32, atol: f32, context: &str) {
    assert_eq!(actual.len(), expected.len(), "{}: length mismatch", context);
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        let diff = (a - e).abs();
        let tolerance = atol + rtol * e.abs();
        assert!(
            diff <= tolerance,
            "{}: mismatch at index {}: actual={}, expected={}, diff={}, tolerance={}",
            context,
            i,
            a,
            e,
            diff,
            tolerance
        );
    }
}

fn gpu_kernel() -> Option<SdpaVectorKernel> {
    match SdpaVectorKernel::create_default() {
        Ok(kernel) => Some(kernel),
        Err(e) => {
            eprintln!("Skipping GPU comparison: {}", e);
            None
        }
    }
}

#[test]
fn gpu_matches_cpu_full_precision() {
    let Some(kernel) = gpu_kernel() else { return };

    let (batch, heads, kv_heads, head_dim, seq_len) = (2, 4, 2, 64, 37);
    let k_stride = seq_len * head_dim;
    let q = generate_test_data(batch * heads * head_dim, 900);
    let k = generate_test_data(batch * kv_heads * k_stride, 901);
    let v = generate_test_data(batch * kv_heads * k_stride, 902);

    let config = DecodeAttentionConfig {
        batch_size: batch,
        num_heads: heads,
        num_kv_heads: kv_heads,
        head_dim,
        seq_len,
        ..Default::default()
    };

    let mut cpu_out = vec![0.0f32; batch * heads * head_dim];
    KernelDispatcher::with_backend(BackendType::Cpu)
        .decode_attention(&q, &k, &v, &mut cpu_out, config.clone())
        .unwrap();

    let gpu_out = kernel
        .forward_f32(
            &q,
            &k,
            &v,
            batch,
            heads,
            kv_heads,
            head_dim,
            seq_len,
            k_stride,
            config.resolved_scale(),
        )
        .expect("GPU forward failed");

    assert_close_f32(&gpu_out, &cpu_out, 1e-4, 1e-5, "gpu vs cpu");
}

#[test]
fn gpu_matches_cpu_quantized() {
    let Some(kernel) = gpu_kernel() else { return };

    let (batch, heads, kv_heads, head_dim, seq_len) = (1, 4, 4, 64, 50);
    let group_size = 32;
    let q = generate_test_data(batch * heads * head_dim, 910);
    let k = generate_test_data(batch * kv_heads * seq_len * head_dim, 911);
    let v = generate_test_data(batch * kv_heads * seq_len * head_dim, 912);

    for bits in [QuantBits::Four, QuantBits::Eight] {
        let (k_codes, k_scales, k_biases) = quantize_affine(&k, group_size, bits);
        let (v_codes, v_scales, v_biases) = quantize_affine(&v, group_size, bits);

        let config = QuantizedDecodeAttentionConfig {
            batch_size: batch,
            num_heads: heads,
            num_kv_heads: kv_heads,
            head_dim,
            seq_len,
            bits,
            group_size,
            ..Default::default()
        };

        let mut cpu_out = vec![0.0f32; batch * heads * head_dim];
        KernelDispatcher::with_backend(BackendType::Cpu)
            .quantized_decode_attention(
                &q,
                &k_codes,
                &k_scales,
                &k_biases,
                &v_codes,
                &v_scales,
                &v_biases,
                &mut cpu_out,
                config.clone(),
            )
            .unwrap();

        let gpu_out = kernel
            .forward_quantized_f32(
                &q,
                &k_codes,
                &k_scales,
                &k_biases,
                &v_codes,
                &v_scales,
                &v_biases,
                batch,
                heads,
                kv_heads,
                head_dim,
                seq_len,
                config.k_stride_words(),
                config.resolved_group_stride(),
                group_size,
                config.resolved_scale(),
                bits,
            )
            .expect("GPU quantized forward failed");

        assert_close_f32(
            &gpu_out,
            &cpu_out,
            1e-4,
            1e-5,
            &format!("gpu vs cpu, {:?}", bits),
        );
    }
}

/// The dispatcher's GPU path must produce finite, CPU-consistent results
/// even when it silently falls back.
#[test]
fn dispatcher_wgpu_backend_is_consistent() {
    let dispatcher = KernelDispatcher::with_backend(BackendType::Wgpu);

    let (head_dim, seq_len) = (64, 20);
    let q = generate_test_data(head_dim, 920);
    let k = generate_test_data(seq_len * head_dim, 921);
    let v = generate_test_data(seq_len * head_dim, 922);

    let config = DecodeAttentionConfig {
        head_dim,
        seq_len,
        ..Default::default()
    };

    let mut wgpu_out = vec![0.0f32; head_dim];
    dispatcher
        .decode_attention(&q, &k, &v, &mut wgpu_out, config.clone())
        .unwrap();

    let mut cpu_out = vec![0.0f32; head_dim];
    KernelDispatcher::with_backend(BackendType::Cpu)
        .decode_attention(&q, &k, &v, &mut cpu_out, config)
        .unwrap();

    assert_close_f32(&wgpu_out, &cpu_out, 1e-4, 1e-5, "dispatcher wgpu vs cpu");
}
