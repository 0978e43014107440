use wgpu::util::DeviceExt;
use wgpu::{BindGroup, Buffer, BufferUsages, ComputePipeline};

use crate::quant::QuantBits;

use super::kernel::{
    QuantSdpaVectorParams, SdpaVectorError, SdpaVectorKernel, SdpaVectorParams, SHADER_DIM_LANES,
};
use super::utils::{
    align_up, buffer_binding, bytes_of, bytes_to_vec, max_align, read_buffer_sync, slice_as_bytes,
};

impl SdpaVectorKernel {
    /// Full-precision decode attention forward for f32 inputs.
    ///
    /// Layouts: `q` is `[batch, num_heads, head_dim]`; `k_cache`/`v_cache`
    /// are `[batch, num_kv_heads, k_stride]` with rows of `head_dim`
    /// elements starting at `pos * head_dim` inside each KV head.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_f32(
        &self,
        q: &[f32],
        k_cache: &[f32],
        v_cache: &[f32],
        batch_size: usize,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        seq_len: usize,
        k_stride: usize,
        scale: f32,
    ) -> Result<Vec<f32>, SdpaVectorError> {
        if seq_len == 0 {
            return Err(SdpaVectorError::InvalidConfig(
                "empty sequence is handled on the CPU path".into(),
            ));
        }
        if head_dim % SHADER_DIM_LANES != 0 {
            return Err(SdpaVectorError::InvalidConfig(format!(
                "head_dim {} not a multiple of the shader lane count {}",
                head_dim, SHADER_DIM_LANES
            )));
        }

        let params = SdpaVectorParams {
            gqa_factor: (num_heads / num_kv_heads) as u32,
            seq_len: seq_len as u32,
            head_dim: head_dim as u32,
            num_kv_heads: num_kv_heads as u32,
            k_stride: k_stride as u32,
            scale,
            _pad0: 0,
            _pad1: 0,
        };

        let out_elems = batch_size * num_heads * head_dim;
        let output_bytes = (out_elems * std::mem::size_of::<f32>()) as u64;

        let q_buffer = self.upload("sdpa_vector_q", slice_as_bytes(q));
        let k_buffer = self.upload("sdpa_vector_k_cache", slice_as_bytes(k_cache));
        let v_buffer = self.upload("sdpa_vector_v_cache", slice_as_bytes(v_cache));
        let params_buffer = self.upload_uniform("sdpa_vector_params", bytes_of(&params));
        let (output_buffer, readback) = self.output_pair("sdpa_vector", output_bytes);

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("sdpa_vector_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                buffer_binding(0, &q_buffer),
                buffer_binding(1, &k_buffer),
                buffer_binding(2, &v_buffer),
                buffer_binding(3, &output_buffer),
                buffer_binding(4, &params_buffer),
            ],
        });

        let result = self.run(
            &self.pipeline_f32,
            &bind_group,
            &output_buffer,
            &readback,
            output_bytes,
            num_heads as u32,
            batch_size as u32,
        )?;
        Ok(bytes_to_vec(&result))
    }

    /// Quantized decode attention forward for f32 scales/biases.
    ///
    /// Packed layouts mirror the CPU kernel: codes are little-endian u32
    /// words with per-KV-head stride `k_stride_words`; scales/biases carry
    /// one entry per quantization group with stride `k_stride_groups`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_quantized_f32(
        &self,
        q: &[f32],
        k_codes: &[u32],
        k_scales: &[f32],
        k_biases: &[f32],
        v_codes: &[u32],
        v_scales: &[f32],
        v_biases: &[f32],
        batch_size: usize,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        seq_len: usize,
        k_stride_words: usize,
        k_stride_groups: usize,
        group_size: usize,
        scale: f32,
        bits: QuantBits,
    ) -> Result<Vec<f32>, SdpaVectorError> {
        if seq_len == 0 {
            return Err(SdpaVectorError::InvalidConfig(
                "empty sequence is handled on the CPU path".into(),
            ));
        }

        let params = QuantSdpaVectorParams {
            gqa_factor: (num_heads / num_kv_heads) as u32,
            seq_len: seq_len as u32,
            head_dim: head_dim as u32,
            num_kv_heads: num_kv_heads as u32,
            k_stride_words: k_stride_words as u32,
            k_stride_groups: k_stride_groups as u32,
            group_size: group_size as u32,
            scale,
        };

        let out_elems = batch_size * num_heads * head_dim;
        let output_bytes = (out_elems * std::mem::size_of::<f32>()) as u64;

        let q_buffer = self.upload("quant_sdpa_vector_q", slice_as_bytes(q));
        let k_codes_buffer = self.upload("quant_sdpa_vector_k_codes", slice_as_bytes(k_codes));
        let k_scales_buffer = self.upload("quant_sdpa_vector_k_scales", slice_as_bytes(k_scales));
        let k_biases_buffer = self.upload("quant_sdpa_vector_k_biases", slice_as_bytes(k_biases));
        let v_codes_buffer = self.upload("quant_sdpa_vector_v_codes", slice_as_bytes(v_codes));
        let v_scales_buffer = self.upload("quant_sdpa_vector_v_scales", slice_as_bytes(v_scales));
        let v_biases_buffer = self.upload("quant_sdpa_vector_v_biases", slice_as_bytes(v_biases));
        let params_buffer = self.upload_uniform("quant_sdpa_vector_params", bytes_of(&params));
        let (output_buffer, readback) = self.output_pair("quant_sdpa_vector", output_bytes);

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("quant_sdpa_vector_bind_group"),
            layout: &self.quant_bind_group_layout,
            entries: &[
                buffer_binding(0, &q_buffer),
                buffer_binding(1, &k_codes_buffer),
                buffer_binding(2, &k_scales_buffer),
                buffer_binding(3, &k_biases_buffer),
                buffer_binding(4, &v_codes_buffer),
                buffer_binding(5, &v_scales_buffer),
                buffer_binding(6, &v_biases_buffer),
                buffer_binding(7, &output_buffer),
                buffer_binding(8, &params_buffer),
            ],
        });

        let pipeline = match bits {
            QuantBits::Four => &self.pipeline_quant_4bit_f32,
            QuantBits::Eight => &self.pipeline_quant_8bit_f32,
        };

        let result = self.run(
            pipeline,
            &bind_group,
            &output_buffer,
            &readback,
            output_bytes,
            num_heads as u32,
            batch_size as u32,
        )?;
        Ok(bytes_to_vec(&result))
    }

    fn upload(&self, label: &str, contents: &[u8]) -> Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
            })
    }

    fn upload_uniform(&self, label: &str, contents: &[u8]) -> Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
            })
    }

    fn output_pair(&self, label: &str, output_bytes: u64) -> (Buffer, Buffer) {
        let padded = align_up(output_bytes, max_align());
        let output = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{label}_output")),
            size: padded,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{label}_readback")),
            size: padded,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        (output, readback)
    }

    /// One workgroup per (head, batch) pair.
    #[allow(clippy::too_many_arguments)]
    fn run(
        &self,
        pipeline: &ComputePipeline,
        bind_group: &BindGroup,
        output_buffer: &Buffer,
        readback: &Buffer,
        output_bytes: u64,
        num_heads: u32,
        batch_size: u32,
    ) -> Result<Vec<u8>, SdpaVectorError> {
        let padded = align_up(output_bytes, max_align());
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("sdpa_vector_encoder"),
            });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("sdpa_vector_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(1, num_heads, batch_size);
        }

        encoder.copy_buffer_to_buffer(output_buffer, 0, readback, 0, padded);
        self.queue.submit(Some(encoder.finish()));

        let mut data = read_buffer_sync(&self.device, readback, padded)?;
        data.truncate(output_bytes as usize);
        Ok(data)
    }
}
