//! WGPU decode attention kernels using WGSL.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use wgpu::{BindGroupLayout, ComputePipeline, Device, Queue};

use super::utils::{buffer_layout_entry, uniform_layout_entry};

const KERNEL_F32: &str = "sdpa_vector_f32";
const KERNEL_QUANT_4BIT_F32: &str = "quant_sdpa_vector_4bit_f32";
const KERNEL_QUANT_8BIT_F32: &str = "quant_sdpa_vector_8bit_f32";
const SHADER_SOURCE: &str = include_str!("../kernels/sdpa_vector.wgsl");
const QUANT_SHADER_SOURCE: &str = include_str!("../kernels/quant_sdpa_vector.wgsl");

/// Lanes per worker-group row in the full-precision shader. The shader only
/// handles head dimensions that are a multiple of this.
pub(crate) const SHADER_DIM_LANES: usize = 32;

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub(super) struct SdpaVectorParams {
    pub(super) gqa_factor: u32,
    pub(super) seq_len: u32,
    pub(super) head_dim: u32,
    pub(super) num_kv_heads: u32,
    pub(super) k_stride: u32,
    pub(super) scale: f32,
    pub(super) _pad0: u32,
    pub(super) _pad1: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub(super) struct QuantSdpaVectorParams {
    pub(super) gqa_factor: u32,
    pub(super) seq_len: u32,
    pub(super) head_dim: u32,
    pub(super) num_kv_heads: u32,
    pub(super) k_stride_words: u32,
    pub(super) k_stride_groups: u32,
    pub(super) group_size: u32,
    pub(super) scale: f32,
}

/// Errors surfaced by the WGPU decode attention kernels.
#[derive(Debug)]
pub enum SdpaVectorError {
    /// WGPU driver error or initialization failure.
    Wgpu(String),
    /// Invalid launch or shape configuration.
    InvalidConfig(String),
    /// Unsupported device capability.
    Unsupported(String),
}

impl fmt::Display for SdpaVectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wgpu(msg) => write!(f, "WGPU error: {msg}"),
            Self::InvalidConfig(msg) => write!(f, "Invalid config: {msg}"),
            Self::Unsupported(msg) => write!(f, "Unsupported: {msg}"),
        }
    }
}

impl std::error::Error for SdpaVectorError {}

/// Decode attention WGPU kernel wrapper.
pub struct SdpaVectorKernel {
    pub(super) device: Arc<Device>,
    pub(super) queue: Arc<Queue>,
    pub(super) bind_group_layout: BindGroupLayout,
    pub(super) quant_bind_group_layout: BindGroupLayout,
    pub(super) pipeline_f32: ComputePipeline,
    pub(super) pipeline_quant_4bit_f32: ComputePipeline,
    pub(super) pipeline_quant_8bit_f32: ComputePipeline,
}

impl SdpaVectorKernel {
    /// Create a decode attention kernel wrapper for an existing WGPU device.
    pub fn new(device: &Device, queue: &Queue) -> Result<Self, SdpaVectorError> {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("sdpa_vector.wgsl"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(SHADER_SOURCE)),
        });
        let quant_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("quant_sdpa_vector.wgsl"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(QUANT_SHADER_SOURCE)),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("sdpa_vector_bind_group_layout"),
            entries: &[
                buffer_layout_entry(0, true),
                buffer_layout_entry(1, true),
                buffer_layout_entry(2, true),
                buffer_layout_entry(3, false),
                uniform_layout_entry(4),
            ],
        });

        let quant_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("quant_sdpa_vector_bind_group_layout"),
                entries: &[
                    buffer_layout_entry(0, true),
                    buffer_layout_entry(1, true),
                    buffer_layout_entry(2, true),
                    buffer_layout_entry(3, true),
                    buffer_layout_entry(4, true),
                    buffer_layout_entry(5, true),
                    buffer_layout_entry(6, true),
                    buffer_layout_entry(7, false),
                    uniform_layout_entry(8),
                ],
            });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("sdpa_vector_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let quant_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("quant_sdpa_vector_pipeline_layout"),
                bind_group_layouts: &[&quant_bind_group_layout],
                push_constant_ranges: &[],
            });

        let pipeline_f32 = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("sdpa_vector_f32"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some(KERNEL_F32),
            compilation_options: Default::default(),
            cache: None,
        });
        let pipeline_quant_4bit_f32 =
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("quant_sdpa_vector_4bit_f32"),
                layout: Some(&quant_pipeline_layout),
                module: &quant_shader,
                entry_point: Some(KERNEL_QUANT_4BIT_F32),
                compilation_options: Default::default(),
                cache: None,
            });
        let pipeline_quant_8bit_f32 =
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("quant_sdpa_vector_8bit_f32"),
                layout: Some(&quant_pipeline_layout),
                module: &quant_shader,
                entry_point: Some(KERNEL_QUANT_8BIT_F32),
                compilation_options: Default::default(),
                cache: None,
            });

        Ok(Self {
            device: Arc::new(device.clone()),
            queue: Arc::new(queue.clone()),
            bind_group_layout,
            quant_bind_group_layout,
            pipeline_f32,
            pipeline_quant_4bit_f32,
            pipeline_quant_8bit_f32,
        })
    }

    /// Create a decode attention kernel wrapper with a newly initialized device.
    pub fn create_default() -> Result<Self, SdpaVectorError> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| SdpaVectorError::Wgpu(format!("no compatible adapter found: {e}")))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("sdpa-kernels-wgpu"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::Off,
        }))
        .map_err(|err| SdpaVectorError::Wgpu(format!("request_device failed: {err}")))?;

        Self::new(&device, &queue)
    }
}
