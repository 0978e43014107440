//! Runtime backend detection with caching.

use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Wgpu,
    Cpu,
}

impl BackendType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Wgpu => "WGPU",
            Self::Cpu => "CPU",
        }
    }
}

static CACHED_BACKEND: OnceLock<BackendType> = OnceLock::new();

/// Detect the best available backend.
///
/// Priority: WGPU → CPU. The probe runs once per process; the CPU backend is
/// always available, so this never fails.
pub fn detect_backend() -> BackendType {
    *CACHED_BACKEND.get_or_init(|| {
        let backend = if try_wgpu() {
            BackendType::Wgpu
        } else {
            BackendType::Cpu
        };
        log::info!("Detected backend: {}", backend.name());
        backend
    })
}

fn try_wgpu() -> bool {
    let instance = wgpu::Instance::default();
    match pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    })) {
        Ok(adapter) => {
            let info = adapter.get_info();
            log::debug!("WGPU adapter: {} ({:?})", info.name, info.backend);
            true
        }
        Err(err) => {
            log::debug!("No WGPU adapter: {err}");
            false
        }
    }
}
