//! Adapter and device acquisition

use thiserror::Error;

/// Why no device could be acquired
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("no suitable GPU adapter found")]
    AdapterNotFound,

    #[error("failed to request device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}

/// How to pick an adapter
#[derive(Clone, Debug)]
pub struct DeviceOptions {
    pub backends: wgpu::Backends,
    pub power_preference: wgpu::PowerPreference,
    /// Use the software rasterizer adapter if the platform has one
    pub force_fallback_adapter: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            backends: preferred_backends(),
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
        }
    }
}

/// The primary backend of the current platform
///
/// Initializing a single driver stack keeps memory usage down.
pub fn preferred_backends() -> wgpu::Backends {
    #[cfg(target_os = "macos")]
    {
        wgpu::Backends::METAL
    }
    #[cfg(target_os = "windows")]
    {
        wgpu::Backends::DX12
    }
    #[cfg(target_os = "linux")]
    {
        wgpu::Backends::VULKAN
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    {
        wgpu::Backends::PRIMARY
    }
}

/// An acquired device with its queue
pub(crate) struct Gpu {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub info: wgpu::AdapterInfo,
}

pub(crate) async fn acquire(options: &DeviceOptions) -> Result<Gpu, DeviceError> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: options.backends,
        ..Default::default()
    });

    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: options.power_preference,
            compatible_surface: None,
            force_fallback_adapter: options.force_fallback_adapter,
        })
        .await
        .ok_or(DeviceError::AdapterNotFound)?;

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Mote Compute Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default().using_resolution(adapter.limits()),
                memory_hints: wgpu::MemoryHints::MemoryUsage,
            },
            None,
        )
        .await?;

    Ok(Gpu {
        device,
        queue,
        info: adapter.get_info(),
    })
}
