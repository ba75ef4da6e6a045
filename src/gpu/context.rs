use crate::error::{Error, Result};

/// Which adapter the plan should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    /// Prefer a discrete or integrated GPU.
    Gpu,
    /// Force the software fallback adapter.
    Cpu,
    /// Take whatever the backend offers first.
    Any,
}

/// Owned compute context. Each plan holds its own context; nothing here is
/// shared between plan instances.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter: wgpu::Adapter,
}

impl GpuContext {
    /// Acquire a device synchronously.
    pub fn new(preference: DevicePreference) -> Result<Self> {
        pollster::block_on(Self::new_async(preference))
    }

    pub async fn new_async(preference: DevicePreference) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: match preference {
                    DevicePreference::Gpu => wgpu::PowerPreference::HighPerformance,
                    _ => wgpu::PowerPreference::default(),
                },
                compatible_surface: None,
                force_fallback_adapter: preference == DevicePreference::Cpu,
            })
            .await
            .map_err(|e| Error::DeviceUnavailable(format!("no adapter: {e}")))?;

        Self::from_adapter(adapter).await
    }

    /// Acquire a specific adapter by enumeration index, for callers that
    /// want one particular device rather than a type hint.
    pub fn with_adapter_index(index: usize) -> Result<Self> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
            let adapters = instance.enumerate_adapters(wgpu::Backends::all());
            let adapter = adapters.into_iter().nth(index).ok_or_else(|| {
                Error::DeviceUnavailable(format!("no adapter with index {index}"))
            })?;
            Self::from_adapter(adapter).await
        })
    }

    async fn from_adapter(adapter: wgpu::Adapter) -> Result<Self> {
        log::debug!("using adapter: {}", adapter.get_info().name);
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("sift-gpu device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::DeviceUnavailable(format!("device request failed: {e}")))?;

        Ok(Self {
            device,
            queue,
            adapter,
        })
    }

    /// Block until all submitted device work has drained.
    pub fn wait_idle(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| Error::Gpu(format!("device poll failed: {e:?}")))?;
        Ok(())
    }
}
