use crate::error::KrylovError;
use bytemuck::{Pod, Zeroable};
use cfg_if::cfg_if;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use wgpu::{util::DeviceExt, PollType};

/// Wrapper for the WGPU device and queue, including transfer counters and
/// the compute pipelines compiled so far.
#[derive(Debug, Clone)]
pub(crate) struct GpuContext {
    pub(crate) device: Arc<wgpu::Device>,
    pub(crate) queue: Arc<wgpu::Queue>,
    /// Tracks bytes transferred from CPU to GPU via instrumented methods.
    pub(crate) bytes_to_gpu: Arc<AtomicU64>,
    /// Tracks bytes transferred from GPU to CPU via instrumented methods.
    pub(crate) bytes_from_gpu: Arc<AtomicU64>,
    pipelines: Arc<Mutex<HashMap<&'static str, Arc<wgpu::ComputePipeline>>>>,
}

impl GpuContext {
    /// Initializes the WGPU context asynchronously.
    pub(crate) async fn new() -> Result<Self, KrylovError> {
        log::info!("Initializing WGPU context");

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY, // Vulkan, Metal, DX12
            ..Default::default()
        });

        log::debug!("Requesting adapter");
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| KrylovError::WgpuInitError("No suitable adapter found".to_string()))?;

        log::info!("Selected Adapter: {:?}", adapter.get_info());

        let adapter_limits = adapter.limits();
        let mut limits = wgpu::Limits::default().using_resolution(adapter_limits.clone());
        // The fused kernels bind up to eight storage buffers at once.
        limits.max_storage_buffers_per_shader_stage = limits
            .max_storage_buffers_per_shader_stage
            .max(8)
            .min(adapter_limits.max_storage_buffers_per_shader_stage);
        log::debug!("Adjusted limits: {:?}", limits);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("krylov_core device"),
                trace: wgpu::Trace::Off,
                memory_hints: wgpu::MemoryHints::Performance,
                required_features: wgpu::Features::empty(),
                required_limits: limits,
            })
            .await
            .map_err(|e| KrylovError::WgpuInitError(format!("Failed to request device: {}", e)))?;

        log::info!("Device and queue obtained successfully");

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            bytes_to_gpu: Arc::new(AtomicU64::new(0)),
            bytes_from_gpu: Arc::new(AtomicU64::new(0)),
            pipelines: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Helper to create a GPU buffer with initial data and track the transfer size.
    pub(crate) fn create_gpu_buffer_with_data(
        &self,
        label: &str,
        contents: &[u8],
        usage: wgpu::BufferUsages,
    ) -> wgpu::Buffer {
        let byte_len = contents.len() as u64;
        log::debug!("Creating GPU buffer '{}' with {} bytes", label, byte_len);
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage,
            });
        self.bytes_to_gpu.fetch_add(byte_len, Ordering::Relaxed);
        log::trace!(
            "bytes_to_gpu incremented by {}, now: {}",
            byte_len,
            self.bytes_to_gpu.load(Ordering::Relaxed)
        );
        buffer
    }

    /// Uniform buffer holding a kernel's parameter block. Not counted as a
    /// data transfer.
    pub(crate) fn create_params_buffer<P: Pod>(&self, label: &str, params: &P) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::bytes_of(params),
                usage: wgpu::BufferUsages::UNIFORM,
            })
    }

    /// Writes `data` into `buffer` starting at element `offset`. Tracks the transfer size.
    pub(crate) async fn write_buffer<T: Pod>(
        &self,
        buffer: &wgpu::Buffer,
        offset: usize,
        data: &[T],
    ) -> Result<(), KrylovError> {
        let element_size = std::mem::size_of::<T>() as u64;
        let byte_len = data.len() as u64 * element_size;
        if byte_len == 0 {
            log::debug!("Skipping write for 0 bytes");
            return Ok(());
        }
        let byte_offset = offset as u64 * element_size;
        if buffer.size() < byte_offset + byte_len {
            return Err(KrylovError::Internal(format!(
                "Target buffer size ({}) is smaller than write end ({})",
                buffer.size(),
                byte_offset + byte_len
            )));
        }
        if !buffer.usage().contains(wgpu::BufferUsages::COPY_DST) {
            return Err(KrylovError::Internal(
                "Target buffer must have COPY_DST usage".to_string(),
            ));
        }

        log::debug!("Writing {} bytes at offset {}", byte_len, byte_offset);
        self.queue
            .write_buffer(buffer, byte_offset, bytemuck::cast_slice(data));

        self.bytes_to_gpu.fetch_add(byte_len, Ordering::Relaxed);
        log::trace!(
            "bytes_to_gpu incremented by {} (write_buffer), now: {}",
            byte_len,
            self.bytes_to_gpu.load(Ordering::Relaxed)
        );
        Ok(())
    }

    /// Helper to create an empty GPU buffer (useful for shader outputs).
    /// Does not count towards `bytes_to_gpu` as no data is initially transferred.
    pub(crate) fn create_empty_buffer(
        &self,
        label: &str,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> wgpu::Buffer {
        log::debug!("Creating empty GPU buffer '{}' of size {}", label, size);
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        })
    }

    /// Returns the cached compute pipeline for `name`, compiling `source` on first use.
    pub(crate) async fn pipeline(
        &self,
        name: &'static str,
        source: &'static str,
    ) -> Result<Arc<wgpu::ComputePipeline>, KrylovError> {
        if let Some(pipeline) = self.cached_pipeline(name)? {
            return Ok(pipeline);
        }

        log::debug!("Compiling compute pipeline '{}'", name);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(name),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(name),
                layout: None,
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });
        if let Some(error) = self.device.pop_error_scope().await {
            return Err(KrylovError::ShaderError(format!("{}: {}", name, error)));
        }

        let pipeline = Arc::new(pipeline);
        self.pipelines
            .lock()
            .map_err(|_| KrylovError::Internal("Pipeline cache lock poisoned".to_string()))?
            .insert(name, Arc::clone(&pipeline));
        Ok(pipeline)
    }

    fn cached_pipeline(
        &self,
        name: &str,
    ) -> Result<Option<Arc<wgpu::ComputePipeline>>, KrylovError> {
        let cache = self
            .pipelines
            .lock()
            .map_err(|_| KrylovError::Internal("Pipeline cache lock poisoned".to_string()))?;
        Ok(cache.get(name).cloned())
    }

    /// Encodes work with `encode` and submits it inside validation and
    /// out-of-memory error scopes, so that a failed launch is reported as
    /// [`KrylovError::ExecutionFailed`].
    pub(crate) async fn submit_scoped<F>(&self, kernel: &str, encode: F) -> Result<(), KrylovError>
    where
        F: FnOnce(&mut wgpu::CommandEncoder),
    {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kernel),
            });
        encode(&mut encoder);
        self.queue.submit(Some(encoder.finish()));

        let validation = self.device.pop_error_scope().await;
        let out_of_memory = self.device.pop_error_scope().await;
        match validation.or(out_of_memory) {
            Some(error) => {
                log::error!("Kernel '{}' failed: {}", kernel, error);
                Err(KrylovError::execution(kernel, error))
            }
            None => Ok(()),
        }
    }

    /// Blocks until all submitted work has completed.
    pub(crate) fn finish(&self) -> Result<(), KrylovError> {
        cfg_if! {
            if #[cfg(not(target_arch = "wasm32"))] {
                self.device
                    .poll(PollType::Wait)
                    .map_err(|e| KrylovError::WgpuError(format!("Device poll failed: {}", e)))?;
            }
        }
        Ok(())
    }

    /// Reads `element_count` elements starting at element `offset` of a GPU
    /// buffer back to the CPU.
    ///
    /// # Errors
    /// Returns `KrylovError` if the range is out of bounds or the mapping fails.
    pub(crate) async fn read_buffer_range<T: Pod + Zeroable>(
        &self,
        buffer: &wgpu::Buffer,
        offset: usize,
        element_count: usize,
    ) -> Result<Vec<T>, KrylovError> {
        let element_size = std::mem::size_of::<T>() as u64;
        let size_bytes = element_count as u64 * element_size;
        let byte_offset = offset as u64 * element_size;

        if size_bytes == 0 {
            log::debug!("Skipping readback for 0 bytes");
            return Ok(Vec::new());
        }
        if buffer.size() < byte_offset + size_bytes {
            return Err(KrylovError::Internal(format!(
                "GPU buffer size ({}) is smaller than requested range end ({})",
                buffer.size(),
                byte_offset + size_bytes
            )));
        }

        log::debug!("Creating staging buffer for readback ({} bytes)", size_bytes);
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging_buffer_for_readback"),
            size: size_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        self.submit_scoped("read_buffer", |encoder| {
            encoder.copy_buffer_to_buffer(buffer, byte_offset, &staging_buffer, 0, size_bytes);
        })
        .await?;

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            if let Err(e) = sender.send(result) {
                log::error!("Failed to send map result back: {:?}", e);
            }
        });

        self.bytes_from_gpu.fetch_add(size_bytes, Ordering::Relaxed);
        log::trace!(
            "bytes_from_gpu incremented by {}, now: {}",
            size_bytes,
            self.bytes_from_gpu.load(Ordering::Relaxed)
        );

        self.finish()?;

        match receiver.await {
            Ok(Ok(())) => {
                let result = {
                    let data = buffer_slice.get_mapped_range();
                    if data.len() as u64 != size_bytes {
                        let mapped_len = data.len();
                        drop(data);
                        staging_buffer.unmap();
                        return Err(KrylovError::Internal(format!(
                            "Mapped data size ({}) does not match expected byte size ({})",
                            mapped_len, size_bytes
                        )));
                    }
                    bytemuck::cast_slice::<u8, T>(&data).to_vec()
                };
                staging_buffer.unmap();
                log::debug!("Buffer readback complete ({} bytes)", size_bytes);
                Ok(result)
            }
            Ok(Err(e)) => {
                log::error!("Failed to map buffer: {:?}", e);
                Err(KrylovError::WgpuError(format!("Buffer mapping failed: {}", e)))
            }
            Err(_) => Err(KrylovError::Internal(
                "Channel receive error during buffer mapping".to_string(),
            )),
        }
    }

    /// Returns the current transfer statistics.
    pub(crate) fn get_transfer_stats(&self) -> (u64, u64) {
        (
            self.bytes_to_gpu.load(Ordering::Relaxed),
            self.bytes_from_gpu.load(Ordering::Relaxed),
        )
    }

    /// Resets the transfer statistics counters to zero.
    pub(crate) fn reset_transfer_stats(&self) {
        self.bytes_to_gpu.store(0, Ordering::Relaxed);
        self.bytes_from_gpu.store(0, Ordering::Relaxed);
        log::info!("GPU transfer counters reset.");
    }
}
