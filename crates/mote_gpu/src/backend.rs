//! [`ComputeBackend`] over a wgpu device
//!
//! Objects live in a [`ResourceRegistry`] keyed by the same flat handles the
//! software backend hands out. Creation runs inside a validation error scope
//! so a rejected object comes back as the invalid sentinel; errors raised
//! while executing submitted work reach the uncaptured error handler and are
//! counted as faults.
//!
//! Compute passes are recorded on the host and replayed into the real
//! encoder when the pass ends.

use std::borrow::Cow;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, error, info, warn};

use mote_core::backend::{align_size, COPY_ALIGNMENT};
use mote_core::handle::{
    BindGroupHandle, BindGroupLayoutHandle, BufferHandle, CommandBufferHandle,
    CommandEncoderHandle, ComputePassHandle, ComputePipelineHandle, DeviceHandle,
    PipelineLayoutHandle, ShaderModuleHandle,
};
use mote_core::records::{decode_bindings, decode_layout_entries};
use mote_core::{BufferDescriptor, ComputeBackend, Handle, RawHandle, ResourceRegistry};

use crate::convert::{buffer_usages, layout_entry};
use crate::device::{acquire, DeviceError, DeviceOptions, Gpu};

// === Objects ===

enum PassCommand {
    SetPipeline(RawHandle),
    SetBindGroup {
        index: u32,
        group: RawHandle,
        offsets: SmallVec<[u32; 2]>,
    },
    Dispatch([u32; 3]),
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
    usage: wgpu::BufferUsages,
    label: String,
}

enum GpuObject {
    Device,
    Buffer(GpuBuffer),
    ShaderModule(wgpu::ShaderModule),
    BindGroupLayout(wgpu::BindGroupLayout),
    BindGroup(wgpu::BindGroup),
    PipelineLayout(wgpu::PipelineLayout),
    ComputePipeline(wgpu::ComputePipeline),
    CommandEncoder {
        /// Lent out while a pass is replayed
        encoder: Option<wgpu::CommandEncoder>,
        open_pass: Option<RawHandle>,
    },
    ComputePass {
        encoder: RawHandle,
        label: String,
        commands: Vec<PassCommand>,
    },
    CommandBuffer(wgpu::CommandBuffer),
}

impl GpuObject {
    fn kind(&self) -> &'static str {
        match self {
            GpuObject::Device => "device",
            GpuObject::Buffer(_) => "buffer",
            GpuObject::ShaderModule(_) => "shader module",
            GpuObject::BindGroupLayout(_) => "bind group layout",
            GpuObject::BindGroup(_) => "bind group",
            GpuObject::PipelineLayout(_) => "pipeline layout",
            GpuObject::ComputePipeline(_) => "compute pipeline",
            GpuObject::CommandEncoder { .. } => "command encoder",
            GpuObject::ComputePass { .. } => "compute pass",
            GpuObject::CommandBuffer(_) => "command buffer",
        }
    }
}

/// Run `create` inside a validation error scope
fn scoped<T>(
    device: &wgpu::Device,
    kind: &str,
    label: &str,
    create: impl FnOnce(&wgpu::Device) -> T,
) -> Option<T> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = create(device);
    match pollster::block_on(device.pop_error_scope()) {
        None => Some(value),
        Some(e) => {
            error!("wgpu: {} '{}' rejected: {}", kind, label, e);
            None
        }
    }
}

// === Backend ===

/// Compute backend on a real GPU
pub struct WgpuBackend {
    options: DeviceOptions,
    gpu: Option<Gpu>,
    objects: ResourceRegistry<GpuObject>,
    invalid_uses: u64,
    faults: Arc<AtomicU32>,
    last_error: Option<DeviceError>,
}

impl Default for WgpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WgpuBackend {
    pub fn new() -> Self {
        Self::with_options(DeviceOptions::default())
    }

    pub fn with_options(options: DeviceOptions) -> Self {
        Self {
            options,
            gpu: None,
            objects: ResourceRegistry::new(),
            invalid_uses: 0,
            faults: Arc::new(AtomicU32::new(0)),
            last_error: None,
        }
    }

    /// Adapter of the acquired device
    pub fn adapter_info(&self) -> Option<&wgpu::AdapterInfo> {
        self.gpu.as_ref().map(|gpu| &gpu.info)
    }

    /// Why the last `request_device` failed, if it did
    pub fn last_error(&self) -> Option<&DeviceError> {
        self.last_error.as_ref()
    }

    /// Objects currently alive
    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    fn insert(&mut self, object: GpuObject) -> RawHandle {
        self.objects.insert(object)
    }

    fn invalid_use(&mut self, op: &str, handle: RawHandle) {
        self.invalid_uses += 1;
        warn!("wgpu: {} on invalid handle {:#x} ignored", op, handle);
    }

    /// The device behind `device`, if the handle is the live device
    fn live_gpu(&mut self, op: &str, device: DeviceHandle) -> Option<&Gpu> {
        let live = matches!(self.objects.get(device.raw()), Some(GpuObject::Device));
        if !live || self.gpu.is_none() {
            self.invalid_use(op, device.raw());
            return None;
        }
        self.gpu.as_ref()
    }

    /// Remove `handle` only if it names an object of `kind`
    fn take(&mut self, op: &str, handle: RawHandle, kind: &str) -> Option<GpuObject> {
        match self.objects.get(handle) {
            Some(object) if object.kind() == kind => self.objects.remove(handle),
            _ => {
                self.invalid_use(op, handle);
                None
            }
        }
    }

    fn record(&mut self, op: &str, pass: ComputePassHandle, command: PassCommand) {
        match self.objects.get_mut(pass.raw()) {
            Some(GpuObject::ComputePass { commands, .. }) => commands.push(command),
            _ => self.invalid_use(op, pass.raw()),
        }
    }

    /// Replay a finished pass into its encoder
    fn replay(&mut self, encoder_handle: RawHandle, label: &str, commands: &[PassCommand]) {
        let mut encoder = match self.objects.get_mut(encoder_handle) {
            Some(GpuObject::CommandEncoder { encoder, open_pass }) => {
                *open_pass = None;
                match encoder.take() {
                    Some(encoder) => encoder,
                    None => return,
                }
            }
            _ => {
                self.invalid_use("end_pass", encoder_handle);
                return;
            }
        };

        let mut stale = 0u64;
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            for command in commands {
                match command {
                    PassCommand::SetPipeline(handle) => match self.objects.get(*handle) {
                        Some(GpuObject::ComputePipeline(pipeline)) => pass.set_pipeline(pipeline),
                        _ => stale += 1,
                    },
                    PassCommand::SetBindGroup {
                        index,
                        group,
                        offsets,
                    } => match self.objects.get(*group) {
                        Some(GpuObject::BindGroup(group)) => {
                            pass.set_bind_group(*index, group, offsets)
                        }
                        _ => stale += 1,
                    },
                    PassCommand::Dispatch([x, y, z]) => pass.dispatch_workgroups(*x, *y, *z),
                }
            }
        }

        if let Some(GpuObject::CommandEncoder { encoder: slot, .. }) =
            self.objects.get_mut(encoder_handle)
        {
            *slot = Some(encoder);
        }
        if stale > 0 {
            self.invalid_uses += stale;
            warn!("wgpu: pass '{}' named {} stale handle(s)", label, stale);
        }
    }
}

impl ComputeBackend for WgpuBackend {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn request_device(&mut self) -> DeviceHandle {
        if self.gpu.is_some() {
            warn!("wgpu: device already acquired");
            return Handle::invalid();
        }
        let gpu = match pollster::block_on(acquire(&self.options)) {
            Ok(gpu) => gpu,
            Err(e) => {
                error!("wgpu: {}", e);
                self.last_error = Some(e);
                return Handle::invalid();
            }
        };

        let faults = Arc::clone(&self.faults);
        gpu.device.on_uncaptured_error(Box::new(move |e| {
            faults.fetch_add(1, Ordering::AcqRel);
            error!("wgpu: uncaptured error: {}", e);
        }));
        info!("wgpu: {} ({:?})", gpu.info.name, gpu.info.backend);

        self.gpu = Some(gpu);
        self.last_error = None;
        Handle::from_raw(self.insert(GpuObject::Device))
    }

    fn create_buffer(&mut self, device: DeviceHandle, desc: &BufferDescriptor<'_>) -> BufferHandle {
        let Some(gpu) = self.live_gpu("create_buffer", device) else {
            return Handle::invalid();
        };
        let usage = buffer_usages(desc.usage);
        let size = align_size(desc.size);
        let buffer = scoped(&gpu.device, "buffer", desc.label, |device| {
            let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(desc.label),
                size,
                usage,
                mapped_at_creation: desc.mapped_at_creation,
            });
            if desc.mapped_at_creation {
                buffer.unmap();
            }
            buffer
        });
        match buffer {
            Some(buffer) => Handle::from_raw(self.insert(GpuObject::Buffer(GpuBuffer {
                buffer,
                size: desc.size,
                usage,
                label: desc.label.to_string(),
            }))),
            None => Handle::invalid(),
        }
    }

    fn write_buffer(&mut self, device: DeviceHandle, buffer: BufferHandle, offset: u64, data: &[u8]) {
        if self.live_gpu("write_buffer", device).is_none() {
            return;
        }
        let Some(GpuObject::Buffer(target)) = self.objects.get(buffer.raw()) else {
            self.invalid_use("write_buffer", buffer.raw());
            return;
        };
        let unaligned = offset % COPY_ALIGNMENT != 0 || data.len() as u64 % COPY_ALIGNMENT != 0;
        let in_range = offset
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= target.size);
        if unaligned || !in_range {
            warn!(
                "wgpu: write of {} bytes at {} rejected for '{}' ({} bytes)",
                data.len(),
                offset,
                target.label,
                target.size
            );
            self.invalid_uses += 1;
            return;
        }
        if let Some(gpu) = &self.gpu {
            gpu.queue.write_buffer(&target.buffer, offset, data);
        }
    }

    fn read_buffer(&mut self, device: DeviceHandle, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.live_gpu("read_buffer", device)?;
        let Some(GpuObject::Buffer(source)) = self.objects.get(buffer.raw()) else {
            self.invalid_use("read_buffer", buffer.raw());
            return None;
        };
        if !source.usage.contains(wgpu::BufferUsages::COPY_SRC) {
            warn!("wgpu: '{}' is not readable (no COPY_SRC)", source.label);
            self.invalid_uses += 1;
            return None;
        }
        let gpu = self.gpu.as_ref()?;
        let size = align_size(source.size);

        let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging, 0, size);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("wgpu: mapping '{}' failed: {}", source.label, e);
                return None;
            }
            Err(_) => {
                error!("wgpu: mapping '{}' never completed", source.label);
                return None;
            }
        }

        let mut bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        bytes.truncate(source.size as usize);
        Some(bytes)
    }

    fn create_shader_module(
        &mut self,
        device: DeviceHandle,
        label: &str,
        source: &str,
    ) -> ShaderModuleHandle {
        let Some(gpu) = self.live_gpu("create_shader_module", device) else {
            return Handle::invalid();
        };
        let module = scoped(&gpu.device, "shader module", label, |device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
            })
        });
        match module {
            Some(module) => Handle::from_raw(self.insert(GpuObject::ShaderModule(module))),
            None => Handle::invalid(),
        }
    }

    fn create_bind_group_layout(
        &mut self,
        device: DeviceHandle,
        label: &str,
        entries: &[u8],
    ) -> BindGroupLayoutHandle {
        let entries = match decode_layout_entries(entries) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("wgpu: bind group layout '{}': {}", label, e);
                self.invalid_uses += 1;
                return Handle::invalid();
            }
        };
        let Some(gpu) = self.live_gpu("create_bind_group_layout", device) else {
            return Handle::invalid();
        };
        let wgpu_entries: Vec<_> = entries.iter().map(layout_entry).collect();
        let layout = scoped(&gpu.device, "bind group layout", label, |device| {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &wgpu_entries,
            })
        });
        match layout {
            Some(layout) => Handle::from_raw(self.insert(GpuObject::BindGroupLayout(layout))),
            None => Handle::invalid(),
        }
    }

    fn create_bind_group(
        &mut self,
        device: DeviceHandle,
        label: &str,
        layout: BindGroupLayoutHandle,
        entries: &[u8],
    ) -> BindGroupHandle {
        let bindings = match decode_bindings(entries) {
            Ok(bindings) => bindings,
            Err(e) => {
                warn!("wgpu: bind group '{}': {}", label, e);
                self.invalid_uses += 1;
                return Handle::invalid();
            }
        };
        if self.live_gpu("create_bind_group", device).is_none() {
            return Handle::invalid();
        }
        let Some(GpuObject::BindGroupLayout(wgpu_layout)) = self.objects.get(layout.raw()) else {
            self.invalid_use("create_bind_group", layout.raw());
            return Handle::invalid();
        };

        let mut stale = None;
        let mut wgpu_entries = Vec::with_capacity(bindings.len());
        for binding in &bindings {
            match self.objects.get(binding.buffer.raw()) {
                Some(GpuObject::Buffer(target)) => wgpu_entries.push(wgpu::BindGroupEntry {
                    binding: binding.binding,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &target.buffer,
                        offset: binding.offset,
                        size: binding.size.and_then(NonZeroU64::new),
                    }),
                }),
                _ => {
                    stale = Some(binding.buffer.raw());
                    break;
                }
            }
        }
        if let Some(handle) = stale {
            self.invalid_uses += 1;
            warn!("wgpu: bind group '{}' names stale buffer {:#x}", label, handle);
            return Handle::invalid();
        }

        let group = self.gpu.as_ref().and_then(|gpu| {
            scoped(&gpu.device, "bind group", label, |device| {
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(label),
                    layout: wgpu_layout,
                    entries: &wgpu_entries,
                })
            })
        });
        match group {
            Some(group) => Handle::from_raw(self.insert(GpuObject::BindGroup(group))),
            None => Handle::invalid(),
        }
    }

    fn create_pipeline_layout(
        &mut self,
        device: DeviceHandle,
        label: &str,
        layouts: &[BindGroupLayoutHandle],
    ) -> PipelineLayoutHandle {
        if self.live_gpu("create_pipeline_layout", device).is_none() {
            return Handle::invalid();
        }
        let mut resolved = Vec::with_capacity(layouts.len());
        for layout in layouts {
            match self.objects.get(layout.raw()) {
                Some(GpuObject::BindGroupLayout(layout)) => resolved.push(layout),
                _ => {
                    self.invalid_uses += 1;
                    warn!("wgpu: pipeline layout '{}' names stale layout {:?}", label, layout);
                    return Handle::invalid();
                }
            }
        }
        let pipeline_layout = self.gpu.as_ref().and_then(|gpu| {
            scoped(&gpu.device, "pipeline layout", label, |device| {
                device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(label),
                    bind_group_layouts: &resolved,
                    push_constant_ranges: &[],
                })
            })
        });
        match pipeline_layout {
            Some(layout) => Handle::from_raw(self.insert(GpuObject::PipelineLayout(layout))),
            None => Handle::invalid(),
        }
    }

    fn create_compute_pipeline(
        &mut self,
        device: DeviceHandle,
        label: &str,
        layout: PipelineLayoutHandle,
        module: ShaderModuleHandle,
        entry_point: &str,
    ) -> ComputePipelineHandle {
        if self.live_gpu("create_compute_pipeline", device).is_none() {
            return Handle::invalid();
        }
        let (Some(GpuObject::PipelineLayout(wgpu_layout)), Some(GpuObject::ShaderModule(wgpu_module))) =
            (self.objects.get(layout.raw()), self.objects.get(module.raw()))
        else {
            self.invalid_use("create_compute_pipeline", layout.raw());
            return Handle::invalid();
        };
        let pipeline = self.gpu.as_ref().and_then(|gpu| {
            scoped(&gpu.device, "compute pipeline", label, |device| {
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(label),
                    layout: Some(wgpu_layout),
                    module: wgpu_module,
                    entry_point: Some(entry_point),
                    compilation_options: Default::default(),
                    cache: None,
                })
            })
        });
        match pipeline {
            Some(pipeline) => Handle::from_raw(self.insert(GpuObject::ComputePipeline(pipeline))),
            None => Handle::invalid(),
        }
    }

    fn create_command_encoder(&mut self, device: DeviceHandle, label: &str) -> CommandEncoderHandle {
        let Some(gpu) = self.live_gpu("create_command_encoder", device) else {
            return Handle::invalid();
        };
        let encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        Handle::from_raw(self.insert(GpuObject::CommandEncoder {
            encoder: Some(encoder),
            open_pass: None,
        }))
    }

    fn begin_compute_pass(&mut self, encoder: CommandEncoderHandle, label: &str) -> ComputePassHandle {
        match self.objects.get(encoder.raw()) {
            Some(GpuObject::CommandEncoder { open_pass: None, .. }) => {}
            Some(GpuObject::CommandEncoder { .. }) => {
                warn!("wgpu: pass '{}' begun while another pass is open", label);
                self.invalid_uses += 1;
                return Handle::invalid();
            }
            _ => {
                self.invalid_use("begin_compute_pass", encoder.raw());
                return Handle::invalid();
            }
        }
        let pass = self.insert(GpuObject::ComputePass {
            encoder: encoder.raw(),
            label: label.to_string(),
            commands: Vec::new(),
        });
        if let Some(GpuObject::CommandEncoder { open_pass, .. }) = self.objects.get_mut(encoder.raw()) {
            *open_pass = Some(pass);
        }
        Handle::from_raw(pass)
    }

    fn set_pipeline(&mut self, pass: ComputePassHandle, pipeline: ComputePipelineHandle) {
        self.record("set_pipeline", pass, PassCommand::SetPipeline(pipeline.raw()));
    }

    fn set_bind_group(
        &mut self,
        pass: ComputePassHandle,
        index: u32,
        group: BindGroupHandle,
        dynamic_offsets: &[u32],
    ) {
        self.record(
            "set_bind_group",
            pass,
            PassCommand::SetBindGroup {
                index,
                group: group.raw(),
                offsets: SmallVec::from_slice(dynamic_offsets),
            },
        );
    }

    fn dispatch(&mut self, pass: ComputePassHandle, x: u32, y: u32, z: u32) {
        self.record("dispatch", pass, PassCommand::Dispatch([x, y, z]));
    }

    fn end_pass(&mut self, pass: ComputePassHandle) {
        let Some(GpuObject::ComputePass {
            encoder,
            label,
            commands,
        }) = self.take("end_pass", pass.raw(), "compute pass")
        else {
            return;
        };
        self.replay(encoder, &label, &commands);
    }

    fn finish(&mut self, encoder: CommandEncoderHandle) -> CommandBufferHandle {
        let Some(GpuObject::CommandEncoder { encoder: inner, open_pass }) =
            self.take("finish", encoder.raw(), "command encoder")
        else {
            return Handle::invalid();
        };
        if let Some(pass) = open_pass {
            warn!("wgpu: encoder finished with pass {:#x} still open", pass);
            self.invalid_uses += 1;
            self.objects.remove(pass);
        }
        match inner {
            Some(inner) => Handle::from_raw(self.insert(GpuObject::CommandBuffer(inner.finish()))),
            None => Handle::invalid(),
        }
    }

    fn submit(&mut self, device: DeviceHandle, commands: CommandBufferHandle) {
        if self.live_gpu("submit", device).is_none() {
            return;
        }
        let Some(GpuObject::CommandBuffer(buffer)) =
            self.take("submit", commands.raw(), "command buffer")
        else {
            return;
        };
        if let Some(gpu) = &self.gpu {
            gpu.queue.submit(std::iter::once(buffer));
        }
    }

    fn release(&mut self, handle: RawHandle) -> bool {
        match self.objects.remove(handle) {
            Some(GpuObject::Device) => {
                debug!("wgpu: device released");
                self.gpu = None;
                true
            }
            Some(GpuObject::Buffer(buffer)) => {
                buffer.buffer.destroy();
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    fn is_valid(&self, handle: RawHandle) -> bool {
        self.objects.contains(handle)
    }

    fn invalid_uses(&self) -> u64 {
        self.invalid_uses
    }

    fn take_faults(&mut self) -> u32 {
        if let Some(gpu) = &self.gpu {
            // Non-blocking; errors of unfinished work land in a later frame
            gpu.device.poll(wgpu::Maintain::Poll);
        }
        self.faults.swap(0, Ordering::AcqRel)
    }
}
