//! In-process compute backend
//!
//! Every object lives in one [`ResourceRegistry`]. Buffers are word vectors,
//! and "compiling" a shader module binds each `@compute` entry point found in
//! the WGSL text to its native kernel in [`crate::kernels`]. Command streams
//! are recorded and executed in order at `submit`, one pass at a time.
//!
//! Follows the backend contract to the letter: creation failures return the
//! invalid handle, stale handles are warned about and counted, and a kernel
//! that fails at dispatch is logged and counted as a fault.

mod bindings;

pub use bindings::Bindings;

use std::cell::RefCell;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, error, warn};

use crate::backend::{align_size, BufferDescriptor, BufferUsages, ComputeBackend, UNIFORM_OFFSET_ALIGNMENT};
use crate::handle::{
    BindGroupHandle, BindGroupLayoutHandle, BufferHandle, CommandBufferHandle,
    CommandEncoderHandle, ComputePassHandle, ComputePipelineHandle, DeviceHandle, Handle,
    PipelineLayoutHandle, RawHandle, ShaderModuleHandle,
};
use crate::kernels::{self, KernelFn};
use crate::records::{decode_bindings, decode_layout_entries, BindingType, LayoutEntry};
use crate::registry::ResourceRegistry;
use crate::shaders;
use bindings::View;

struct SoftBuffer {
    label: String,
    words: Vec<u32>,
    size: u64,
    usage: BufferUsages,
}

#[derive(Clone, Copy)]
struct EntryPoint {
    kernel: KernelFn,
    workgroup_size: u32,
}

struct BoundBuffer {
    binding: u32,
    buffer: RawHandle,
    offset: u64,
    size: u64,
    dynamic: bool,
}

struct SoftBindGroup {
    /// Sorted by binding number, which is also dynamic offset order
    entries: Vec<BoundBuffer>,
}

struct SoftPipeline {
    label: String,
    entry: EntryPoint,
    /// Bind groups the layout declares; each must be set before a dispatch
    group_count: u32,
}

#[derive(Clone)]
enum PassCommand {
    SetPipeline(RawHandle),
    SetBindGroup {
        index: u32,
        group: RawHandle,
        offsets: SmallVec<[u32; 2]>,
    },
    Dispatch(u32, u32, u32),
}

struct RecordedPass {
    label: String,
    commands: Vec<PassCommand>,
}

enum SoftResource {
    Device,
    Buffer(SoftBuffer),
    ShaderModule(FxHashMap<String, EntryPoint>),
    BindGroupLayout(Vec<LayoutEntry>),
    BindGroup(SoftBindGroup),
    PipelineLayout(Vec<RawHandle>),
    ComputePipeline(SoftPipeline),
    CommandEncoder {
        open_pass: bool,
        passes: Vec<RecordedPass>,
    },
    ComputePass {
        encoder: RawHandle,
        pass: RecordedPass,
    },
    CommandBuffer(Vec<RecordedPass>),
}

impl SoftResource {
    fn kind(&self) -> &'static str {
        match self {
            SoftResource::Device => "device",
            SoftResource::Buffer(_) => "buffer",
            SoftResource::ShaderModule(_) => "shader module",
            SoftResource::BindGroupLayout(_) => "bind group layout",
            SoftResource::BindGroup(_) => "bind group",
            SoftResource::PipelineLayout(_) => "pipeline layout",
            SoftResource::ComputePipeline(_) => "compute pipeline",
            SoftResource::CommandEncoder { .. } => "command encoder",
            SoftResource::ComputePass { .. } => "compute pass",
            SoftResource::CommandBuffer(_) => "command buffer",
        }
    }
}

/// Synchronous CPU implementation of [`ComputeBackend`]
pub struct SoftwareBackend {
    objects: ResourceRegistry<SoftResource>,
    created: u64,
    invalid_uses: u64,
    faults: u32,
    dispatches: u64,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self {
            objects: ResourceRegistry::new(),
            created: 0,
            invalid_uses: 0,
            faults: 0,
            dispatches: 0,
        }
    }

    /// Objects created over the backend lifetime, transient ones included
    pub fn created_count(&self) -> u64 {
        self.created
    }

    /// Objects currently alive
    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    /// Dispatches executed so far
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    fn insert(&mut self, object: SoftResource) -> RawHandle {
        self.created += 1;
        self.objects.insert(object)
    }

    fn invalid_use(&mut self, op: &str, handle: RawHandle) {
        self.invalid_uses += 1;
        warn!("software: {} on invalid handle {:#x} ignored", op, handle);
    }

    fn check_device(&mut self, op: &str, device: DeviceHandle) -> bool {
        if matches!(self.objects.get(device.raw()), Some(SoftResource::Device)) {
            true
        } else {
            self.invalid_use(op, device.raw());
            false
        }
    }

    /// Remove an object only if it is of the expected kind
    fn take(&mut self, handle: RawHandle, kind: &'static str) -> Option<SoftResource> {
        match self.objects.get(handle) {
            Some(object) if object.kind() == kind => self.objects.remove(handle),
            _ => None,
        }
    }

    fn buffer(&self, handle: RawHandle) -> Option<&SoftBuffer> {
        match self.objects.get(handle) {
            Some(SoftResource::Buffer(buffer)) => Some(buffer),
            _ => None,
        }
    }

    fn entry_point(&self, module: RawHandle, name: &str) -> Option<EntryPoint> {
        match self.objects.get(module) {
            Some(SoftResource::ShaderModule(entries)) => entries.get(name).copied(),
            _ => None,
        }
    }

    fn compile(&self, label: &str, source: &str) -> Option<FxHashMap<String, EntryPoint>> {
        let found = shaders::entry_points(source);
        if found.is_empty() {
            warn!("software: shader '{}' declares no compute entry point", label);
            return None;
        }
        let mut entries = FxHashMap::default();
        for (name, workgroup_size) in found {
            let Some(kernel) = kernels::lookup(&name) else {
                warn!("software: shader '{}' has no native kernel for '{}'", label, name);
                return None;
            };
            entries.insert(
                name,
                EntryPoint {
                    kernel,
                    workgroup_size,
                },
            );
        }
        Some(entries)
    }

    fn resolve_bind_group(&self, label: &str, layout: RawHandle, packed: &[u8]) -> Option<SoftBindGroup> {
        let Some(SoftResource::BindGroupLayout(layout_entries)) = self.objects.get(layout) else {
            warn!("software: bind group '{}' names a stale layout", label);
            return None;
        };
        let bindings = match decode_bindings(packed) {
            Ok(bindings) => bindings,
            Err(e) => {
                warn!("software: bind group '{}': {}", label, e);
                return None;
            }
        };
        if bindings.len() != layout_entries.len() {
            warn!(
                "software: bind group '{}' has {} entries, layout expects {}",
                label,
                bindings.len(),
                layout_entries.len()
            );
            return None;
        }

        let mut entries = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let Some(slot) = layout_entries.iter().find(|e| e.binding == binding.binding) else {
                warn!("software: bind group '{}' binding {} not in layout", label, binding.binding);
                return None;
            };
            let Some(buffer) = self.buffer(binding.buffer.raw()) else {
                warn!("software: bind group '{}' binding {} names a stale buffer", label, binding.binding);
                return None;
            };
            let required = match slot.ty {
                BindingType::Uniform => BufferUsages::UNIFORM,
                BindingType::ReadOnlyStorage | BindingType::Storage => BufferUsages::STORAGE,
            };
            if !buffer.usage.contains(required) {
                warn!(
                    "software: bind group '{}' binding {}: '{}' lacks {:?}",
                    label, binding.binding, buffer.label, required
                );
                return None;
            }
            let size = binding
                .size
                .unwrap_or_else(|| buffer.size.saturating_sub(binding.offset));
            let in_range = binding
                .offset
                .checked_add(size)
                .is_some_and(|end| end <= buffer.size);
            if binding.offset % 4 != 0 || size % 4 != 0 || !in_range {
                warn!(
                    "software: bind group '{}' binding {} range {}+{} exceeds '{}' ({} bytes)",
                    label, binding.binding, binding.offset, size, buffer.label, buffer.size
                );
                return None;
            }
            entries.push(BoundBuffer {
                binding: binding.binding,
                buffer: binding.buffer.raw(),
                offset: binding.offset,
                size,
                dynamic: slot.has_dynamic_offset,
            });
        }
        entries.sort_by_key(|e| e.binding);
        Some(SoftBindGroup { entries })
    }

    fn record(&mut self, pass: ComputePassHandle, op: &str, command: PassCommand) {
        match self.objects.get_mut(pass.raw()) {
            Some(SoftResource::ComputePass { pass: recorded, .. }) => recorded.commands.push(command),
            _ => self.invalid_use(op, pass.raw()),
        }
    }

    // === Execution ===

    fn execute(&mut self, pass: &RecordedPass) {
        let mut pipeline: Option<RawHandle> = None;
        let mut groups: FxHashMap<u32, (RawHandle, SmallVec<[u32; 2]>)> = FxHashMap::default();

        for command in &pass.commands {
            match command {
                PassCommand::SetPipeline(handle) => pipeline = Some(*handle),
                PassCommand::SetBindGroup {
                    index,
                    group,
                    offsets,
                } => {
                    groups.insert(*index, (*group, offsets.clone()));
                }
                PassCommand::Dispatch(x, y, z) => {
                    if let Err(reason) = self.dispatch_now(pipeline, &groups, [*x, *y, *z]) {
                        self.faults += 1;
                        error!("software: dispatch in pass '{}' failed: {}", pass.label, reason);
                    }
                }
            }
        }
    }

    fn dispatch_now(
        &mut self,
        pipeline: Option<RawHandle>,
        groups: &FxHashMap<u32, (RawHandle, SmallVec<[u32; 2]>)>,
        workgroups: [u32; 3],
    ) -> std::result::Result<(), String> {
        let pipeline = pipeline.ok_or("no pipeline set")?;
        let Some(SoftResource::ComputePipeline(soft_pipeline)) = self.objects.get(pipeline) else {
            return Err(format!("pipeline {:#x} is not live", pipeline));
        };
        let label = soft_pipeline.label.clone();
        let entry = soft_pipeline.entry;
        if let Some(missing) = (0..soft_pipeline.group_count).find(|i| !groups.contains_key(i)) {
            return Err(format!("'{}': bind group {} not set", label, missing));
        }

        // Resolve every bound range, sharing one slot per distinct buffer
        let mut buffers: Vec<RawHandle> = Vec::new();
        let mut views = FxHashMap::default();
        for (&index, (group, offsets)) in groups {
            let Some(SoftResource::BindGroup(bind_group)) = self.objects.get(*group) else {
                return Err(format!("'{}': bind group {} is not live", label, index));
            };
            let dynamic_count = bind_group.entries.iter().filter(|e| e.dynamic).count();
            if dynamic_count != offsets.len() {
                return Err(format!(
                    "'{}': group {} expects {} dynamic offsets, got {}",
                    label,
                    index,
                    dynamic_count,
                    offsets.len()
                ));
            }
            let mut dynamic = offsets.iter();
            for entry in &bind_group.entries {
                let extra = if entry.dynamic {
                    let offset = dynamic.next().copied().unwrap_or(0);
                    if offset % UNIFORM_OFFSET_ALIGNMENT != 0 {
                        return Err(format!("'{}': dynamic offset {} is unaligned", label, offset));
                    }
                    offset as u64
                } else {
                    0
                };
                let buffer = self
                    .buffer(entry.buffer)
                    .ok_or_else(|| format!("'{}': buffer at {}:{} is not live", label, index, entry.binding))?;
                let offset = entry.offset + extra;
                if offset + entry.size > buffer.size {
                    return Err(format!(
                        "'{}': {}:{} range {}+{} exceeds '{}'",
                        label, index, entry.binding, offset, entry.size, buffer.label
                    ));
                }
                let slot = match buffers.iter().position(|&b| b == entry.buffer) {
                    Some(slot) => slot,
                    None => {
                        buffers.push(entry.buffer);
                        buffers.len() - 1
                    }
                };
                views.insert(
                    (index, entry.binding),
                    View {
                        slot,
                        offset: offset as usize,
                        size: entry.size as usize,
                    },
                );
            }
        }

        // Move the memory out of the registry for the duration of the kernel
        let slots: Vec<RefCell<Vec<u32>>> = buffers
            .iter()
            .map(|&raw| match self.objects.get_mut(raw) {
                Some(SoftResource::Buffer(buffer)) => RefCell::new(std::mem::take(&mut buffer.words)),
                _ => RefCell::new(Vec::new()),
            })
            .collect();

        let invocations = workgroups[0]
            .saturating_mul(workgroups[1])
            .saturating_mul(workgroups[2])
            .saturating_mul(entry.workgroup_size);
        let result = {
            let bindings = Bindings::new(&slots, views);
            (entry.kernel)(&bindings, invocations)
        };

        for (raw, cell) in buffers.iter().zip(slots) {
            if let Some(SoftResource::Buffer(buffer)) = self.objects.get_mut(*raw) {
                buffer.words = cell.into_inner();
            }
        }
        self.dispatches += 1;
        result.map_err(|e| format!("'{}': {}", label, e))
    }
}

impl ComputeBackend for SoftwareBackend {
    fn name(&self) -> &str {
        "software"
    }

    fn request_device(&mut self) -> DeviceHandle {
        let device = Handle::from_raw(self.insert(SoftResource::Device));
        debug!("software: device {:?}", device);
        device
    }

    fn create_buffer(&mut self, device: DeviceHandle, desc: &BufferDescriptor<'_>) -> BufferHandle {
        if !self.check_device("create_buffer", device) {
            return Handle::invalid();
        }
        if desc.usage.is_empty() {
            warn!("software: buffer '{}' has no usage", desc.label);
            return Handle::invalid();
        }
        let words = (align_size(desc.size) / 4) as usize;
        Handle::from_raw(self.insert(SoftResource::Buffer(SoftBuffer {
            label: desc.label.to_string(),
            words: vec![0; words],
            size: desc.size,
            usage: desc.usage,
        })))
    }

    fn write_buffer(&mut self, device: DeviceHandle, buffer: BufferHandle, offset: u64, data: &[u8]) {
        if !self.check_device("write_buffer", device) {
            return;
        }
        let Some(SoftResource::Buffer(target)) = self.objects.get_mut(buffer.raw()) else {
            self.invalid_use("write_buffer", buffer.raw());
            return;
        };
        let end = offset.checked_add(data.len() as u64);
        let Some(end) = end.filter(|&end| end <= target.size) else {
            warn!(
                "software: write of {} bytes at {} overruns '{}' ({} bytes)",
                data.len(),
                offset,
                target.label,
                target.size
            );
            self.invalid_uses += 1;
            return;
        };
        bytemuck::cast_slice_mut::<u32, u8>(&mut target.words)[offset as usize..end as usize]
            .copy_from_slice(data);
    }

    fn read_buffer(&mut self, device: DeviceHandle, buffer: BufferHandle) -> Option<Vec<u8>> {
        if !self.check_device("read_buffer", device) {
            return None;
        }
        match self.buffer(buffer.raw()) {
            Some(source) => {
                let bytes = bytemuck::cast_slice::<u32, u8>(&source.words);
                Some(bytes[..source.size as usize].to_vec())
            }
            None => {
                self.invalid_use("read_buffer", buffer.raw());
                None
            }
        }
    }

    fn create_shader_module(
        &mut self,
        device: DeviceHandle,
        label: &str,
        source: &str,
    ) -> ShaderModuleHandle {
        if !self.check_device("create_shader_module", device) {
            return Handle::invalid();
        }
        match self.compile(label, source) {
            Some(entries) => {
                debug!("software: shader '{}' with {} entry point(s)", label, entries.len());
                Handle::from_raw(self.insert(SoftResource::ShaderModule(entries)))
            }
            None => Handle::invalid(),
        }
    }

    fn create_bind_group_layout(
        &mut self,
        device: DeviceHandle,
        label: &str,
        entries: &[u8],
    ) -> BindGroupLayoutHandle {
        if !self.check_device("create_bind_group_layout", device) {
            return Handle::invalid();
        }
        match decode_layout_entries(entries) {
            Ok(entries) => Handle::from_raw(self.insert(SoftResource::BindGroupLayout(entries))),
            Err(e) => {
                warn!("software: bind group layout '{}': {}", label, e);
                Handle::invalid()
            }
        }
    }

    fn create_bind_group(
        &mut self,
        device: DeviceHandle,
        label: &str,
        layout: BindGroupLayoutHandle,
        entries: &[u8],
    ) -> BindGroupHandle {
        if !self.check_device("create_bind_group", device) {
            return Handle::invalid();
        }
        match self.resolve_bind_group(label, layout.raw(), entries) {
            Some(group) => Handle::from_raw(self.insert(SoftResource::BindGroup(group))),
            None => Handle::invalid(),
        }
    }

    fn create_pipeline_layout(
        &mut self,
        device: DeviceHandle,
        label: &str,
        layouts: &[BindGroupLayoutHandle],
    ) -> PipelineLayoutHandle {
        if !self.check_device("create_pipeline_layout", device) {
            return Handle::invalid();
        }
        let all_live = layouts
            .iter()
            .all(|l| matches!(self.objects.get(l.raw()), Some(SoftResource::BindGroupLayout(_))));
        if !all_live {
            warn!("software: pipeline layout '{}' names a stale bind group layout", label);
            return Handle::invalid();
        }
        let layouts = layouts.iter().map(|l| l.raw()).collect();
        Handle::from_raw(self.insert(SoftResource::PipelineLayout(layouts)))
    }

    fn create_compute_pipeline(
        &mut self,
        device: DeviceHandle,
        label: &str,
        layout: PipelineLayoutHandle,
        module: ShaderModuleHandle,
        entry_point: &str,
    ) -> ComputePipelineHandle {
        if !self.check_device("create_compute_pipeline", device) {
            return Handle::invalid();
        }
        let group_count = match self.objects.get(layout.raw()) {
            Some(SoftResource::PipelineLayout(layouts)) => layouts.len() as u32,
            _ => {
                warn!("software: pipeline '{}' names a stale layout", label);
                return Handle::invalid();
            }
        };
        let Some(entry) = self.entry_point(module.raw(), entry_point) else {
            warn!("software: pipeline '{}': no entry point '{}'", label, entry_point);
            return Handle::invalid();
        };
        Handle::from_raw(self.insert(SoftResource::ComputePipeline(SoftPipeline {
            label: label.to_string(),
            entry,
            group_count,
        })))
    }

    fn create_command_encoder(&mut self, device: DeviceHandle, _label: &str) -> CommandEncoderHandle {
        if !self.check_device("create_command_encoder", device) {
            return Handle::invalid();
        }
        Handle::from_raw(self.insert(SoftResource::CommandEncoder {
            open_pass: false,
            passes: Vec::new(),
        }))
    }

    fn begin_compute_pass(&mut self, encoder: CommandEncoderHandle, label: &str) -> ComputePassHandle {
        match self.objects.get_mut(encoder.raw()) {
            Some(SoftResource::CommandEncoder { open_pass, .. }) if !*open_pass => *open_pass = true,
            _ => {
                self.invalid_use("begin_compute_pass", encoder.raw());
                return Handle::invalid();
            }
        }
        Handle::from_raw(self.insert(SoftResource::ComputePass {
            encoder: encoder.raw(),
            pass: RecordedPass {
                label: label.to_string(),
                commands: Vec::new(),
            },
        }))
    }

    fn set_pipeline(&mut self, pass: ComputePassHandle, pipeline: ComputePipelineHandle) {
        self.record(pass, "set_pipeline", PassCommand::SetPipeline(pipeline.raw()));
    }

    fn set_bind_group(
        &mut self,
        pass: ComputePassHandle,
        index: u32,
        group: BindGroupHandle,
        dynamic_offsets: &[u32],
    ) {
        self.record(
            pass,
            "set_bind_group",
            PassCommand::SetBindGroup {
                index,
                group: group.raw(),
                offsets: SmallVec::from_slice(dynamic_offsets),
            },
        );
    }

    fn dispatch(&mut self, pass: ComputePassHandle, x: u32, y: u32, z: u32) {
        self.record(pass, "dispatch", PassCommand::Dispatch(x, y, z));
    }

    fn end_pass(&mut self, pass: ComputePassHandle) {
        let Some(SoftResource::ComputePass {
            encoder,
            pass: recorded,
        }) = self.take(pass.raw(), "compute pass")
        else {
            self.invalid_use("end_pass", pass.raw());
            return;
        };
        match self.objects.get_mut(encoder) {
            Some(SoftResource::CommandEncoder { open_pass, passes }) => {
                *open_pass = false;
                passes.push(recorded);
            }
            _ => self.invalid_use("end_pass", encoder),
        }
    }

    fn finish(&mut self, encoder: CommandEncoderHandle) -> CommandBufferHandle {
        match self.take(encoder.raw(), "command encoder") {
            Some(SoftResource::CommandEncoder {
                open_pass: false,
                passes,
            }) => Handle::from_raw(self.insert(SoftResource::CommandBuffer(passes))),
            Some(_) => {
                warn!("software: encoder finished with an open pass");
                Handle::invalid()
            }
            None => {
                self.invalid_use("finish", encoder.raw());
                Handle::invalid()
            }
        }
    }

    fn submit(&mut self, device: DeviceHandle, commands: CommandBufferHandle) {
        if !self.check_device("submit", device) {
            return;
        }
        let Some(SoftResource::CommandBuffer(passes)) = self.take(commands.raw(), "command buffer")
        else {
            self.invalid_use("submit", commands.raw());
            return;
        };
        for pass in &passes {
            self.execute(pass);
        }
    }

    fn release(&mut self, handle: RawHandle) -> bool {
        self.objects.remove(handle).is_some()
    }

    fn is_valid(&self, handle: RawHandle) -> bool {
        self.objects.contains(handle)
    }

    fn invalid_uses(&self) -> u64 {
        self.invalid_uses
    }

    fn take_faults(&mut self) -> u32 {
        std::mem::take(&mut self.faults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{encode_bindings, encode_layout_entries, BufferBinding};

    struct Fixture {
        backend: SoftwareBackend,
        device: DeviceHandle,
        pipeline: ComputePipelineHandle,
        layout: BindGroupLayoutHandle,
    }

    fn prefix_fixture() -> Fixture {
        let mut backend = SoftwareBackend::new();
        let device = backend.request_device();
        let module = backend.create_shader_module(
            device,
            "prefix",
            &shaders::ShaderModule::PrefixSum.source(),
        );
        let layout = backend.create_bind_group_layout(
            device,
            "prefix",
            &encode_layout_entries(&[
                LayoutEntry::read_only(0),
                LayoutEntry::storage(1),
                LayoutEntry::dynamic_uniform(2),
            ]),
        );
        let pipeline_layout = backend.create_pipeline_layout(device, "prefix", &[layout]);
        let pipeline = backend.create_compute_pipeline(
            device,
            "prefix",
            pipeline_layout,
            module,
            shaders::PREFIX_SUM_STEP,
        );
        assert!(!pipeline.is_invalid());
        Fixture {
            backend,
            device,
            pipeline,
            layout,
        }
    }

    fn buffer(f: &mut Fixture, usage: BufferUsages, contents: &[u32]) -> BufferHandle {
        let bytes = bytemuck::cast_slice::<u32, u8>(contents);
        let handle = f.backend.create_buffer(
            f.device,
            &BufferDescriptor {
                label: "test",
                size: bytes.len() as u64,
                usage: usage | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            },
        );
        f.backend.write_buffer(f.device, handle, 0, bytes);
        handle
    }

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    fn run_step(f: &mut Fixture, group: BindGroupHandle, offsets: &[u32]) {
        let encoder = f.backend.create_command_encoder(f.device, "step");
        let pass = f.backend.begin_compute_pass(encoder, "step");
        f.backend.set_pipeline(pass, f.pipeline);
        f.backend.set_bind_group(pass, 0, group, offsets);
        f.backend.dispatch(pass, 1, 1, 1);
        f.backend.end_pass(pass);
        let commands = f.backend.finish(encoder);
        f.backend.submit(f.device, commands);
    }

    #[test]
    fn test_prefix_step_with_dynamic_offset() {
        let mut f = prefix_fixture();
        let src = buffer(&mut f, BufferUsages::STORAGE, &[0, 1, 2, 3, 4]);
        let dst = buffer(&mut f, BufferUsages::STORAGE | BufferUsages::COPY_SRC, &[0; 5]);
        let mut steps = vec![0u32; 128];
        steps[0] = 1;
        steps[64] = 2;
        let step = buffer(&mut f, BufferUsages::UNIFORM, &steps);

        let group = f.backend.create_bind_group(
            f.device,
            "prefix",
            f.layout,
            &encode_bindings(&[
                BufferBinding::whole(0, src),
                BufferBinding::whole(1, dst),
                BufferBinding::range(2, step, 0, 4),
            ]),
        );
        run_step(&mut f, group, &[256]);

        let out = f.backend.read_buffer(f.device, dst).unwrap();
        assert_eq!(words(&out), &[0, 1, 2, 4, 6]);
        assert_eq!(f.backend.take_faults(), 0);
        assert_eq!(f.backend.dispatch_count(), 1);
    }

    #[test]
    fn test_aliased_binding_is_a_fault() {
        let mut f = prefix_fixture();
        let data = buffer(&mut f, BufferUsages::STORAGE, &[1, 2, 3, 4]);
        let step = buffer(&mut f, BufferUsages::UNIFORM, &[1]);
        let group = f.backend.create_bind_group(
            f.device,
            "aliased",
            f.layout,
            &encode_bindings(&[
                BufferBinding::whole(0, data),
                BufferBinding::whole(1, data),
                BufferBinding::range(2, step, 0, 4),
            ]),
        );
        run_step(&mut f, group, &[0]);
        assert_eq!(f.backend.take_faults(), 1);
        assert_eq!(f.backend.take_faults(), 0);

        // The buffer survives the failed dispatch untouched
        let out = f.backend.read_buffer(f.device, data).unwrap();
        assert_eq!(words(&out), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_released_buffer_faults_dispatch() {
        let mut f = prefix_fixture();
        let src = buffer(&mut f, BufferUsages::STORAGE, &[1, 2]);
        let dst = buffer(&mut f, BufferUsages::STORAGE, &[0, 0]);
        let step = buffer(&mut f, BufferUsages::UNIFORM, &[1]);
        let group = f.backend.create_bind_group(
            f.device,
            "prefix",
            f.layout,
            &encode_bindings(&[
                BufferBinding::whole(0, src),
                BufferBinding::whole(1, dst),
                BufferBinding::range(2, step, 0, 4),
            ]),
        );
        assert!(f.backend.release(src.raw()));
        assert!(!f.backend.release(src.raw()));
        run_step(&mut f, group, &[0]);
        assert_eq!(f.backend.take_faults(), 1);
    }

    #[test]
    fn test_stale_handles_are_counted_not_fatal() {
        let mut f = prefix_fixture();
        let dst = buffer(&mut f, BufferUsages::STORAGE, &[0; 4]);
        f.backend.release(dst.raw());

        f.backend.write_buffer(f.device, dst, 0, &[0; 4]);
        assert!(f.backend.read_buffer(f.device, dst).is_none());
        f.backend.dispatch(ComputePassHandle::invalid(), 1, 1, 1);
        assert_eq!(f.backend.invalid_uses(), 3);
    }

    #[test]
    fn test_write_past_the_address_space_is_counted() {
        let mut f = prefix_fixture();
        let dst = buffer(&mut f, BufferUsages::STORAGE, &[7; 4]);

        f.backend.write_buffer(f.device, dst, u64::MAX - 1, &[1; 4]);
        f.backend.write_buffer(f.device, dst, 12, &[1; 8]);
        assert_eq!(f.backend.invalid_uses(), 2);

        let out = f.backend.read_buffer(f.device, dst).unwrap();
        assert_eq!(bytemuck::cast_slice::<u8, u32>(&out), &[7, 7, 7, 7]);
    }

    #[test]
    fn test_truncated_handle_does_not_reach_live_buffer() {
        let mut f = prefix_fixture();
        let dst = buffer(&mut f, BufferUsages::STORAGE, &[0; 4]);
        let forged = BufferHandle::from_raw(dst.raw() & 0xffff_ffff);

        f.backend.write_buffer(f.device, forged, 0, &[9; 4]);
        assert_eq!(f.backend.invalid_uses(), 1);

        let out = f.backend.read_buffer(f.device, dst).unwrap();
        assert_eq!(bytemuck::cast_slice::<u8, u32>(&out), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_bind_group_validation() {
        let mut f = prefix_fixture();
        let storage = buffer(&mut f, BufferUsages::STORAGE, &[0; 4]);
        // Uniform slot bound to a storage-only buffer
        let group = f.backend.create_bind_group(
            f.device,
            "bad usage",
            f.layout,
            &encode_bindings(&[
                BufferBinding::whole(0, storage),
                BufferBinding::whole(1, storage),
                BufferBinding::range(2, storage, 0, 4),
            ]),
        );
        assert!(group.is_invalid());

        // Truncated record stream
        let packed = encode_bindings(&[BufferBinding::whole(0, storage)]);
        let group = f
            .backend
            .create_bind_group(f.device, "short", f.layout, &packed[..20]);
        assert!(group.is_invalid());
    }

    #[test]
    fn test_unknown_entry_point_fails_compile() {
        let mut backend = SoftwareBackend::new();
        let device = backend.request_device();
        let module = backend.create_shader_module(
            device,
            "mystery",
            "@compute @workgroup_size(64)\nfn mystery() {}",
        );
        assert!(module.is_invalid());
    }
}
