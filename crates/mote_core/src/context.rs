//! Host-side view of a compute backend
//!
//! [`GpuContext`] wraps a [`ComputeBackend`] and its device. It turns the
//! backend's invalid sentinels into [`MoteError::ResourceCreation`], keeps a
//! ledger of the handles it created and has not released, and refuses to
//! forward a `create` whose parent is not in that ledger.
//!
//! The ledger only says what this side *may* still use. Whether a handle is
//! actually live is always the backend's call.

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::backend::{BufferDescriptor, BufferUsages, ComputeBackend};
use crate::error::{MoteError, Result};
use crate::handle::{
    BindGroupHandle, BindGroupLayoutHandle, BufferHandle, ComputePassHandle,
    ComputePipelineHandle, DeviceHandle, Handle, HandleKind, PipelineLayoutHandle, RawHandle,
    ShaderModuleHandle,
};
use crate::records::{encode_bindings, encode_layout_entries, BufferBinding, LayoutEntry};

/// Position in the creation journal, used to roll back partial construction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint(usize);

/// A backend, its device, and the handles created through them
pub struct GpuContext<B: ComputeBackend> {
    backend: B,
    device: DeviceHandle,
    /// Handles created here and not yet released
    live: FxHashSet<RawHandle>,
    /// Creation order of persistent objects
    journal: Vec<RawHandle>,
    /// Creates refused before reaching the backend
    rejected: u64,
}

impl<B: ComputeBackend> GpuContext<B> {
    /// Acquire a device from the backend
    pub fn new(mut backend: B) -> Result<Self> {
        let device = backend.request_device();
        if device.is_invalid() {
            return Err(MoteError::BackendUnavailable(format!(
                "{} returned no device",
                backend.name()
            )));
        }
        debug!("{} device acquired: {:?}", backend.name(), device);

        let mut live = FxHashSet::default();
        live.insert(device.raw());

        Ok(Self {
            backend,
            device,
            live,
            journal: Vec::new(),
            rejected: 0,
        })
    }

    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Whether this side still considers the handle usable
    pub fn is_live<K: HandleKind>(&self, handle: Handle<K>) -> bool {
        self.live.contains(&handle.raw())
    }

    /// Number of handles this side still holds, device included
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Creates refused locally because a parent was invalid
    pub fn rejected_creates(&self) -> u64 {
        self.rejected
    }

    // === Creation ===

    /// Allocate a buffer
    pub fn create_buffer(&mut self, desc: &BufferDescriptor<'_>) -> Result<BufferHandle> {
        self.require_parent(self.device, "buffer", desc.label)?;
        let handle = self.backend.create_buffer(self.device, desc);
        self.track(handle, desc.label)
    }

    /// Allocate a buffer and fill it with `contents`
    pub fn create_buffer_init(
        &mut self,
        label: &str,
        usage: BufferUsages,
        contents: &[u8],
    ) -> Result<BufferHandle> {
        let buffer = self.create_buffer(&BufferDescriptor {
            label,
            size: contents.len() as u64,
            usage: usage | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })?;
        self.write_buffer(buffer, 0, contents);
        Ok(buffer)
    }

    /// Compile WGSL source
    pub fn create_shader_module(&mut self, label: &str, source: &str) -> Result<ShaderModuleHandle> {
        self.require_parent(self.device, "shader module", label)?;
        let handle = self.backend.create_shader_module(self.device, label, source);
        self.track(handle, label)
    }

    pub fn create_bind_group_layout(
        &mut self,
        label: &str,
        entries: &[LayoutEntry],
    ) -> Result<BindGroupLayoutHandle> {
        self.require_parent(self.device, "bind group layout", label)?;
        let packed = encode_layout_entries(entries);
        let handle = self.backend.create_bind_group_layout(self.device, label, &packed);
        self.track(handle, label)
    }

    pub fn create_bind_group(
        &mut self,
        label: &str,
        layout: BindGroupLayoutHandle,
        bindings: &[BufferBinding],
    ) -> Result<BindGroupHandle> {
        self.require_parent(self.device, "bind group", label)?;
        self.require_parent(layout, "bind group", label)?;
        for binding in bindings {
            self.require_parent(binding.buffer, "bind group", label)?;
        }
        let packed = encode_bindings(bindings);
        let handle = self
            .backend
            .create_bind_group(self.device, label, layout, &packed);
        self.track(handle, label)
    }

    pub fn create_pipeline_layout(
        &mut self,
        label: &str,
        layouts: &[BindGroupLayoutHandle],
    ) -> Result<PipelineLayoutHandle> {
        self.require_parent(self.device, "pipeline layout", label)?;
        for &layout in layouts {
            self.require_parent(layout, "pipeline layout", label)?;
        }
        let handle = self
            .backend
            .create_pipeline_layout(self.device, label, layouts);
        self.track(handle, label)
    }

    pub fn create_compute_pipeline(
        &mut self,
        label: &str,
        layout: PipelineLayoutHandle,
        module: ShaderModuleHandle,
        entry_point: &str,
    ) -> Result<ComputePipelineHandle> {
        self.require_parent(self.device, "compute pipeline", label)?;
        self.require_parent(layout, "compute pipeline", label)?;
        self.require_parent(module, "compute pipeline", label)?;
        let handle =
            self.backend
                .create_compute_pipeline(self.device, label, layout, module, entry_point);
        self.track(handle, label)
    }

    // === Memory ===

    /// Queue a buffer write; a stale buffer is diagnosed by the backend
    pub fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        self.backend.write_buffer(self.device, buffer, offset, data);
    }

    /// Blocking readback of a whole buffer
    pub fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>> {
        self.backend
            .read_buffer(self.device, buffer)
            .ok_or_else(|| MoteError::Readback(format!("{:?} could not be read", buffer)))
    }

    // === Command streams ===

    /// Record a command stream with `record` and submit it
    ///
    /// The encoder, its passes and the resulting command buffer are
    /// transient; the backend consumes them.
    pub fn submit_commands<F>(&mut self, label: &str, record: F) -> Result<()>
    where
        F: FnOnce(&mut CommandRecorder<'_, B>),
    {
        let encoder = self.backend.create_command_encoder(self.device, label);
        if encoder.is_invalid() {
            return Err(MoteError::ResourceCreation {
                kind: "command encoder",
                label: label.to_string(),
            });
        }

        let mut recorder = CommandRecorder {
            backend: &mut self.backend,
            encoder,
            passes: 0,
        };
        record(&mut recorder);
        let passes = recorder.passes;

        let commands = self.backend.finish(encoder);
        if commands.is_invalid() {
            return Err(MoteError::ResourceCreation {
                kind: "command buffer",
                label: label.to_string(),
            });
        }
        self.backend.submit(self.device, commands);
        debug!("submitted '{}' ({} passes)", label, passes);
        Ok(())
    }

    // === Lifetime ===

    /// Release a handle; repeated releases are no-ops
    pub fn release<K: HandleKind>(&mut self, handle: Handle<K>) {
        if handle.is_invalid() {
            return;
        }
        if self.live.remove(&handle.raw()) {
            self.backend.release(handle.raw());
        } else {
            debug!("{:?} already released", handle);
        }
    }

    /// Mark the current point in the creation journal
    pub fn checkpoint(&mut self) -> Checkpoint {
        let live = &self.live;
        self.journal.retain(|raw| live.contains(raw));
        Checkpoint(self.journal.len())
    }

    /// Release everything created since `checkpoint`, newest first
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        let start = checkpoint.0.min(self.journal.len());
        let created: Vec<RawHandle> = self.journal.drain(start..).collect();
        let mut released = 0;
        for raw in created.into_iter().rev() {
            if self.live.remove(&raw) {
                self.backend.release(raw);
                released += 1;
            }
        }
        debug!("rolled back {} resource(s)", released);
    }

    /// Release every remaining handle, device last, and return the backend
    pub fn into_backend(mut self) -> B {
        let journal = std::mem::take(&mut self.journal);
        for raw in journal.into_iter().rev() {
            if self.live.remove(&raw) {
                self.backend.release(raw);
            }
        }
        let device = self.device.raw();
        for raw in self.live.drain().filter(|raw| *raw != device) {
            self.backend.release(raw);
        }
        self.backend.release(device);
        self.backend
    }

    fn require_parent<K: HandleKind>(
        &mut self,
        parent: Handle<K>,
        kind: &'static str,
        label: &str,
    ) -> Result<()> {
        if self.live.contains(&parent.raw()) {
            return Ok(());
        }
        self.rejected += 1;
        warn!(
            "refusing to create {} '{}': parent {:?} is not live",
            kind, label, parent
        );
        Err(MoteError::ResourceCreation {
            kind,
            label: label.to_string(),
        })
    }

    fn track<K: HandleKind>(&mut self, handle: Handle<K>, label: &str) -> Result<Handle<K>> {
        if handle.is_invalid() {
            warn!("{} returned no {} for '{}'", self.backend.name(), K::NAME, label);
            return Err(MoteError::ResourceCreation {
                kind: K::NAME,
                label: label.to_string(),
            });
        }
        self.live.insert(handle.raw());
        self.journal.push(handle.raw());
        Ok(handle)
    }
}

/// Records compute passes into one command stream
pub struct CommandRecorder<'a, B: ComputeBackend> {
    backend: &'a mut B,
    encoder: crate::handle::CommandEncoderHandle,
    passes: u32,
}

impl<'a, B: ComputeBackend> CommandRecorder<'a, B> {
    /// Record one compute pass
    pub fn compute_pass<F>(&mut self, label: &str, record: F)
    where
        F: FnOnce(&mut ComputePassRecorder<'_, B>),
    {
        let pass = self.backend.begin_compute_pass(self.encoder, label);
        let mut recorder = ComputePassRecorder {
            backend: &mut *self.backend,
            pass,
        };
        record(&mut recorder);
        self.backend.end_pass(pass);
        self.passes += 1;
    }
}

/// Records commands into one compute pass
pub struct ComputePassRecorder<'a, B: ComputeBackend> {
    backend: &'a mut B,
    pass: ComputePassHandle,
}

impl<'a, B: ComputeBackend> ComputePassRecorder<'a, B> {
    pub fn set_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.backend.set_pipeline(self.pass, pipeline);
    }

    pub fn set_bind_group(&mut self, index: u32, group: BindGroupHandle, dynamic_offsets: &[u32]) {
        self.backend
            .set_bind_group(self.pass, index, group, dynamic_offsets);
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.backend.dispatch(self.pass, x, y, z);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::SoftwareBackend;

    fn storage_desc(label: &str) -> BufferDescriptor<'_> {
        BufferDescriptor {
            label,
            size: 64,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }
    }

    #[test]
    fn test_create_and_release() {
        let mut ctx = GpuContext::new(SoftwareBackend::new()).unwrap();
        let buffer = ctx.create_buffer(&storage_desc("a")).unwrap();

        assert!(ctx.is_live(buffer));
        assert!(ctx.backend().is_valid(buffer.raw()));

        ctx.release(buffer);
        ctx.release(buffer);
        assert!(!ctx.is_live(buffer));
        assert!(!ctx.backend().is_valid(buffer.raw()));
    }

    #[test]
    fn test_create_against_released_parent_is_rejected_locally() {
        let mut ctx = GpuContext::new(SoftwareBackend::new()).unwrap();
        let layout = ctx
            .create_bind_group_layout("layout", &[LayoutEntry::storage(0)])
            .unwrap();
        let buffer = ctx.create_buffer(&storage_desc("data")).unwrap();
        ctx.release(layout);

        let before = ctx.backend().created_count();
        let result = ctx.create_bind_group("group", layout, &[BufferBinding::whole(0, buffer)]);

        assert!(matches!(
            result,
            Err(MoteError::ResourceCreation { kind: "bind group", .. })
        ));
        assert_eq!(ctx.rejected_creates(), 1);
        assert_eq!(
            ctx.backend().created_count(),
            before,
            "the backend must never see the request"
        );
    }

    #[test]
    fn test_backend_sentinel_becomes_error() {
        let mut ctx = GpuContext::new(SoftwareBackend::new()).unwrap();
        let result = ctx.create_shader_module("broken", "fn not_a_kernel() {}");
        assert!(matches!(
            result,
            Err(MoteError::ResourceCreation { kind: "shader module", .. })
        ));
    }

    #[test]
    fn test_rollback_releases_newer_handles_only() {
        let mut ctx = GpuContext::new(SoftwareBackend::new()).unwrap();
        let keep = ctx.create_buffer(&storage_desc("keep")).unwrap();

        let mark = ctx.checkpoint();
        let a = ctx.create_buffer(&storage_desc("a")).unwrap();
        let b = ctx.create_buffer(&storage_desc("b")).unwrap();
        ctx.rollback(mark);

        assert!(ctx.is_live(keep));
        assert!(!ctx.backend().is_valid(a.raw()));
        assert!(!ctx.backend().is_valid(b.raw()));
        assert_eq!(ctx.live_count(), 2);
    }

    #[test]
    fn test_into_backend_releases_everything() {
        let mut ctx = GpuContext::new(SoftwareBackend::new()).unwrap();
        ctx.create_buffer(&storage_desc("a")).unwrap();
        ctx.create_buffer(&storage_desc("b")).unwrap();

        let backend = ctx.into_backend();
        assert_eq!(backend.live_objects(), 0);
    }
}
