//! The compute backend command protocol
//!
//! Everything the simulation asks of a backend goes through
//! [`ComputeBackend`]. Objects live on the backend side; the simulation only
//! holds handles. The contract:
//!
//! - every `create_*` returns the invalid sentinel on failure instead of
//!   panicking across the boundary
//! - every operation on a stale or invalid handle is a no-op that logs a
//!   diagnostic and bumps [`ComputeBackend::invalid_uses`]
//! - [`ComputeBackend::release`] is idempotent
//!
//! Multi-entry parameters arrive as packed records (see [`crate::records`]).

use bitflags::bitflags;

use crate::handle::{
    BindGroupHandle, BindGroupLayoutHandle, BufferHandle, CommandBufferHandle,
    CommandEncoderHandle, ComputePassHandle, ComputePipelineHandle, DeviceHandle,
    PipelineLayoutHandle, RawHandle, ShaderModuleHandle,
};

/// Required alignment of dynamic uniform offsets
pub const UNIFORM_OFFSET_ALIGNMENT: u32 = 256;

/// Required alignment of buffer sizes, offsets and copy lengths
pub const COPY_ALIGNMENT: u64 = 4;

bitflags! {
    /// Buffer usage flags, bit-compatible with WebGPU
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsages: u32 {
        const MAP_READ = 1 << 0;
        const MAP_WRITE = 1 << 1;
        const COPY_SRC = 1 << 2;
        const COPY_DST = 1 << 3;
        const INDEX = 1 << 4;
        const VERTEX = 1 << 5;
        const UNIFORM = 1 << 6;
        const STORAGE = 1 << 7;
        const INDIRECT = 1 << 8;
    }
}

/// Parameters of `create_buffer`
#[derive(Clone, Copy, Debug)]
pub struct BufferDescriptor<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: BufferUsages,
    pub mapped_at_creation: bool,
}

/// A backend that executes submitted command streams and owns real memory
pub trait ComputeBackend {
    /// Short backend name for logs
    fn name(&self) -> &str;

    // === Device ===

    /// Acquire a logical device
    fn request_device(&mut self) -> DeviceHandle;

    // === Memory ===

    /// Allocate a zero-initialized buffer
    fn create_buffer(&mut self, device: DeviceHandle, desc: &BufferDescriptor<'_>) -> BufferHandle;

    /// Queue a write; ordered before any later `submit` on the same device
    fn write_buffer(&mut self, device: DeviceHandle, buffer: BufferHandle, offset: u64, data: &[u8]);

    /// Block until all submitted work is done and copy the buffer to the host
    fn read_buffer(&mut self, device: DeviceHandle, buffer: BufferHandle) -> Option<Vec<u8>>;

    // === Kernels and bindings ===

    /// Compile shader source
    fn create_shader_module(
        &mut self,
        device: DeviceHandle,
        label: &str,
        source: &str,
    ) -> ShaderModuleHandle;

    /// Create a layout from packed [`crate::records::LayoutEntryRecord`]s
    fn create_bind_group_layout(
        &mut self,
        device: DeviceHandle,
        label: &str,
        entries: &[u8],
    ) -> BindGroupLayoutHandle;

    /// Create a bind group from packed [`crate::records::BindingRecord`]s
    fn create_bind_group(
        &mut self,
        device: DeviceHandle,
        label: &str,
        layout: BindGroupLayoutHandle,
        entries: &[u8],
    ) -> BindGroupHandle;

    /// Combine bind group layouts, in group order
    fn create_pipeline_layout(
        &mut self,
        device: DeviceHandle,
        label: &str,
        layouts: &[BindGroupLayoutHandle],
    ) -> PipelineLayoutHandle;

    /// Bind a module entry point to a pipeline layout
    fn create_compute_pipeline(
        &mut self,
        device: DeviceHandle,
        label: &str,
        layout: PipelineLayoutHandle,
        module: ShaderModuleHandle,
        entry_point: &str,
    ) -> ComputePipelineHandle;

    // === Command streams ===

    /// Open a command stream
    fn create_command_encoder(&mut self, device: DeviceHandle, label: &str) -> CommandEncoderHandle;

    /// Begin a compute pass; passes are synchronization boundaries
    fn begin_compute_pass(&mut self, encoder: CommandEncoderHandle, label: &str) -> ComputePassHandle;

    fn set_pipeline(&mut self, pass: ComputePassHandle, pipeline: ComputePipelineHandle);

    fn set_bind_group(
        &mut self,
        pass: ComputePassHandle,
        index: u32,
        group: BindGroupHandle,
        dynamic_offsets: &[u32],
    );

    fn dispatch(&mut self, pass: ComputePassHandle, x: u32, y: u32, z: u32);

    /// Close a pass; its handle is consumed
    fn end_pass(&mut self, pass: ComputePassHandle);

    /// Close a stream; the encoder handle is consumed
    fn finish(&mut self, encoder: CommandEncoderHandle) -> CommandBufferHandle;

    /// Queue a finished stream for execution; the command buffer is consumed
    fn submit(&mut self, device: DeviceHandle, commands: CommandBufferHandle);

    // === Lifetime ===

    /// Release any object; returns whether the handle was live
    fn release(&mut self, handle: RawHandle) -> bool;

    /// Whether a handle currently resolves to a live object
    fn is_valid(&self, handle: RawHandle) -> bool;

    // === Diagnostics ===

    /// Operations ignored because they named an invalid handle
    fn invalid_uses(&self) -> u64;

    /// Failed dispatches since the last call, resetting the count
    fn take_faults(&mut self) -> u32;
}

/// Number of workgroups needed to cover `invocations` threads
pub fn workgroup_count(invocations: u32, workgroup_size: u32) -> u32 {
    invocations.div_ceil(workgroup_size).max(1)
}

/// Round a byte size up to [`COPY_ALIGNMENT`]
pub fn align_size(size: u64) -> u64 {
    size.div_ceil(COPY_ALIGNMENT) * COPY_ALIGNMENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workgroup_count() {
        assert_eq!(workgroup_count(0, 64), 1);
        assert_eq!(workgroup_count(64, 64), 1);
        assert_eq!(workgroup_count(65, 64), 2);
        assert_eq!(workgroup_count(1_000_000, 64), 15_625);
    }

    #[test]
    fn test_usage_bits_match_webgpu() {
        assert_eq!(BufferUsages::STORAGE.bits(), 0x80);
        assert_eq!(BufferUsages::UNIFORM.bits(), 0x40);
        assert_eq!(BufferUsages::COPY_DST.bits(), 0x08);
    }

    #[test]
    fn test_align_size() {
        assert_eq!(align_size(0), 0);
        assert_eq!(align_size(5), 8);
        assert_eq!(align_size(20), 20);
    }
}
