//! Typed opaque handles to backend-owned objects
//!
//! Simulation code never holds a backend object directly. It holds a
//! [`Handle<K>`]: a flat `u64` on the wire, tagged at compile time with the
//! resource category `K` so a buffer handle cannot be passed where a bind
//! group is expected. `0` is reserved as the invalid sentinel.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Wire representation of every handle, regardless of category
pub type RawHandle = u64;

/// The sentinel returned by a failed `create*`
pub const HANDLE_INVALID: RawHandle = 0;

/// Marker trait for resource categories
pub trait HandleKind: 'static {
    /// Category name used in diagnostics
    const NAME: &'static str;
}

macro_rules! handle_kinds {
    ($($(#[$meta:meta])* $kind:ident => $name:literal),* $(,)?) => {
        /// Resource category markers
        pub mod kind {
            $(
                $(#[$meta])*
                #[derive(Debug)]
                pub enum $kind {}

                impl super::HandleKind for $kind {
                    const NAME: &'static str = $name;
                }
            )*
        }
    };
}

handle_kinds! {
    /// A logical compute device
    Device => "device",
    /// A linear memory buffer
    Buffer => "buffer",
    /// Compiled shader source
    ShaderModule => "shader module",
    /// A texture (presentation only)
    Texture => "texture",
    /// A view into a texture (presentation only)
    TextureView => "texture view",
    /// Binding layout for one bind group slot
    BindGroupLayout => "bind group layout",
    /// Concrete resources bound to a layout
    BindGroup => "bind group",
    /// Ordered bind group layouts of a pipeline
    PipelineLayout => "pipeline layout",
    /// A compute kernel entry point with its layout
    ComputePipeline => "compute pipeline",
    /// An open command stream
    CommandEncoder => "command encoder",
    /// A finished, submittable command stream
    CommandBuffer => "command buffer",
    /// A compute pass being recorded
    ComputePass => "compute pass",
    /// A render pass being recorded (presentation only)
    RenderPass => "render pass",
}

/// A typed reference to an object owned by the backend
#[repr(transparent)]
pub struct Handle<K: HandleKind> {
    raw: RawHandle,
    _kind: PhantomData<fn() -> K>,
}

impl<K: HandleKind> Handle<K> {
    /// Wrap a raw wire value
    pub const fn from_raw(raw: RawHandle) -> Self {
        Self {
            raw,
            _kind: PhantomData,
        }
    }

    /// The invalid sentinel for this category
    pub const fn invalid() -> Self {
        Self::from_raw(HANDLE_INVALID)
    }

    /// The raw wire value
    pub const fn raw(self) -> RawHandle {
        self.raw
    }

    /// Whether this is the invalid sentinel
    ///
    /// A non-zero handle is not necessarily live; only the owning backend
    /// can answer that.
    pub const fn is_invalid(self) -> bool {
        self.raw == HANDLE_INVALID
    }

    /// Category name for diagnostics
    pub fn kind_name(self) -> &'static str {
        K::NAME
    }
}

impl<K: HandleKind> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: HandleKind> Copy for Handle<K> {}

impl<K: HandleKind> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<K: HandleKind> Eq for Handle<K> {}

impl<K: HandleKind> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<K: HandleKind> Default for Handle<K> {
    fn default() -> Self {
        Self::invalid()
    }
}

impl<K: HandleKind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:#x}", K::NAME, self.raw)
    }
}

pub type DeviceHandle = Handle<kind::Device>;
pub type BufferHandle = Handle<kind::Buffer>;
pub type ShaderModuleHandle = Handle<kind::ShaderModule>;
pub type TextureHandle = Handle<kind::Texture>;
pub type TextureViewHandle = Handle<kind::TextureView>;
pub type BindGroupLayoutHandle = Handle<kind::BindGroupLayout>;
pub type BindGroupHandle = Handle<kind::BindGroup>;
pub type PipelineLayoutHandle = Handle<kind::PipelineLayout>;
pub type ComputePipelineHandle = Handle<kind::ComputePipeline>;
pub type CommandEncoderHandle = Handle<kind::CommandEncoder>;
pub type CommandBufferHandle = Handle<kind::CommandBuffer>;
pub type ComputePassHandle = Handle<kind::ComputePass>;
pub type RenderPassHandle = Handle<kind::RenderPass>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_sentinel() {
        let handle = BufferHandle::invalid();
        assert!(handle.is_invalid());
        assert_eq!(handle.raw(), HANDLE_INVALID);
        assert_eq!(BufferHandle::default(), handle);
    }

    #[test]
    fn test_wire_size_is_flat() {
        assert_eq!(std::mem::size_of::<BufferHandle>(), 8);
        assert_eq!(std::mem::size_of::<ComputePipelineHandle>(), 8);
    }

    #[test]
    fn test_debug_names_category() {
        let handle = BindGroupHandle::from_raw(0x1_0000_0002);
        assert_eq!(format!("{:?}", handle), "bind group#0x100000002");
        assert_eq!(handle.kind_name(), "bind group");
    }
}
