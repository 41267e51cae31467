//! Packed binary records for multi-entry protocol parameters
//!
//! Bind group layout entries and bind group entries cross the backend
//! boundary as flat arrays of fixed-stride records, interpreted positionally.
//! The field order and stride below are shared by every backend.
//!
//! ```text
//! LayoutEntryRecord (16 bytes)     BindingRecord (32 bytes)
//! ┌─────────┬────────────┐         ┌─────────┬─────────┬────────┬────────┬──────┐
//! │ binding │ visibility │         │ binding │ padding │ buffer │ offset │ size │
//! │ ty      │ dynamic    │         │  u32    │  u32    │  u64   │  u64   │ u64  │
//! └─────────┴────────────┘         └─────────┴─────────┴────────┴────────┴──────┘
//! ```

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::handle::BufferHandle;

/// Visibility bit for the compute stage (matches WebGPU's `COMPUTE`)
pub const VISIBILITY_COMPUTE: u32 = 1 << 2;

/// Stride of one packed layout entry
pub const LAYOUT_ENTRY_STRIDE: usize = std::mem::size_of::<LayoutEntryRecord>();

/// Stride of one packed binding entry
pub const BINDING_STRIDE: usize = std::mem::size_of::<BindingRecord>();

/// Errors decoding packed records
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("{len} bytes is not a whole number of {stride}-byte records")]
    Stride { len: usize, stride: usize },

    #[error("unknown binding type tag {0}")]
    BindingType(u32),

    #[error("record {index} is not visible to the compute stage")]
    Visibility { index: usize },
}

/// How a buffer is bound
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingType {
    /// Uniform block
    Uniform,
    /// Storage buffer, read only
    ReadOnlyStorage,
    /// Storage buffer, read write (atomics allowed)
    Storage,
}

impl BindingType {
    fn tag(self) -> u32 {
        match self {
            BindingType::Uniform => 0,
            BindingType::ReadOnlyStorage => 1,
            BindingType::Storage => 2,
        }
    }

    fn from_tag(tag: u32) -> Result<Self, RecordError> {
        match tag {
            0 => Ok(BindingType::Uniform),
            1 => Ok(BindingType::ReadOnlyStorage),
            2 => Ok(BindingType::Storage),
            other => Err(RecordError::BindingType(other)),
        }
    }
}

/// One slot of a bind group layout
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutEntry {
    pub binding: u32,
    pub ty: BindingType,
    pub has_dynamic_offset: bool,
}

impl LayoutEntry {
    pub const fn uniform(binding: u32) -> Self {
        Self {
            binding,
            ty: BindingType::Uniform,
            has_dynamic_offset: false,
        }
    }

    pub const fn dynamic_uniform(binding: u32) -> Self {
        Self {
            binding,
            ty: BindingType::Uniform,
            has_dynamic_offset: true,
        }
    }

    pub const fn storage(binding: u32) -> Self {
        Self {
            binding,
            ty: BindingType::Storage,
            has_dynamic_offset: false,
        }
    }

    pub const fn read_only(binding: u32) -> Self {
        Self {
            binding,
            ty: BindingType::ReadOnlyStorage,
            has_dynamic_offset: false,
        }
    }
}

/// A buffer range bound to one slot of a bind group
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBinding {
    pub binding: u32,
    pub buffer: BufferHandle,
    pub offset: u64,
    /// `None` binds the rest of the buffer
    pub size: Option<u64>,
}

impl BufferBinding {
    /// Bind a whole buffer
    pub fn whole(binding: u32, buffer: BufferHandle) -> Self {
        Self {
            binding,
            buffer,
            offset: 0,
            size: None,
        }
    }

    /// Bind `size` bytes starting at `offset`
    pub fn range(binding: u32, buffer: BufferHandle, offset: u64, size: u64) -> Self {
        Self {
            binding,
            buffer,
            offset,
            size: Some(size),
        }
    }
}

/// Wire form of [`LayoutEntry`]
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct LayoutEntryRecord {
    pub binding: u32,
    pub visibility: u32,
    pub ty: u32,
    pub has_dynamic_offset: u32,
}

/// Wire form of [`BufferBinding`]; `size == 0` binds the rest of the buffer
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct BindingRecord {
    pub binding: u32,
    pub _padding: u32,
    pub buffer: u64,
    pub offset: u64,
    pub size: u64,
}

/// Pack layout entries for `create_bind_group_layout`
pub fn encode_layout_entries(entries: &[LayoutEntry]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(entries.len() * LAYOUT_ENTRY_STRIDE);
    for entry in entries {
        let record = LayoutEntryRecord {
            binding: entry.binding,
            visibility: VISIBILITY_COMPUTE,
            ty: entry.ty.tag(),
            has_dynamic_offset: entry.has_dynamic_offset as u32,
        };
        bytes.extend_from_slice(bytemuck::bytes_of(&record));
    }
    bytes
}

/// Unpack layout entries; the byte slice need not be aligned
pub fn decode_layout_entries(bytes: &[u8]) -> Result<Vec<LayoutEntry>, RecordError> {
    check_stride(bytes, LAYOUT_ENTRY_STRIDE)?;
    bytes
        .chunks_exact(LAYOUT_ENTRY_STRIDE)
        .enumerate()
        .map(|(index, chunk)| {
            let record: LayoutEntryRecord = bytemuck::pod_read_unaligned(chunk);
            if record.visibility & VISIBILITY_COMPUTE == 0 {
                return Err(RecordError::Visibility { index });
            }
            Ok(LayoutEntry {
                binding: record.binding,
                ty: BindingType::from_tag(record.ty)?,
                has_dynamic_offset: record.has_dynamic_offset != 0,
            })
        })
        .collect()
}

/// Pack buffer bindings for `create_bind_group`
pub fn encode_bindings(bindings: &[BufferBinding]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(bindings.len() * BINDING_STRIDE);
    for binding in bindings {
        let record = BindingRecord {
            binding: binding.binding,
            _padding: 0,
            buffer: binding.buffer.raw(),
            offset: binding.offset,
            size: binding.size.unwrap_or(0),
        };
        bytes.extend_from_slice(bytemuck::bytes_of(&record));
    }
    bytes
}

/// Unpack buffer bindings; the byte slice need not be aligned
pub fn decode_bindings(bytes: &[u8]) -> Result<Vec<BufferBinding>, RecordError> {
    check_stride(bytes, BINDING_STRIDE)?;
    Ok(bytes
        .chunks_exact(BINDING_STRIDE)
        .map(|chunk| {
            let record: BindingRecord = bytemuck::pod_read_unaligned(chunk);
            BufferBinding {
                binding: record.binding,
                buffer: BufferHandle::from_raw(record.buffer),
                offset: record.offset,
                size: (record.size != 0).then_some(record.size),
            }
        })
        .collect())
}

fn check_stride(bytes: &[u8], stride: usize) -> Result<(), RecordError> {
    if bytes.len() % stride != 0 {
        return Err(RecordError::Stride {
            len: bytes.len(),
            stride,
        });
    }
    Ok(())
}
