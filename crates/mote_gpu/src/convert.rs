//! Protocol types to wgpu descriptors

use mote_core::records::{BindingType, LayoutEntry};
use mote_core::BufferUsages;

pub(crate) fn buffer_usages(usage: BufferUsages) -> wgpu::BufferUsages {
    // Bit-compatible by construction
    wgpu::BufferUsages::from_bits_truncate(usage.bits())
}

pub(crate) fn layout_entry(entry: &LayoutEntry) -> wgpu::BindGroupLayoutEntry {
    let ty = match entry.ty {
        BindingType::Uniform => wgpu::BufferBindingType::Uniform,
        BindingType::ReadOnlyStorage => wgpu::BufferBindingType::Storage { read_only: true },
        BindingType::Storage => wgpu::BufferBindingType::Storage { read_only: false },
    };
    wgpu::BindGroupLayoutEntry {
        binding: entry.binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: entry.has_dynamic_offset,
            min_binding_size: None,
        },
        count: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_bits_carry_over() {
        let usage = BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::UNIFORM;
        assert_eq!(
            buffer_usages(usage),
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::UNIFORM
        );
        assert_eq!(buffer_usages(BufferUsages::MAP_READ), wgpu::BufferUsages::MAP_READ);
    }

    #[test]
    fn test_dynamic_uniform_entry() {
        let entry = layout_entry(&LayoutEntry::dynamic_uniform(2));
        assert_eq!(entry.binding, 2);
        assert!(matches!(
            entry.ty,
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: true,
                ..
            }
        ));
    }
}
