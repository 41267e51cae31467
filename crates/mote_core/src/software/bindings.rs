//! Buffer views handed to a software kernel for one dispatch

use std::cell::{Ref, RefCell, RefMut};

use bytemuck::Pod;
use rustc_hash::FxHashMap;

use crate::error::KernelError;

/// Byte range of a buffer slot visible at one `(group, binding)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct View {
    pub slot: usize,
    pub offset: usize,
    pub size: usize,
}

/// Resources bound for a dispatch
///
/// Buffers bound at several slots share one cell, so a kernel that borrows
/// the same memory mutably twice gets [`KernelError::Aliased`] instead of
/// silently racing with itself.
pub struct Bindings<'a> {
    slots: &'a [RefCell<Vec<u32>>],
    views: FxHashMap<(u32, u32), View>,
}

impl<'a> Bindings<'a> {
    pub(crate) fn new(slots: &'a [RefCell<Vec<u32>>], views: FxHashMap<(u32, u32), View>) -> Self {
        Self { slots, views }
    }

    /// Read-only view of a storage binding as `[T]`
    pub fn storage<T: Pod>(&self, group: u32, binding: u32) -> Result<Ref<'a, [T]>, KernelError> {
        let (view, cell) = self.resolve(group, binding)?;
        let words = cell
            .try_borrow()
            .map_err(|_| KernelError::Aliased { group, binding })?;
        let (start, end) = word_range(view);
        Ref::filter_map(words, |w| {
            w.get(start..end)
                .and_then(|w| bytemuck::try_cast_slice::<u32, T>(w).ok())
        })
        .map_err(|_| layout_error::<T>(group, binding))
    }

    /// Writable view of a storage binding as `[T]`
    pub fn storage_mut<T: Pod>(
        &self,
        group: u32,
        binding: u32,
    ) -> Result<RefMut<'a, [T]>, KernelError> {
        let (view, cell) = self.resolve(group, binding)?;
        let words = cell
            .try_borrow_mut()
            .map_err(|_| KernelError::Aliased { group, binding })?;
        let (start, end) = word_range(view);
        RefMut::filter_map(words, |w| {
            w.get_mut(start..end)
                .and_then(|w| bytemuck::try_cast_slice_mut::<u32, T>(w).ok())
        })
        .map_err(|_| layout_error::<T>(group, binding))
    }

    /// Copy of a uniform binding
    pub fn uniform<T: Pod>(&self, group: u32, binding: u32) -> Result<T, KernelError> {
        let (view, cell) = self.resolve(group, binding)?;
        let words = cell
            .try_borrow()
            .map_err(|_| KernelError::Aliased { group, binding })?;
        let bytes = bytemuck::cast_slice::<u32, u8>(words.as_slice());
        let len = std::mem::size_of::<T>();
        if len > view.size {
            return Err(layout_error::<T>(group, binding));
        }
        bytes
            .get(view.offset..view.offset + len)
            .map(bytemuck::pod_read_unaligned)
            .ok_or_else(|| layout_error::<T>(group, binding))
    }

    fn resolve(&self, group: u32, binding: u32) -> Result<(View, &'a RefCell<Vec<u32>>), KernelError> {
        let view = *self
            .views
            .get(&(group, binding))
            .ok_or(KernelError::MissingBinding { group, binding })?;
        let cell = self
            .slots
            .get(view.slot)
            .ok_or(KernelError::MissingBinding { group, binding })?;
        Ok((view, cell))
    }
}

fn word_range(view: View) -> (usize, usize) {
    (view.offset / 4, (view.offset + view.size) / 4)
}

fn layout_error<T>(group: u32, binding: u32) -> KernelError {
    KernelError::Layout {
        group,
        binding,
        type_name: std::any::type_name::<T>(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(slots: &[RefCell<Vec<u32>>]) -> Bindings<'_> {
        let mut views = FxHashMap::default();
        views.insert((0, 0), View { slot: 0, offset: 0, size: 16 });
        views.insert((0, 1), View { slot: 0, offset: 8, size: 8 });
        views.insert((1, 0), View { slot: 1, offset: 4, size: 4 });
        Bindings::new(slots, views)
    }

    #[test]
    fn test_views_respect_offsets() {
        let slots = [RefCell::new(vec![1, 2, 3, 4]), RefCell::new(vec![10, 20])];
        let b = bindings(&slots);
        assert_eq!(&*b.storage::<u32>(0, 1).unwrap(), &[3, 4]);
        assert_eq!(b.uniform::<u32>(1, 0).unwrap(), 20);
    }

    #[test]
    fn test_aliased_mutable_borrow_is_rejected() {
        let slots = [RefCell::new(vec![0; 4]), RefCell::new(vec![0; 2])];
        let b = bindings(&slots);
        let _whole = b.storage_mut::<u32>(0, 0).unwrap();
        assert_eq!(
            b.storage::<u32>(0, 1).err(),
            Some(KernelError::Aliased { group: 0, binding: 1 })
        );
    }

    #[test]
    fn test_missing_and_mistyped() {
        let slots = [RefCell::new(vec![0; 4]), RefCell::new(vec![0; 2])];
        let b = bindings(&slots);
        assert_eq!(
            b.uniform::<u32>(2, 0).err(),
            Some(KernelError::MissingBinding { group: 2, binding: 0 })
        );
        assert!(matches!(
            b.storage::<[u32; 3]>(0, 0),
            Err(KernelError::Layout { .. })
        ));
    }
}
