//! Generational arena mapping flat handles to backend objects
//!
//! Each slot carries a generation tag. Releasing an object bumps the tag, so
//! a stale handle never resolves to whatever later reuses the slot, while the
//! outside world still sees a single `u64`.

use crate::handle::RawHandle;
use slotmap::{new_key_type, Key, KeyData, SlotMap};

new_key_type! {
    /// Slot index plus generation inside a registry
    struct Slot;
}

/// Owns backend objects and hands out flat handles to them
pub struct ResourceRegistry<T> {
    slots: SlotMap<Slot, T>,
    released: u64,
}

impl<T> Default for ResourceRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResourceRegistry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            released: 0,
        }
    }

    /// Take ownership of an object and return its handle
    pub fn insert(&mut self, value: T) -> RawHandle {
        encode(self.slots.insert(value))
    }

    /// Resolve a handle
    pub fn get(&self, handle: RawHandle) -> Option<&T> {
        self.slots.get(decode(handle)?)
    }

    /// Resolve a handle mutably
    pub fn get_mut(&mut self, handle: RawHandle) -> Option<&mut T> {
        self.slots.get_mut(decode(handle)?)
    }

    /// Check whether a handle currently resolves
    pub fn contains(&self, handle: RawHandle) -> bool {
        decode(handle).is_some_and(|slot| self.slots.contains_key(slot))
    }

    /// Release a handle, returning the object if it was live
    ///
    /// Releasing twice is harmless: the second call returns `None`.
    pub fn remove(&mut self, handle: RawHandle) -> Option<T> {
        let removed = self.slots.remove(decode(handle)?);
        if removed.is_some() {
            self.released += 1;
        }
        removed
    }

    /// Iterate live handles and objects
    pub fn iter(&self) -> impl Iterator<Item = (RawHandle, &T)> + '_ {
        self.slots.iter().map(|(slot, value)| (encode(slot), value))
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total number of objects released over the registry lifetime
    pub fn released(&self) -> u64 {
        self.released
    }
}

fn encode(slot: Slot) -> RawHandle {
    slot.data().as_ffi()
}

fn decode(handle: RawHandle) -> Option<Slot> {
    // Occupied slots always carry an odd generation in the high word, so a
    // live handle is never zero. from_ffi forces the generation odd, so an
    // even one (zero included) must be refused here or it would alias the
    // live object in that slot.
    if (handle >> 32) & 1 == 0 {
        return None;
    }
    Some(KeyData::from_ffi(handle).into())
}
