//! Generational handles
//!
//! Callers hold a [`HeapHandle`] instead of a payload address. The handle
//! resolves through a slot table to the block that currently owns the
//! payload, so compaction can move bytes without invalidating it. A freed
//! handle is detected by its generation, a handle from another heap by the
//! heap id it carries.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use serde::Serialize;

/// Index plus generation into a [`Slots`] table
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotKey {
    index: u32,
    generation: u32,
}

impl SlotKey {
    const NULL_INDEX: u32 = u32::MAX;

    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub const fn null() -> Self {
        Self::new(Self::NULL_INDEX, 0)
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.index == Self::NULL_INDEX
    }

    #[inline]
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{}v{}", self.index, self.generation)
        }
    }
}

/// Id of the heap that owns no handles
const NO_HEAP: u32 = 0;

static NEXT_HEAP_ID: AtomicU32 = AtomicU32::new(NO_HEAP + 1);

/// A process-unique id for a new heap
pub(crate) fn next_heap_id() -> u32 {
    NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed)
}

/// Stable reference to one live allocation
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HeapHandle {
    heap: u32,
    index: u32,
    generation: u32,
}

impl HeapHandle {
    /// The handle that refers to nothing. Deallocating it is a no-op.
    #[inline]
    pub const fn null() -> Self {
        Self::new(NO_HEAP, SlotKey::null())
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.key().is_null()
    }

    /// Id of the heap that issued this handle
    #[inline]
    pub const fn heap_id(&self) -> u32 {
        self.heap
    }

    #[inline]
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    #[inline]
    pub(crate) const fn new(heap: u32, key: SlotKey) -> Self {
        Self {
            heap,
            index: key.index(),
            generation: key.generation(),
        }
    }

    #[inline]
    pub(crate) const fn key(&self) -> SlotKey {
        SlotKey::new(self.index, self.generation)
    }
}

impl Default for HeapHandle {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for HeapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "HeapHandle(null)")
        } else {
            write!(f, "HeapHandle({:?}@{})", self.key(), self.heap)
        }
    }
}

struct Slot<T> {
    value: Option<T>,
    generation: u32,
}

/// Generational slot storage with index reuse
pub(crate) struct Slots<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    len: usize,
}

impl<T> Slots<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> SlotKey {
        self.len += 1;

        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            SlotKey::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                value: Some(value),
                generation: 0,
            });
            SlotKey::new(index, 0)
        }
    }

    pub fn remove(&mut self, key: SlotKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index() as usize)?;
        if slot.generation != key.generation() || slot.value.is_none() {
            return None;
        }

        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(key.index());
        self.len -= 1;
        slot.value.take()
    }

    pub fn get(&self, key: SlotKey) -> Option<&T> {
        let slot = self.slots.get(key.index() as usize)?;
        if slot.generation != key.generation() {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, key: SlotKey) -> Option<&mut T> {
        let slot = self.slots.get_mut(key.index() as usize)?;
        if slot.generation != key.generation() {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn contains(&self, key: SlotKey) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotKey, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value
                .as_ref()
                .map(|v| (SlotKey::new(i as u32, slot.generation), v))
        })
    }
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_basic() {
        let mut slots: Slots<i32> = Slots::new();

        let a = slots.insert(42);
        let b = slots.insert(100);

        assert_eq!(slots.get(a), Some(&42));
        assert_eq!(slots.get(b), Some(&100));
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn test_stale_key_rejected() {
        let mut slots: Slots<i32> = Slots::new();

        let a = slots.insert(42);
        assert_eq!(slots.remove(a), Some(42));
        assert_eq!(slots.remove(a), None);

        let b = slots.insert(7);
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert_eq!(slots.get(a), None);
        assert_eq!(slots.get(b), Some(&7));
    }

    #[test]
    fn test_null_handle() {
        let handle = HeapHandle::default();
        assert!(handle.is_null());
        assert_eq!(format!("{:?}", handle), "HeapHandle(null)");
        assert!(!HeapHandle::new(2, SlotKey::new(3, 1)).is_null());
        assert_eq!(
            format!("{:?}", HeapHandle::new(2, SlotKey::new(3, 1))),
            "HeapHandle(3v1@2)"
        );
    }

    #[test]
    fn test_heap_ids_unique() {
        let a = next_heap_id();
        let b = next_heap_id();
        assert_ne!(a, b);
        assert_ne!(a, HeapHandle::null().heap_id());
        assert_ne!(b, HeapHandle::null().heap_id());
    }
}
