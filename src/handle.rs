//! Generation-checked handles
//!
//! Queues, event groups and multiwaiters live in fixed slabs. A handle is
//! slot index plus generation; deleting an object bumps the generation, so
//! any handle still held by a sleeping thread stops resolving. That is the
//! liveness check for kernel-owned objects.
//!
//! Author: Moroya Sakamoto

use core::array;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

/// Typed reference to a slab-allocated kernel object
pub struct Handle<T> {
    index: u16,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    const fn new(index: u16, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slab slot this handle points at
    pub fn index(&self) -> u16 {
        self.index
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}#{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity object table
pub(crate) struct Slab<T, const N: usize> {
    slots: [Slot<T>; N],
}

impl<T, const N: usize> Slab<T, N> {
    pub(crate) fn new() -> Self {
        Self {
            slots: array::from_fn(|_| Slot {
                generation: 0,
                value: None,
            }),
        }
    }

    /// Store `value`, or give it back if the table is full
    pub(crate) fn insert(&mut self, value: T) -> Result<Handle<T>, T> {
        match self.slots.iter().position(|s| s.value.is_none()) {
            Some(i) => {
                let slot = &mut self.slots[i];
                slot.value = Some(value);
                Ok(Handle::new(i as u16, slot.generation))
            }
            None => Err(value),
        }
    }

    pub(crate) fn get(&self, handle: Handle<T>) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation == handle.generation {
            slot.value.as_ref()
        } else {
            None
        }
    }

    pub(crate) fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation == handle.generation {
            slot.value.as_mut()
        } else {
            None
        }
    }

    /// Take the object out and invalidate every outstanding handle
    pub(crate) fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(value)
    }

    /// Object in slot `index`, whatever its generation
    pub(crate) fn slot_mut(&mut self, index: u16) -> Option<&mut T> {
        self.slots.get_mut(index as usize)?.value.as_mut()
    }
}
