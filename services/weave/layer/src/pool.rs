//! Fixed-capacity object pools with generation-checked handles.
//!
//! Each slot is either `Free` or `InUse`; freeing a slot bumps its
//! generation so stale handles stop resolving.

use std::fmt;

/// Index of a pool slot plus the generation it was allocated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Slot index
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Value unique to this allocation while it is live
    pub fn as_u64(&self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Free { generation: u32 },
    InUse { generation: u32, value: T },
}

/// Arena of at most `capacity` objects
#[derive(Debug)]
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    in_use: usize,
}

impl<T> Pool<T> {
    /// Create a pool with `capacity` free slots
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot::Free { generation: 0 }).collect();
        Self { slots, in_use: 0 }
    }

    /// Store `value` in the first free slot, `None` when the pool is full
    pub fn insert(&mut self, value: T) -> Option<Handle> {
        let index = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Slot::Free { .. }))?;
        let generation = match self.slots[index] {
            Slot::Free { generation } => generation,
            Slot::InUse { .. } => return None,
        };
        self.slots[index] = Slot::InUse { generation, value };
        self.in_use += 1;
        Some(Handle {
            index: index as u32,
            generation,
        })
    }

    /// Object behind a live handle
    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.slots.get(handle.index())? {
            Slot::InUse { generation, value } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    /// Object behind a live handle, mutable
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index())? {
            Slot::InUse { generation, value } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    /// Free the slot and return its object
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        if !self.contains(handle) {
            return None;
        }
        let next = Slot::Free {
            generation: handle.generation.wrapping_add(1),
        };
        match std::mem::replace(&mut self.slots[handle.index()], next) {
            Slot::InUse { value, .. } => {
                self.in_use -= 1;
                Some(value)
            }
            Slot::Free { .. } => None,
        }
    }

    /// Whether the handle refers to a live object
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Number of objects in use
    pub fn len(&self) -> usize {
        self.in_use
    }

    /// Whether no object is in use
    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Whether every slot is in use
    pub fn is_full(&self) -> bool {
        self.in_use == self.slots.len()
    }

    /// Handles of all live objects
    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Live objects with their handles
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::InUse { generation, value } => Some((
                Handle {
                    index: index as u32,
                    generation: *generation,
                },
                value,
            )),
            Slot::Free { .. } => None,
        })
    }
}
