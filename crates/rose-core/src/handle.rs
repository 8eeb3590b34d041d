//! Generational Handles
//!
//! Stable opaque identifiers for engine objects. Each handle carries a
//! generation counter, so a handle whose slot has been recycled never
//! compares equal to the slot's new occupant. Maps keyed by handles can
//! therefore outlive the objects they describe without ever confusing a
//! destroyed object with its replacement.

use std::fmt;

/// Opaque identifier with a generation counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    /// Slot index
    index: u32,
    /// Generation counter to detect stale references
    generation: u32,
}

impl Handle {
    /// Create a handle from raw parts
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Get the slot index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Get the generation
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Create a null handle (never allocated)
    pub const fn null() -> Self {
        Self {
            index: u32::MAX,
            generation: 0,
        }
    }

    /// Check if this is the null handle
    pub fn is_null(&self) -> bool {
        self.index == u32::MAX
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{}v{}", self.index, self.generation)
        }
    }
}

#[derive(Debug)]
struct SlotMeta {
    generation: u32,
    alive: bool,
}

/// Allocator for generational handles with index recycling
#[derive(Debug, Default)]
pub struct HandleAllocator {
    /// Slot metadata indexed by handle index
    slots: Vec<SlotMeta>,
    /// Free slot indices for recycling
    free_indices: Vec<u32>,
}

impl HandleAllocator {
    /// Create an empty allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new handle, recycling a released slot if one exists
    pub fn allocate(&mut self) -> Handle {
        if let Some(index) = self.free_indices.pop() {
            let meta = &mut self.slots[index as usize];
            meta.generation = meta.generation.wrapping_add(1);
            meta.alive = true;
            return Handle::new(index, meta.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(SlotMeta {
            generation: 0,
            alive: true,
        });
        Handle::new(index, 0)
    }

    /// Release a handle. Returns false if the handle was stale or already released.
    pub fn release(&mut self, handle: Handle) -> bool {
        if !self.is_alive(handle) {
            return false;
        }

        self.slots[handle.index() as usize].alive = false;
        self.free_indices.push(handle.index());
        true
    }

    /// Check if a handle refers to a live slot
    pub fn is_alive(&self, handle: Handle) -> bool {
        self.slots
            .get(handle.index() as usize)
            .is_some_and(|meta| meta.alive && meta.generation == handle.generation())
    }

    /// Number of live handles
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free_indices.len()
    }
}
