//! Fixed-capacity object pools.
//!
//! Every cache structure lives in a [`Pool`] sized once at initialization.
//! Handles are generational [`slotmap`] keys, so a handle that outlived its
//! slot resolves to `None` instead of aliasing the slot's next occupant.

use slotmap::{Key, SlotMap};

use crate::error::{ResolverError, Result};

/// A slot map that refuses to grow past its capacity.
pub struct Pool<K: Key, V> {
    name: &'static str,
    slots: SlotMap<K, V>,
    capacity: usize,
}

impl<K: Key, V> Pool<K, V> {
    /// Creates an empty pool holding at most `capacity` blocks.
    #[must_use]
    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            slots: SlotMap::with_capacity_and_key(capacity),
            capacity,
        }
    }

    /// Takes a block and stores `value` in it.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::MemAlloc`] naming the pool when every block is
    /// in use.
    pub fn get(&mut self, value: V) -> Result<K> {
        if self.slots.len() >= self.capacity {
            return Err(ResolverError::MemAlloc { pool: self.name });
        }
        Ok(self.slots.insert(value))
    }

    /// Returns a block to the pool.
    pub fn free(&mut self, key: K) -> Option<V> {
        self.slots.remove(key)
    }

    /// Shared access to a live block.
    #[must_use]
    pub fn block(&self, key: K) -> Option<&V> {
        self.slots.get(key)
    }

    /// Exclusive access to a live block.
    pub fn block_mut(&mut self, key: K) -> Option<&mut V> {
        self.slots.get_mut(key)
    }

    /// Returns `true` if `key` refers to a live block.
    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.slots.contains_key(key)
    }

    /// Blocks in use.
    #[must_use]
    pub fn used(&self) -> usize {
        self.slots.len()
    }

    /// Blocks still available.
    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity - self.slots.len()
    }

    /// Pool name used in allocation errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<K: Key, V> std::fmt::Debug for Pool<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("used", &self.slots.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
