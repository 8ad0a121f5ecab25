//! Generational arena owning worker entities by index.

use crate::models::ids::EntityIndex;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot storage with generation-checked handles.
///
/// Removing an entry bumps its slot generation, so an [`EntityIndex`] held
/// past removal resolves to `None` instead of a newer occupant.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Store `value` and return its handle.
    pub fn insert(&mut self, value: T) -> EntityIndex {
        self.len += 1;
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.value = Some(value);
            return EntityIndex {
                slot,
                generation: entry.generation,
            };
        }
        let slot = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        EntityIndex {
            slot,
            generation: 0,
        }
    }

    /// Borrow the entry behind `index` if it is still live.
    #[must_use]
    pub fn get(&self, index: EntityIndex) -> Option<&T> {
        self.slots
            .get(index.slot as usize)
            .filter(|entry| entry.generation == index.generation)
            .and_then(|entry| entry.value.as_ref())
    }

    /// Mutably borrow the entry behind `index` if it is still live.
    pub fn get_mut(&mut self, index: EntityIndex) -> Option<&mut T> {
        self.slots
            .get_mut(index.slot as usize)
            .filter(|entry| entry.generation == index.generation)
            .and_then(|entry| entry.value.as_mut())
    }

    /// Remove and return the entry behind `index`.
    pub fn remove(&mut self, index: EntityIndex) -> Option<T> {
        let entry = self
            .slots
            .get_mut(index.slot as usize)
            .filter(|entry| entry.generation == index.generation)?;
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(index.slot);
        self.len -= 1;
        Some(value)
    }

    /// Whether `index` refers to a live entry.
    #[must_use]
    pub fn contains(&self, index: EntityIndex) -> bool {
        self.get(index).is_some()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handles of every live entry, in slot order.
    #[must_use]
    pub fn indices(&self) -> Vec<EntityIndex> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.value.is_some())
            .filter_map(|(slot, entry)| {
                u32::try_from(slot).ok().map(|slot| EntityIndex {
                    slot,
                    generation: entry.generation,
                })
            })
            .collect()
    }
}
