//! Handle registry: an arena of slots plus a free list
//!
//! A registered value stays alive for as long as its slot is occupied, even
//! if the guest drops every other binding to it.

use serde::{Deserialize, Serialize};

/// Opaque handle given to clients. Never reused while registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub i32);

pub struct Registry<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
    live: usize,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Store `value`, reusing the most recently freed slot when there is one
    pub fn register(&mut self, value: T) -> Handle {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(value);
                index
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        };
        self.live += 1;
        Handle(index as i32)
    }

    fn index(&self, handle: Handle) -> Option<usize> {
        usize::try_from(handle.0)
            .ok()
            .filter(|index| *index < self.slots.len())
    }

    pub fn has(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.index(handle).and_then(|index| self.slots[index].as_ref())
    }

    /// Release `handle`; unknown or already released handles are ignored
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let index = self.index(handle)?;
        let value = self.slots[index].take()?;
        self.free.push(index);
        self.live -= 1;
        Some(value)
    }

    pub fn remove_all(&mut self, handles: impl IntoIterator<Item = Handle>) {
        for handle in handles {
            self.remove(handle);
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Release every entry
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.live = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_leaves_other_handles() {
        let mut registry = Registry::new();
        let handles: Vec<Handle> = (0..3).map(|i| registry.register(i)).collect();

        registry.remove_all([handles[0], handles[1]]);

        let present: Vec<bool> = handles.iter().map(|h| registry.has(*h)).collect();
        assert_eq!(present, vec![false, false, true]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut registry = Registry::new();
        let a = registry.register("a");
        let b = registry.register("b");
        registry.remove(a);

        let c = registry.register("c");
        assert_eq!(c, a);
        assert_ne!(c, b);
        assert_eq!(registry.get(c), Some(&"c"));
    }

    #[test]
    fn test_unknown_handles_are_ignored() {
        let mut registry: Registry<u8> = Registry::new();
        let h = registry.register(1);

        assert!(registry.remove(Handle(17)).is_none());
        assert!(registry.remove(Handle(-1)).is_none());
        assert!(!registry.has(Handle(-1)));
        assert_eq!(registry.remove(h), Some(1));
        assert!(registry.remove(h).is_none());
        assert!(registry.is_empty());
    }
}
