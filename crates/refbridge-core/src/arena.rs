//! Generational arena backing every host table.
//!
//! Entries are stored in a Vec with generation tracking. When an entry is
//! removed its slot is reused but the generation is incremented, so a handle
//! kept across a removal fails its liveness check instead of aliasing the new
//! occupant. Generations start at 1, which keeps the packed form of a live
//! handle non-zero and lets `0` stand for null in host memory.

use std::fmt;
use std::marker::PhantomData;

/// Raw generational index shared by all typed handles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawId {
    /// Slot index
    pub index: u32,
    /// Generation for use-after-free detection
    pub generation: u32,
}

impl RawId {
    /// The null id. No arena ever hands it out.
    pub const NULL: RawId = RawId {
        index: 0,
        generation: 0,
    };

    /// Pack into a single `u64` suitable for storing in host memory.
    #[inline]
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Unpack a value produced by [`RawId::to_bits`].
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        RawId {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }

    /// Check if this is the null id.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.generation == 0
    }
}

/// A typed handle into an [`Arena`].
pub trait ArenaId: Copy + Eq + std::hash::Hash + fmt::Debug {
    /// Wrap a raw id.
    fn from_raw(raw: RawId) -> Self;
    /// Unwrap to the raw id.
    fn raw(self) -> RawId;
}

/// Declares a typed arena handle.
#[macro_export]
macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub $crate::arena::RawId);

        impl $name {
            /// The null handle.
            pub const NULL: $name = $name($crate::arena::RawId::NULL);

            /// Pack into a single `u64`.
            #[inline]
            pub const fn to_bits(self) -> u64 {
                self.0.to_bits()
            }

            /// Unpack a value produced by `to_bits`.
            #[inline]
            pub const fn from_bits(bits: u64) -> Self {
                $name($crate::arena::RawId::from_bits(bits))
            }

            /// Check if this is the null handle.
            #[inline]
            pub const fn is_null(self) -> bool {
                self.0.is_null()
            }
        }

        impl $crate::arena::ArenaId for $name {
            #[inline]
            fn from_raw(raw: $crate::arena::RawId) -> Self {
                $name(raw)
            }

            #[inline]
            fn raw(self) -> $crate::arena::RawId {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::NULL
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({}v{})", stringify!($name), self.0.index, self.0.generation)
            }
        }
    };
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generational storage keyed by a typed handle.
pub struct Arena<I: ArenaId, T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    len: usize,
    _marker: PhantomData<I>,
}

impl<I: ArenaId, T> Arena<I, T> {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            len: 0,
            _marker: PhantomData,
        }
    }

    /// Insert a value and return its handle.
    pub fn insert(&mut self, value: T) -> I {
        self.len += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            I::from_raw(RawId {
                index,
                generation: slot.generation,
            })
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 1,
                value: Some(value),
            });
            I::from_raw(RawId {
                index,
                generation: 1,
            })
        }
    }

    /// Get an entry. Returns None if the handle is null or stale.
    pub fn get(&self, id: I) -> Option<&T> {
        let raw = id.raw();
        let slot = self.slots.get(raw.index as usize)?;
        if slot.generation != raw.generation {
            return None;
        }
        slot.value.as_ref()
    }

    /// Get a mutable entry. Returns None if the handle is null or stale.
    pub fn get_mut(&mut self, id: I) -> Option<&mut T> {
        let raw = id.raw();
        let slot = self.slots.get_mut(raw.index as usize)?;
        if slot.generation != raw.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Check whether a handle still refers to a live entry.
    pub fn contains(&self, id: I) -> bool {
        self.get(id).is_some()
    }

    /// Remove an entry, bumping the slot generation.
    pub fn remove(&mut self, id: I) -> Option<T> {
        let raw = id.raw();
        if let Some(slot) = self.slots.get_mut(raw.index as usize)
            && slot.generation == raw.generation
            && slot.value.is_some()
        {
            let value = slot.value.take();
            slot.generation = slot.generation.wrapping_add(1).max(1);
            self.free_list.push(raw.index);
            self.len -= 1;
            return value;
        }
        None
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the arena has no live entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over live entries.
    pub fn iter(&self) -> impl Iterator<Item = (I, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    I::from_raw(RawId {
                        index: index as u32,
                        generation: slot.generation,
                    }),
                    value,
                )
            })
        })
    }
}

impl<I: ArenaId, T> Default for Arena<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: ArenaId, T> fmt::Debug for Arena<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("slot_count", &self.slots.len())
            .field("live", &self.len)
            .field("free_count", &self.free_list.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    arena_id!(TestId);

    #[test]
    fn insert_and_get() {
        let mut arena: Arena<TestId, &str> = Arena::new();
        let id = arena.insert("a");
        assert_eq!(arena.get(id), Some(&"a"));
        assert_eq!(arena.len(), 1);
        assert!(!id.is_null());
    }

    #[test]
    fn removed_handle_is_stale() {
        let mut arena: Arena<TestId, u32> = Arena::new();
        let old = arena.insert(1);
        assert_eq!(arena.remove(old), Some(1));
        let new = arena.insert(2);

        assert_eq!(old.0.index, new.0.index);
        assert_ne!(old, new);
        assert!(arena.get(old).is_none());
        assert_eq!(arena.get(new), Some(&2));
        assert!(arena.remove(old).is_none());
    }

    #[test]
    fn null_never_resolves() {
        let mut arena: Arena<TestId, u32> = Arena::new();
        arena.insert(7);
        assert!(arena.get(TestId::NULL).is_none());
        assert_eq!(TestId::NULL.to_bits(), 0);
    }

    #[test]
    fn bits_roundtrip() {
        let mut arena: Arena<TestId, u32> = Arena::new();
        for i in 0..5 {
            arena.insert(i);
        }
        let id = arena.insert(99);
        assert_eq!(TestId::from_bits(id.to_bits()), id);
        assert_eq!(arena.get(TestId::from_bits(id.to_bits())), Some(&99));
    }

    #[test]
    fn iter_skips_removed() {
        let mut arena: Arena<TestId, u32> = Arena::new();
        let a = arena.insert(1);
        arena.insert(2);
        arena.remove(a);
        let values: Vec<u32> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![2]);
    }
}
