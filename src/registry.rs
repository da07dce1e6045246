//! Open handle bookkeeping.
//!
//! Handles live in a [`slab::Slab`]; a [`HandleId`] pairs the slot index
//! with the generation the slot had when the handle was inserted, so an id
//! kept past `close` never reaches a handle that later reused the slot.

use slab::Slab;

use crate::vfile::VirtualFile;
use crate::writer::{AppendSession, WriteSession};

/// An open handle.  The variant is fixed at open time.
#[derive(Debug)]
pub enum Handle {
    Read(VirtualFile),
    Write(WriteSession),
    Append(AppendSession),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Read,
    Write,
    Append,
}

impl Handle {
    pub fn kind(&self) -> HandleKind {
        match self {
            Handle::Read(_) => HandleKind::Read,
            Handle::Write(_) => HandleKind::Write,
            Handle::Append(_) => HandleKind::Append,
        }
    }
}

impl std::fmt::Display for HandleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HandleKind::Read => "read",
            HandleKind::Write => "write",
            HandleKind::Append => "append",
        };
        f.write_str(s)
    }
}

/// Opaque reference to a registered handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    index: u32,
    generation: u32,
}

impl HandleId {
    /// Pack into a single integer for hosts that need a plain token.
    pub fn into_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

struct Entry {
    generation: u32,
    handle: Handle,
}

#[derive(Default)]
pub struct HandleRegistry {
    slots: Slab<Entry>,
    next_generation: u32,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: Handle) -> HandleId {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let index = self.slots.insert(Entry { generation, handle });
        HandleId {
            index: index as u32,
            generation,
        }
    }

    pub fn get(&self, id: HandleId) -> Option<&Handle> {
        self.slots
            .get(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .map(|e| &e.handle)
    }

    pub fn get_mut(&mut self, id: HandleId) -> Option<&mut Handle> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .map(|e| &mut e.handle)
    }

    /// Release a handle.  Unknown and stale ids yield `None`.
    pub fn remove(&mut self, id: HandleId) -> Option<Handle> {
        if self.get(id).is_none() {
            return None;
        }
        Some(self.slots.remove(id.index as usize).handle)
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Take every handle out, leaving the registry empty.
    pub fn drain(&mut self) -> Vec<(HandleId, Handle)> {
        std::mem::take(&mut self.slots)
            .into_iter()
            .map(|(index, e)| {
                let id = HandleId {
                    index: index as u32,
                    generation: e.generation,
                };
                (id, e.handle)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_handle(name: &str) -> Handle {
        Handle::Read(VirtualFile::new(
            "b".into(),
            name.into(),
            0,
            vec![name.into()],
            vec![1],
        ))
    }

    fn glob_of(handle: &Handle) -> &str {
        match handle {
            Handle::Read(file) => file.object_glob(),
            _ => panic!("not a read handle"),
        }
    }

    #[test]
    fn test_close_first_of_three() {
        let mut registry = HandleRegistry::new();
        let first = registry.insert(read_handle("one"));
        let second = registry.insert(read_handle("two"));
        let third = registry.insert(read_handle("three"));
        assert_eq!(registry.len(), 3);

        let removed = registry.remove(first).unwrap();
        assert_eq!(glob_of(&removed), "one");
        assert_eq!(registry.len(), 2);
        assert_eq!(glob_of(registry.get(second).unwrap()), "two");
        assert_eq!(glob_of(registry.get(third).unwrap()), "three");
    }

    #[test]
    fn test_unknown_id_is_none() {
        let mut registry = HandleRegistry::new();
        registry.insert(read_handle("one"));
        let bogus = HandleId::from_raw(0xdead_beef);
        assert!(registry.remove(bogus).is_none());
        assert!(registry.get_mut(bogus).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_id_does_not_reach_reused_slot() {
        let mut registry = HandleRegistry::new();
        let old = registry.insert(read_handle("old"));
        registry.remove(old).unwrap();
        let new = registry.insert(read_handle("new"));
        assert_ne!(old, new);
        assert!(registry.get(old).is_none());
        assert!(registry.remove(old).is_none());
        assert!(registry.contains(new));
    }

    #[test]
    fn test_raw_round_trip_and_kind() {
        let mut registry = HandleRegistry::new();
        registry.insert(read_handle("a"));
        let id = registry.insert(read_handle("b"));
        assert_eq!(HandleId::from_raw(id.into_raw()), id);
        assert_eq!(registry.get(id).unwrap().kind(), HandleKind::Read);
        assert_eq!(HandleKind::Append.to_string(), "append");
    }

    #[test]
    fn test_drain_empties() {
        let mut registry = HandleRegistry::new();
        registry.insert(read_handle("a"));
        registry.insert(read_handle("b"));
        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
