// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Entity handles and the entity directory.
//!
//! Handles are (index, generation) pairs; the directory is a dense slot
//! array with an intrusive freelist. Indices are recycled after destroy
//! with a bumped generation, so stale handles are detectable. Directory
//! writes only happen under an exclusive registry borrow; shared reads
//! need no synchronization.

use std::fmt;

use crate::chunk::ArchetypeId;
use crate::error::{CoreError, Result};

/// Opaque entity handle: 32-bit index plus 32-bit generation
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    index: u32,
    generation: u32,
}

impl Entity {
    /// Reserved null handle; never refers to a live entity
    pub const NULL: Entity = Entity {
        index: u32::MAX,
        generation: 0,
    };

    pub(crate) const fn from_parts(index: u32, generation: u32) -> Self {
        Entity { index, generation }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    pub fn is_null(self) -> bool {
        self.index == u32::MAX
    }
}

impl Default for Entity {
    fn default() -> Self {
        Entity::NULL
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Entity(null)")
        } else {
            write!(f, "Entity({}v{})", self.index, self.generation)
        }
    }
}

const NO_SLOT: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
enum SlotState {
    Free { next_free: u32 },
    Occupied { archetype: ArchetypeId, row: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    generation: u32,
    state: SlotState,
}

/// Maps live entity handles to their (archetype, row) location
///
/// Generation is preserved across Free → Occupied and bumped on destroy;
/// a slot's generation wraps after 2³² destroys, at which point stale-handle
/// detection can alias. That is documented as out of contract.
pub(crate) struct EntityDirectory {
    slots: Vec<Slot>,
    free_head: u32,
    live: usize,
}

impl EntityDirectory {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: NO_SLOT,
            live: 0,
        }
    }

    /// Number of live entities
    pub fn len(&self) -> usize {
        self.live
    }

    /// Allocate a handle pointing at the given location
    pub fn allocate(&mut self, archetype: ArchetypeId, row: u32) -> Entity {
        self.live += 1;
        if self.free_head != NO_SLOT {
            let index = self.free_head;
            let slot = &mut self.slots[index as usize];
            let SlotState::Free { next_free } = slot.state else {
                unreachable!("freelist head points at an occupied slot");
            };
            self.free_head = next_free;
            slot.state = SlotState::Occupied { archetype, row };
            return Entity::from_parts(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        assert!(index < u32::MAX, "entity index space exhausted");
        self.slots.push(Slot {
            generation: 0,
            state: SlotState::Occupied { archetype, row },
        });
        Entity::from_parts(index, 0)
    }

    /// Resolve a handle to its location
    pub fn resolve(&self, entity: Entity) -> Result<(ArchetypeId, u32)> {
        let slot = self
            .slots
            .get(entity.index as usize)
            .ok_or(CoreError::UnknownEntity)?;
        match slot.state {
            SlotState::Occupied { archetype, row } => {
                if slot.generation == entity.generation {
                    Ok((archetype, row))
                } else {
                    Err(CoreError::StaleEntity)
                }
            }
            SlotState::Free { .. } => {
                if slot.generation == entity.generation {
                    // The handle named this slot's current lifetime, but
                    // the entity is gone.
                    Err(CoreError::UnknownEntity)
                } else {
                    Err(CoreError::StaleEntity)
                }
            }
        }
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.resolve(entity).is_ok()
    }

    /// Free a handle's slot, bumping its generation, and return the prior
    /// location
    pub fn free(&mut self, entity: Entity) -> Result<(ArchetypeId, u32)> {
        let location = self.resolve(entity)?;
        let slot = &mut self.slots[entity.index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = SlotState::Free {
            next_free: self.free_head,
        };
        self.free_head = entity.index;
        self.live -= 1;
        Ok(location)
    }

    /// Repoint a live handle at a new location (archetype migration or
    /// swap-remove fixup)
    pub fn relocate(&mut self, entity: Entity, archetype: ArchetypeId, row: u32) {
        let slot = &mut self.slots[entity.index as usize];
        debug_assert_eq!(slot.generation, entity.generation);
        debug_assert!(matches!(slot.state, SlotState::Occupied { .. }));
        slot.state = SlotState::Occupied { archetype, row };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARCH: ArchetypeId = ArchetypeId(0);

    #[test]
    fn test_allocate_and_resolve() {
        let mut dir = EntityDirectory::new();
        let e = dir.allocate(ARCH, 5);
        assert_eq!(dir.resolve(e), Ok((ARCH, 5)));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_free_then_stale() {
        let mut dir = EntityDirectory::new();
        let e = dir.allocate(ARCH, 0);
        dir.free(e).unwrap();

        // Slot is free; the old handle's generation no longer matches
        assert_eq!(dir.resolve(e), Err(CoreError::StaleEntity));
        assert_eq!(dir.len(), 0);
    }

    #[test]
    fn test_index_reuse_bumps_generation() {
        let mut dir = EntityDirectory::new();
        let first = dir.allocate(ARCH, 0);
        dir.free(first).unwrap();
        let second = dir.allocate(ARCH, 1);

        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert_eq!(dir.resolve(first), Err(CoreError::StaleEntity));
        assert_eq!(dir.resolve(second), Ok((ARCH, 1)));
    }

    #[test]
    fn test_unknown_index() {
        let dir = EntityDirectory::new();
        let bogus = Entity::from_parts(42, 0);
        assert_eq!(dir.resolve(bogus), Err(CoreError::UnknownEntity));
    }

    #[test]
    fn test_freelist_lifo_order() {
        let mut dir = EntityDirectory::new();
        let a = dir.allocate(ARCH, 0);
        let b = dir.allocate(ARCH, 1);
        dir.free(a).unwrap();
        dir.free(b).unwrap();

        // Most recently freed index comes back first
        let c = dir.allocate(ARCH, 2);
        assert_eq!(c.index(), b.index());
    }

    #[test]
    fn test_relocate() {
        let mut dir = EntityDirectory::new();
        let e = dir.allocate(ARCH, 0);
        dir.relocate(e, ArchetypeId(3), 9);
        assert_eq!(dir.resolve(e), Ok((ArchetypeId(3), 9)));
    }

    #[test]
    fn test_null_handle() {
        let dir = EntityDirectory::new();
        assert!(Entity::NULL.is_null());
        assert_eq!(dir.resolve(Entity::NULL), Err(CoreError::UnknownEntity));
    }
}
