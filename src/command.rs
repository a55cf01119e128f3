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

//! Deferred structural mutation
//!
//! Structural registry mutations are forbidden inside a running wave, so
//! systems record them into a [`CommandBuffer`] and the caller applies the
//! buffer between frames (or between waves) under the exclusive borrow.

use crate::component::{Component, ComponentPack};
use crate::entity::Entity;
use crate::error::Result;
use crate::registry::Registry;

/// Type alias for deferred registry mutation closures
pub type CommandClosure = Box<dyn FnOnce(&mut Registry) -> Result<()> + Send>;

/// Deferred structural command
pub enum Command {
    /// Create an entity from a recorded pack
    Create(CommandClosure),

    /// Destroy an entity
    Destroy(Entity),

    /// Arbitrary registry mutation
    Custom(CommandClosure),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Create(_) => write!(f, "Create(...)"),
            Command::Destroy(entity) => f.debug_tuple("Destroy").field(entity).finish(),
            Command::Custom(_) => write!(f, "Custom(...)"),
        }
    }
}

/// Buffer of structural mutations to apply outside the wave
#[derive(Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            commands: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Record an entity creation
    pub fn create<P: ComponentPack>(&mut self, pack: P) {
        self.commands.push(Command::Create(Box::new(move |registry| {
            registry.create_entity(pack).map(|_| ())
        })));
    }

    /// Record an entity destruction
    pub fn destroy(&mut self, entity: Entity) {
        self.commands.push(Command::Destroy(entity));
    }

    /// Record a component add
    pub fn add<T: Component>(&mut self, entity: Entity, value: T) {
        self.commands.push(Command::Custom(Box::new(move |registry| {
            registry.add(entity, value)
        })));
    }

    /// Record a component remove
    pub fn remove<T: Component>(&mut self, entity: Entity) {
        self.commands.push(Command::Custom(Box::new(move |registry| {
            registry.remove::<T>(entity)
        })));
    }

    /// Record an arbitrary mutation
    pub fn push(&mut self, f: impl FnOnce(&mut Registry) -> Result<()> + Send + 'static) {
        self.commands.push(Command::Custom(Box::new(f)));
    }

    /// Apply every recorded command in order.
    ///
    /// Stops at the first error; unapplied commands stay in the buffer.
    pub fn apply(&mut self, registry: &mut Registry) -> Result<()> {
        let mut pending = std::mem::take(&mut self.commands).into_iter();
        for command in pending.by_ref() {
            let result = match command {
                Command::Create(f) | Command::Custom(f) => f(registry),
                Command::Destroy(entity) => registry.destroy_entity(entity),
            };
            if let Err(err) = result {
                self.commands = pending.collect();
                return Err(err);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("commands", &self.commands.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::error::CoreError;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Hp(u32);
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Armor(u32);

    #[test]
    fn test_deferred_create_and_destroy() {
        let mut registry = Registry::new(CoreConfig::default());
        let existing = registry.create_entity((Hp(1),)).unwrap();

        let mut buffer = CommandBuffer::new();
        buffer.create((Hp(2), Armor(3)));
        buffer.destroy(existing);
        assert_eq!(buffer.len(), 2);

        buffer.apply(&mut registry).unwrap();
        assert!(buffer.is_empty());
        assert!(!registry.is_alive(existing));
        assert_eq!(registry.entity_count(), 1);
    }

    #[test]
    fn test_deferred_add_remove() {
        let mut registry = Registry::new(CoreConfig::default());
        let entity = registry.create_entity((Hp(10),)).unwrap();

        let mut buffer = CommandBuffer::new();
        buffer.add(entity, Armor(5));
        buffer.apply(&mut registry).unwrap();
        assert_eq!(*registry.get::<Armor>(entity).unwrap(), Armor(5));

        buffer.remove::<Armor>(entity);
        buffer.apply(&mut registry).unwrap();
        assert_eq!(registry.has::<Armor>(entity), Ok(false));
    }

    #[test]
    fn test_error_keeps_unapplied_tail() {
        let mut registry = Registry::new(CoreConfig::default());
        let entity = registry.create_entity((Hp(1),)).unwrap();
        registry.destroy_entity(entity).unwrap();

        let mut buffer = CommandBuffer::new();
        buffer.destroy(entity); // stale
        buffer.create((Hp(9),));

        assert_eq!(buffer.apply(&mut registry), Err(CoreError::StaleEntity));
        // The create after the failing command is still pending
        assert_eq!(buffer.len(), 1);
        buffer.apply(&mut registry).unwrap();
        assert_eq!(registry.entity_count(), 1);
    }
}
