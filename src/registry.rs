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

//! Registry: central entity and archetype storage
//!
//! Orchestrates entity lifecycle, component add/remove with archetype
//! migration, and query resolution. Structural mutation requires `&mut
//! Registry`; shared `&Registry` borrows are what systems receive during a
//! wave, so the exclusive/shared lock discipline is the borrow checker's.

use std::sync::Arc;

use ahash::AHashMap;
use smallvec::SmallVec;

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::chunk::{transfer_row, Archetype, ArchetypeId};
use crate::component::{
    signature_of, Component, ComponentPack, EntityBuilder, MAX_PACK_COMPONENTS,
};
use crate::config::CoreConfig;
use crate::context::CoreContext;
use crate::entity::{Entity, EntityDirectory};
use crate::error::{CoreError, Result};
use crate::query::QueryBuilder;
use crate::signature::Signature;

/// Central ECS registry
pub struct Registry {
    ctx: Arc<CoreContext>,
    directory: EntityDirectory,
    archetypes: Vec<Archetype>,
    archetype_index: AHashMap<Signature, ArchetypeId>,
    /// Advances whenever an archetype is created; queries re-resolve
    /// lazily when they observe a newer value.
    archetype_generation: u64,
}

impl Registry {
    /// Create a registry with its own private context
    pub fn new(config: CoreConfig) -> Self {
        Self::with_context(CoreContext::new(config))
    }

    /// Create a registry sharing an existing context (and thus its
    /// component type registry and profiler) with other subsystems
    pub fn with_context(ctx: Arc<CoreContext>) -> Self {
        let mut registry = Self {
            ctx,
            directory: EntityDirectory::new(),
            archetypes: Vec::with_capacity(64),
            archetype_index: AHashMap::with_capacity(64),
            archetype_generation: 0,
        };
        // Bootstrap the empty archetype (entities with no components).
        // Always at index 0, which simplifies create().
        registry
            .ensure_archetype(Signature::EMPTY)
            .expect("empty archetype is always constructible");
        registry
    }

    pub fn context(&self) -> &Arc<CoreContext> {
        &self.ctx
    }

    /// Number of live entities
    pub fn entity_count(&self) -> usize {
        self.directory.len()
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// Current archetype-set version; advances when archetypes are created
    pub fn archetype_generation(&self) -> u64 {
        self.archetype_generation
    }

    /// Create an entity with no components
    pub fn create(&mut self) -> Result<Entity> {
        self.create_entity(())
    }

    /// Create an entity from a tuple pack of components
    pub fn create_entity<P: ComponentPack>(&mut self, pack: P) -> Result<Entity> {
        let ids = self.ctx.with_components_mut(|reg| P::register(reg))?;
        let signature = signature_of(&ids)?;

        #[cfg(feature = "profiling")]
        let _span = info_span!(
            "registry.create_entity",
            components = ids.len(),
            archetypes = self.archetypes.len()
        )
        .entered();

        let archetype_id = self.ensure_archetype(signature)?;
        let archetype = &mut self.archetypes[archetype_id.index()];

        let entity = self.directory.allocate(archetype_id, 0);
        let row = match unsafe { archetype.push_row(entity) } {
            Ok(row) => row,
            Err(err) => {
                let _ = self.directory.free(entity);
                return Err(err);
            }
        };
        self.directory.relocate(entity, archetype_id, row);

        // Member-order pointers for the pack writer
        let mut ptrs: SmallVec<[*mut u8; MAX_PACK_COMPONENTS]> = SmallVec::new();
        for &id in &ids {
            let column = archetype
                .column_index(id)
                .expect("pack component missing from its own archetype");
            ptrs.push(unsafe { archetype.component_ptr(row, column) });
        }
        unsafe { pack.write(&ptrs) };

        Ok(entity)
    }

    /// Create an entity from a dynamic [`EntityBuilder`] pack
    pub fn create_with(&mut self, mut builder: EntityBuilder) -> Result<Entity> {
        let blobs = self.ctx.with_components_mut(|reg| builder.blobs(reg))?;
        let ids: SmallVec<[_; MAX_PACK_COMPONENTS]> =
            blobs.iter().map(|(id, _, _)| *id).collect();
        let signature = signature_of(&ids)?;

        let archetype_id = self.ensure_archetype(signature)?;
        let archetype = &mut self.archetypes[archetype_id.index()];

        let entity = self.directory.allocate(archetype_id, 0);
        let row = match unsafe { archetype.push_row(entity) } {
            Ok(row) => row,
            Err(err) => {
                let _ = self.directory.free(entity);
                return Err(err);
            }
        };
        self.directory.relocate(entity, archetype_id, row);

        for &(id, ptr, size) in &blobs {
            let column = archetype.column_index(id).unwrap();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    ptr,
                    archetype.component_ptr(row, column),
                    size,
                );
            }
        }
        // Staged values now live in the chunk; the builder must not drop
        // them again.
        builder.disarm();

        Ok(entity)
    }

    /// Destroy an entity, dropping every component in its row exactly once
    pub fn destroy_entity(&mut self, entity: Entity) -> Result<()> {
        let (archetype_id, row) = self.directory.free(entity)?;
        let archetype = &mut self.archetypes[archetype_id.index()];
        let signature = archetype.signature();
        let displaced = unsafe { archetype.swap_remove_row(row, signature) };
        if let Some(moved) = displaced {
            self.directory.relocate(moved, archetype_id, row);
        }
        Ok(())
    }

    /// True if the handle refers to a live entity
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.directory.contains(entity)
    }

    /// Add a component, migrating the entity to the wider archetype
    pub fn add<T: Component>(&mut self, entity: Entity, value: T) -> Result<()> {
        let (src_id, row) = self.directory.resolve(entity)?;
        let id = self.ctx.register_component::<T>()?;

        let old_signature = self.archetypes[src_id.index()].signature();
        if old_signature.contains(id) {
            return Err(CoreError::DuplicateComponent);
        }
        let dst_id = self.ensure_archetype(old_signature.with(id))?;

        #[cfg(feature = "profiling")]
        let _span = info_span!("registry.add", component = std::any::type_name::<T>()).entered();

        let blob = (&value as *const T as *const u8, std::mem::size_of::<T>());
        let (src, dst) = self.two_archetypes_mut(src_id, dst_id);
        let (new_row, displaced) =
            unsafe { transfer_row(src, dst, row, &[(id, blob.0, blob.1)])? };
        // The value was moved into the destination column bitwise
        std::mem::forget(value);

        self.directory.relocate(entity, dst_id, new_row);
        if let Some(moved) = displaced {
            self.directory.relocate(moved, src_id, row);
        }
        Ok(())
    }

    /// Remove a component, migrating the entity to the narrower archetype
    /// and dropping the removed value
    pub fn remove<T: Component>(&mut self, entity: Entity) -> Result<()> {
        let (src_id, row) = self.directory.resolve(entity)?;
        let id = self
            .ctx
            .component_id::<T>()
            .ok_or(CoreError::MissingComponent)?;

        let old_signature = self.archetypes[src_id.index()].signature();
        if !old_signature.contains(id) {
            return Err(CoreError::MissingComponent);
        }
        let dst_id = self.ensure_archetype(old_signature.without(id))?;

        let (src, dst) = self.two_archetypes_mut(src_id, dst_id);
        let (new_row, displaced) = unsafe { transfer_row(src, dst, row, &[])? };

        self.directory.relocate(entity, dst_id, new_row);
        if let Some(moved) = displaced {
            self.directory.relocate(moved, src_id, row);
        }
        Ok(())
    }

    /// Shared reference to a component
    pub fn get<T: Component>(&self, entity: Entity) -> Result<&T> {
        let (archetype, column, row) = self.locate_component::<T>(entity)?;
        Ok(unsafe { &*(archetype.component_ptr(row, column) as *const T) })
    }

    /// Exclusive reference to a component
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Result<&mut T> {
        let (archetype, column, row) = self.locate_component::<T>(entity)?;
        Ok(unsafe { &mut *(archetype.component_ptr(row, column) as *mut T) })
    }

    /// Overwrite a component in place, dropping the previous value
    pub fn set<T: Component>(&mut self, entity: Entity, value: T) -> Result<()> {
        *self.get_mut::<T>(entity)? = value;
        Ok(())
    }

    /// Whether the entity currently has component `T`
    pub fn has<T: Component>(&self, entity: Entity) -> Result<bool> {
        let (archetype_id, _) = self.directory.resolve(entity)?;
        let Some(id) = self.ctx.component_id::<T>() else {
            return Ok(false);
        };
        Ok(self.archetypes[archetype_id.index()].signature().contains(id))
    }

    /// Start building a query
    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    /// Release chunk memory held by empty archetypes.
    ///
    /// Archetype records and ids stay valid; only backing slabs are freed.
    /// Must be called between frames, never while a wave is running.
    pub fn collect_empty_archetypes(&mut self) {
        for archetype in &mut self.archetypes {
            if archetype.is_empty() {
                archetype.release_empty_chunks();
            }
        }
    }

    pub(crate) fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    fn locate_component<T: Component>(
        &self,
        entity: Entity,
    ) -> Result<(&Archetype, usize, u32)> {
        let (archetype_id, row) = self.directory.resolve(entity)?;
        let id = self
            .ctx
            .component_id::<T>()
            .ok_or(CoreError::MissingComponent)?;
        let archetype = &self.archetypes[archetype_id.index()];
        let column = archetype
            .column_index(id)
            .ok_or(CoreError::MissingComponent)?;
        Ok((archetype, column, row))
    }

    fn ensure_archetype(&mut self, signature: Signature) -> Result<ArchetypeId> {
        if let Some(&id) = self.archetype_index.get(&signature) {
            return Ok(id);
        }
        let infos = self.ctx.component_infos(signature);
        let id = ArchetypeId(self.archetypes.len() as u32);
        let archetype = Archetype::new(
            id,
            signature,
            &infos,
            self.ctx.config().chunk_payload_bytes,
        )?;
        self.archetypes.push(archetype);
        self.archetype_index.insert(signature, id);
        self.archetype_generation += 1;
        Ok(id)
    }

    fn two_archetypes_mut(
        &mut self,
        a: ArchetypeId,
        b: ArchetypeId,
    ) -> (&mut Archetype, &mut Archetype) {
        let (a, b) = (a.index(), b.index());
        debug_assert_ne!(a, b);
        if a < b {
            let (head, tail) = self.archetypes.split_at_mut(b);
            (&mut head[a], &mut tail[0])
        } else {
            let (head, tail) = self.archetypes.split_at_mut(a);
            (&mut tail[0], &mut head[b])
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("entities", &self.entity_count())
            .field("archetypes", &self.archetype_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pos(f32, f32);
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Vel(f32, f32);
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Health(i32);

    fn registry() -> Registry {
        Registry::new(CoreConfig::default())
    }

    #[test]
    fn test_create_and_get() {
        let mut reg = registry();
        let e = reg.create_entity((Pos(1.0, 2.0), Vel(0.5, 0.0))).unwrap();
        assert_eq!(*reg.get::<Pos>(e).unwrap(), Pos(1.0, 2.0));
        assert_eq!(*reg.get::<Vel>(e).unwrap(), Vel(0.5, 0.0));
        assert_eq!(reg.get::<Health>(e), Err(CoreError::MissingComponent));
        assert_eq!(reg.entity_count(), 1);
    }

    #[test]
    fn test_create_empty() {
        let mut reg = registry();
        let e = reg.create().unwrap();
        assert!(reg.is_alive(e));
        assert_eq!(reg.has::<Pos>(e), Ok(false));
    }

    #[test]
    fn test_destroy_then_stale() {
        let mut reg = registry();
        let e = reg.create_entity((Pos(0.0, 0.0),)).unwrap();
        reg.destroy_entity(e).unwrap();
        assert_eq!(reg.get::<Pos>(e), Err(CoreError::StaleEntity));
        assert_eq!(reg.destroy_entity(e), Err(CoreError::StaleEntity));
        assert_eq!(reg.entity_count(), 0);
    }

    #[test]
    fn test_add_migrates_archetype() {
        let mut reg = registry();
        let e = reg.create_entity((Pos(1.0, 1.0),)).unwrap();
        reg.add(e, Vel(2.0, 0.0)).unwrap();

        assert_eq!(*reg.get::<Pos>(e).unwrap(), Pos(1.0, 1.0));
        assert_eq!(*reg.get::<Vel>(e).unwrap(), Vel(2.0, 0.0));
        assert_eq!(reg.add(e, Vel(9.9, 9.9)), Err(CoreError::DuplicateComponent));
    }

    #[test]
    fn test_remove_drops_and_narrows() {
        let mut reg = registry();
        let e = reg.create_entity((Pos(1.0, 1.0), Vel(2.0, 0.0))).unwrap();
        reg.remove::<Vel>(e).unwrap();

        assert_eq!(reg.has::<Vel>(e), Ok(false));
        assert_eq!(*reg.get::<Pos>(e).unwrap(), Pos(1.0, 1.0));
        assert_eq!(reg.remove::<Vel>(e), Err(CoreError::MissingComponent));
    }

    #[test]
    fn test_set_overwrites() {
        let mut reg = registry();
        let e = reg.create_entity((Health(10),)).unwrap();
        reg.set(e, Health(75)).unwrap();
        assert_eq!(*reg.get::<Health>(e).unwrap(), Health(75));
        assert_eq!(reg.set(e, Pos(0.0, 0.0)), Err(CoreError::MissingComponent));
    }

    #[test]
    fn test_swap_remove_directory_fixup() {
        let mut reg = registry();
        let first = reg.create_entity((Health(1),)).unwrap();
        let second = reg.create_entity((Health(2),)).unwrap();
        let third = reg.create_entity((Health(3),)).unwrap();

        // Destroying the first row swaps the last row into its place
        reg.destroy_entity(first).unwrap();
        assert_eq!(*reg.get::<Health>(second).unwrap(), Health(2));
        assert_eq!(*reg.get::<Health>(third).unwrap(), Health(3));
    }

    #[test]
    fn test_archetype_generation_advances() {
        let mut reg = registry();
        let before = reg.archetype_generation();
        reg.create_entity((Pos(0.0, 0.0),)).unwrap();
        assert!(reg.archetype_generation() > before);

        let mid = reg.archetype_generation();
        reg.create_entity((Pos(1.0, 1.0),)).unwrap();
        // Same signature, no new archetype
        assert_eq!(reg.archetype_generation(), mid);
    }

    #[test]
    fn test_create_with_builder() {
        let mut reg = registry();
        let builder = EntityBuilder::new()
            .with(Pos(3.0, 4.0))
            .with(Health(50));
        let e = reg.create_with(builder).unwrap();
        assert_eq!(*reg.get::<Pos>(e).unwrap(), Pos(3.0, 4.0));
        assert_eq!(*reg.get::<Health>(e).unwrap(), Health(50));
    }

    #[test]
    fn test_component_drop_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut reg = registry();
        let e = reg.create_entity((Tracked, Health(1))).unwrap();
        // Migration moves Tracked without dropping it
        reg.add(e, Pos(0.0, 0.0)).unwrap();
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);

        reg.destroy_entity(e).unwrap();
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_collect_empty_archetypes() {
        let mut reg = registry();
        let e = reg.create_entity((Pos(0.0, 0.0),)).unwrap();
        reg.destroy_entity(e).unwrap();
        let archetypes = reg.archetype_count();
        reg.collect_empty_archetypes();
        // Records survive collection; only chunk memory is released
        assert_eq!(reg.archetype_count(), archetypes);
    }
}
