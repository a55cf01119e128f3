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

//! Query engine with archetype filtering
//!
//! A query compiles include / exclude / optional masks into a cached list
//! of matching archetypes. The cache is invalidated by the registry's
//! archetype-generation counter and refreshed incrementally: archetypes
//! are never destroyed, so only newly created ones need scanning.
//!
//! Iteration is chunk-at-a-time. Column offsets were computed once at
//! archetype creation, so a [`ChunkView`] only hands out pointers; no
//! per-row hashing happens on the hot path.

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::chunk::{Archetype, ArchetypeId};
use crate::component::Component;
use crate::context::CoreContext;
use crate::entity::Entity;
use crate::registry::Registry;
use crate::signature::Signature;

/// Builder for [`Query`] masks
///
/// Never fails: a `with` on a type no entity has simply yields a query
/// that matches nothing.
pub struct QueryBuilder<'r> {
    registry: &'r Registry,
    include: Signature,
    exclude: Signature,
    optional: Signature,
    impossible: bool,
}

impl<'r> QueryBuilder<'r> {
    pub(crate) fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            include: Signature::EMPTY,
            exclude: Signature::EMPTY,
            optional: Signature::EMPTY,
            impossible: false,
        }
    }

    /// Require component `T`
    pub fn with<T: Component>(mut self) -> Self {
        match self.registry.context().component_id::<T>() {
            Some(id) => self.include = self.include.with(id),
            // Unregistered type: nothing can match
            None => self.impossible = true,
        }
        self
    }

    /// Reject entities with component `T`
    pub fn without<T: Component>(mut self) -> Self {
        if let Some(id) = self.registry.context().component_id::<T>() {
            self.exclude = self.exclude.with(id);
        }
        self
    }

    /// Expose component `T` where present, without gating on it
    pub fn optional<T: Component>(mut self) -> Self {
        if let Some(id) = self.registry.context().component_id::<T>() {
            self.optional = self.optional.with(id);
        }
        self
    }

    /// Compile the masks into a reusable query
    pub fn resolve(self) -> Query {
        Query {
            include: self.include,
            exclude: self.exclude,
            optional: self.optional,
            impossible: self.impossible,
            cache: Mutex::new(QueryCache {
                matched: Vec::new(),
                seen_archetypes: 0,
                generation: u64::MAX,
            }),
        }
    }
}

struct QueryCache {
    matched: Vec<ArchetypeId>,
    seen_archetypes: usize,
    generation: u64,
}

/// Compiled query over include / exclude / optional signature masks
pub struct Query {
    include: Signature,
    exclude: Signature,
    optional: Signature,
    impossible: bool,
    cache: Mutex<QueryCache>,
}

impl Query {
    pub fn include(&self) -> Signature {
        self.include
    }

    pub fn exclude(&self) -> Signature {
        self.exclude
    }

    pub fn optional(&self) -> Signature {
        self.optional
    }

    fn matches(&self, signature: Signature) -> bool {
        self.include.is_subset_of(signature) && !self.exclude.intersects(signature)
    }

    /// Matching archetype ids, refreshing the cache if the registry's
    /// archetype set advanced
    fn matched(&self, registry: &Registry) -> SmallVec<[ArchetypeId; 16]> {
        if self.impossible {
            return SmallVec::new();
        }
        let mut cache = self.cache.lock();
        if cache.generation != registry.archetype_generation() {
            let archetypes = registry.archetypes();
            for archetype in &archetypes[cache.seen_archetypes..] {
                if self.matches(archetype.signature()) {
                    cache.matched.push(archetype.id());
                }
            }
            cache.seen_archetypes = archetypes.len();
            cache.generation = registry.archetype_generation();
        }
        cache.matched.iter().copied().collect()
    }

    /// Visit every non-empty chunk of every matching archetype
    pub fn for_each_chunk<'r, F>(&self, registry: &'r Registry, mut f: F)
    where
        F: FnMut(ChunkView<'r>),
    {
        for id in self.matched(registry) {
            let archetype = &registry.archetypes()[id.index()];
            for chunk in 0..archetype.chunk_count() {
                let rows = archetype.chunk_rows(chunk);
                if rows == 0 {
                    continue;
                }
                f(ChunkView {
                    ctx: registry.context(),
                    archetype,
                    chunk,
                    rows,
                });
            }
        }
    }

    /// Visit every non-empty chunk with write access, under an exclusive
    /// registry borrow
    pub fn for_each_chunk_mut<F>(&self, registry: &mut Registry, mut f: F)
    where
        F: FnMut(ChunkViewMut<'_>),
    {
        // The exclusive borrow makes the mutable views sound
        self.for_each_chunk(registry, |view| f(ChunkViewMut { view }));
    }

    /// Visit every matching row
    pub fn for_each_row<'r, F>(&self, registry: &'r Registry, mut f: F)
    where
        F: FnMut(Entity, RowView<'r>),
    {
        self.for_each_chunk(registry, |view| {
            let entities = view.entities();
            for row in 0..view.len() {
                f(entities[row], RowView { view, row });
            }
        });
    }

    /// Number of matching entities
    pub fn count(&self, registry: &Registry) -> usize {
        self.matched(registry)
            .iter()
            .map(|id| registry.archetypes()[id.index()].len())
            .sum()
    }

    /// Collect every matching entity handle
    pub fn entities(&self, registry: &Registry) -> Vec<Entity> {
        let mut out = Vec::with_capacity(self.count(registry));
        self.for_each_chunk(registry, |view| out.extend_from_slice(view.entities()));
        out
    }
}

/// One chunk's worth of rows from a matching archetype
///
/// Columns are exposed as typed slices over the chunk's stable backing
/// storage. Shared reads are safe; writes go through
/// [`column_mut`](ChunkView::column_mut), whose soundness is the parallel
/// scheduler's conflict rule (no two concurrently running systems may
/// touch a column one of them writes) or an exclusive registry borrow.
#[derive(Clone, Copy)]
pub struct ChunkView<'r> {
    ctx: &'r std::sync::Arc<CoreContext>,
    archetype: &'r Archetype,
    chunk: usize,
    rows: usize,
}

impl<'r> ChunkView<'r> {
    /// Rows in this chunk
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn signature(&self) -> Signature {
        self.archetype.signature()
    }

    /// Entity handle for each row
    pub fn entities(&self) -> &'r [Entity] {
        self.archetype.chunk_entities(self.chunk)
    }

    fn column_ptr<T: Component>(&self) -> Option<*mut T> {
        let id = self.ctx.component_id::<T>()?;
        let column = self.archetype.column_index(id)?;
        debug_assert_eq!(
            self.archetype.layout().columns[column].info.size,
            std::mem::size_of::<T>()
        );
        Some(unsafe { self.archetype.chunk_column_ptr(self.chunk, column) as *mut T })
    }

    /// Typed read access to a column; `None` when the archetype lacks `T`
    /// (optional columns)
    pub fn column<T: Component>(&self) -> Option<&'r [T]> {
        let ptr = self.column_ptr::<T>()?;
        Some(unsafe { std::slice::from_raw_parts(ptr, self.rows) })
    }

    /// Typed write access to a column
    ///
    /// # Safety
    /// The caller must have exclusive access to this (component, archetype)
    /// column for the duration of the borrow: either it holds `&mut
    /// Registry`, or it runs inside a wave as a system that declared the
    /// component in its writes and the conflict rule excludes every other
    /// concurrent toucher.
    pub unsafe fn column_mut<T: Component>(&self) -> Option<&'r mut [T]> {
        let ptr = self.column_ptr::<T>()?;
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, self.rows) })
    }

    /// Read one component instance
    pub fn read<T: Component>(&self, row: usize) -> Option<&'r T> {
        self.column::<T>()?.get(row)
    }
}

/// [`ChunkView`] obtained through an exclusive registry borrow; write
/// access is safe here
pub struct ChunkViewMut<'r> {
    view: ChunkView<'r>,
}

impl<'r> std::ops::Deref for ChunkViewMut<'r> {
    type Target = ChunkView<'r>;

    fn deref(&self) -> &Self::Target {
        &self.view
    }
}

impl<'r> ChunkViewMut<'r> {
    /// Typed write access to a column
    pub fn column_mut<T: Component>(&mut self) -> Option<&mut [T]> {
        // Sound: the registry was exclusively borrowed to create this view
        // and `&mut self` prevents overlapping column borrows.
        unsafe { self.view.column_mut::<T>() }
    }
}

/// One row of a [`ChunkView`]
#[derive(Clone, Copy)]
pub struct RowView<'r> {
    view: ChunkView<'r>,
    row: usize,
}

impl<'r> RowView<'r> {
    pub fn get<T: Component>(&self) -> Option<&'r T> {
        self.view.read::<T>(self.row)
    }

    /// # Safety
    /// As [`ChunkView::column_mut`].
    pub unsafe fn get_mut<T: Component>(&self) -> Option<&'r mut T> {
        unsafe { self.view.column_mut::<T>() }.and_then(|slice| slice.get_mut(self.row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pos(f32);
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Vel(f32);
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Tag;

    fn registry() -> Registry {
        Registry::new(CoreConfig::default())
    }

    #[test]
    fn test_include_matching() {
        let mut reg = registry();
        reg.create_entity((Pos(1.0),)).unwrap();
        reg.create_entity((Pos(2.0), Vel(0.1))).unwrap();
        reg.create_entity((Vel(0.2),)).unwrap();

        let query = reg.query().with::<Pos>().resolve();
        assert_eq!(query.count(&reg), 2);

        let both = reg.query().with::<Pos>().with::<Vel>().resolve();
        assert_eq!(both.count(&reg), 1);
    }

    #[test]
    fn test_exclude_matching() {
        let mut reg = registry();
        reg.create_entity((Pos(1.0),)).unwrap();
        reg.create_entity((Pos(2.0), Vel(0.1))).unwrap();

        let query = reg.query().with::<Pos>().without::<Vel>().resolve();
        assert_eq!(query.count(&reg), 1);
        let entities = query.entities(&reg);
        assert_eq!(*reg.get::<Pos>(entities[0]).unwrap(), Pos(1.0));
    }

    #[test]
    fn test_optional_column() {
        let mut reg = registry();
        reg.create_entity((Pos(1.0),)).unwrap();
        reg.create_entity((Pos(2.0), Vel(0.5))).unwrap();

        let query = reg.query().with::<Pos>().optional::<Vel>().resolve();
        let mut with_vel = 0;
        let mut without_vel = 0;
        query.for_each_chunk(&reg, |view| {
            match view.column::<Vel>() {
                Some(vels) => with_vel += vels.len(),
                None => without_vel += view.len(),
            }
        });
        assert_eq!(with_vel, 1);
        assert_eq!(without_vel, 1);
    }

    #[test]
    fn test_unregistered_with_matches_nothing() {
        let mut reg = registry();
        reg.create_entity((Pos(1.0),)).unwrap();

        // Vel was never registered
        let query = reg.query().with::<Vel>().resolve();
        assert_eq!(query.count(&reg), 0);
    }

    #[test]
    fn test_cache_refreshes_on_new_archetype() {
        let mut reg = registry();
        reg.create_entity((Pos(1.0),)).unwrap();

        let query = reg.query().with::<Pos>().resolve();
        assert_eq!(query.count(&reg), 1);

        // A new archetype appears after the query was resolved
        reg.create_entity((Pos(2.0), Vel(0.1))).unwrap();
        assert_eq!(query.count(&reg), 2);
    }

    #[test]
    fn test_for_each_chunk_mut_writes() {
        let mut reg = registry();
        for i in 0..10 {
            reg.create_entity((Pos(i as f32), Vel(1.0))).unwrap();
        }

        let query = reg.query().with::<Pos>().with::<Vel>().resolve();
        query.for_each_chunk_mut(&mut reg, |mut view| {
            let vels: Vec<Vel> = view.column::<Vel>().unwrap().to_vec();
            let poses = view.column_mut::<Pos>().unwrap();
            for (pos, vel) in poses.iter_mut().zip(vels) {
                pos.0 += vel.0;
            }
        });

        let sum: f32 = {
            let mut total = 0.0;
            query.for_each_chunk(&reg, |view| {
                total += view.column::<Pos>().unwrap().iter().map(|p| p.0).sum::<f32>();
            });
            total
        };
        // 0..10 summed, each bumped by 1.0
        assert_eq!(sum, 45.0 + 10.0);
    }

    #[test]
    fn test_for_each_row() {
        let mut reg = registry();
        let a = reg.create_entity((Pos(1.0), Tag)).unwrap();
        reg.create_entity((Pos(2.0),)).unwrap();

        let query = reg.query().with::<Pos>().with::<Tag>().resolve();
        let mut seen = Vec::new();
        query.for_each_row(&reg, |entity, row| {
            seen.push((entity, *row.get::<Pos>().unwrap()));
        });
        assert_eq!(seen, vec![(a, Pos(1.0))]);
    }
}
