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

//! Component type registry and component packs
//!
//! Maps each concrete component type to a stable small-integer id plus a
//! layout/drop vtable. Ids are assigned lowest-unused-first on registration
//! and never reused for the lifetime of the registry.

use std::any::TypeId;
use std::fmt;
use std::ptr::NonNull;

use bumpalo::Bump;
use smallvec::SmallVec;

use crate::error::{CoreError, Result};
use crate::signature::Signature;

/// Hard ceiling on distinct component types (one signature bit each)
pub const MAX_COMPONENT_TYPES: usize = 64;

/// Maximum number of components in a tuple pack
pub const MAX_PACK_COMPONENTS: usize = 8;

/// Marker trait for components
///
/// Components must be 'static (no borrowed data)
pub trait Component: 'static + Send + Sync {}

/// Automatically implement Component for all valid types
impl<T: 'static + Send + Sync> Component for T {}

/// Stable small-integer component type identifier (0..64)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentTypeId(u8);

impl ComponentTypeId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) const fn from_index(index: usize) -> Self {
        ComponentTypeId(index as u8)
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

/// Per-type layout and drop vtable
///
/// Relocation is bitwise: Rust values move by memcpy and the source bytes
/// are simply never dropped afterwards, so no separate move entry exists.
#[derive(Clone, Copy)]
pub struct ComponentInfo {
    pub id: ComponentTypeId,
    pub size: usize,
    pub align: usize,
    /// Drops `count` contiguous instances starting at `ptr`. `None` for
    /// types without drop glue.
    pub drop_fn: Option<unsafe fn(*mut u8, usize)>,
    pub type_id: TypeId,
    pub name: &'static str,
}

impl fmt::Debug for ComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentInfo")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("name", &self.name)
            .finish()
    }
}

unsafe fn drop_column_slice<T>(ptr: *mut u8, count: usize) {
    let ptr = ptr as *mut T;
    for i in 0..count {
        unsafe { std::ptr::drop_in_place(ptr.add(i)) };
    }
}

/// Registry of component types
///
/// Lives inside [`CoreContext`](crate::CoreContext) behind a lock; ids are
/// stable for the registry's lifetime and registration is idempotent per
/// concrete type.
pub struct ComponentRegistry {
    infos: Vec<ComponentInfo>,
    by_type: ahash::AHashMap<TypeId, ComponentTypeId>,
    max_types: usize,
    payload_budget: usize,
}

impl ComponentRegistry {
    pub(crate) fn new(max_types: usize, payload_budget: usize) -> Self {
        let max_types = max_types.min(MAX_COMPONENT_TYPES);
        Self {
            infos: Vec::with_capacity(max_types),
            by_type: ahash::AHashMap::with_capacity(max_types),
            max_types,
            payload_budget,
        }
    }

    /// Register `T`, returning its id
    ///
    /// Repeated registration of the same type returns the same id.
    pub fn register<T: Component>(&mut self) -> Result<ComponentTypeId> {
        let type_id = TypeId::of::<T>();
        if let Some(&id) = self.by_type.get(&type_id) {
            return Ok(id);
        }

        if std::mem::size_of::<T>() > self.payload_budget {
            return Err(CoreError::ComponentTooLarge(std::any::type_name::<T>()));
        }
        if self.infos.len() >= self.max_types {
            return Err(CoreError::TooManyComponentTypes);
        }

        let id = ComponentTypeId::from_index(self.infos.len());
        self.infos.push(ComponentInfo {
            id,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            drop_fn: if std::mem::needs_drop::<T>() {
                Some(drop_column_slice::<T>)
            } else {
                None
            },
            type_id,
            name: std::any::type_name::<T>(),
        });
        self.by_type.insert(type_id, id);
        Ok(id)
    }

    /// Look up `T`'s id without registering it
    pub fn lookup<T: Component>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn info(&self, id: ComponentTypeId) -> &ComponentInfo {
        &self.infos[id.index()]
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

/// Pack of components for entity creation
///
/// Implemented for tuples of 1..=8 components plus the unit pack `()`.
pub trait ComponentPack: Send + Sync + 'static {
    /// Register every member type and return ids in member order
    fn register(registry: &mut ComponentRegistry) -> Result<PackIds>
    where
        Self: Sized;

    /// Write members through raw column pointers, in member order
    ///
    /// # Safety
    /// `ptrs` must hold one valid, properly aligned pointer per member, in
    /// the order returned by [`ComponentPack::register`]. Members are moved
    /// into place; the caller owns them afterwards.
    unsafe fn write(self, ptrs: &[*mut u8]);
}

/// Ids of a pack's members, in member order
pub type PackIds = SmallVec<[ComponentTypeId; MAX_PACK_COMPONENTS]>;

impl ComponentPack for () {
    fn register(_registry: &mut ComponentRegistry) -> Result<PackIds> {
        Ok(SmallVec::new())
    }

    unsafe fn write(self, _ptrs: &[*mut u8]) {}
}

macro_rules! impl_pack {
    ($($T:ident),*) => {
        impl<$($T: Component),*> ComponentPack for ($($T,)*) {
            fn register(registry: &mut ComponentRegistry) -> Result<PackIds> {
                let mut ids = SmallVec::new();
                $(ids.push(registry.register::<$T>()?);)*
                Ok(ids)
            }

            #[allow(non_snake_case)]
            unsafe fn write(self, ptrs: &[*mut u8]) {
                let ($($T,)*) = self;
                let mut i = 0;
                $(
                    unsafe { std::ptr::write(ptrs[i] as *mut $T, $T) };
                    i += 1;
                )*
                let _ = i;
            }
        }
    };
}

impl_pack!(A);
impl_pack!(A, B);
impl_pack!(A, B, C);
impl_pack!(A, B, C, D);
impl_pack!(A, B, C, D, E);
impl_pack!(A, B, C, D, E, F);
impl_pack!(A, B, C, D, E, F, G);
impl_pack!(A, B, C, D, E, F, G, H);

struct BuilderEntry {
    register: fn(&mut ComponentRegistry) -> Result<ComponentTypeId>,
    ptr: NonNull<u8>,
    drop_fn: Option<unsafe fn(*mut u8, usize)>,
    size: usize,
}

/// Dynamic component pack staged in a bump arena
///
/// Unlike tuple packs, the member set can be decided at runtime. Values are
/// written into the arena on [`add`](EntityBuilder::add) and moved into the
/// entity's row when the builder is committed via
/// [`Registry::create_with`](crate::Registry::create_with).
pub struct EntityBuilder {
    arena: Bump,
    entries: Vec<BuilderEntry>,
}

impl EntityBuilder {
    pub fn new() -> Self {
        Self {
            arena: Bump::new(),
            entries: Vec::new(),
        }
    }

    /// Stage a component value
    pub fn add<T: Component>(&mut self, value: T) -> &mut Self {
        let slot: &mut T = self.arena.alloc(value);
        self.entries.push(BuilderEntry {
            register: |registry| registry.register::<T>(),
            ptr: NonNull::from(slot).cast::<u8>(),
            drop_fn: if std::mem::needs_drop::<T>() {
                Some(drop_column_slice::<T>)
            } else {
                None
            },
            size: std::mem::size_of::<T>(),
        });
        self
    }

    /// Chainable variant of [`add`](EntityBuilder::add)
    pub fn with<T: Component>(mut self, value: T) -> Self {
        self.add(value);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register every staged type and hand out (id, bytes) pairs.
    ///
    /// The staged values stay owned by the builder until
    /// [`disarm`](EntityBuilder::disarm) is called.
    pub(crate) fn blobs(
        &self,
        registry: &mut ComponentRegistry,
    ) -> Result<SmallVec<[(ComponentTypeId, *const u8, usize); MAX_PACK_COMPONENTS]>> {
        let mut blobs = SmallVec::new();
        for entry in &self.entries {
            let id = (entry.register)(registry)?;
            blobs.push((id, entry.ptr.as_ptr() as *const u8, entry.size));
        }
        Ok(blobs)
    }

    /// Release ownership of the staged values after they have been moved
    /// out. The arena itself is freed when the builder drops; only the drop
    /// glue is skipped.
    pub(crate) fn disarm(&mut self) {
        self.entries.clear();
    }
}

impl Default for EntityBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EntityBuilder {
    fn drop(&mut self) {
        // Bump arenas never run drop glue, so staged values are dropped here
        // if the builder dies before being committed.
        for entry in &self.entries {
            if let Some(drop_fn) = entry.drop_fn {
                unsafe { drop_fn(entry.ptr.as_ptr(), 1) };
            }
        }
    }
}

/// Compute the signature of a set of pack ids, rejecting duplicates
pub(crate) fn signature_of(ids: &[ComponentTypeId]) -> Result<Signature> {
    let mut sig = Signature::EMPTY;
    for &id in ids {
        if sig.contains(id) {
            return Err(CoreError::DuplicateComponent);
        }
        sig = sig.with(id);
    }
    Ok(sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy)]
    struct Position {
        _x: f32,
        _y: f32,
    }

    #[derive(Debug, Clone, Copy)]
    struct Velocity {
        _x: f32,
    }

    fn registry() -> ComponentRegistry {
        ComponentRegistry::new(MAX_COMPONENT_TYPES, 16 * 1024)
    }

    #[test]
    fn test_registration_idempotent() {
        let mut reg = registry();
        let a = reg.register::<Position>().unwrap();
        let b = reg.register::<Position>().unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_lowest_unused_index() {
        let mut reg = registry();
        let a = reg.register::<Position>().unwrap();
        let b = reg.register::<Velocity>().unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
    }

    #[test]
    fn test_too_many_types() {
        let mut reg = ComponentRegistry::new(1, 16 * 1024);
        reg.register::<Position>().unwrap();
        assert_eq!(
            reg.register::<Velocity>(),
            Err(CoreError::TooManyComponentTypes)
        );
    }

    #[test]
    fn test_component_too_large() {
        let mut reg = ComponentRegistry::new(64, 8);
        let err = reg.register::<[u8; 64]>().unwrap_err();
        assert!(matches!(err, CoreError::ComponentTooLarge(_)));
    }

    #[test]
    fn test_pack_ids_in_member_order() {
        let mut reg = registry();
        let ids = <(Velocity, Position)>::register(&mut reg).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], reg.lookup::<Velocity>().unwrap());
        assert_eq!(ids[1], reg.lookup::<Position>().unwrap());
    }

    #[test]
    fn test_duplicate_pack_rejected() {
        let mut reg = registry();
        let ids = <(Position, Position)>::register(&mut reg).unwrap();
        assert_eq!(signature_of(&ids), Err(CoreError::DuplicateComponent));
    }

    #[test]
    fn test_builder_drops_uncommitted() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let mut builder = EntityBuilder::new();
            builder.add(Tracked);
            builder.add(Tracked);
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);
    }
}
