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

//! Archetype chunk storage
//!
//! Entities sharing one signature live in an [`Archetype`]: a sequence of
//! fixed-size chunks, each holding column-contiguous (SoA) component arrays
//! plus a parallel entity-handle array. Column offsets are computed once at
//! archetype creation; chunk slabs are never resized or relocated, so
//! column addresses stay stable for a chunk's lifetime.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use smallvec::SmallVec;

use crate::component::{ComponentInfo, ComponentTypeId};
use crate::entity::Entity;
use crate::error::{CoreError, Result};
use crate::signature::Signature;

/// Index of an archetype inside a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Align `value` up to a power-of-two `alignment`
pub(crate) fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// One column's placement inside a chunk slab
#[derive(Debug, Clone, Copy)]
pub(crate) struct ColumnLayout {
    pub info: ComponentInfo,
    pub offset: usize,
}

/// Placement of every column in a chunk, shared by all chunks of an
/// archetype
#[derive(Debug, Clone)]
pub(crate) struct ChunkLayout {
    /// Columns ordered by (alignment desc, type id asc)
    pub columns: SmallVec<[ColumnLayout; 8]>,
    /// Offset of the parallel entity-handle array
    pub entity_offset: usize,
    /// Rows per chunk
    pub capacity: usize,
    pub slab_bytes: usize,
    pub slab_align: usize,
}

impl ChunkLayout {
    /// Compute column placement for the given payload budget.
    ///
    /// The entity-handle array counts against the payload like any column.
    /// Capacity shrinks until everything fits; an archetype whose row
    /// cannot fit even once is rejected.
    pub fn compute(payload_bytes: usize, infos: &[ComponentInfo]) -> Result<ChunkLayout> {
        let mut ordered: SmallVec<[ComponentInfo; 8]> = infos.iter().copied().collect();
        ordered.sort_by(|a, b| b.align.cmp(&a.align).then(a.id.cmp(&b.id)));

        let entity_size = std::mem::size_of::<Entity>();
        let entity_align = std::mem::align_of::<Entity>();
        let row_size: usize = entity_size + ordered.iter().map(|i| i.size).sum::<usize>();

        let mut capacity = payload_bytes / row_size.max(1);
        let slab_align = ordered
            .iter()
            .map(|i| i.align)
            .max()
            .unwrap_or(entity_align)
            .max(entity_align);

        loop {
            if capacity == 0 {
                return Err(CoreError::ArchetypeTooWide);
            }

            // Entity handles first, then columns in decreasing alignment;
            // padding only appears where alignment classes change.
            let mut cursor = entity_size * capacity;
            let mut columns: SmallVec<[ColumnLayout; 8]> = SmallVec::new();
            for info in &ordered {
                let offset = align_to(cursor, info.align);
                columns.push(ColumnLayout {
                    info: *info,
                    offset,
                });
                cursor = offset + info.size * capacity;
            }

            if cursor <= payload_bytes {
                return Ok(ChunkLayout {
                    columns,
                    entity_offset: 0,
                    capacity,
                    slab_bytes: payload_bytes,
                    slab_align,
                });
            }
            capacity -= 1;
        }
    }

    /// Index into `columns` for a component type
    pub fn column_of(&self, id: ComponentTypeId) -> Option<usize> {
        self.columns.iter().position(|c| c.info.id == id)
    }
}

/// One fixed-size slab of rows
///
/// The slab is a single aligned allocation addressed through the owning
/// archetype's [`ChunkLayout`]; the chunk itself is just the pointer.
struct Chunk {
    data: NonNull<u8>,
}

// Chunks own their slab; the component types stored inside are constrained
// to Send + Sync at registration.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    fn allocate(layout: &ChunkLayout) -> Result<Chunk> {
        let alloc_layout = Layout::from_size_align(layout.slab_bytes, layout.slab_align)
            .map_err(|_| CoreError::ChunkAllocationFailed)?;
        let data = unsafe { alloc(alloc_layout) };
        match NonNull::new(data) {
            Some(data) => Ok(Chunk { data }),
            None => Err(CoreError::ChunkAllocationFailed),
        }
    }

    #[inline]
    fn entity_ptr(&self, layout: &ChunkLayout) -> *mut Entity {
        unsafe { self.data.as_ptr().add(layout.entity_offset) as *mut Entity }
    }

    #[inline]
    fn column_ptr(&self, layout: &ChunkLayout, column: usize) -> *mut u8 {
        unsafe { self.data.as_ptr().add(layout.columns[column].offset) }
    }

    fn release(self, layout: &ChunkLayout) {
        let alloc_layout =
            Layout::from_size_align(layout.slab_bytes, layout.slab_align).unwrap();
        unsafe { dealloc(self.data.as_ptr(), alloc_layout) };
        std::mem::forget(self);
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // Slabs must be released through Chunk::release (the alloc layout
        // lives on the archetype); reaching this drop means a leak bug.
        debug_assert!(false, "chunk dropped without release");
    }
}

/// Column storage for all entities sharing one signature
pub struct Archetype {
    id: ArchetypeId,
    signature: Signature,
    layout: ChunkLayout,
    chunks: Vec<Chunk>,
    len: usize,
}

impl Archetype {
    pub(crate) fn new(
        id: ArchetypeId,
        signature: Signature,
        infos: &[ComponentInfo],
        payload_bytes: usize,
    ) -> Result<Self> {
        debug_assert_eq!(infos.len(), signature.len());
        let layout = ChunkLayout::compute(payload_bytes, infos)?;
        Ok(Self {
            id,
            signature,
            layout,
            chunks: Vec::new(),
            len: 0,
        })
    }

    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// Number of live rows
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Rows per chunk
    pub fn chunk_capacity(&self) -> usize {
        self.layout.capacity
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Live rows in chunk `chunk`
    pub fn chunk_rows(&self, chunk: usize) -> usize {
        let start = chunk * self.layout.capacity;
        self.len.saturating_sub(start).min(self.layout.capacity)
    }

    pub(crate) fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    pub(crate) fn column_index(&self, id: ComponentTypeId) -> Option<usize> {
        self.layout.column_of(id)
    }

    #[inline]
    fn locate(&self, row: u32) -> (usize, usize) {
        let row = row as usize;
        (row / self.layout.capacity, row % self.layout.capacity)
    }

    /// Entity handle stored at `row`
    pub fn entity_at(&self, row: u32) -> Entity {
        debug_assert!((row as usize) < self.len);
        let (chunk, slot) = self.locate(row);
        unsafe { *self.chunks[chunk].entity_ptr(&self.layout).add(slot) }
    }

    /// Entity handles of chunk `chunk`
    pub fn chunk_entities(&self, chunk: usize) -> &[Entity] {
        let rows = self.chunk_rows(chunk);
        unsafe {
            std::slice::from_raw_parts(self.chunks[chunk].entity_ptr(&self.layout), rows)
        }
    }

    /// Base pointer of column `column` in chunk `chunk`
    ///
    /// # Safety
    /// Indices must be in bounds; writes through the pointer require the
    /// caller to have exclusive access to the column per the scheduler's
    /// conflict rule or an exclusive archetype borrow.
    pub(crate) unsafe fn chunk_column_ptr(&self, chunk: usize, column: usize) -> *mut u8 {
        self.chunks[chunk].column_ptr(&self.layout, column)
    }

    /// Pointer to one component instance
    ///
    /// # Safety
    /// As [`chunk_column_ptr`](Archetype::chunk_column_ptr); `row` must be
    /// a live row.
    pub(crate) unsafe fn component_ptr(&self, row: u32, column: usize) -> *mut u8 {
        let (chunk, slot) = self.locate(row);
        let size = self.layout.columns[column].info.size;
        unsafe {
            self.chunks[chunk]
                .column_ptr(&self.layout, column)
                .add(slot * size)
        }
    }

    /// Append a row for `entity`, allocating a chunk if the tail is full.
    ///
    /// # Safety
    /// The returned row's component columns are uninitialized. The caller
    /// must write every column before the row is removed or the archetype
    /// is dropped.
    pub(crate) unsafe fn push_row(&mut self, entity: Entity) -> Result<u32> {
        if self.len == self.chunks.len() * self.layout.capacity {
            self.chunks.push(Chunk::allocate(&self.layout)?);
        }
        let row = self.len as u32;
        let (chunk, slot) = self.locate(row);
        unsafe {
            self.chunks[chunk]
                .entity_ptr(&self.layout)
                .add(slot)
                .write(entity)
        };
        self.len += 1;
        Ok(row)
    }

    /// Overwrite the stored entity handle at `row`
    pub(crate) fn set_entity_at(&mut self, row: u32, entity: Entity) {
        debug_assert!((row as usize) < self.len);
        let (chunk, slot) = self.locate(row);
        unsafe {
            self.chunks[chunk]
                .entity_ptr(&self.layout)
                .add(slot)
                .write(entity)
        };
    }

    /// Remove `row` by swapping the last row into its place.
    ///
    /// Components whose type is in `drop_mask` are dropped; the rest are
    /// assumed to have been moved out already (archetype migration). Returns
    /// the entity that now occupies `row`, if any, so the caller can fix up
    /// its directory entry.
    ///
    /// # Safety
    /// `row` must be a live row with fully initialized columns (except
    /// those already moved out, which must be excluded from `drop_mask`).
    pub(crate) unsafe fn swap_remove_row(
        &mut self,
        row: u32,
        drop_mask: Signature,
    ) -> Option<Entity> {
        debug_assert!((row as usize) < self.len);
        let last = (self.len - 1) as u32;

        for column in 0..self.layout.columns.len() {
            let info = self.layout.columns[column].info;
            if drop_mask.contains(info.id) {
                if let Some(drop_fn) = info.drop_fn {
                    unsafe { drop_fn(self.component_ptr(row, column), 1) };
                }
            }
        }

        let displaced = if row != last {
            for column in 0..self.layout.columns.len() {
                let size = self.layout.columns[column].info.size;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.component_ptr(last, column),
                        self.component_ptr(row, column),
                        size,
                    );
                }
            }
            let moved = self.entity_at(last);
            self.set_entity_at(row, moved);
            Some(moved)
        } else {
            None
        };

        self.len -= 1;
        displaced
    }

    /// Release chunks past the tail. Only trailing chunks can be empty
    /// because removal always backfills from the global last row.
    pub(crate) fn release_empty_chunks(&mut self) {
        let needed = self.len.div_ceil(self.layout.capacity);
        while self.chunks.len() > needed {
            let chunk = self.chunks.pop().unwrap();
            chunk.release(&self.layout);
        }
    }
}

impl Drop for Archetype {
    fn drop(&mut self) {
        // Columns are contiguous within a chunk, so each column's live rows
        // drop in one call.
        for (index, chunk) in self.chunks.iter().enumerate() {
            let rows = self.chunk_rows(index);
            if rows == 0 {
                continue;
            }
            for (column, layout) in self.layout.columns.iter().enumerate() {
                if let Some(drop_fn) = layout.info.drop_fn {
                    unsafe { drop_fn(chunk.column_ptr(&self.layout, column), rows) };
                }
            }
        }
        for chunk in self.chunks.drain(..) {
            chunk.release(&self.layout);
        }
    }
}

/// Move `row` from `src` into `dst`.
///
/// Overlapping columns are moved bitwise; columns only in `dst` are
/// initialized from `added` blobs; columns only in `src` are dropped. The
/// destination row is fully prepared before the source row is disturbed, so
/// an allocation failure leaves `src` untouched.
///
/// Returns the new row in `dst` and the entity displaced into the vacated
/// source row, if any.
///
/// # Safety
/// `row` must be live in `src`; `added` must contain one valid blob for
/// every component present in `dst` but not `src`.
pub(crate) unsafe fn transfer_row(
    src: &mut Archetype,
    dst: &mut Archetype,
    row: u32,
    added: &[(ComponentTypeId, *const u8, usize)],
) -> Result<(u32, Option<Entity>)> {
    let entity = src.entity_at(row);
    let dst_row = unsafe { dst.push_row(entity)? };

    for column in 0..dst.layout.columns.len() {
        let info = dst.layout.columns[column].info;
        let dst_ptr = unsafe { dst.component_ptr(dst_row, column) };
        if let Some(src_column) = src.column_index(info.id) {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.component_ptr(row, src_column),
                    dst_ptr,
                    info.size,
                );
            }
        } else {
            let blob = added
                .iter()
                .find(|(id, _, _)| *id == info.id)
                .expect("missing blob for added component");
            debug_assert_eq!(blob.2, info.size);
            unsafe { std::ptr::copy_nonoverlapping(blob.1, dst_ptr, info.size) };
        }
    }

    // Moved columns must not be dropped; only src-exclusive ones are.
    let drop_mask = src.signature.difference(dst.signature);
    let displaced = unsafe { src.swap_remove_row(row, drop_mask) };
    Ok((dst_row, displaced))
}
