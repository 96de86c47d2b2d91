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

//! Chunked id pool with per-archetype tenants
//!
//! A [`ChunkedPool`] hands out chunk ids for every tenant. A [`Tenant`] owns a
//! chain of [`LinkedChunk`]s, each a fixed block of `2^chunk_bit` slots with
//! one type-erased column per component type. Slot `row` of chunk `c` is the
//! entity id `create_id(c, row)`.
//!
//! Ids are issued under the tenant's shared lock: the free-id stack first,
//! then a CAS on the current chunk's fill index. Only chunk rollover and
//! removal take the exclusive lock.

use std::alloc::Layout;
use std::mem;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[cfg(feature = "profiling")]
use tracing::debug;

use crate::component::ComponentInfo;
use crate::entity::{IdSchema, Identifiable};
use crate::error::{EcsError, Result};
use crate::memory::{RawBlock, RawBuffer};
use crate::stack::ConcurrentIntStack;

/// Type-erased component column of one chunk
pub struct Column {
    info: ComponentInfo,
    block: RawBlock,
}

impl Column {
    fn new(info: ComponentInfo, capacity: usize) -> Result<Self> {
        let layout = info.layout();
        let bytes = layout
            .size()
            .checked_mul(capacity)
            .ok_or(EcsError::AllocationFailed { bytes: usize::MAX })?;
        let block = RawBlock::allocate(Layout::from_size_align(bytes, layout.align())?)?;
        Ok(Self { info, block })
    }

    #[inline]
    pub fn info(&self) -> &ComponentInfo {
        &self.info
    }

    /// Address of `row`'s value; only in bounds for `row < capacity`
    #[inline]
    pub fn ptr_at(&self, row: usize) -> *mut u8 {
        // SAFETY: callers pass rows below the chunk capacity.
        unsafe { self.block.as_ptr().add(row * self.info.layout().size()) }
    }
}

/// Fixed-capacity slot block in a tenant's chunk chain
pub struct LinkedChunk<T: Identifiable> {
    id: usize,
    schema: IdSchema,
    size: AtomicUsize,
    items: RawBuffer<AtomicPtr<T>>,
    columns: Box<[Column]>,
    previous: Option<Arc<LinkedChunk<T>>>,
    next: OnceLock<Weak<LinkedChunk<T>>>,
}

impl<T: Identifiable> LinkedChunk<T> {
    fn new(
        id: usize,
        schema: IdSchema,
        layout: &[ComponentInfo],
        previous: Option<Arc<LinkedChunk<T>>>,
    ) -> Result<Self> {
        let capacity = schema.chunk_capacity();
        let columns = layout
            .iter()
            .map(|info| Column::new(*info, capacity))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id,
            schema,
            size: AtomicUsize::new(0),
            items: RawBuffer::zeroed(capacity)?,
            columns: columns.into_boxed_slice(),
            previous,
            next: OnceLock::new(),
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Fill index: rows `0..size` are claimed
    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    pub fn previous(&self) -> Option<&Arc<LinkedChunk<T>>> {
        self.previous.as_ref()
    }

    pub fn next(&self) -> Option<Arc<LinkedChunk<T>>> {
        self.next.get().and_then(Weak::upgrade)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Item published in `row`, `None` for holes and pending writes
    #[inline]
    pub fn item(&self, row: usize) -> Option<&T> {
        let ptr = self.items.get(row)?.load(Ordering::Acquire);
        // SAFETY: published pointers come from `Arc::into_raw` and stay owned
        // by the slot until removal, which needs the tenant's exclusive lock.
        (!ptr.is_null()).then(|| unsafe { &*ptr })
    }

    /// Shared handle to the item in `row`
    pub fn item_arc(&self, row: usize) -> Option<Arc<T>> {
        let ptr = self.items.get(row)?.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: see `item`; the slot keeps its own strong count.
        unsafe {
            Arc::increment_strong_count(ptr);
            Some(Arc::from_raw(ptr))
        }
    }

    #[inline]
    pub fn holds(&self, row: usize, item: &Arc<T>) -> bool {
        self.items
            .get(row)
            .is_some_and(|slot| ptr::eq(slot.load(Ordering::Acquire), Arc::as_ptr(item)))
    }

    /// Column value address for `slot` at `row`
    #[inline]
    pub fn component_ptr(&self, slot: usize, row: usize) -> *mut u8 {
        self.columns[slot].ptr_at(row)
    }

    fn try_claim(&self) -> Option<usize> {
        let capacity = self.capacity();
        let mut size = self.size.load(Ordering::Acquire);
        while size < capacity {
            match self
                .size
                .compare_exchange_weak(size, size + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(size),
                Err(actual) => size = actual,
            }
        }
        None
    }

    fn publish(&self, row: usize, item: Arc<T>) -> Result<()> {
        let raw = Arc::into_raw(item) as *mut T;
        match self.items[row].compare_exchange(
            ptr::null_mut(),
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: `raw` was not stored, so ownership is still ours.
                drop(unsafe { Arc::from_raw(raw) });
                Err(EcsError::DuplicateValue(self.schema.create_id(self.id, row)))
            }
        }
    }
}

impl<T: Identifiable> Drop for LinkedChunk<T> {
    fn drop(&mut self) {
        let size = *self.size.get_mut();
        for row in 0..size {
            let item = self.items[row].swap(ptr::null_mut(), Ordering::AcqRel);
            if item.is_null() {
                continue;
            }
            for column in self.columns.iter() {
                // SAFETY: a published row has every column initialized.
                unsafe { column.info.drop_value(column.ptr_at(row)) };
            }
            // SAFETY: releases the slot's strong count.
            drop(unsafe { Arc::from_raw(item) });
        }
    }
}

/// Pool-wide chunk registry
pub struct ChunkedPool<T: Identifiable> {
    schema: IdSchema,
    chunks: RwLock<Vec<Arc<LinkedChunk<T>>>>,
}

impl<T: Identifiable> ChunkedPool<T> {
    pub fn new(schema: IdSchema) -> Self {
        Self {
            schema,
            chunks: RwLock::new(Vec::new()),
        }
    }

    #[inline]
    pub fn schema(&self) -> &IdSchema {
        &self.schema
    }

    /// Allocate a chunk with the next pool-wide id and link it behind `previous`
    fn new_chunk(
        &self,
        layout: &[ComponentInfo],
        previous: Option<Arc<LinkedChunk<T>>>,
    ) -> Result<Arc<LinkedChunk<T>>> {
        let mut chunks = self.chunks.write();
        let id = chunks.len();
        if id >= self.schema.max_chunks() {
            return Err(EcsError::ChunkCapacityExhausted {
                max_chunks: self.schema.max_chunks(),
            });
        }
        let chunk = Arc::new(LinkedChunk::new(id, self.schema, layout, previous)?);
        if let Some(previous) = &chunk.previous {
            let _ = previous.next.set(Arc::downgrade(&chunk));
        }
        chunks.push(chunk.clone());

        #[cfg(feature = "profiling")]
        debug!(chunk_id = id, columns = layout.len(), "chunk allocated");

        Ok(chunk)
    }

    /// Create a tenant storing `layout`'s columns in slot order
    pub fn new_tenant(self: &Arc<Self>, layout: &[ComponentInfo]) -> Result<Tenant<T>> {
        let first = self.new_chunk(layout, None)?;
        Ok(Tenant {
            pool: Arc::clone(self),
            schema: self.schema,
            layout: layout.into(),
            state: Arc::new(RwLock::new(TenantState {
                chunks: vec![first],
                free_ids: ConcurrentIntStack::with_capacity(0)?,
            })),
        })
    }

    pub fn get_chunk(&self, chunk_id: usize) -> Option<Arc<LinkedChunk<T>>> {
        self.chunks.read().get(chunk_id).cloned()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    /// Claimed slots across every chunk
    pub fn size(&self) -> usize {
        self.chunks.read().iter().map(|chunk| chunk.size()).sum()
    }
}

/// Lock-protected part of a tenant
pub struct TenantState<T: Identifiable> {
    chunks: Vec<Arc<LinkedChunk<T>>>,
    free_ids: ConcurrentIntStack,
}

impl<T: Identifiable> TenantState<T> {
    /// Chain in allocation order; the last chunk is current
    pub fn chunks(&self) -> &[Arc<LinkedChunk<T>>] {
        &self.chunks
    }

    fn current(&self) -> &Arc<LinkedChunk<T>> {
        &self.chunks[self.chunks.len() - 1]
    }

    fn chunk(&self, chunk_id: usize) -> Option<&Arc<LinkedChunk<T>>> {
        self.chunks
            .binary_search_by_key(&chunk_id, |chunk| chunk.id)
            .ok()
            .map(|pos| &self.chunks[pos])
    }

    fn locate(&self, schema: &IdSchema, id: u32) -> Option<(&Arc<LinkedChunk<T>>, usize)> {
        let chunk = self.chunk(schema.fetch_chunk_id(id))?;
        let row = schema.fetch_object_id(id);
        (row < chunk.size()).then_some((chunk, row))
    }
}

/// One slot of a tenant, seen while the tenant lock is held
pub struct Row<'a, T: Identifiable> {
    chunk: &'a LinkedChunk<T>,
    row: usize,
}

impl<'a, T: Identifiable> Row<'a, T> {
    #[inline]
    pub fn id(&self) -> u32 {
        self.chunk.schema.create_id(self.chunk.id, self.row)
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.row
    }

    pub fn chunk(&self) -> &'a LinkedChunk<T> {
        self.chunk
    }

    pub fn item(&self) -> Option<&'a T> {
        self.chunk.item(self.row)
    }

    pub fn holds(&self, item: &Arc<T>) -> bool {
        self.chunk.holds(self.row, item)
    }

    #[inline]
    pub fn component_ptr(&self, slot: usize) -> *mut u8 {
        self.chunk.component_ptr(slot, self.row)
    }
}

/// What removal does with the vacated row's components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vacate {
    /// Run their destructors
    Drop,
    /// The caller moved them out
    Forget,
}

/// Storage partition of one archetype
pub struct Tenant<T: Identifiable> {
    pool: Arc<ChunkedPool<T>>,
    schema: IdSchema,
    layout: Box<[ComponentInfo]>,
    state: Arc<RwLock<TenantState<T>>>,
}

impl<T: Identifiable> Tenant<T> {
    #[inline]
    pub fn schema(&self) -> &IdSchema {
        &self.schema
    }

    pub fn layout(&self) -> &[ComponentInfo] {
        &self.layout
    }

    pub fn pool(&self) -> &Arc<ChunkedPool<T>> {
        &self.pool
    }

    /// Reserve a fresh slot id.
    ///
    /// The slot stays empty until [`Tenant::register`] publishes an item.
    pub fn next_id(&self) -> Result<u32> {
        self.reserve().map(|(_, id)| id)
    }

    fn reserve(&self) -> Result<(RwLockReadGuard<'_, TenantState<T>>, u32)> {
        let state = self.state.read_recursive();
        if let Some(id) = self.try_reserve(&state) {
            return Ok((state, id));
        }
        drop(state);

        let mut state = self.state.write();
        let id = match self.try_reserve(&state) {
            Some(id) => id,
            None => {
                self.roll_over(&mut state)?;
                self.try_reserve(&state)
                    .ok_or(EcsError::ChunkCapacityExhausted {
                        max_chunks: self.schema.max_chunks(),
                    })?
            }
        };
        Ok((RwLockWriteGuard::downgrade(state), id))
    }

    fn try_reserve(&self, state: &TenantState<T>) -> Option<u32> {
        if let Some(id) = state.free_ids.pop() {
            let id = id as u32;
            if let Some(chunk) = state.chunk(self.schema.fetch_chunk_id(id)) {
                chunk
                    .size
                    .fetch_max(self.schema.fetch_object_id(id) + 1, Ordering::AcqRel);
                return Some(id);
            }
        }
        let current = state.current();
        current
            .try_claim()
            .map(|row| self.schema.create_id(current.id, row))
    }

    fn roll_over(&self, state: &mut TenantState<T>) -> Result<()> {
        let chunk = self.pool.new_chunk(&self.layout, Some(state.current().clone()))?;
        state.chunks.push(chunk);
        Ok(())
    }

    /// Make room for one more free id, doubling the stack when it is full
    fn ensure_free_room(&self, state: &mut TenantState<T>) -> Result<()> {
        if state.free_ids.size() < state.free_ids.capacity() {
            return Ok(());
        }
        let wanted = (state.free_ids.capacity() * 2).max(self.schema.chunk_capacity());
        let grown = ConcurrentIntStack::with_capacity(wanted)?;
        for id in state.free_ids.drain().into_iter().rev() {
            grown.push(id);
        }
        state.free_ids = grown;

        #[cfg(feature = "profiling")]
        debug!(capacity = wanted, "free id stack grown");

        Ok(())
    }

    /// Publish `item` in a slot reserved by [`Tenant::next_id`]
    ///
    /// # Safety
    /// Every column of the slot must already hold an initialized value.
    pub unsafe fn register(&self, id: u32, item: Arc<T>) -> Result<()> {
        let state = self.state.read_recursive();
        let (chunk, row) = state
            .locate(&self.schema, id)
            .ok_or(EcsError::EntityNotFound)?;
        item.set_id(id);
        chunk.publish(row, item)
    }

    /// Reserve a slot, let `write` fill its columns, then publish `item`.
    ///
    /// `write` must initialize every column of the row.
    pub fn insert_with<F>(&self, item: Arc<T>, write: F) -> Result<u32>
    where
        F: FnOnce(&Row<'_, T>),
    {
        let (state, id) = self.reserve()?;
        let chunk = state
            .chunk(self.schema.fetch_chunk_id(id))
            .ok_or(EcsError::EntityNotFound)?;
        let row = Row {
            chunk,
            row: self.schema.fetch_object_id(id),
        };
        write(&row);
        item.set_id(id);
        chunk.publish(row.row, item)?;
        Ok(id)
    }

    /// Remove the item at `id`, dropping its components.
    ///
    /// Returns the vacated id, which is the next one reused.
    pub fn free_id(&self, id: u32) -> Result<u32> {
        self.vacate_with(id, |_| Ok(((), Vacate::Drop)))
            .map(|(_, vacated)| vacated)
    }

    /// Remove the item at `id` once `f` accepts the row.
    ///
    /// Runs under the exclusive lock. An `Err` from `f` leaves the row intact.
    /// The last row of the chunk moves into the freed slot and its item is
    /// relocated. While that last row is reserved but not yet registered it
    /// stays put, and the freed slot is left as a hole on the free stack.
    pub fn vacate_with<R, F>(&self, id: u32, f: F) -> Result<(R, u32)>
    where
        F: FnOnce(&Row<'_, T>) -> Result<(R, Vacate)>,
    {
        let mut state = self.state.write();
        let (chunk, row) = state
            .locate(&self.schema, id)
            .ok_or(EcsError::EntityNotFound)?;
        let chunk = Arc::clone(chunk);
        if chunk.item(row).is_none() {
            return Err(EcsError::EntityNotFound);
        }
        self.ensure_free_room(&mut state)?;
        let (result, vacate) = f(&Row { chunk: &chunk, row })?;

        let item = chunk.items[row].swap(ptr::null_mut(), Ordering::AcqRel);
        if vacate == Vacate::Drop {
            for column in chunk.columns.iter() {
                // SAFETY: the row was published, so its values are live.
                unsafe { column.info.drop_value(column.ptr_at(row)) };
            }
        }
        // SAFETY: releases the slot's strong count.
        drop(unsafe { Arc::from_raw(item) });

        let last = chunk.size() - 1;
        if row != last && chunk.item(last).is_none() {
            let vacated = self.schema.create_id(chunk.id, row);
            state.free_ids.push(vacated as i32);
            return Ok((result, vacated));
        }

        if row != last {
            for column in chunk.columns.iter() {
                // SAFETY: distinct rows of one column never overlap.
                unsafe {
                    ptr::copy_nonoverlapping(
                        column.ptr_at(last),
                        column.ptr_at(row),
                        column.info.layout().size(),
                    )
                };
            }
            let moved = chunk.items[last].swap(ptr::null_mut(), Ordering::AcqRel);
            chunk.items[row].store(moved, Ordering::Release);
            // SAFETY: `moved` was published and is owned by the slot it now occupies.
            unsafe { &*moved }.relocate(self.schema.create_id(chunk.id, row));
        }
        chunk.size.store(last, Ordering::Release);

        let vacated = self.schema.create_id(chunk.id, last);
        if !Arc::ptr_eq(&chunk, state.current()) {
            state.free_ids.push(vacated as i32);
        }
        Ok((result, vacated))
    }

    /// Run `f` on the row of `id` under the shared lock
    pub fn with_row<R>(&self, id: u32, f: impl FnOnce(&Row<'_, T>) -> R) -> Result<R> {
        let state = self.state.read_recursive();
        let (chunk, row) = state
            .locate(&self.schema, id)
            .ok_or(EcsError::EntityNotFound)?;
        Ok(f(&Row { chunk, row }))
    }

    /// Run `f` on the row of `id` under the exclusive lock
    pub fn with_row_mut<R>(&self, id: u32, f: impl FnOnce(&Row<'_, T>) -> R) -> Result<R> {
        let state = self.state.write();
        let (chunk, row) = state
            .locate(&self.schema, id)
            .ok_or(EcsError::EntityNotFound)?;
        Ok(f(&Row { chunk, row }))
    }

    /// Hold the shared lock until the returned guard is dropped
    pub fn read_guard(&self) -> TenantReadGuard<T> {
        let guard = self.state.read_recursive();
        let state = NonNull::from(&*guard);
        mem::forget(guard);
        TenantReadGuard {
            lock: Arc::clone(&self.state),
            state,
        }
    }

    /// Published items in chunk order
    pub fn iter(&self) -> TenantIter<'_, T> {
        TenantIter {
            state: self.state.read_recursive(),
            chunk: 0,
            row: 0,
        }
    }

    /// Claimed slots of this tenant
    pub fn size(&self) -> usize {
        let state = self.state.read_recursive();
        state.chunks.iter().map(|chunk| chunk.size()).sum()
    }

    pub fn chunk_count(&self) -> usize {
        self.state.read_recursive().chunks.len()
    }

    /// Ids waiting for reuse in non-current chunks
    pub fn free_id_count(&self) -> usize {
        self.state.read_recursive().free_ids.size()
    }
}

/// Owned shared lock on a tenant's state
pub struct TenantReadGuard<T: Identifiable> {
    lock: Arc<RwLock<TenantState<T>>>,
    state: NonNull<TenantState<T>>,
}

impl<T: Identifiable> Deref for TenantReadGuard<T> {
    type Target = TenantState<T>;

    fn deref(&self) -> &TenantState<T> {
        // SAFETY: the shared lock is held until drop and `lock` keeps the
        // state allocated.
        unsafe { self.state.as_ref() }
    }
}

impl<T: Identifiable> Drop for TenantReadGuard<T> {
    fn drop(&mut self) {
        // SAFETY: pairs with the guard forgotten in `Tenant::read_guard`.
        unsafe { self.lock.force_unlock_read() };
    }
}

/// Iterator over a tenant's items, holding its shared lock
pub struct TenantIter<'a, T: Identifiable> {
    state: RwLockReadGuard<'a, TenantState<T>>,
    chunk: usize,
    row: usize,
}

impl<'a, T: Identifiable> Iterator for TenantIter<'a, T> {
    type Item = Arc<T>;

    fn next(&mut self) -> Option<Arc<T>> {
        loop {
            let chunk = self.state.chunks.get(self.chunk)?;
            if self.row >= chunk.size() {
                self.chunk += 1;
                self.row = 0;
                continue;
            }
            let row = self.row;
            self.row += 1;
            if let Some(item) = chunk.item_arc(row) {
                return Some(item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    struct Item {
        id: AtomicU32,
        tag: usize,
    }

    impl Item {
        fn new(tag: usize) -> Arc<Self> {
            Arc::new(Self {
                id: AtomicU32::new(0),
                tag,
            })
        }
    }

    impl Identifiable for Item {
        fn id(&self) -> u32 {
            self.id.load(Ordering::Acquire)
        }

        fn set_id(&self, id: u32) {
            self.id.store(id, Ordering::Release);
        }
    }

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tenant(chunk_bit: u32, max_chunks: Option<usize>) -> Tenant<Item> {
        let pool = Arc::new(ChunkedPool::new(IdSchema::new(chunk_bit, max_chunks).unwrap()));
        pool.new_tenant(&[]).unwrap()
    }

    fn insert(tenant: &Tenant<Item>, tag: usize) -> (Arc<Item>, u32) {
        let item = Item::new(tag);
        let id = tenant.insert_with(item.clone(), |_| {}).unwrap();
        (item, id)
    }

    fn remove(tenant: &Tenant<Item>, item: &Arc<Item>) {
        // A concurrent removal may move the item between reading its id and
        // taking the lock.
        loop {
            let freed = tenant.vacate_with(item.id(), |row| {
                if row.holds(item) {
                    Ok(((), Vacate::Drop))
                } else {
                    Err(EcsError::EntityNotFound)
                }
            });
            if freed.is_ok() {
                return;
            }
            std::hint::spin_loop();
        }
    }

    #[test]
    fn test_ids_fill_chunk_then_roll_over() {
        let tenant = tenant(2, None);
        let schema = *tenant.schema();
        let ids: Vec<u32> = (0..6).map(|_| tenant.next_id().unwrap()).collect();
        assert_eq!(&ids[..4], &[0, 1, 2, 3]);
        assert_eq!(ids[4], schema.create_id(1, 0));
        assert_eq!(ids[5], schema.create_id(1, 1));
        assert_eq!(tenant.chunk_count(), 2);
        assert_eq!(tenant.size(), 6);

        let second = tenant.pool().get_chunk(1).unwrap();
        let first = second.previous().unwrap();
        assert_eq!(first.id(), 0);
        assert!(Arc::ptr_eq(&first.next().unwrap(), &second));
    }

    #[test]
    fn test_free_tail_is_reused_first() {
        let tenant = tenant(4, None);
        let (_a, a) = insert(&tenant, 0);
        let (_b, b) = insert(&tenant, 1);
        assert_eq!((a, b), (0, 1));
        assert_eq!(tenant.free_id(1).unwrap(), 1);
        assert_eq!(tenant.next_id().unwrap(), 1);
    }

    #[test]
    fn test_free_moves_last_into_hole() {
        let tenant = tenant(4, None);
        let (_a, _) = insert(&tenant, 0);
        let (b, b_id) = insert(&tenant, 1);
        assert_eq!(b_id, 1);

        assert_eq!(tenant.free_id(0).unwrap(), 1);
        assert_eq!(b.id(), 0);
        assert!(tenant.with_row(0, |row| row.holds(&b)).unwrap());
        assert_eq!(tenant.next_id().unwrap(), 1);
    }

    #[test]
    fn test_single_entity_reuses_zero() {
        let tenant = tenant(4, None);
        let (_a, id) = insert(&tenant, 0);
        assert_eq!(tenant.free_id(id).unwrap(), 0);
        assert_eq!(tenant.next_id().unwrap(), 0);
    }

    #[test]
    fn test_old_chunk_ids_come_from_free_stack() {
        let tenant = tenant(2, None);
        let schema = *tenant.schema();
        let items: Vec<_> = (0..5).map(|tag| insert(&tenant, tag)).collect();
        assert_eq!(items[4].1, schema.create_id(1, 0));

        // Freeing row 1 of the full first chunk moves row 3 into it.
        assert_eq!(tenant.free_id(1).unwrap(), 3);
        assert_eq!(items[3].0.id(), 1);
        assert_eq!(tenant.free_id_count(), 1);

        assert_eq!(tenant.next_id().unwrap(), 3);
        assert_eq!(tenant.next_id().unwrap(), schema.create_id(1, 1));
    }

    #[test]
    fn test_free_stack_drains_before_current_chunk() {
        let tenant = tenant(2, None);
        let schema = *tenant.schema();
        for tag in 0..5 {
            insert(&tenant, tag);
        }
        tenant.free_id(0).unwrap();
        tenant.free_id(0).unwrap();
        // Chunk 0 now has rows 0 and 1; ids 3 then 2 wait on the stack.
        for tag in 0..3 {
            insert(&tenant, tag);
        }
        // Stack drained: 2, 3, then the current chunk continues.
        let third = insert(&tenant, 9).1;
        assert_eq!(third, schema.create_id(1, 2));
        for tag in 0..2 {
            insert(&tenant, tag);
        }
        assert_eq!(tenant.chunk_count(), 3);
        assert_eq!(tenant.size(), 9);
    }

    #[test]
    fn test_free_keeps_reserved_tail() {
        let tenant = tenant(4, None);
        let (_a, a) = insert(&tenant, 0);
        let reserved = tenant.next_id().unwrap();
        assert_eq!((a, reserved), (0, 1));

        // Row 1 is claimed but empty, so row 0 becomes a hole instead.
        assert_eq!(tenant.free_id(a).unwrap(), 0);
        assert_eq!(tenant.free_id(reserved), Err(EcsError::EntityNotFound));
        let again = tenant.next_id().unwrap();
        assert_eq!(again, 0);

        unsafe {
            tenant.register(reserved, Item::new(1)).unwrap();
            tenant.register(again, Item::new(2)).unwrap();
        }
        let mut tags: Vec<usize> = tenant.iter().map(|item| item.tag).collect();
        tags.sort_unstable();
        assert_eq!(tags, vec![1, 2]);
        assert_eq!(tenant.size(), 2);
    }

    #[test]
    fn test_free_stack_grows_on_demand() {
        let tenant = tenant(2, None);
        let items: Vec<_> = (0..40).map(|tag| insert(&tenant, tag)).collect();
        assert_eq!(tenant.chunk_count(), 10);
        assert_eq!(tenant.state.read().free_ids.capacity(), 0);

        for (item, _) in &items[..6] {
            tenant.free_id(item.id()).unwrap();
        }
        assert_eq!(tenant.free_id_count(), 6);
        assert_eq!(tenant.state.read().free_ids.capacity(), 8);
    }

    #[test]
    fn test_capacity_exhausted() {
        let tenant = tenant(2, Some(1));
        for _ in 0..4 {
            tenant.next_id().unwrap();
        }
        assert_eq!(
            tenant.next_id(),
            Err(EcsError::ChunkCapacityExhausted { max_chunks: 1 })
        );
    }

    #[test]
    fn test_unknown_id() {
        let tenant = tenant(4, None);
        assert_eq!(tenant.free_id(3), Err(EcsError::EntityNotFound));
        assert!(tenant.with_row(1 << 10, |_| ()).is_err());
    }

    #[test]
    fn test_register_rejects_occupied_slot() {
        let tenant = tenant(4, None);
        let id = tenant.next_id().unwrap();
        unsafe {
            tenant.register(id, Item::new(1)).unwrap();
            assert_eq!(
                tenant.register(id, Item::new(2)),
                Err(EcsError::DuplicateValue(id))
            );
        }
        assert_eq!(tenant.iter().map(|item| item.tag).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_iter_skips_unpublished_slots() {
        let tenant = tenant(2, None);
        insert(&tenant, 10);
        tenant.next_id().unwrap();
        insert(&tenant, 12);
        insert(&tenant, 13);
        insert(&tenant, 14);
        let tags: Vec<usize> = tenant.iter().map(|item| item.tag).collect();
        assert_eq!(tags, vec![10, 12, 13, 14]);
    }

    #[test]
    fn test_components_dropped_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let pool = Arc::new(ChunkedPool::new(IdSchema::new(2, None).unwrap()));
            let tenant: Tenant<Item> =
                pool.new_tenant(&[ComponentInfo::of::<Tracked>()]).unwrap();
            let ids: Vec<u32> = (0..6)
                .map(|tag| {
                    let value = Tracked(drops.clone());
                    tenant
                        .insert_with(Item::new(tag), move |row| unsafe {
                            ptr::write(row.component_ptr(0) as *mut Tracked, value)
                        })
                        .unwrap()
                })
                .collect();
            tenant.free_id(ids[1]).unwrap();
            assert_eq!(drops.load(Ordering::SeqCst), 1);

            let (_, vacated) = tenant
                .vacate_with(ids[0], |row| {
                    let value = unsafe { ptr::read(row.component_ptr(0) as *const Tracked) };
                    Ok((value, Vacate::Forget))
                })
                .unwrap();
            assert_eq!(vacated, 2);
            assert_eq!(drops.load(Ordering::SeqCst), 2);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_concurrent_next_id_distinct() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 500;
        let tenant = tenant(4, None);

        let ids: Vec<Vec<u32>> = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let tenant = &tenant;
                    s.spawn(move || (0..PER_THREAD).map(|_| tenant.next_id().unwrap()).collect())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let unique: HashSet<u32> = ids.into_iter().flatten().collect();
        assert_eq!(unique.len(), THREADS * PER_THREAD);
        assert_eq!(tenant.size(), THREADS * PER_THREAD);
        assert_eq!(tenant.pool().size(), THREADS * PER_THREAD);
    }

    #[test]
    fn test_concurrent_insert_and_free() {
        let tenant = tenant(3, None);
        let kept: Vec<Vec<Arc<Item>>> = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let tenant = &tenant;
                    s.spawn(move || {
                        let mut kept = Vec::new();
                        for i in 0..200 {
                            let (item, _) = insert(tenant, t * 1000 + i);
                            if i % 3 == 0 {
                                // A concurrent removal may move the item between
                                // reading its id and taking the lock.
                                loop {
                                    let freed = tenant.vacate_with(item.id(), |row| {
                                        if row.holds(&item) {
                                            Ok(((), Vacate::Drop))
                                        } else {
                                            Err(EcsError::EntityNotFound)
                                        }
                                    });
                                    if freed.is_ok() {
                                        break;
                                    }
                                    std::hint::spin_loop();
                                }
                            } else {
                                kept.push(item);
                            }
                        }
                        kept
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let kept: Vec<Arc<Item>> = kept.into_iter().flatten().collect();
        assert_eq!(tenant.size(), kept.len());
        for item in &kept {
            assert!(tenant.with_row(item.id(), |row| row.holds(item)).unwrap());
        }
    }

    #[test]
    fn test_reservations_survive_concurrent_removal() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 200;
        let tenant = tenant(3, None);

        // A double-issued id would fail the second `register`.
        thread::scope(|s| {
            for t in 0..THREADS {
                let tenant = &tenant;
                s.spawn(move || {
                    for i in 0..PER_THREAD {
                        let id = tenant.next_id().unwrap();
                        let (item, _) = insert(tenant, usize::MAX);
                        remove(tenant, &item);
                        unsafe { tenant.register(id, Item::new(t * 1000 + i)).unwrap() };
                    }
                });
            }
        });

        let items: Vec<Arc<Item>> = tenant.iter().collect();
        assert_eq!(items.len(), THREADS * PER_THREAD);
        assert!(items.iter().all(|item| item.tag != usize::MAX));
        let ids: HashSet<u32> = items.iter().map(|item| item.id()).collect();
        assert_eq!(ids.len(), items.len());
    }
}
