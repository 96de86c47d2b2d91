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

//! Fixed-capacity lock-free LIFO stacks over raw memory
//!
//! The top index is claimed with a CAS loop; each slot then hands its value
//! over through the `MIN` marker, so a pop never observes a slot whose push
//! has reserved it but not yet written it.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicUsize, Ordering};

use crate::error::Result;
use crate::memory::{RawBuffer, ZeroInit};

/// Word type storable in a [`ConcurrentStack`]
pub trait StackWord: Copy + Eq + Send + Sync + 'static {
    type Atomic: ZeroInit + Send + Sync;

    /// Marker of an empty slot; never accepted by `push`
    const EMPTY: Self;

    fn load(cell: &Self::Atomic) -> Self;
    fn store(cell: &Self::Atomic, value: Self);
    fn swap(cell: &Self::Atomic, value: Self) -> Self;
    fn compare_exchange(cell: &Self::Atomic, current: Self, new: Self) -> bool;
}

macro_rules! impl_stack_word {
    ($word:ty, $atomic:ty) => {
        impl StackWord for $word {
            type Atomic = $atomic;

            const EMPTY: Self = <$word>::MIN;

            #[inline]
            fn load(cell: &$atomic) -> Self {
                cell.load(Ordering::Acquire)
            }

            #[inline]
            fn store(cell: &$atomic, value: Self) {
                cell.store(value, Ordering::Release)
            }

            #[inline]
            fn swap(cell: &$atomic, value: Self) -> Self {
                cell.swap(value, Ordering::AcqRel)
            }

            #[inline]
            fn compare_exchange(cell: &$atomic, current: Self, new: Self) -> bool {
                cell.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            }
        }
    };
}

impl_stack_word!(i32, AtomicI32);
impl_stack_word!(i64, AtomicI64);

/// Lock-free fixed-capacity stack
pub struct ConcurrentStack<W: StackWord> {
    slots: RawBuffer<W::Atomic>,
    top: AtomicUsize,
}

/// Stack of 32-bit ids
pub type ConcurrentIntStack = ConcurrentStack<i32>;

/// Stack of 64-bit values
pub type ConcurrentLongStack = ConcurrentStack<i64>;

impl<W: StackWord> ConcurrentStack<W> {
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let slots = RawBuffer::<W::Atomic>::zeroed(capacity)?;
        for slot in slots.iter() {
            W::store(slot, W::EMPTY);
        }
        Ok(Self {
            slots,
            top: AtomicUsize::new(0),
        })
    }

    /// Push a value, returning false once the stack is full.
    ///
    /// `W::EMPTY` is the slot marker and is rejected.
    pub fn push(&self, value: W) -> bool {
        if value == W::EMPTY {
            return false;
        }
        let mut top = self.top.load(Ordering::Acquire);
        loop {
            if top >= self.slots.len() {
                return false;
            }
            match self
                .top
                .compare_exchange_weak(top, top + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => top = actual,
            }
        }
        let slot = &self.slots[top];
        // A pop that claimed this index earlier may still be draining it.
        while !W::compare_exchange(slot, W::EMPTY, value) {
            spin_loop();
        }
        true
    }

    /// Pop the most recent value, `None` when empty
    pub fn pop(&self) -> Option<W> {
        let mut top = self.top.load(Ordering::Acquire);
        loop {
            if top == 0 {
                return None;
            }
            match self
                .top
                .compare_exchange_weak(top, top - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => top = actual,
            }
        }
        let slot = &self.slots[top - 1];
        loop {
            let value = W::swap(slot, W::EMPTY);
            if value != W::EMPTY {
                return Some(value);
            }
            spin_loop();
        }
    }

    /// Number of claimed slots
    pub fn size(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Drain into a vector, most recent first
    pub fn drain(&self) -> Vec<W> {
        let mut values = Vec::with_capacity(self.size());
        while let Some(value) = self.pop() {
            values.push(value);
        }
        values
    }
}
