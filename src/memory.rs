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

//! Raw memory blocks owned outside of `Vec`
//!
//! A [`RawBlock`] is a single manual allocation released on drop. [`RawBuffer`]
//! types a block as a slice of zero-initializable values such as atomics.

use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicPtr, AtomicU32, AtomicUsize};

use crate::error::{EcsError, Result};

/// Exclusively owned raw allocation.
///
/// Zero-sized layouts never touch the allocator; the block then points at a
/// dangling, correctly aligned address.
pub struct RawBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the block is plain memory; access is synchronized by its owner.
unsafe impl Send for RawBlock {}
unsafe impl Sync for RawBlock {}

impl RawBlock {
    /// Allocate uninitialized memory for `layout`
    pub fn allocate(layout: Layout) -> Result<Self> {
        Self::allocate_with(layout, false)
    }

    /// Allocate zero-filled memory for `layout`
    pub fn allocate_zeroed(layout: Layout) -> Result<Self> {
        Self::allocate_with(layout, true)
    }

    fn allocate_with(layout: Layout, zeroed: bool) -> Result<Self> {
        if layout.size() == 0 {
            return Ok(Self {
                ptr: dangling(layout.align()),
                layout,
            });
        }
        let raw = unsafe {
            if zeroed {
                alloc::alloc_zeroed(layout)
            } else {
                alloc::alloc(layout)
            }
        };
        let ptr = NonNull::new(raw).ok_or(EcsError::AllocationFailed {
            bytes: layout.size(),
        })?;
        Ok(Self { ptr, layout })
    }

    /// Base address of the block
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }
}

impl Drop for RawBlock {
    fn drop(&mut self) {
        if self.layout.size() != 0 {
            unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }
}

fn dangling(align: usize) -> NonNull<u8> {
    // Alignment is a non-zero power of two, so the address is never null.
    NonNull::new(align as *mut u8).unwrap_or(NonNull::dangling())
}

/// Types whose all-zero bit pattern is a valid value.
///
/// # Safety
/// Implementors must accept zeroed memory as a fully initialized value.
pub unsafe trait ZeroInit {}

unsafe impl ZeroInit for AtomicI32 {}
unsafe impl ZeroInit for AtomicI64 {}
unsafe impl ZeroInit for AtomicU32 {}
unsafe impl ZeroInit for AtomicUsize {}
unsafe impl<T> ZeroInit for AtomicPtr<T> {}

/// Fixed-length typed view over a zeroed [`RawBlock`]
pub struct RawBuffer<T: ZeroInit> {
    block: RawBlock,
    len: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T: ZeroInit + Send + Sync> Send for RawBuffer<T> {}
unsafe impl<T: ZeroInit + Send + Sync> Sync for RawBuffer<T> {}

impl<T: ZeroInit> RawBuffer<T> {
    /// Allocate `len` zeroed elements
    pub fn zeroed(len: usize) -> Result<Self> {
        let layout = Layout::array::<T>(len)?;
        Ok(Self {
            block: RawBlock::allocate_zeroed(layout)?,
            len,
            _marker: PhantomData,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the block holds `len` zero-initialized elements of `T`.
        unsafe { std::slice::from_raw_parts(self.block.as_ptr() as *const T, self.len) }
    }

    /// Size of the backing allocation in bytes
    pub fn byte_size(&self) -> usize {
        self.block.size()
    }
}

impl<T: ZeroInit> std::ops::Deref for RawBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_zeroed_buffer() {
        let buffer = RawBuffer::<AtomicI64>::zeroed(64).unwrap();
        assert_eq!(buffer.len(), 64);
        assert_eq!(buffer.byte_size(), 64 * 8);
        assert!(buffer.iter().all(|v| v.load(Ordering::Relaxed) == 0));

        buffer[10].store(42, Ordering::Relaxed);
        assert_eq!(buffer[10].load(Ordering::Relaxed), 42);
    }

    #[test]
    fn test_null_pointers_after_zeroing() {
        let buffer = RawBuffer::<AtomicPtr<u32>>::zeroed(8).unwrap();
        assert!(buffer.iter().all(|p| p.load(Ordering::Relaxed).is_null()));
    }

    #[test]
    fn test_zero_sized_block_is_aligned() {
        let block = RawBlock::allocate(Layout::from_size_align(0, 16).unwrap()).unwrap();
        assert_eq!(block.size(), 0);
        assert_eq!(block.as_ptr() as usize % 16, 0);

        let empty = RawBuffer::<AtomicU32>::zeroed(0).unwrap();
        assert!(empty.is_empty());
    }
}
