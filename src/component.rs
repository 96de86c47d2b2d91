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

//! Component and Bundle traits
//!
//! Components are data attached to entities.
//! Bundles hand a fixed set of components to a composition as type-erased
//! pointers, so the composition can reorder them without boxing.

use std::alloc::Layout;
use std::any::TypeId;
use std::fmt;
use std::mem::ManuallyDrop;

use smallvec::{smallvec, SmallVec};

use crate::error::Result;

/// Maximum number of components supported by Bundle implementations
pub const MAX_BUNDLE_COMPONENTS: usize = 8;

/// Marker trait for components
///
/// Components must be 'static (no borrowed data)
pub trait Component: 'static + Send + Sync {}

/// Automatically implement Component for all valid types
impl<T: 'static + Send + Sync> Component for T {}

/// Runtime description of a component type
#[derive(Clone, Copy)]
pub struct ComponentInfo {
    type_id: TypeId,
    name: &'static str,
    layout: Layout,
    drop_fn: Option<unsafe fn(*mut u8)>,
}

impl ComponentInfo {
    pub fn of<T: Component>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            layout: Layout::new::<T>(),
            drop_fn: if std::mem::needs_drop::<T>() {
                Some(|ptr| unsafe {
                    std::ptr::drop_in_place(ptr as *mut T);
                })
            } else {
                None
            },
        }
    }

    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Drop the value at `ptr` in place
    ///
    /// # Safety
    /// `ptr` must point to an initialized value of this component type.
    #[inline]
    pub unsafe fn drop_value(&self, ptr: *mut u8) {
        if let Some(drop_fn) = self.drop_fn {
            drop_fn(ptr);
        }
    }
}

impl PartialEq for ComponentInfo {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ComponentInfo {}

impl fmt::Debug for ComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentInfo")
            .field("name", &self.name)
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

/// A component value seen through its type description.
///
/// The pointer refers to a value owned elsewhere; whoever consumes an erased
/// component moves the bytes out and the owner must not drop it afterwards.
#[derive(Clone, Copy, Debug)]
pub struct ErasedComponent {
    info: ComponentInfo,
    ptr: *mut u8,
}

impl ErasedComponent {
    /// # Safety
    /// `ptr` must point to an initialized value described by `info` and stay
    /// valid while the erased component is in use.
    pub unsafe fn new(info: ComponentInfo, ptr: *mut u8) -> Self {
        Self { info, ptr }
    }

    #[inline]
    pub fn info(&self) -> &ComponentInfo {
        &self.info
    }

    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.info.type_id
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Move the value into `dst`
    ///
    /// # Safety
    /// `dst` must be valid for writes of this component's layout. The source
    /// must be treated as moved-from afterwards.
    #[inline]
    pub unsafe fn move_to(&self, dst: *mut u8) {
        std::ptr::copy_nonoverlapping(self.ptr, dst, self.info.layout.size());
    }
}

/// Bundle of components
///
/// Allows creating entities with multiple components at once.
pub trait Bundle: Send + Sync + 'static {
    /// Descriptions of all components in declaration order
    fn component_infos() -> SmallVec<[ComponentInfo; MAX_BUNDLE_COMPONENTS]>
    where
        Self: Sized;

    /// Hand the components to `sink` as erased pointers.
    ///
    /// When `sink` returns `Ok` it has moved every component out. On `Err`
    /// the bundle drops its components itself.
    fn take_components<Out, Sink>(self, sink: Sink) -> Result<Out>
    where
        Self: Sized,
        Sink: FnOnce(&mut [ErasedComponent]) -> Result<Out>;
}

impl Bundle for () {
    fn component_infos() -> SmallVec<[ComponentInfo; MAX_BUNDLE_COMPONENTS]> {
        SmallVec::new()
    }

    fn take_components<Out, Sink>(self, sink: Sink) -> Result<Out>
    where
        Sink: FnOnce(&mut [ErasedComponent]) -> Result<Out>,
    {
        sink(&mut [])
    }
}

// Macro for tuple Bundle implementations
macro_rules! impl_bundle {
    ($($T:ident),*) => {
        impl<$($T: Component),*> Bundle for ($($T,)*) {
            fn component_infos() -> SmallVec<[ComponentInfo; MAX_BUNDLE_COMPONENTS]> {
                smallvec![$(ComponentInfo::of::<$T>()),*]
            }

            #[allow(non_snake_case)]
            fn take_components<Out, Sink>(self, sink: Sink) -> Result<Out>
            where
                Sink: FnOnce(&mut [ErasedComponent]) -> Result<Out>,
            {
                let mut values = ManuallyDrop::new(self);
                let mut erased: SmallVec<[ErasedComponent; MAX_BUNDLE_COMPONENTS]> = {
                    let ($($T,)*) = &mut *values;
                    // SAFETY: each pointer targets a live field of `values`.
                    unsafe {
                        smallvec![$(ErasedComponent::new(
                            ComponentInfo::of::<$T>(),
                            $T as *mut $T as *mut u8,
                        )),*]
                    }
                };
                let result = sink(&mut erased);
                if result.is_err() {
                    // SAFETY: on error nothing was moved out of `values`.
                    unsafe { ManuallyDrop::drop(&mut values) };
                }
                result
            }
        }
    };
}

// Implement for tuples of 1-8 components
impl_bundle!(A);
impl_bundle!(A, B);
impl_bundle!(A, B, C);
impl_bundle!(A, B, C, D);
impl_bundle!(A, B, C, D, E);
impl_bundle!(A, B, C, D, E, F);
impl_bundle!(A, B, C, D, E, F, G);
impl_bundle!(A, B, C, D, E, F, G, H);
