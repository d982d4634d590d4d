// Copyright 2024 Kevin Ludwig
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

#![cfg_attr(not(test), no_std)]

use core::{marker, mem, ptr::NonNull};

use volatile::{
    access::{Readable, Writable},
    VolatilePtr,
};

pub use volatile::access::{ReadOnly, ReadWrite, WriteOnly};

/// A window of memory-mapped device registers.
///
/// Every access goes through a volatile pointer, so reads and writes are
/// never elided, merged or reordered by the compiler.
pub struct Mmio {
    base: NonNull<u8>,
    size: usize,
}

// Register windows are shared between the submission path and the interrupt
// handler; the device serializes the accesses itself.
unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Mmio {
    /// Creates a register window.
    ///
    /// # Safety
    ///
    /// `base` must point to `size` bytes of mapped device memory that stay
    /// mapped for the lifetime of the window.
    pub const unsafe fn new(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the register at `offset`.
    ///
    /// Since not all registers are both readable and writable, the access
    /// type `A` limits the allowed operations. It defaults to `ReadWrite`.
    pub fn register<T: Copy, A>(&self, offset: usize) -> Register<'_, T, A> {
        assert!(offset + mem::size_of::<T>() <= self.size);
        assert!(offset % mem::align_of::<T>() == 0);

        Register {
            pointer: unsafe { self.base.add(offset) }.cast(),
            access: marker::PhantomData,
            window: marker::PhantomData,
        }
    }

    /// Performs a read on the register at `offset`.
    pub fn read<T: Copy>(&self, offset: usize) -> T {
        self.register::<T, ReadOnly>(offset).read()
    }

    /// Performs a write on the register at `offset`.
    pub fn write<T: Copy>(&self, offset: usize, value: T) {
        self.register::<T, WriteOnly>(offset).write(value)
    }
}

#[must_use]
#[derive(Clone, Copy)]
pub struct Register<'window, T, A = ReadWrite> {
    pointer: NonNull<T>,
    access: marker::PhantomData<A>,
    window: marker::PhantomData<&'window Mmio>,
}

impl<T: Copy, A> Register<'_, T, A> {
    /// Performs a read on the contained register.
    pub fn read(self) -> T
    where
        A: Readable,
    {
        unsafe { VolatilePtr::new(self.pointer) }.read()
    }

    /// Performs a write on the contained register.
    pub fn write(self, value: T)
    where
        A: Writable,
    {
        unsafe { VolatilePtr::new(self.pointer) }.write(value)
    }

    /// Performs a read-modify-write on the contained register.
    pub fn update(self, f: impl FnOnce(T) -> T)
    where
        A: Readable + Writable,
    {
        let value = self.read();
        self.write(f(value));
    }
}
