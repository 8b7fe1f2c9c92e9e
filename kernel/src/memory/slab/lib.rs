// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Fixed-type slot pools built from chunked slabs.
//!
//! A [`Slab`] stores values of one type in a sequence of fixed-size
//! chunks. Each chunk holds a free bitmap and inline storage for a
//! fixed number of slots; allocation takes the first free bit of the
//! first chunk with space, so slot keys are stable and allocation is
//! first-fit. Chunks are added on demand and never removed, so a key
//! handed out stays valid until the slot is removed.
//!
//! The handle manager keys its object tables on slab slots; the
//! generation half of a handle guards against a slot being reused.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitmap_index::Bitmap;
use core::mem::MaybeUninit;

/// The storage footprint of one chunk, in bytes. Chunks hold
/// as many slots as fit here, and at least one.
///
const CHUNK_BYTES: usize = 32 * 1024;

/// A slot pool for values of type `T`, with stable integer
/// keys.
///
pub struct Slab<T> {
    chunks: Vec<Chunk<T>>,
    allocated: usize,
}

struct Chunk<T> {
    // A set bit marks an allocated slot.
    used: Bitmap,
    storage: Box<[MaybeUninit<T>]>,
}

impl<T> Slab<T> {
    /// The number of slots in each chunk.
    ///
    const SLOTS_PER_CHUNK: usize = {
        let fit = CHUNK_BYTES / core::mem::size_of::<T>();
        if fit == 0 {
            1
        } else {
            fit
        }
    };

    /// Returns a new, empty slab.
    ///
    pub const fn new() -> Self {
        Slab {
            chunks: Vec::new(),
            allocated: 0,
        }
    }

    /// Returns the number of allocated slots.
    ///
    pub fn len(&self) -> usize {
        self.allocated
    }

    /// Returns whether no slots are allocated.
    ///
    pub fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    /// Stores `value` in a free slot, returning its key.
    ///
    /// The first free slot of the first chunk with space is used, so
    /// keys are handed out lowest-first.
    ///
    pub fn insert(&mut self, value: T) -> usize {
        for (i, chunk) in self.chunks.iter_mut().enumerate() {
            if let Some(slot) = chunk.used.next_unset() {
                chunk.used.set(slot);
                chunk.storage[slot] = MaybeUninit::new(value);
                self.allocated += 1;

                return i * Self::SLOTS_PER_CHUNK + slot;
            }
        }

        // Every chunk is full; grow by one.
        let mut chunk = Chunk::new(Self::SLOTS_PER_CHUNK);
        chunk.used.set(0);
        chunk.storage[0] = MaybeUninit::new(value);

        self.chunks.push(chunk);
        self.allocated += 1;

        (self.chunks.len() - 1) * Self::SLOTS_PER_CHUNK
    }

    /// Returns a reference to the value at `key`, or `None`
    /// if the slot is free or out of bounds.
    ///
    pub fn get(&self, key: usize) -> Option<&T> {
        let chunk = self.chunks.get(key / Self::SLOTS_PER_CHUNK)?;
        let slot = key % Self::SLOTS_PER_CHUNK;
        if !chunk.used.get(slot) {
            return None;
        }

        // The bitmap says the slot is initialised.
        Some(unsafe { &*chunk.storage[slot].as_ptr() })
    }

    /// Removes and returns the value at `key`.
    ///
    /// # Panics
    ///
    /// `remove` will panic if the slot is not allocated; freeing a
    /// free slot is a caller bug.
    ///
    pub fn remove(&mut self, key: usize) -> T {
        let chunk_idx = key / Self::SLOTS_PER_CHUNK;
        let slot = key % Self::SLOTS_PER_CHUNK;
        let chunk = match self.chunks.get_mut(chunk_idx) {
            Some(chunk) => chunk,
            None => panic!("slab slot {} out of bounds", key),
        };

        if !chunk.used.get(slot) {
            panic!("slab slot {} is not allocated", key);
        }

        chunk.used.unset(slot);
        self.allocated -= 1;

        let value = core::mem::replace(&mut chunk.storage[slot], MaybeUninit::uninit());

        // The bitmap said the slot was initialised.
        unsafe { value.assume_init() }
    }

    /// Returns whether the slot at `key` is allocated.
    ///
    pub fn contains(&self, key: usize) -> bool {
        self.get(key).is_some()
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Slab::new()
    }
}

impl<T> Chunk<T> {
    fn new(slots: usize) -> Self {
        let mut storage = Vec::with_capacity(slots);
        storage.resize_with(slots, MaybeUninit::uninit);

        Chunk {
            used: Bitmap::new_unset(slots),
            storage: storage.into_boxed_slice(),
        }
    }
}

impl<T> Drop for Chunk<T> {
    fn drop(&mut self) {
        // Run the destructors of the slots still allocated.
        for slot in 0..self.used.len() {
            if self.used.get(slot) {
                unsafe { core::ptr::drop_in_place(self.storage[slot].as_mut_ptr()) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use alloc::vec;

    #[test]
    fn insert_get_remove() {
        let mut slab = Slab::new();
        assert!(slab.is_empty());

        let a = slab.insert(10u64);
        let b = slab.insert(20u64);
        let c = slab.insert(30u64);
        assert_eq!(slab.len(), 3);
        assert_eq!(slab.get(a), Some(&10));
        assert_eq!(slab.get(b), Some(&20));
        assert_eq!(slab.get(c), Some(&30));

        assert_eq!(slab.remove(b), 20);
        assert_eq!(slab.get(b), None);
        assert!(!slab.contains(b));
        assert_eq!(slab.len(), 2);

        // The freed slot is the first to be reused.
        let d = slab.insert(40u64);
        assert_eq!(d, b);
        assert_eq!(slab.get(d), Some(&40));
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn double_remove_panics() {
        let mut slab = Slab::new();
        let key = slab.insert(1u32);
        slab.remove(key);
        slab.remove(key);
    }

    #[test]
    fn grows_across_chunks() {
        // Fill more than one chunk and check keys stay
        // distinct and resolvable.
        let per_chunk = Slab::<u64>::SLOTS_PER_CHUNK;
        let mut slab = Slab::new();
        let mut keys = vec![];
        for i in 0..(per_chunk + 3) {
            keys.push(slab.insert(i as u64));
        }

        assert_eq!(slab.len(), per_chunk + 3);
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(slab.get(*key), Some(&(i as u64)));
        }

        // Keys in the second chunk start past the first.
        assert_eq!(keys[per_chunk], per_chunk);
    }

    #[test]
    fn drops_remaining_values() {
        let value = Rc::new(0u32);
        {
            let mut slab = Slab::new();
            slab.insert(value.clone());
            slab.insert(value.clone());
            let key = slab.insert(value.clone());
            slab.remove(key);
            assert_eq!(Rc::strong_count(&value), 3);
        }

        // Dropping the slab dropped the remaining slots.
        assert_eq!(Rc::strong_count(&value), 1);
    }
}
