//! Dense-index handle allocator.
//!
//! External peers identify objects by compact indices, while the core wants
//! stable identifiers that survive reordering. The allocator maintains the
//! mapping both ways with O(1) alloc and free: freeing swaps the freed dense
//! slot with the last in-use slot, so `handle_at(0..count)` always
//! enumerates the live handles without gaps.

use std::collections::HashMap;

pub const INVALID_HANDLE: u16 = u16::MAX;

pub struct HandleAlloc {
    count: u16,
    capacity: u16,
    handle_to_index: Vec<u16>,
    index_to_handle: Vec<u16>,
    handle_to_key: Vec<i32>,
    key_to_handle: HashMap<i32, u16>,
}

impl HandleAlloc {
    pub fn new(capacity: u16) -> Self {
        assert!(capacity < INVALID_HANDLE, "capacity exhausts the handle space");
        Self {
            count: 0,
            capacity,
            handle_to_index: (0..capacity).collect(),
            index_to_handle: (0..capacity).collect(),
            handle_to_key: vec![0; capacity as usize],
            key_to_handle: HashMap::new(),
        }
    }

    /// Allocates the next free handle, or `INVALID_HANDLE` when full.
    pub fn alloc(&mut self) -> u16 {
        if self.count == self.capacity {
            return INVALID_HANDLE;
        }
        let handle = self.index_to_handle[self.count as usize];
        self.handle_to_index[handle as usize] = self.count;
        self.count += 1;
        handle
    }

    /// Allocates a handle and associates an external key for O(1) lookup.
    pub fn alloc_key(&mut self, key: i32) -> u16 {
        let handle = self.alloc();
        if handle != INVALID_HANDLE {
            self.handle_to_key[handle as usize] = key;
            self.key_to_handle.insert(key, handle);
        }
        handle
    }

    /// Frees a handle, swapping its dense slot with the last in-use one.
    pub fn free(&mut self, handle: u16) {
        assert!(self.is_valid(handle), "freeing an invalid handle");

        let key = self.handle_to_key[handle as usize];
        if self.key_to_handle.get(&key) == Some(&handle) {
            self.key_to_handle.remove(&key);
        }

        let index = self.handle_to_index[handle as usize];
        let last = self.count - 1;
        let moved = self.index_to_handle[last as usize];

        self.index_to_handle[index as usize] = moved;
        self.handle_to_index[moved as usize] = index;
        self.index_to_handle[last as usize] = handle;
        self.handle_to_index[handle as usize] = last;

        self.count = last;
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.key_to_handle.clear();
        for i in 0..self.capacity {
            self.handle_to_index[i as usize] = i;
            self.index_to_handle[i as usize] = i;
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn is_valid(&self, handle: u16) -> bool {
        (handle as usize) < self.handle_to_index.len()
            && self.handle_to_index[handle as usize] < self.count
            && self.index_to_handle[self.handle_to_index[handle as usize] as usize] == handle
    }

    /// Live handle stored at dense slot `index` (`index < count`).
    pub fn handle_at(&self, index: u16) -> u16 {
        assert!(index < self.count, "dense index out of range");
        self.index_to_handle[index as usize]
    }

    pub fn contains_key(&self, key: i32) -> bool {
        self.key_to_handle.contains_key(&key)
    }

    /// Handle previously allocated with `alloc_key`, or `INVALID_HANDLE`.
    pub fn get_by_key(&self, key: i32) -> u16 {
        self.key_to_handle.get(&key).copied().unwrap_or(INVALID_HANDLE)
    }

    /// Iterates the currently live handles in dense order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.index_to_handle[..self.count as usize].iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{seq::SliceRandom, Rng};
    use std::collections::HashSet;

    #[test]
    fn alloc_until_full() {
        let mut halloc = HandleAlloc::new(4);
        let handles: Vec<u16> = (0..4).map(|_| halloc.alloc()).collect();
        assert!(handles.iter().all(|&h| h != INVALID_HANDLE));
        assert_eq!(halloc.alloc(), INVALID_HANDLE);
        assert_eq!(halloc.count(), 4);
    }

    #[test]
    fn free_keeps_dense_enumeration() {
        let mut halloc = HandleAlloc::new(8);
        let handles: Vec<u16> = (0..8).map(|_| halloc.alloc()).collect();
        halloc.free(handles[2]);
        halloc.free(handles[5]);

        let live: HashSet<u16> = halloc.iter().collect();
        assert_eq!(live.len(), 6);
        assert!(!live.contains(&handles[2]));
        assert!(!live.contains(&handles[5]));
        for &h in &live {
            assert!(halloc.is_valid(h));
        }
        assert!(!halloc.is_valid(handles[2]));
    }

    #[test]
    fn key_lookup() {
        let mut halloc = HandleAlloc::new(4);
        let h = halloc.alloc_key(1234);
        assert!(halloc.contains_key(1234));
        assert_eq!(halloc.get_by_key(1234), h);
        halloc.free(h);
        assert!(!halloc.contains_key(1234));
        assert_eq!(halloc.get_by_key(1234), INVALID_HANDLE);
    }

    #[test]
    fn randomized_alloc_free_bijection() {
        let mut rng = rand::thread_rng();
        let mut halloc = HandleAlloc::new(64);
        let mut live: Vec<u16> = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || (live.len() < 64 && rng.gen_bool(0.6)) {
                let h = halloc.alloc();
                assert_ne!(h, INVALID_HANDLE);
                assert!(!live.contains(&h));
                live.push(h);
            } else {
                live.shuffle(&mut rng);
                let h = live.pop().unwrap();
                halloc.free(h);
            }

            assert_eq!(halloc.count() as usize, live.len());
            let enumerated: HashSet<u16> = halloc.iter().collect();
            assert_eq!(enumerated, live.iter().copied().collect());
        }
    }
}
