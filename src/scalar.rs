//! Scalar linear-probe map with displacement chains.
//!
//! This is the non-vectorized reference the batched maps are measured
//! and tested against. Each slot carries a chain counter `chn`: the
//! number of probe sequences that pass through the slot on their way to
//! a home further along. The counter lets a lookup stop early at an
//! empty slot with `chn == 0` — no displaced key can live beyond it —
//! while erase keeps the counters consistent by walking the same path
//! backwards.

use std::marker::PhantomData;

use crate::hash::crc32;
use crate::probe::key_matches;
use crate::TableFull;

/// Open-addressed linear-probe map from borrowed `N`-byte keys to `i32`
/// values.
///
/// Keys are borrowed for `'k`: the map stores a pointer to the caller's
/// key bytes and never copies or frees them.
pub struct ScalarMap<'k, const N: usize> {
    capacity: usize,
    busybits: Box<[bool]>,
    keyps: Box<[*const u8]>,
    khs: Box<[u32]>,
    chns: Box<[i32]>,
    vals: Box<[i32]>,
    size: usize,
    _keys: PhantomData<&'k [u8]>,
}

impl<'k, const N: usize> ScalarMap<'k, N> {
    /// Creates a map with room for `capacity` entries, allocating all
    /// tables up front.
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero or not a power of two.
    pub fn new(capacity: usize) -> Self {
        const { assert!(N > 0, "key width must be nonzero") }
        assert!(
            capacity > 0 && capacity.is_power_of_two(),
            "capacity must be a power of two, got {capacity}"
        );
        Self {
            capacity,
            busybits: vec![false; capacity].into_boxed_slice(),
            keyps: vec![std::ptr::null(); capacity].into_boxed_slice(),
            khs: vec![0; capacity].into_boxed_slice(),
            chns: vec![0; capacity].into_boxed_slice(),
            vals: vec![0; capacity].into_boxed_slice(),
            size: 0,
            _keys: PhantomData,
        }
    }

    /// Looks the key up, following the displacement chain from its home
    /// slot. Stops as soon as an empty slot with a zero chain counter
    /// proves the key absent.
    pub fn get(&self, key: &[u8; N]) -> Option<i32> {
        let hash = crc32::<N>(key);
        self.find_key(key, hash).map(|idx| self.vals[idx])
    }

    /// Inserts the key or updates it in place.
    ///
    /// Returns the previous value when the key was already present (the
    /// table is not modified otherwise: no chain counter moves, `len` is
    /// unchanged). A new key lands in the first empty slot along its
    /// probe path, bumping the chain counter of every occupied slot it
    /// passes.
    ///
    /// # Errors
    ///
    /// [`TableFull`] when the key is absent and every slot is occupied.
    pub fn put(&mut self, key: &'k [u8; N], value: i32) -> Result<Option<i32>, TableFull> {
        let hash = crc32::<N>(key);
        if let Some(idx) = self.find_key(key, hash) {
            let old = self.vals[idx];
            self.vals[idx] = value;
            return Ok(Some(old));
        }
        if self.size == self.capacity {
            return Err(TableFull { capacity: self.capacity });
        }

        let mask = self.capacity - 1;
        let mut idx = hash as usize & mask;
        while self.busybits[idx] {
            self.chns[idx] += 1;
            idx = (idx + 1) & mask;
        }
        self.busybits[idx] = true;
        self.keyps[idx] = key.as_ptr();
        self.khs[idx] = hash;
        self.vals[idx] = value;
        self.size += 1;
        Ok(None)
    }

    /// Removes the key if present.
    ///
    /// Walks the probe path from the key's home slot: every slot
    /// strictly before the match has its chain counter decremented by
    /// one, the matching slot's busybit is cleared. An absent key leaves
    /// the map untouched.
    pub fn erase(&mut self, key: &[u8; N]) -> bool {
        let hash = crc32::<N>(key);
        let Some(found) = self.find_key(key, hash) else {
            return false;
        };

        let mask = self.capacity - 1;
        let mut idx = hash as usize & mask;
        while idx != found {
            self.chns[idx] -= 1;
            idx = (idx + 1) & mask;
        }
        self.busybits[found] = false;
        self.size -= 1;
        true
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.size
    }

    /// True when no entries are present.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Fixed capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn find_key(&self, key: &[u8; N], hash: u32) -> Option<usize> {
        let mask = self.capacity - 1;
        let start = hash as usize & mask;
        for i in 0..self.capacity {
            let idx = (start + i) & mask;
            if self.busybits[idx] && self.khs[idx] == hash {
                // SAFETY: an occupied slot holds a pointer to a key the
                // caller keeps alive for 'k.
                if unsafe { key_matches::<N>(self.keyps[idx], key) } {
                    return Some(idx);
                }
            } else if !self.busybits[idx] && self.chns[idx] == 0 {
                return None;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> [u8; 16] {
        let mut k = [0u8; 16];
        k[0] = byte;
        k
    }

    #[test]
    fn insert_erase_preserves_chains() {
        let keys: Vec<[u8; 16]> = (1..=4).map(key).collect();
        let mut map = ScalarMap::<16>::new(32);

        for (i, k) in keys.iter().enumerate() {
            assert_eq!(map.put(k, (i as i32 + 1) * 10), Ok(None));
        }
        assert_eq!(map.len(), 4);
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(map.get(k), Some((i as i32 + 1) * 10));
        }

        assert!(map.erase(&keys[1]));
        assert_eq!(map.get(&keys[1]), None);
        // Removal in the middle of a chain must not strand later keys.
        assert_eq!(map.get(&keys[2]), Some(30));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn put_updates_in_place() {
        let k = key(9);
        let mut map = ScalarMap::<16>::new(32);
        assert_eq!(map.put(&k, 1), Ok(None));
        assert_eq!(map.put(&k, 2), Ok(Some(1)));
        assert_eq!(map.get(&k), Some(2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn erase_absent_key_is_a_noop() {
        let present = key(1);
        let absent = key(2);
        let mut map = ScalarMap::<16>::new(32);
        map.put(&present, 5).unwrap();
        assert!(!map.erase(&absent));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&present), Some(5));
    }

    #[test]
    fn fills_to_capacity() {
        let keys: Vec<[u8; 16]> = (0..64).map(|i| key(i as u8)).collect();
        let mut map = ScalarMap::<16>::new(64);
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(map.put(k, i as i32), Ok(None));
        }
        assert_eq!(map.len(), 64);
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(map.get(k), Some(i as i32));
        }

        // A fresh key has nowhere to go; an update still succeeds.
        let fresh = key(200);
        assert_eq!(map.put(&fresh, 1), Err(TableFull { capacity: 64 }));
        assert_eq!(map.put(&keys[10], -1), Ok(Some(10)));
        assert_eq!(map.get(&keys[10]), Some(-1));
    }

    #[test]
    fn colliding_keys_chain_past_each_other() {
        // Probing wraps modulo capacity, so keys landing on the same
        // home slot displace to consecutive slots.
        let keys: Vec<[u8; 16]> = (0..8).map(|i| key(i as u8)).collect();
        let mut map = ScalarMap::<16>::new(8);
        for (i, k) in keys.iter().enumerate() {
            map.put(k, i as i32).unwrap();
        }
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(map.get(k), Some(i as i32));
        }
        // Erase in arbitrary order; survivors stay reachable.
        let mut erased = Vec::new();
        for gone in [3usize, 0, 7] {
            assert!(map.erase(&keys[gone]));
            erased.push(gone);
            for (i, k) in keys.iter().enumerate() {
                if erased.contains(&i) {
                    assert_eq!(map.get(k), None, "key {i} still visible after erase");
                } else {
                    assert_eq!(map.get(k), Some(i as i32), "key {i} lost after erasing {gone}");
                }
            }
        }
    }

    #[test]
    fn odd_width_keys() {
        // 12-byte keys exercise the generic crc32 fold.
        let keys: Vec<[u8; 12]> = (0..10u8).map(|i| [i; 12]).collect();
        let mut map = ScalarMap::<12>::new(16);
        for (i, k) in keys.iter().enumerate() {
            map.put(k, i as i32).unwrap();
        }
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(map.get(k), Some(i as i32));
        }
    }

    #[test]
    fn erase_and_reinsert_cycles() {
        // Repeated churn over the same slots keeps chains balanced.
        let keys: Vec<[u8; 16]> = (0..16).map(|i| key(i as u8)).collect();
        let mut map = ScalarMap::<16>::new(16);
        for round in 0..8 {
            for (i, k) in keys.iter().enumerate() {
                map.put(k, (round * 100 + i) as i32).unwrap();
            }
            assert_eq!(map.len(), 16);
            for (i, k) in keys.iter().enumerate().rev() {
                assert_eq!(map.get(k), Some((round * 100 + i) as i32));
                assert!(map.erase(k));
            }
            assert!(map.is_empty());
        }
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn capacity_must_be_power_of_two() {
        let _ = ScalarMap::<16>::new(48);
    }
}
