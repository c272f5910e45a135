//! 16-lane vectorized map over split parallel arrays with busybits.
//!
//! Slot state lives in four parallel arrays (busybits, key pointers,
//! hashes, values). A batched lookup gathers busybits and hashes per
//! probe step, confirms hash matches with a full key comparison, and
//! scatters nothing; a batched insert resolves intra-batch slot races
//! with the conflict-detect primitive and scatters all four arrays under
//! the insertion mask.

use std::marker::PhantomData;

use crate::hash::crc32;
use crate::probe::{self, key_matches, SlotTable};
use crate::{KeyBatch, TableFull};

/// 16-lane busybit-based map from borrowed `N`-byte keys to `i32`
/// values.
///
/// `N` must be a positive multiple of 4: the batched key comparison
/// walks keys four bytes at a time.
///
/// Erasing punches a hole that later *batched* lookups treat as a probe
/// terminator, so keys displaced past an erased slot stop being visible
/// to [`get_vec`](Self::get_vec) (scalar [`get`](Self::get) scans past
/// holes and is unaffected). Batched deletion is deliberately absent;
/// mixed erase/lookup workloads belong on the scalar path.
pub struct SplitMap16<'k, const N: usize> {
    capacity: usize,
    busybits: Box<[i32]>,
    keyps: Box<[*const u8]>,
    khs: Box<[u32]>,
    vals: Box<[i32]>,
    size: usize,
    use_batch_kernels: bool,
    _keys: PhantomData<&'k [u8]>,
}

impl<'k, const N: usize> SplitMap16<'k, N> {
    /// Lanes per batched call.
    pub const LANES: usize = 16;

    /// Creates a map with room for `capacity` entries, allocating all
    /// tables up front.
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero or not a power of two.
    pub fn new(capacity: usize) -> Self {
        const { assert!(N > 0 && N % 4 == 0, "key width must be a positive multiple of 4") }
        assert!(
            capacity > 0 && capacity.is_power_of_two(),
            "capacity must be a power of two, got {capacity}"
        );
        Self {
            capacity,
            busybits: vec![0; capacity].into_boxed_slice(),
            keyps: vec![std::ptr::null(); capacity].into_boxed_slice(),
            khs: vec![0; capacity].into_boxed_slice(),
            vals: vec![0; capacity].into_boxed_slice(),
            size: 0,
            use_batch_kernels: crate::simd::batch_kernels_available(),
            _keys: PhantomData,
        }
    }

    /// Batched lookup of 16 keys.
    ///
    /// Writes `out[lane]` for every lane whose key is present and
    /// returns the found mask (bit `lane` set on a hit). Output slots of
    /// missed lanes are left untouched.
    pub fn get_vec(&self, keys: &KeyBatch<16, N>, out: &mut [i32; 16]) -> u16 {
        let hashes = self.hash_batch(keys);
        #[cfg(target_arch = "x86_64")]
        if self.use_batch_kernels {
            // SAFETY: AVX-512 support was verified at construction.
            return unsafe { self.get_vec_avx512(keys, &hashes, out) };
        }
        probe::get_lanes(self, &hashes, keys, out) as u16
    }

    /// Batched insert of 16 fresh keys with their values.
    ///
    /// The caller contract is batch-insert of new entries: no key may
    /// already be present in the map or repeat within the batch, and the
    /// key block must stay alive and unmodified while the entries are in
    /// the map. Afterwards `len` has grown by exactly 16.
    ///
    /// # Panics
    ///
    /// Panics when fewer than 16 slots are free.
    pub fn put_vec(&mut self, keys: &'k KeyBatch<16, N>, values: &[i32; 16]) {
        assert!(
            self.size + Self::LANES <= self.capacity,
            "batch insert needs {} free slots, have {}",
            Self::LANES,
            self.capacity - self.size
        );
        let hashes = self.hash_batch(keys);
        #[cfg(target_arch = "x86_64")]
        if self.use_batch_kernels {
            // SAFETY: AVX-512 support was verified at construction.
            unsafe { self.put_vec_avx512(keys, &hashes, values) };
            self.size += Self::LANES;
            return;
        }
        probe::put_lanes(self, &hashes, keys, values);
        self.size += Self::LANES;
    }

    /// Scalar lookup. Scans the full table on a miss (no chain counters
    /// to stop early on), so it keeps finding keys displaced past erase
    /// holes.
    pub fn get(&self, key: &[u8; N]) -> Option<i32> {
        let hash = crc32::<N>(key);
        self.find_key(key, hash).map(|idx| self.vals[idx])
    }

    /// Inserts the key or updates it in place, returning the previous
    /// value if any.
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
        while self.busybits[idx] != 0 {
            idx = (idx + 1) & mask;
        }
        self.busybits[idx] = 1;
        self.keyps[idx] = key.as_ptr();
        self.khs[idx] = hash;
        self.vals[idx] = value;
        self.size += 1;
        Ok(None)
    }

    /// Removes the key if present by clearing its busybit.
    pub fn erase(&mut self, key: &[u8; N]) -> bool {
        let hash = crc32::<N>(key);
        match self.find_key(key, hash) {
            Some(idx) => {
                self.busybits[idx] = 0;
                self.size -= 1;
                true
            }
            None => false,
        }
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

    /// Per-lane hashes of the batch, loaded by the probe loops once at
    /// entry.
    fn hash_batch(&self, keys: &KeyBatch<16, N>) -> [u32; 16] {
        let mut hashes = [0u32; 16];
        for (lane, h) in hashes.iter_mut().enumerate() {
            *h = crc32::<N>(keys.key(lane));
        }
        hashes
    }

    fn find_key(&self, key: &[u8; N], hash: u32) -> Option<usize> {
        let mask = self.capacity - 1;
        let start = hash as usize & mask;
        for i in 0..self.capacity {
            let idx = (start + i) & mask;
            if self.busybits[idx] != 0 && self.khs[idx] == hash {
                // SAFETY: occupied slots hold key pointers live for 'k.
                if unsafe { key_matches::<N>(self.keyps[idx], key) } {
                    return Some(idx);
                }
            }
        }
        None
    }

    #[cfg(target_arch = "x86_64")]
    #[target_feature(enable = "avx512f,avx512cd,avx512dq,avx512vl")]
    unsafe fn get_vec_avx512(
        &self,
        keys: &KeyBatch<16, N>,
        hashes: &[u32; 16],
        out: &mut [i32; 16],
    ) -> u16 {
        use core::arch::x86_64::*;

        let cap_mask = _mm512_set1_epi32((self.capacity - 1) as i32);
        let cap = _mm512_set1_epi32(self.capacity as i32);
        // SAFETY: reading 64 bytes from the hash array.
        let hashes_vec = unsafe { _mm512_loadu_si512(hashes.as_ptr() as *const _) };

        // Lanes still probing.
        let mut mask: __mmask16 = 0xffff;
        let mut offset = _mm512_setzero_si512();
        let mut found: __mmask16 = 0;

        while mask != 0 {
            let indices = _mm512_and_si512(_mm512_add_epi32(hashes_vec, offset), cap_mask);

            // SAFETY: indices are masked into 0..capacity; gathers read
            // only the active lanes' slots.
            let (busy, stored) = unsafe {
                (
                    _mm512_mask_i32gather_epi32::<4>(
                        _mm512_setzero_si512(),
                        mask,
                        indices,
                        self.busybits.as_ptr() as *const _,
                    ),
                    _mm512_mask_i32gather_epi32::<4>(
                        _mm512_setzero_si512(),
                        mask,
                        indices,
                        self.khs.as_ptr() as *const _,
                    ),
                )
            };

            let busy_cmp = _mm512_cmpneq_epi32_mask(busy, _mm512_setzero_si512());
            let hash_cmp = _mm512_cmpeq_epi32_mask(stored, hashes_vec);
            let candidates = busy_cmp & hash_cmp;

            // An empty slot ends the probe for its lane: the key is
            // absent.
            mask &= busy_cmp;

            // SAFETY: candidate lanes hold valid slot indices and live
            // key pointers; N % 4 == 0 per the construction assert.
            let matched = unsafe {
                crate::simd::x86::confirm_keys16::<N>(
                    keys.as_ptr(),
                    indices,
                    candidates,
                    self.keyps.as_ptr(),
                )
            };

            // SAFETY: value gather is masked by matched lanes; the
            // masked store writes only those lanes of `out`.
            unsafe {
                let values = _mm512_mask_i32gather_epi32::<4>(
                    _mm512_setzero_si512(),
                    matched,
                    indices,
                    self.vals.as_ptr() as *const _,
                );
                _mm512_mask_storeu_epi32(out.as_mut_ptr() as *mut _, matched, values);
            }

            found |= matched;
            mask &= !matched;

            offset = _mm512_mask_add_epi32(offset, mask, offset, _mm512_set1_epi32(1));

            // A lane that has probed every slot retires empty-handed.
            let wrapped = _mm512_mask_cmpeq_epi32_mask(mask, offset, cap);
            mask &= !wrapped;
        }
        found
    }

    #[cfg(target_arch = "x86_64")]
    #[target_feature(enable = "avx512f,avx512cd,avx512dq,avx512vl")]
    unsafe fn put_vec_avx512(&mut self, keys: &KeyBatch<16, N>, hashes: &[u32; 16], values: &[i32; 16]) {
        use core::arch::x86_64::*;

        let cap_mask = _mm512_set1_epi32((self.capacity - 1) as i32);
        // SAFETY: 64-byte reads from the hash and value arrays.
        let hashes_vec = unsafe { _mm512_loadu_si512(hashes.as_ptr() as *const _) };
        let values_vec = unsafe { _mm512_loadu_si512(values.as_ptr() as *const _) };

        // Per-lane key pointers, 64-bit, in two half-batches.
        // SAFETY: register construction only.
        let keys_lo = unsafe { crate::simd::x86::lane_ptrs(keys.as_ptr(), N, 0) };
        let keys_hi = unsafe { crate::simd::x86::lane_ptrs(keys.as_ptr(), N, 8) };

        let mut mask: __mmask16 = 0xffff;
        let mut offset = _mm512_setzero_si512();
        let mut rounds = 0usize;

        while mask != 0 {
            let indices = _mm512_and_si512(_mm512_add_epi32(hashes_vec, offset), cap_mask);

            // Per lane, a bitmask of earlier lanes probing the same
            // slot this round; only conflict-free lanes may install.
            let conflicts = _mm512_mask_conflict_epi32(_mm512_setzero_si512(), mask, indices);
            let no_conflict =
                _mm512_mask_testn_epi32_mask(mask, conflicts, _mm512_set1_epi32(-1)) & mask;

            // SAFETY: masked gather of in-table busybits.
            let busy = unsafe {
                _mm512_mask_i32gather_epi32::<4>(
                    _mm512_setzero_si512(),
                    no_conflict,
                    indices,
                    self.busybits.as_ptr() as *const _,
                )
            };

            // Lanes that are pending, conflict-free, and over an empty
            // slot.
            let install = _mm512_mask_cmpeq_epi32_mask(no_conflict, busy, _mm512_setzero_si512());

            let indices_lo = _mm512_castsi512_si256(indices);
            let indices_hi = _mm512_extracti32x8_epi32::<1>(indices);

            // SAFETY: every scatter is masked by `install`, whose lanes
            // hold distinct in-table indices.
            unsafe {
                _mm512_mask_i32scatter_epi32::<4>(
                    self.busybits.as_mut_ptr() as *mut _,
                    install,
                    indices,
                    _mm512_set1_epi32(1),
                );
                _mm512_mask_i32scatter_epi32::<4>(
                    self.khs.as_mut_ptr() as *mut _,
                    install,
                    indices,
                    hashes_vec,
                );
                _mm512_mask_i32scatter_epi64::<8>(
                    self.keyps.as_mut_ptr() as *mut _,
                    install as __mmask8,
                    indices_lo,
                    keys_lo,
                );
                _mm512_mask_i32scatter_epi64::<8>(
                    self.keyps.as_mut_ptr() as *mut _,
                    (install >> 8) as __mmask8,
                    indices_hi,
                    keys_hi,
                );
                _mm512_mask_i32scatter_epi32::<4>(
                    self.vals.as_mut_ptr() as *mut _,
                    install,
                    indices,
                    values_vec,
                );
            }

            mask &= !install;
            offset = _mm512_mask_add_epi32(offset, mask, offset, _mm512_set1_epi32(1));

            rounds += 1;
            assert!(
                mask == 0 || rounds < self.capacity,
                "batch insert probed every slot without finding room"
            );
        }
    }
}

impl<'k, const N: usize> SlotTable for SplitMap16<'k, N> {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn slot_is_empty(&self, idx: usize) -> bool {
        self.busybits[idx] == 0
    }

    fn slot_hash(&self, idx: usize) -> u32 {
        self.khs[idx]
    }

    fn slot_key(&self, idx: usize) -> *const u8 {
        self.keyps[idx]
    }

    fn slot_value(&self, idx: usize) -> i32 {
        self.vals[idx]
    }

    fn install(&mut self, idx: usize, hash: u32, key: *const u8, value: i32) {
        self.busybits[idx] = 1;
        self.keyps[idx] = key;
        self.khs[idx] = hash;
        self.vals[idx] = value;
    }
}

#[cfg(test)]
impl<'k, const N: usize> SplitMap16<'k, N> {
    pub(crate) fn set_batch_kernels(&mut self, enabled: bool) {
        self.use_batch_kernels = enabled && crate::simd::batch_kernels_available();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_batch(rng: &mut ChaCha8Rng) -> KeyBatch<16, 16> {
        let mut batch = KeyBatch::new();
        for lane in 0..16 {
            let mut key = [0u8; 16];
            rng.fill(&mut key[..]);
            batch.set_key(lane, &key);
        }
        batch
    }

    #[test]
    fn batch_roundtrip() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let batch = random_batch(&mut rng);
        let values: [i32; 16] = std::array::from_fn(|lane| lane as i32);

        let mut map = SplitMap16::<16>::new(65536);
        map.put_vec(&batch, &values);
        assert_eq!(map.len(), 16);

        let mut out = [-1i32; 16];
        let found = map.get_vec(&batch, &mut out);
        assert_eq!(found, 0xffff);
        assert_eq!(out, values);

        // Scalar lookups see the batched entries too.
        for lane in 0..16 {
            assert_eq!(map.get(batch.key(lane)), Some(lane as i32));
        }
    }

    #[test]
    fn adversarial_collision_batch_scatters_in_lane_order() {
        const CAP: usize = 1024;
        // Engineer 16 distinct keys whose crc32 home slot is 0.
        let mut keys = KeyBatch::<16, 16>::new();
        let mut lane = 0;
        let mut counter = 0u64;
        while lane < 16 {
            let mut key = [0u8; 16];
            key[..8].copy_from_slice(&counter.to_le_bytes());
            counter += 1;
            if crc32::<16>(&key) as usize & (CAP - 1) == 0 {
                keys.set_key(lane, &key);
                lane += 1;
            }
        }

        let values: [i32; 16] = std::array::from_fn(|lane| lane as i32 + 100);
        let mut map = SplitMap16::<16>::new(CAP);
        map.put_vec(&keys, &values);

        // The colliding lanes must occupy slots 0..16 in lane order.
        for lane in 0..16 {
            assert_eq!(map.busybits[lane], 1, "slot {lane} not occupied");
            assert_eq!(map.vals[lane], lane as i32 + 100, "slot {lane} out of order");
            assert_eq!(map.keyps[lane], keys.lane_ptr(lane));
        }

        let mut out = [0i32; 16];
        assert_eq!(map.get_vec(&keys, &mut out), 0xffff);
        assert_eq!(out, values);
    }

    #[test]
    fn missing_lanes_stay_untouched() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let present = random_batch(&mut rng);
        let values: [i32; 16] = std::array::from_fn(|lane| lane as i32);

        let mut map = SplitMap16::<16>::new(4096);
        map.put_vec(&present, &values);

        // A batch where odd lanes carry absent keys.
        let mut mixed = present.clone();
        for lane in (1..16).step_by(2) {
            let mut key = [0u8; 16];
            rng.fill(&mut key[..]);
            mixed.set_key(lane, &key);
        }

        let mut out = [-7i32; 16];
        let found = map.get_vec(&mixed, &mut out);
        assert_eq!(found, 0x5555);
        for lane in 0..16 {
            if lane % 2 == 0 {
                assert_eq!(out[lane], lane as i32);
            } else {
                assert_eq!(out[lane], -7, "missed lane {lane} was written");
            }
        }
    }

    #[test]
    fn put_vec_fills_to_capacity() {
        const CAP: usize = 32;
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let first = random_batch(&mut rng);
        let second = random_batch(&mut rng);
        let values: [i32; 16] = std::array::from_fn(|lane| lane as i32);

        let mut map = SplitMap16::<16>::new(CAP);
        map.put_vec(&first, &values);
        // size == capacity - 16: the last batch that fits.
        map.put_vec(&second, &values);
        assert_eq!(map.len(), CAP);

        let mut out = [0i32; 16];
        assert_eq!(map.get_vec(&first, &mut out), 0xffff);
        assert_eq!(map.get_vec(&second, &mut out), 0xffff);
    }

    #[test]
    #[should_panic(expected = "free slots")]
    fn put_vec_rejects_overflow() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let first = random_batch(&mut rng);
        let second = random_batch(&mut rng);
        let extra = [9u8; 16];
        let values: [i32; 16] = [0; 16];

        let mut map = SplitMap16::<16>::new(32);
        map.put_vec(&first, &values);
        map.put(&extra, 1).unwrap();
        // size == capacity - 16 + 1: one slot short.
        map.put_vec(&second, &values);
    }

    #[test]
    fn get_on_full_table_misses_cleanly() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let first = random_batch(&mut rng);
        let second = random_batch(&mut rng);
        let values: [i32; 16] = std::array::from_fn(|lane| lane as i32);

        let mut map = SplitMap16::<16>::new(32);
        map.put_vec(&first, &values);
        map.put_vec(&second, &values);

        // Fully occupied table: absent keys must terminate after a full
        // scan with their lanes unmarked.
        let absent = random_batch(&mut rng);
        let mut out = [0i32; 16];
        assert_eq!(map.get_vec(&absent, &mut out), 0);
    }

    #[test]
    fn scalar_ops_mirror_batched_state() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let batch = random_batch(&mut rng);
        let values: [i32; 16] = std::array::from_fn(|lane| lane as i32 * 3);

        let mut map = SplitMap16::<16>::new(256);
        map.put_vec(&batch, &values);

        assert_eq!(map.put(batch.key(5), -5), Ok(Some(15)));
        assert_eq!(map.get(batch.key(5)), Some(-5));
        assert_eq!(map.len(), 16);

        assert!(map.erase(batch.key(5)));
        assert_eq!(map.get(batch.key(5)), None);
        assert_eq!(map.len(), 15);
    }

    #[test]
    fn narrow_keys_roundtrip() {
        // 12-byte keys take the generic crc32 path (three word folds)
        // and a three-chunk key comparison.
        let mut batch = KeyBatch::<16, 12>::new();
        for lane in 0..16 {
            let mut key = [0u8; 12];
            key[0] = lane as u8;
            key[11] = 0xee;
            batch.set_key(lane, &key);
        }
        let values: [i32; 16] = std::array::from_fn(|lane| lane as i32 + 7);

        let mut map = SplitMap16::<12>::new(128);
        map.put_vec(&batch, &values);

        let mut out = [0i32; 16];
        assert_eq!(map.get_vec(&batch, &mut out), 0xffff);
        assert_eq!(out, values);
    }

    #[test]
    fn portable_and_avx512_engines_agree() {
        if !crate::simd::batch_kernels_available() {
            return;
        }
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        for _ in 0..16 {
            let batch = random_batch(&mut rng);
            let values: [i32; 16] = std::array::from_fn(|lane| lane as i32);

            let mut simd_map = SplitMap16::<16>::new(64);
            let mut portable_map = SplitMap16::<16>::new(64);
            portable_map.set_batch_kernels(false);

            simd_map.put_vec(&batch, &values);
            portable_map.put_vec(&batch, &values);

            assert_eq!(&simd_map.busybits, &portable_map.busybits);
            assert_eq!(&simd_map.khs, &portable_map.khs);
            assert_eq!(&simd_map.vals, &portable_map.vals);

            let mut probe_keys = batch.clone();
            for lane in (0..16).step_by(3) {
                let mut key = [0u8; 16];
                rng.fill(&mut key[..]);
                probe_keys.set_key(lane, &key);
            }
            let mut simd_out = [0i32; 16];
            let mut portable_out = [0i32; 16];
            let simd_found = simd_map.get_vec(&probe_keys, &mut simd_out);
            let portable_found = portable_map.get_vec(&probe_keys, &mut portable_out);
            assert_eq!(simd_found, portable_found);
            assert_eq!(simd_out, portable_out);
        }
    }
}
