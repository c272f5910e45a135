//! 16-lane vectorized map with a sentinel hash instead of busybits.
//!
//! Dropping the busybit array saves one gather per probe step and one
//! array from the working set: a slot is empty exactly when its stored
//! hash is the reserved null value. In exchange the map must guarantee
//! that no live key ever hashes to the sentinel, which the hash
//! production enforces by remapping a would-be-zero hash to a fixed
//! nonzero constant (see [`crate::hash::fx`]: the all-zero key really
//! does hash to 0).

use std::marker::PhantomData;

use crate::hash::{fx, fx_vec16};
use crate::probe::{self, key_matches, live_hash, SlotTable, EMPTY_HASH};
use crate::{KeyBatch, TableFull};

/// 16-lane sentinel-hash map from borrowed `N`-byte keys to `i32`
/// values.
///
/// Hashes with the fx family, so `N` must be a positive multiple of 8.
/// A stored hash of 0 means the slot is empty; live hashes of 0 are
/// remapped to a fixed constant, which is part of this map's hash
/// contract (stored hashes equal the remapped hash of the stored key).
///
/// Erase writes the sentinel back, with the same displaced-key caveat
/// for later batched lookups as [`crate::SplitMap16`].
pub struct MergedMap16<'k, const N: usize> {
    capacity: usize,
    keyps: Box<[*const u8]>,
    khs: Box<[u32]>,
    vals: Box<[i32]>,
    size: usize,
    use_batch_kernels: bool,
    _keys: PhantomData<&'k [u8]>,
}

impl<'k, const N: usize> MergedMap16<'k, N> {
    /// Lanes per batched call.
    pub const LANES: usize = 16;

    /// Creates a map with room for `capacity` entries. Every slot
    /// starts at the null hash.
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero or not a power of two.
    pub fn new(capacity: usize) -> Self {
        const { assert!(N > 0 && N % 8 == 0, "key width must be a positive multiple of 8") }
        assert!(
            capacity > 0 && capacity.is_power_of_two(),
            "capacity must be a power of two, got {capacity}"
        );
        Self {
            capacity,
            keyps: vec![std::ptr::null(); capacity].into_boxed_slice(),
            khs: vec![EMPTY_HASH; capacity].into_boxed_slice(),
            vals: vec![0; capacity].into_boxed_slice(),
            size: 0,
            use_batch_kernels: crate::simd::batch_kernels_available(),
            _keys: PhantomData,
        }
    }

    /// Batched lookup of 16 keys. Writes `out[lane]` for hits and
    /// returns the found mask; missed lanes are left untouched.
    pub fn get_vec(&self, keys: &KeyBatch<16, N>, out: &mut [i32; 16]) -> u16 {
        let hashes = self.hash_batch(keys);
        #[cfg(target_arch = "x86_64")]
        if self.use_batch_kernels {
            // SAFETY: AVX-512 support was verified at construction.
            return unsafe { self.get_vec_avx512(keys, &hashes, out) };
        }
        probe::get_lanes(self, &hashes, keys, out) as u16
    }

    /// Batched insert of 16 fresh keys with their values. Same caller
    /// contract as [`crate::SplitMap16::put_vec`].
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

    /// Scalar lookup; scans the full table on a miss.
    pub fn get(&self, key: &[u8; N]) -> Option<i32> {
        let hash = live_hash(fx::<N>(key));
        self.find_key(key, hash).map(|idx| self.vals[idx])
    }

    /// Inserts the key or updates it in place, returning the previous
    /// value if any.
    ///
    /// # Errors
    ///
    /// [`TableFull`] when the key is absent and every slot is occupied.
    pub fn put(&mut self, key: &'k [u8; N], value: i32) -> Result<Option<i32>, TableFull> {
        let hash = live_hash(fx::<N>(key));
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
        while self.khs[idx] != EMPTY_HASH {
            idx = (idx + 1) & mask;
        }
        self.keyps[idx] = key.as_ptr();
        self.khs[idx] = hash;
        self.vals[idx] = value;
        self.size += 1;
        Ok(None)
    }

    /// Removes the key if present by writing the sentinel back.
    pub fn erase(&mut self, key: &[u8; N]) -> bool {
        let hash = live_hash(fx::<N>(key));
        match self.find_key(key, hash) {
            Some(idx) => {
                self.khs[idx] = EMPTY_HASH;
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

    fn hash_batch(&self, keys: &KeyBatch<16, N>) -> [u32; 16] {
        let mut hashes = fx_vec16::<N>(keys);
        for h in &mut hashes {
            *h = live_hash(*h);
        }
        hashes
    }

    fn find_key(&self, key: &[u8; N], hash: u32) -> Option<usize> {
        let mask = self.capacity - 1;
        let start = hash as usize & mask;
        for i in 0..self.capacity {
            let idx = (start + i) & mask;
            if self.khs[idx] == hash {
                // SAFETY: a slot with a live hash holds a key pointer
                // valid for 'k.
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
        // SAFETY: 64-byte read from the hash array.
        let hashes_vec = unsafe { _mm512_loadu_si512(hashes.as_ptr() as *const _) };

        let mut mask: __mmask16 = 0xffff;
        let mut offset = _mm512_setzero_si512();
        let mut found: __mmask16 = 0;

        while mask != 0 {
            let indices = _mm512_and_si512(_mm512_add_epi32(hashes_vec, offset), cap_mask);

            // One gather per step: occupancy and hash come from the
            // same array.
            // SAFETY: masked gather of in-table stored hashes.
            let stored = unsafe {
                _mm512_mask_i32gather_epi32::<4>(
                    _mm512_setzero_si512(),
                    mask,
                    indices,
                    self.khs.as_ptr() as *const _,
                )
            };

            let occupied = _mm512_cmpneq_epi32_mask(stored, _mm512_setzero_si512());
            let hash_cmp = _mm512_cmpeq_epi32_mask(stored, hashes_vec);
            let candidates = occupied & hash_cmp;

            // A null-hash slot ends the probe for its lane.
            mask &= occupied;

            // SAFETY: candidate lanes hold valid indices and live key
            // pointers; N % 8 == 0 implies the 4-byte chunk walk fits.
            let matched = unsafe {
                crate::simd::x86::confirm_keys16::<N>(
                    keys.as_ptr(),
                    indices,
                    candidates,
                    self.keyps.as_ptr(),
                )
            };

            // SAFETY: masked value gather and masked store to `out`.
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

        // SAFETY: register construction only.
        let keys_lo = unsafe { crate::simd::x86::lane_ptrs(keys.as_ptr(), N, 0) };
        let keys_hi = unsafe { crate::simd::x86::lane_ptrs(keys.as_ptr(), N, 8) };

        let mut mask: __mmask16 = 0xffff;
        let mut offset = _mm512_setzero_si512();
        let mut rounds = 0usize;

        while mask != 0 {
            let indices = _mm512_and_si512(_mm512_add_epi32(hashes_vec, offset), cap_mask);

            let conflicts = _mm512_mask_conflict_epi32(_mm512_setzero_si512(), mask, indices);
            let no_conflict =
                _mm512_mask_testn_epi32_mask(mask, conflicts, _mm512_set1_epi32(-1)) & mask;

            // SAFETY: masked gather of in-table stored hashes.
            let stored = unsafe {
                _mm512_mask_i32gather_epi32::<4>(
                    _mm512_setzero_si512(),
                    no_conflict,
                    indices,
                    self.khs.as_ptr() as *const _,
                )
            };

            let install = _mm512_mask_cmpeq_epi32_mask(no_conflict, stored, _mm512_setzero_si512());

            let indices_lo = _mm512_castsi512_si256(indices);
            let indices_hi = _mm512_extracti32x8_epi32::<1>(indices);

            // SAFETY: every scatter is masked by `install`, whose lanes
            // hold distinct in-table indices.
            unsafe {
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

impl<'k, const N: usize> SlotTable for MergedMap16<'k, N> {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn slot_is_empty(&self, idx: usize) -> bool {
        self.khs[idx] == EMPTY_HASH
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
        self.keyps[idx] = key;
        self.khs[idx] = hash;
        self.vals[idx] = value;
    }
}

#[cfg(test)]
impl<'k, const N: usize> MergedMap16<'k, N> {
    pub(crate) fn set_batch_kernels(&mut self, enabled: bool) {
        self.use_batch_kernels = enabled && crate::simd::batch_kernels_available();
    }
}
