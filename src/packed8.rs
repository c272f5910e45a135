//! 8-lane vectorized map over packed `(hash, value)` slot records.
//!
//! Each slot is one 64-bit record: hash in the low half, value in the
//! high half. The probe loop runs on 64-bit lanes throughout, so a
//! single gather per step fetches occupancy, hash and value together —
//! half the batch width of the 16-lane maps against one gather instead
//! of two, and a friendlier layout when hash and value are consumed
//! together.

use std::marker::PhantomData;

use crate::hash::crc32;
use crate::probe::{self, key_matches, live_hash, SlotTable, EMPTY_HASH};
use crate::{KeyBatch, TableFull};

/// Builds a slot record from a live hash and a value.
#[inline]
fn pack(hash: u32, value: i32) -> u64 {
    hash as u64 | ((value as u32 as u64) << 32)
}

/// 8-lane packed-record map from borrowed `N`-byte keys to `i32`
/// values.
///
/// `N` must be a positive multiple of 8: the batched key comparison
/// walks keys eight bytes at a time. A record with a zero hash half is
/// empty; live hashes of 0 are remapped exactly as in
/// [`crate::MergedMap16`].
pub struct PackedMap8<'k, const N: usize> {
    capacity: usize,
    packed: Box<[u64]>,
    keyps: Box<[*const u8]>,
    size: usize,
    use_batch_kernels: bool,
    _keys: PhantomData<&'k [u8]>,
}

impl<'k, const N: usize> PackedMap8<'k, N> {
    /// Lanes per batched call.
    pub const LANES: usize = 8;

    /// Creates a map with room for `capacity` entries. Every record
    /// starts empty.
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
            packed: vec![0; capacity].into_boxed_slice(),
            keyps: vec![std::ptr::null(); capacity].into_boxed_slice(),
            size: 0,
            use_batch_kernels: crate::simd::batch_kernels_available(),
            _keys: PhantomData,
        }
    }

    /// Batched lookup of 8 keys. Writes `out[lane]` for hits and
    /// returns the found mask; missed lanes are left untouched.
    pub fn get_vec(&self, keys: &KeyBatch<8, N>, out: &mut [i32; 8]) -> u8 {
        let hashes = self.hash_batch(keys);
        #[cfg(target_arch = "x86_64")]
        if self.use_batch_kernels {
            // SAFETY: AVX-512 support was verified at construction.
            return unsafe { self.get_vec_avx512(keys, &hashes, out) };
        }
        probe::get_lanes(self, &hashes, keys, out) as u8
    }

    /// Batched insert of 8 fresh keys with their values. Same caller
    /// contract as [`crate::SplitMap16::put_vec`].
    ///
    /// # Panics
    ///
    /// Panics when fewer than 8 slots are free.
    pub fn put_vec(&mut self, keys: &'k KeyBatch<8, N>, values: &[i32; 8]) {
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
        let hash = live_hash(crc32::<N>(key));
        self.find_key(key, hash)
            .map(|idx| (self.packed[idx] >> 32) as i32)
    }

    /// Inserts the key or updates it in place, returning the previous
    /// value if any.
    ///
    /// # Errors
    ///
    /// [`TableFull`] when the key is absent and every slot is occupied.
    pub fn put(&mut self, key: &'k [u8; N], value: i32) -> Result<Option<i32>, TableFull> {
        let hash = live_hash(crc32::<N>(key));
        if let Some(idx) = self.find_key(key, hash) {
            let old = (self.packed[idx] >> 32) as i32;
            self.packed[idx] = pack(hash, value);
            return Ok(Some(old));
        }
        if self.size == self.capacity {
            return Err(TableFull { capacity: self.capacity });
        }

        let mask = self.capacity - 1;
        let mut idx = hash as usize & mask;
        while self.packed[idx] as u32 != EMPTY_HASH {
            idx = (idx + 1) & mask;
        }
        self.packed[idx] = pack(hash, value);
        self.keyps[idx] = key.as_ptr();
        self.size += 1;
        Ok(None)
    }

    /// Removes the key if present by clearing the hash half of its
    /// record.
    pub fn erase(&mut self, key: &[u8; N]) -> bool {
        let hash = live_hash(crc32::<N>(key));
        match self.find_key(key, hash) {
            Some(idx) => {
                self.packed[idx] &= 0xffff_ffff_0000_0000;
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

    fn hash_batch(&self, keys: &KeyBatch<8, N>) -> [u32; 8] {
        let mut hashes = [0u32; 8];
        for (lane, h) in hashes.iter_mut().enumerate() {
            *h = live_hash(crc32::<N>(keys.key(lane)));
        }
        hashes
    }

    fn find_key(&self, key: &[u8; N], hash: u32) -> Option<usize> {
        let mask = self.capacity - 1;
        let start = hash as usize & mask;
        for i in 0..self.capacity {
            let idx = (start + i) & mask;
            if self.packed[idx] as u32 == hash {
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
    unsafe fn get_vec_avx512(&self, keys: &KeyBatch<8, N>, hashes: &[u32; 8], out: &mut [i32; 8]) -> u8 {
        use core::arch::x86_64::*;

        let cap_mask = _mm512_set1_epi64((self.capacity - 1) as i64);
        let cap = _mm512_set1_epi64(self.capacity as i64);
        let hash_half = _mm512_set1_epi64(0xffff_ffff);

        // The whole loop runs on 64-bit lanes so the packed record can
        // be gathered in one load per lane.
        let hashes64: [u64; 8] = std::array::from_fn(|lane| hashes[lane] as u64);
        // SAFETY: 64-byte read from the widened hash array.
        let hashes_vec = unsafe { _mm512_loadu_si512(hashes64.as_ptr() as *const _) };

        let mut mask: __mmask8 = 0xff;
        let mut offset = _mm512_setzero_si512();
        let mut found: __mmask8 = 0;

        while mask != 0 {
            // Retired lanes are parked on an out-of-table index so they
            // can never alias an active lane.
            let indices = _mm512_mask_and_epi64(
                _mm512_set1_epi64(-1),
                mask,
                _mm512_add_epi64(hashes_vec, offset),
                cap_mask,
            );

            // SAFETY: active lanes' indices are in-table; parked lanes
            // are masked out of the gather.
            let records = unsafe {
                _mm512_mask_i64gather_epi64::<8>(
                    _mm512_setzero_si512(),
                    mask,
                    indices,
                    self.packed.as_ptr() as *const _,
                )
            };
            let stored_hashes = _mm512_and_epi64(records, hash_half);

            let occupied = _mm512_mask_cmpneq_epi64_mask(mask, stored_hashes, _mm512_setzero_si512());
            let hash_cmp = _mm512_mask_cmpeq_epi64_mask(mask, stored_hashes, hashes_vec);
            let mut matched = occupied & hash_cmp;

            // An empty record ends the probe for its lane.
            mask &= occupied;

            // Key confirmation, eight bytes per step on the same 64-bit
            // lanes.
            // SAFETY: matched lanes hold valid indices and live key
            // pointers.
            let mut stored_ptrs = unsafe {
                _mm512_mask_i64gather_epi64::<8>(
                    _mm512_setzero_si512(),
                    matched,
                    indices,
                    self.keyps.as_ptr() as *const _,
                )
            };
            // SAFETY: register construction only.
            let mut probe_ptrs = unsafe { crate::simd::x86::lane_ptrs(keys.as_ptr(), N, 0) };

            let mut compared = 0;
            while compared < N {
                // SAFETY: pointer lanes of matched candidates stay
                // within their keys (`compared + 8 <= N`).
                let (stored_chunk, probe_chunk) = unsafe {
                    (
                        _mm512_mask_i64gather_epi64::<1>(
                            _mm512_setzero_si512(),
                            matched,
                            stored_ptrs,
                            core::ptr::null(),
                        ),
                        _mm512_mask_i64gather_epi64::<1>(
                            _mm512_setzero_si512(),
                            matched,
                            probe_ptrs,
                            core::ptr::null(),
                        ),
                    )
                };
                matched &= _mm512_cmpeq_epi64_mask(stored_chunk, probe_chunk);

                stored_ptrs = _mm512_add_epi64(stored_ptrs, _mm512_set1_epi64(8));
                probe_ptrs = _mm512_add_epi64(probe_ptrs, _mm512_set1_epi64(8));
                compared += 8;
            }

            // The gathered records already carry the values; shift them
            // down and narrow.
            let values = _mm512_cvtepi64_epi32(_mm512_srli_epi64::<32>(records));
            // SAFETY: masked store touches only matched lanes of `out`.
            unsafe { _mm256_mask_storeu_epi32(out.as_mut_ptr() as *mut _, matched, values) };

            found |= matched;
            mask &= !matched;

            offset = _mm512_mask_add_epi64(offset, mask, offset, _mm512_set1_epi64(1));

            let wrapped = _mm512_mask_cmpeq_epi64_mask(mask, offset, cap);
            mask &= !wrapped;
        }
        found
    }

    #[cfg(target_arch = "x86_64")]
    #[target_feature(enable = "avx512f,avx512cd,avx512dq,avx512vl")]
    unsafe fn put_vec_avx512(&mut self, keys: &KeyBatch<8, N>, hashes: &[u32; 8], values: &[i32; 8]) {
        use core::arch::x86_64::*;

        let cap_mask = _mm512_set1_epi64((self.capacity - 1) as i64);
        let hash_half = _mm512_set1_epi64(0xffff_ffff);

        let hashes64: [u64; 8] = std::array::from_fn(|lane| hashes[lane] as u64);
        // SAFETY: 64-byte read from the widened hash array.
        let hashes_vec = unsafe { _mm512_loadu_si512(hashes64.as_ptr() as *const _) };

        // Combined records: hash in the low dword of each lane, value
        // widened into the high dword.
        // SAFETY: 32-byte read from the value array.
        let values256 = unsafe { _mm256_loadu_si256(values.as_ptr() as *const _) };
        let combined =
            _mm512_or_si512(hashes_vec, _mm512_slli_epi64::<32>(_mm512_cvtepu32_epi64(values256)));

        // SAFETY: register construction only.
        let key_ptrs = unsafe { crate::simd::x86::lane_ptrs(keys.as_ptr(), N, 0) };

        let mut mask: __mmask8 = 0xff;
        let mut offset = _mm512_setzero_si512();
        let mut rounds = 0usize;

        while mask != 0 {
            let indices = _mm512_mask_and_epi64(
                _mm512_set1_epi64(-1),
                mask,
                _mm512_add_epi64(hashes_vec, offset),
                cap_mask,
            );

            let conflicts = _mm512_mask_conflict_epi64(_mm512_setzero_si512(), mask, indices);
            let no_conflict =
                _mm512_mask_testn_epi64_mask(mask, conflicts, _mm512_set1_epi64(-1)) & mask;

            // SAFETY: masked gather of in-table records.
            let records = unsafe {
                _mm512_mask_i64gather_epi64::<8>(
                    _mm512_setzero_si512(),
                    no_conflict,
                    indices,
                    self.packed.as_ptr() as *const _,
                )
            };
            let stored_hashes = _mm512_and_epi64(records, hash_half);

            let install =
                _mm512_mask_cmpeq_epi64_mask(no_conflict, stored_hashes, _mm512_setzero_si512());

            // SAFETY: scatters are masked by `install`, whose lanes hold
            // distinct in-table indices.
            unsafe {
                _mm512_mask_i64scatter_epi64::<8>(
                    self.packed.as_mut_ptr() as *mut _,
                    install,
                    indices,
                    combined,
                );
                _mm512_mask_i64scatter_epi64::<8>(
                    self.keyps.as_mut_ptr() as *mut _,
                    install,
                    indices,
                    key_ptrs,
                );
            }

            mask &= !install;
            offset = _mm512_mask_add_epi64(offset, mask, offset, _mm512_set1_epi64(1));

            rounds += 1;
            assert!(
                mask == 0 || rounds < self.capacity,
                "batch insert probed every slot without finding room"
            );
        }
    }
}

impl<'k, const N: usize> SlotTable for PackedMap8<'k, N> {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn slot_is_empty(&self, idx: usize) -> bool {
        self.packed[idx] as u32 == EMPTY_HASH
    }

    fn slot_hash(&self, idx: usize) -> u32 {
        self.packed[idx] as u32
    }

    fn slot_key(&self, idx: usize) -> *const u8 {
        self.keyps[idx]
    }

    fn slot_value(&self, idx: usize) -> i32 {
        (self.packed[idx] >> 32) as i32
    }

    fn install(&mut self, idx: usize, hash: u32, key: *const u8, value: i32) {
        self.packed[idx] = pack(hash, value);
        self.keyps[idx] = key;
    }
}

#[cfg(test)]
impl<'k, const N: usize> PackedMap8<'k, N> {
    pub(crate) fn set_batch_kernels(&mut self, enabled: bool) {
        self.use_batch_kernels = enabled && crate::simd::batch_kernels_available();
    }
}
