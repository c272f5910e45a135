//! CPU capability probe and shared AVX-512 helpers for the batched
//! engines.
//!
//! Every map decides once at construction whether the hand-written
//! AVX-512 kernels are usable; otherwise calls fall back to the portable
//! engine in [`crate::probe`], which implements identical lane
//! semantics.

/// True when the full feature set of the batched kernels is present:
/// foundation ops, conflict detection, 64-bit multiplies and the 256-bit
/// masked forms.
#[cfg(target_arch = "x86_64")]
pub(crate) fn batch_kernels_available() -> bool {
    is_x86_feature_detected!("avx512f")
        && is_x86_feature_detected!("avx512cd")
        && is_x86_feature_detected!("avx512dq")
        && is_x86_feature_detected!("avx512vl")
}

#[cfg(not(target_arch = "x86_64"))]
pub(crate) fn batch_kernels_available() -> bool {
    false
}

#[cfg(target_arch = "x86_64")]
pub(crate) mod x86 {
    use core::arch::x86_64::*;
    use core::ptr;

    /// Builds the pointer vector for eight consecutive lanes of a key
    /// block: lane `i` holds `base + (first_lane + i) * stride`.
    ///
    /// # Safety
    ///
    /// Caller must have `avx512f` available.
    #[inline]
    #[target_feature(enable = "avx512f")]
    pub(crate) unsafe fn lane_ptrs(base: *const u8, stride: usize, first_lane: usize) -> __m512i {
        let lane = |i: usize| base.wrapping_add((first_lane + i) * stride) as i64;
        _mm512_set_epi64(lane(7), lane(6), lane(5), lane(4), lane(3), lane(2), lane(1), lane(0))
    }

    /// Confirms hash matches with a full key comparison across 16 lanes.
    ///
    /// For each lane still set in `candidates`, walks the stored key and
    /// the probe key four bytes at a time and clears the lane on the
    /// first differing chunk. Pointers are 64-bit, so the 16 lanes are
    /// handled as two half-batches of eight.
    ///
    /// # Safety
    ///
    /// Caller must have `avx512f`, `avx512dq` and `avx512vl` available.
    /// For every candidate lane, `keyps[index]` and the batch lane must
    /// point at `N` readable bytes, and `N % 4 == 0`.
    #[target_feature(enable = "avx512f,avx512dq,avx512vl")]
    pub(crate) unsafe fn confirm_keys16<const N: usize>(
        keys_base: *const u8,
        indices: __m512i,
        candidates: __mmask16,
        keyps: *const *const u8,
    ) -> __mmask16 {
        let indices_lo = _mm512_castsi512_si256(indices);
        let indices_hi = _mm512_extracti32x8_epi32::<1>(indices);

        // Stored key pointers for the candidate lanes.
        // SAFETY: indices are in-table for candidate lanes; masked-off
        // lanes are not accessed.
        let mut stored_lo = unsafe {
            _mm512_mask_i32gather_epi64::<8>(
                _mm512_setzero_si512(),
                candidates as __mmask8,
                indices_lo,
                keyps as *const _,
            )
        };
        let mut stored_hi = unsafe {
            _mm512_mask_i32gather_epi64::<8>(
                _mm512_setzero_si512(),
                (candidates >> 8) as __mmask8,
                indices_hi,
                keyps as *const _,
            )
        };

        // Probe key pointers, derived from the batch base by lane stride.
        // SAFETY: register construction only.
        let mut probe_lo = unsafe { lane_ptrs(keys_base, N, 0) };
        let mut probe_hi = unsafe { lane_ptrs(keys_base, N, 8) };

        let mut confirmed = candidates;
        let mut compared = 0;
        while compared < N {
            let lo_mask = confirmed as __mmask8;
            let hi_mask = (confirmed >> 8) as __mmask8;

            // SAFETY: the pointer lanes of confirmed candidates stay
            // within their keys (`compared + 4 <= N`); the gathers read
            // from absolute addresses (null base, scale 1).
            let (lo_eq, hi_eq) = unsafe {
                let stored_chunk_lo =
                    _mm512_mask_i64gather_epi32::<1>(_mm256_setzero_si256(), lo_mask, stored_lo, ptr::null());
                let probe_chunk_lo =
                    _mm512_mask_i64gather_epi32::<1>(_mm256_setzero_si256(), lo_mask, probe_lo, ptr::null());
                let stored_chunk_hi =
                    _mm512_mask_i64gather_epi32::<1>(_mm256_setzero_si256(), hi_mask, stored_hi, ptr::null());
                let probe_chunk_hi =
                    _mm512_mask_i64gather_epi32::<1>(_mm256_setzero_si256(), hi_mask, probe_hi, ptr::null());
                (
                    _mm256_cmpeq_epi32_mask(stored_chunk_lo, probe_chunk_lo),
                    _mm256_cmpeq_epi32_mask(stored_chunk_hi, probe_chunk_hi),
                )
            };

            confirmed &= ((hi_eq as __mmask16) << 8) | (lo_eq as __mmask16);

            stored_lo = _mm512_add_epi64(stored_lo, _mm512_set1_epi64(4));
            stored_hi = _mm512_add_epi64(stored_hi, _mm512_set1_epi64(4));
            probe_lo = _mm512_add_epi64(probe_lo, _mm512_set1_epi64(4));
            probe_hi = _mm512_add_epi64(probe_hi, _mm512_set1_epi64(4));
            compared += 4;
        }
        confirmed
    }
}
