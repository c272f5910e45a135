//! Hash primitives for fixed-width keys.
//!
//! Two families back the maps:
//!
//! - [`crc32`]: CRC32C folded over the key four bytes at a time. Uses
//!   the SSE4.2 instruction when the CPU has it and a bit-identical
//!   software Castagnoli fallback otherwise.
//! - [`fx`]: a multiply-xor hash over 8-byte words with a final
//!   avalanche shift, plus its 8- and 16-lane batched forms
//!   [`fx_vec8`] and [`fx_vec16`].
//!
//! The batched forms obey one law: lane `i` of the output equals the
//! scalar [`fx`] of lane `i`'s key, bit for bit, on every engine.
//!
//! [`djb2`] and [`murmur3`] round out the family as scalar baselines
//! for hash-quality comparisons; no map uses them.

use crate::KeyBatch;

/// Multiplier of the fx hash.
pub(crate) const FX_CONSTANT: u64 = 0x517c_c1b7_2722_0a95;

/// CRC32C (Castagnoli) polynomial, reversed bit order.
const CRC32C_POLY: u32 = 0x82f6_3b78;

/// CRC32C of the key: 4-byte little-endian words folded through the
/// Castagnoli polynomial starting from state 0, then any trailing bytes
/// one at a time.
pub fn crc32<const N: usize>(key: &[u8; N]) -> u32 {
    const { assert!(N > 0, "key width must be nonzero") }
    #[cfg(target_arch = "x86_64")]
    if is_x86_feature_detected!("sse4.2") {
        // SAFETY: SSE4.2 support verified above.
        return unsafe { crc32_hw::<N>(key) };
    }
    crc32_sw::<N>(key)
}

/// One CRC32C fold of a single 32-bit word. The Bloom filter salts its
/// rows with this.
pub(crate) fn crc32_step(state: u32, word: u32) -> u32 {
    #[cfg(target_arch = "x86_64")]
    if is_x86_feature_detected!("sse4.2") {
        // SAFETY: SSE4.2 support verified above.
        return unsafe { crc32_step_hw(state, word) };
    }
    crc32_word_sw(state, word)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.2")]
fn crc32_hw<const N: usize>(key: &[u8; N]) -> u32 {
    use core::arch::x86_64::{_mm_crc32_u32, _mm_crc32_u8};
    let mut hash = 0u32;
    let mut words = key.chunks_exact(4);
    for w in &mut words {
        hash = _mm_crc32_u32(hash, u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
    }
    for &b in words.remainder() {
        hash = _mm_crc32_u8(hash, b);
    }
    hash
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.2")]
fn crc32_step_hw(state: u32, word: u32) -> u32 {
    core::arch::x86_64::_mm_crc32_u32(state, word)
}

fn crc32_sw<const N: usize>(key: &[u8; N]) -> u32 {
    let mut hash = 0u32;
    let mut words = key.chunks_exact(4);
    for w in &mut words {
        hash = crc32_word_sw(hash, u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
    }
    for &b in words.remainder() {
        hash = crc32_byte_sw(hash, b);
    }
    hash
}

fn crc32_word_sw(state: u32, word: u32) -> u32 {
    let mut crc = state ^ word;
    for _ in 0..32 {
        let mask = (crc & 1).wrapping_neg();
        crc = (crc >> 1) ^ (CRC32C_POLY & mask);
    }
    crc
}

fn crc32_byte_sw(state: u32, byte: u8) -> u32 {
    let mut crc = state ^ byte as u32;
    for _ in 0..8 {
        let mask = (crc & 1).wrapping_neg();
        crc = (crc >> 1) ^ (CRC32C_POLY & mask);
    }
    crc
}

/// fx hash of the key: per 8-byte little-endian word,
/// `state = (state ^ word) * 0x517cc1b727220a95`, then a final
/// `state ^= state >> 32` avalanche, truncated to 32 bits.
///
/// The key width must be a multiple of 8. Note that the all-zero key
/// hashes to 0.
pub fn fx<const N: usize>(key: &[u8; N]) -> u32 {
    const { assert!(N > 0 && N % 8 == 0, "fx hash requires a key width that is a multiple of 8") }
    let mut state = 0u64;
    for w in key.chunks_exact(8) {
        let word = u64::from_le_bytes([w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7]]);
        state = (state ^ word).wrapping_mul(FX_CONSTANT);
    }
    state ^= state >> 32;
    state as u32
}

/// Eight fx hashes computed lane-parallel over a key batch.
///
/// Lane `i` equals `fx(keys.key(i))` exactly.
pub fn fx_vec8<const N: usize>(keys: &KeyBatch<8, N>) -> [u32; 8] {
    const { assert!(N > 0 && N % 8 == 0, "fx hash requires a key width that is a multiple of 8") }
    #[cfg(target_arch = "x86_64")]
    if crate::simd::batch_kernels_available() {
        // SAFETY: AVX-512 support verified above.
        return unsafe { fx_vec8_avx512::<N>(keys) };
    }
    let mut hashes = [0u32; 8];
    for (lane, h) in hashes.iter_mut().enumerate() {
        *h = fx::<N>(keys.key(lane));
    }
    hashes
}

/// Sixteen fx hashes computed lane-parallel over a key batch.
///
/// Lane `i` equals `fx(keys.key(i))` exactly. Maintained as two 8-wide
/// 64-bit register halves that are narrowed and fused at the end.
pub fn fx_vec16<const N: usize>(keys: &KeyBatch<16, N>) -> [u32; 16] {
    const { assert!(N > 0 && N % 8 == 0, "fx hash requires a key width that is a multiple of 8") }
    #[cfg(target_arch = "x86_64")]
    if crate::simd::batch_kernels_available() {
        // SAFETY: AVX-512 support verified above.
        return unsafe { fx_vec16_avx512::<N>(keys) };
    }
    let mut hashes = [0u32; 16];
    for (lane, h) in hashes.iter_mut().enumerate() {
        *h = fx::<N>(keys.key(lane));
    }
    hashes
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx512f,avx512dq")]
unsafe fn fx_vec8_avx512<const N: usize>(keys: &KeyBatch<8, N>) -> [u32; 8] {
    use core::arch::x86_64::*;
    let magic = _mm512_set1_epi64(FX_CONSTANT as i64);
    let mut state = _mm512_setzero_si512();
    // SAFETY: register construction only.
    let mut ptrs = unsafe { crate::simd::x86::lane_ptrs(keys.as_ptr(), N, 0) };

    let mut consumed = 0;
    while consumed < N {
        // SAFETY: the batch owns 8 * N readable bytes and the lane
        // pointers stay inside it (`consumed + 8 <= N`).
        let words = unsafe { _mm512_i64gather_epi64::<1>(ptrs, core::ptr::null()) };
        state = _mm512_xor_si512(state, words);
        state = _mm512_mullo_epi64(state, magic);
        ptrs = _mm512_add_epi64(ptrs, _mm512_set1_epi64(8));
        consumed += 8;
    }

    state = _mm512_xor_si512(state, _mm512_srli_epi64::<32>(state));

    let narrowed = _mm512_cvtepi64_epi32(state);
    let mut out = [0u32; 8];
    // SAFETY: `out` has room for the eight narrowed lanes.
    unsafe { _mm256_storeu_si256(out.as_mut_ptr() as *mut _, narrowed) };
    out
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx512f,avx512dq")]
unsafe fn fx_vec16_avx512<const N: usize>(keys: &KeyBatch<16, N>) -> [u32; 16] {
    use core::arch::x86_64::*;
    let magic = _mm512_set1_epi64(FX_CONSTANT as i64);
    let mut state_lo = _mm512_setzero_si512();
    let mut state_hi = _mm512_setzero_si512();
    // SAFETY: register construction only.
    let mut ptrs_lo = unsafe { crate::simd::x86::lane_ptrs(keys.as_ptr(), N, 0) };
    let mut ptrs_hi = unsafe { crate::simd::x86::lane_ptrs(keys.as_ptr(), N, 8) };

    let mut consumed = 0;
    while consumed < N {
        // SAFETY: the batch owns 16 * N readable bytes and the lane
        // pointers stay inside it (`consumed + 8 <= N`).
        let words_lo = unsafe { _mm512_i64gather_epi64::<1>(ptrs_lo, core::ptr::null()) };
        state_lo = _mm512_xor_si512(state_lo, words_lo);
        state_lo = _mm512_mullo_epi64(state_lo, magic);

        // SAFETY: as above, for the upper half-batch.
        let words_hi = unsafe { _mm512_i64gather_epi64::<1>(ptrs_hi, core::ptr::null()) };
        state_hi = _mm512_xor_si512(state_hi, words_hi);
        state_hi = _mm512_mullo_epi64(state_hi, magic);

        ptrs_lo = _mm512_add_epi64(ptrs_lo, _mm512_set1_epi64(8));
        ptrs_hi = _mm512_add_epi64(ptrs_hi, _mm512_set1_epi64(8));
        consumed += 8;
    }

    state_lo = _mm512_xor_si512(state_lo, _mm512_srli_epi64::<32>(state_lo));
    state_hi = _mm512_xor_si512(state_hi, _mm512_srli_epi64::<32>(state_hi));

    let mut out = [0u32; 16];
    // SAFETY: `out` has room for both narrowed half-batches.
    unsafe {
        _mm256_storeu_si256(out.as_mut_ptr() as *mut _, _mm512_cvtepi64_epi32(state_lo));
        _mm256_storeu_si256(out.as_mut_ptr().add(8) as *mut _, _mm512_cvtepi64_epi32(state_hi));
    }
    out
}

/// djb2: `hash = hash * 33 + byte` over the key, seeded with 5381.
pub fn djb2<const N: usize>(key: &[u8; N]) -> u32 {
    let mut hash = 5381u32;
    for &b in key {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// Murmur3 32-bit over the key with seed 0, finalized with the key
/// length.
pub fn murmur3<const N: usize>(key: &[u8; N]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut hash = 0u32;
    let mut blocks = key.chunks_exact(4);
    for b in &mut blocks {
        let mut k = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        hash ^= k;
        hash = hash.rotate_left(13);
        hash = hash.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    let mut k1 = 0u32;
    if tail.len() >= 3 {
        k1 ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        k1 ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        k1 ^= tail[0] as u32;
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        hash ^= k1;
    }

    hash ^= N as u32;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^= hash >> 16;
    hash
}
