//! Portable lane-exact probe engine shared by the batched maps.
//!
//! The three vectorized variants differ only in how a slot stores its
//! state; the probe loop itself is identical. [`SlotTable`] captures the
//! per-variant pieces (occupancy test, stored hash, key pointer, value,
//! and the install step) and [`get_lanes`]/[`put_lanes`] run the loop in
//! plain scalar code with exactly the semantics of the AVX-512 kernels:
//!
//! - every lane probes linearly from `hash & (capacity - 1)`,
//! - a lane retires on a match, on a terminating empty slot, or after
//!   probing the whole table,
//! - during batched inserts, when several lanes target the same slot in
//!   the same step the earliest lane wins and the rest advance.
//!
//! On hosts without AVX-512 this engine *is* the implementation; on
//! hosts with it the test suite holds the two engines to identical
//! results.

use crate::KeyBatch;

/// Reserved hash for empty slots in the sentinel-hash tables.
pub(crate) const EMPTY_HASH: u32 = 0;

/// Substitute hash for a live key whose hash would collide with the
/// empty sentinel.
pub(crate) const ZERO_HASH_SUBSTITUTE: u32 = 0x517c_c1b7;

/// Remaps the reserved empty value out of a live key's hash.
#[inline]
pub(crate) fn live_hash(hash: u32) -> u32 {
    if hash == EMPTY_HASH {
        ZERO_HASH_SUBSTITUTE
    } else {
        hash
    }
}

/// Byte-wise key equality against a stored key pointer.
///
/// # Safety
///
/// `stored` must point at `N` readable bytes; the maps guarantee this
/// for occupied slots via the `'k` borrow of inserted keys.
#[inline]
pub(crate) unsafe fn key_matches<const N: usize>(stored: *const u8, key: &[u8; N]) -> bool {
    let stored = unsafe { std::slice::from_raw_parts(stored, N) };
    stored == key
}

/// Slot-state interface of one batched map variant.
pub(crate) trait SlotTable {
    fn capacity(&self) -> usize;
    fn slot_is_empty(&self, idx: usize) -> bool;
    fn slot_hash(&self, idx: usize) -> u32;
    fn slot_key(&self, idx: usize) -> *const u8;
    fn slot_value(&self, idx: usize) -> i32;
    fn install(&mut self, idx: usize, hash: u32, key: *const u8, value: i32);
}

/// Batched lookup: resolves all `B` lanes against the table and writes
/// `out[lane]` for each hit. Returns the found mask (bit `lane` set on
/// a hit); output slots of missed lanes are left untouched.
pub(crate) fn get_lanes<T: SlotTable, const B: usize, const N: usize>(
    table: &T,
    hashes: &[u32; B],
    keys: &KeyBatch<B, N>,
    out: &mut [i32; B],
) -> u32 {
    let capacity = table.capacity();
    let mask = capacity - 1;
    let mut found = 0u32;

    for lane in 0..B {
        let key = keys.key(lane);
        let start = hashes[lane] as usize & mask;
        for i in 0..capacity {
            let idx = (start + i) & mask;
            if table.slot_is_empty(idx) {
                break;
            }
            if table.slot_hash(idx) == hashes[lane] {
                // SAFETY: the slot is occupied, so its key pointer is
                // live for 'k.
                if unsafe { key_matches::<N>(table.slot_key(idx), key) } {
                    out[lane] = table.slot_value(idx);
                    found |= 1 << lane;
                    break;
                }
            }
        }
    }
    found
}

/// Batched insert of `B` fresh keys.
///
/// All lanes advance in lockstep, one probe step per round. A lane
/// installs its entry when its slot is empty and no earlier active lane
/// targets the same slot this round; everyone else advances one slot.
///
/// # Panics
///
/// Panics when a lane probes the entire table without finding room,
/// which can only happen when the caller violated the free-slot
/// precondition.
pub(crate) fn put_lanes<T: SlotTable, const B: usize, const N: usize>(
    table: &mut T,
    hashes: &[u32; B],
    keys: &KeyBatch<B, N>,
    values: &[i32; B],
) {
    let capacity = table.capacity();
    let idx_mask = capacity - 1;

    let mut pending = (1u32 << B) - 1;
    let mut offsets = [0u32; B];
    let mut indices = [0usize; B];

    while pending != 0 {
        for lane in 0..B {
            if pending & (1 << lane) != 0 {
                indices[lane] = (hashes[lane].wrapping_add(offsets[lane])) as usize & idx_mask;
            }
        }

        let mut installed = 0u32;
        for lane in 0..B {
            if pending & (1 << lane) == 0 {
                continue;
            }
            let conflicts = (0..lane)
                .any(|earlier| pending & (1 << earlier) != 0 && indices[earlier] == indices[lane]);
            if !conflicts && table.slot_is_empty(indices[lane]) {
                table.install(indices[lane], hashes[lane], keys.lane_ptr(lane), values[lane]);
                installed |= 1 << lane;
            }
        }

        pending &= !installed;
        for lane in 0..B {
            if pending & (1 << lane) != 0 {
                offsets[lane] += 1;
                assert!(
                    (offsets[lane] as usize) < capacity,
                    "batch insert probed every slot without finding room"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal slot table: one array of optional (hash, key, value)
    /// entries. Hashes act as their own key identity here.
    struct ToyTable {
        slots: Vec<Option<(u32, *const u8, i32)>>,
    }

    impl ToyTable {
        fn new(capacity: usize) -> Self {
            Self { slots: vec![None; capacity] }
        }
    }

    impl SlotTable for ToyTable {
        fn capacity(&self) -> usize {
            self.slots.len()
        }
        fn slot_is_empty(&self, idx: usize) -> bool {
            self.slots[idx].is_none()
        }
        fn slot_hash(&self, idx: usize) -> u32 {
            self.slots[idx].unwrap().0
        }
        fn slot_key(&self, idx: usize) -> *const u8 {
            self.slots[idx].unwrap().1
        }
        fn slot_value(&self, idx: usize) -> i32 {
            self.slots[idx].unwrap().2
        }
        fn install(&mut self, idx: usize, hash: u32, key: *const u8, value: i32) {
            assert!(self.slots[idx].is_none(), "double install at {idx}");
            self.slots[idx] = Some((hash, key, value));
        }
    }

    #[test]
    fn colliding_lanes_install_in_lane_order() {
        let mut table = ToyTable::new(32);
        let keys = KeyBatch::<8, 8>::from_keys(std::array::from_fn(|lane| [lane as u8; 8]));
        let hashes = [5u32; 8];
        let values: [i32; 8] = std::array::from_fn(|lane| lane as i32);

        put_lanes(&mut table, &hashes, &keys, &values);

        // All eight lanes share home slot 5; they must land on slots
        // 5..13 in lane order.
        for lane in 0..8 {
            let (hash, key, value) = table.slots[5 + lane].unwrap();
            assert_eq!(hash, 5);
            assert_eq!(key, keys.lane_ptr(lane));
            assert_eq!(value, lane as i32);
        }
    }

    #[test]
    fn lookup_stops_at_empty_slot_and_reports_mask() {
        let mut table = ToyTable::new(16);
        let keys = KeyBatch::<8, 8>::from_keys(std::array::from_fn(|lane| [lane as u8; 8]));
        let hashes: [u32; 8] = std::array::from_fn(|lane| lane as u32 * 2);
        let values: [i32; 8] = std::array::from_fn(|lane| lane as i32 + 50);
        put_lanes(&mut table, &hashes, &keys, &values);

        let mut out = [0i32; 8];
        let found = get_lanes(&table, &hashes, &keys, &mut out);
        assert_eq!(found, 0xff);
        assert_eq!(out, values);

        // Same hashes but different key bytes: lanes survive the hash
        // comparison and die on the key comparison.
        let other = KeyBatch::<8, 8>::from_keys(std::array::from_fn(|lane| [lane as u8 + 100; 8]));
        let mut out = [i32::MIN; 8];
        let found = get_lanes(&table, &hashes, &other, &mut out);
        assert_eq!(found, 0);
        assert_eq!(out, [i32::MIN; 8]);
    }

    #[test]
    #[should_panic(expected = "without finding room")]
    fn overfull_batch_panics() {
        // Four slots cannot hold eight lanes; the engine must fail loud
        // rather than spin.
        let mut table = ToyTable::new(4);
        let keys = KeyBatch::<8, 8>::from_keys(std::array::from_fn(|lane| [lane as u8; 8]));
        let hashes = [0u32; 8];
        let values = [0i32; 8];
        put_lanes(&mut table, &hashes, &keys, &values);
    }

    #[test]
    fn zero_hash_is_remapped_and_others_pass_through() {
        assert_eq!(live_hash(0), ZERO_HASH_SUBSTITUTE);
        assert_eq!(live_hash(1), 1);
        assert_eq!(live_hash(u32::MAX), u32::MAX);
    }
}
