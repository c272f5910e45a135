//! Model-based differential tests.
//!
//! Random action sequences run against a `BTreeMap` model for the
//! scalar map, and randomized batch fills run against the scalar map as
//! oracle for the three vectorized variants. Keys live in an arena that
//! outlives every map so the borrowed-key contract holds.

use std::collections::BTreeMap;

use proptest::prelude::*;
use proptest_derive::Arbitrary;

use crate::{KeyBatch, MergedMap16, PackedMap8, ScalarMap, SplitMap16};

/// Bounded key universe; actions address keys by slot index so that
/// gets and erases hit live keys often.
const UNIVERSE: usize = 64;

fn universe() -> Vec<[u8; 16]> {
    (0..UNIVERSE as u64)
        .map(|i| {
            let mut key = [0u8; 16];
            key[..8].copy_from_slice(&i.to_le_bytes());
            key[15] = 0x5a;
            key
        })
        .collect()
}

/// Distinct keys derived from a seed, `16 * batches` of them.
fn seeded_keys(seed: u64, batches: usize) -> Vec<[u8; 16]> {
    (0..(16 * batches) as u64)
        .map(|i| {
            let mut key = [0u8; 16];
            key[..8].copy_from_slice(&i.to_le_bytes());
            key[8..16].copy_from_slice(&seed.to_le_bytes());
            key
        })
        .collect()
}

#[derive(Arbitrary, Debug, Clone)]
enum Action {
    Put { slot: usize, value: i32 },
    Get { slot: usize },
    Erase { slot: usize },
}

fn run_scalar_actions(actions: Vec<Action>) {
    let keys = universe();
    let mut map = ScalarMap::<16>::new(128);
    let mut model: BTreeMap<usize, i32> = BTreeMap::new();

    for action in actions {
        match action {
            Action::Put { slot, value } => {
                let slot = slot % UNIVERSE;
                let previous = map.put(&keys[slot], value).expect("universe fits the table");
                assert_eq!(
                    previous,
                    model.insert(slot, value),
                    "put mismatch at slot {slot}"
                );
            }
            Action::Get { slot } => {
                let slot = slot % UNIVERSE;
                assert_eq!(
                    map.get(&keys[slot]),
                    model.get(&slot).copied(),
                    "get mismatch at slot {slot}"
                );
            }
            Action::Erase { slot } => {
                let slot = slot % UNIVERSE;
                assert_eq!(
                    map.erase(&keys[slot]),
                    model.remove(&slot).is_some(),
                    "erase mismatch at slot {slot}"
                );
            }
        }
        assert_eq!(map.len(), model.len());
        assert_eq!(map.is_empty(), model.is_empty());
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn scalar_map_matches_btreemap(actions in prop::collection::vec(any::<Action>(), 1..96)) {
        run_scalar_actions(actions);
    }

    #[test]
    fn split16_batches_match_scalar_oracle(seed in any::<u64>(), batches in 1usize..8) {
        let keys = seeded_keys(seed, batches);
        let batch_blocks: Vec<KeyBatch<16, 16>> = keys
            .chunks(16)
            .map(|chunk| {
                let mut batch = KeyBatch::new();
                for (lane, key) in chunk.iter().enumerate() {
                    batch.set_key(lane, key);
                }
                batch
            })
            .collect();

        let mut map = SplitMap16::<16>::new(1024);
        let mut oracle = ScalarMap::<16>::new(1024);

        for (b, batch) in batch_blocks.iter().enumerate() {
            let values: [i32; 16] = std::array::from_fn(|lane| (b * 16 + lane) as i32);
            map.put_vec(batch, &values);
            for lane in 0..16 {
                oracle.put(batch.key(lane), values[lane]).unwrap();
            }

            let mut out = [0i32; 16];
            prop_assert_eq!(map.get_vec(batch, &mut out), 0xffff);
            prop_assert_eq!(out, values);
        }

        prop_assert_eq!(map.len(), oracle.len());
        for key in &keys {
            prop_assert_eq!(map.get(key), oracle.get(key));
        }
        // Fresh keys miss in both.
        for key in seeded_keys(!seed, 1).iter() {
            prop_assert_eq!(map.get(key), oracle.get(key));
        }
    }

    #[test]
    fn merged16_batches_match_scalar_oracle(seed in any::<u64>(), batches in 1usize..8) {
        let keys = seeded_keys(seed, batches);
        let batch_blocks: Vec<KeyBatch<16, 16>> = keys
            .chunks(16)
            .map(|chunk| {
                let mut batch = KeyBatch::new();
                for (lane, key) in chunk.iter().enumerate() {
                    batch.set_key(lane, key);
                }
                batch
            })
            .collect();

        let mut map = MergedMap16::<16>::new(1024);
        let mut oracle = ScalarMap::<16>::new(1024);

        for (b, batch) in batch_blocks.iter().enumerate() {
            let values: [i32; 16] = std::array::from_fn(|lane| (b * 16 + lane) as i32);
            map.put_vec(batch, &values);
            for lane in 0..16 {
                oracle.put(batch.key(lane), values[lane]).unwrap();
            }
        }

        prop_assert_eq!(map.len(), oracle.len());
        for key in &keys {
            prop_assert_eq!(map.get(key), oracle.get(key));
        }
    }

    #[test]
    fn packed8_batches_match_scalar_oracle(seed in any::<u64>(), batches in 1usize..8) {
        let keys = seeded_keys(seed, batches);
        let batch_blocks: Vec<KeyBatch<8, 16>> = keys
            .chunks(8)
            .map(|chunk| {
                let mut batch = KeyBatch::new();
                for (lane, key) in chunk.iter().enumerate() {
                    batch.set_key(lane, key);
                }
                batch
            })
            .collect();

        let mut map = PackedMap8::<16>::new(1024);
        let mut oracle = ScalarMap::<16>::new(1024);

        for (b, batch) in batch_blocks.iter().enumerate() {
            let values: [i32; 8] = std::array::from_fn(|lane| (b * 8 + lane) as i32);
            map.put_vec(batch, &values);
            for lane in 0..8 {
                oracle.put(batch.key(lane), values[lane]).unwrap();
            }

            let mut out = [0i32; 8];
            prop_assert_eq!(map.get_vec(batch, &mut out), 0xff);
            prop_assert_eq!(out, values);
        }

        prop_assert_eq!(map.len(), oracle.len());
        for key in &keys {
            prop_assert_eq!(map.get(key), oracle.get(key));
        }
    }
}
