//! Differential fuzzing of `SparseBitset` against a `BTreeSet` model.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use liveset::SparseBitset;
use std::collections::BTreeSet;

#[derive(Arbitrary, Debug)]
enum Op {
    Set(u32),
    Clear(u32),
    Test(u32),
    Merge(Vec<u32>),
    Snapshot,
}

#[derive(Arbitrary, Debug)]
struct Input {
    dense: bool,
    ops: Vec<Op>,
}

const CAP_DENSE: usize = 1000;
const CAP_SPARSE: usize = 1 << 21;

fuzz_target!(|input: Input| {
    let cap = if input.dense { CAP_DENSE } else { CAP_SPARSE };
    let mut model: BTreeSet<usize> = BTreeSet::new();
    let mut s = SparseBitset::new(cap);
    let mut snapshots: Vec<(SparseBitset, BTreeSet<usize>)> = vec![];

    for op in &input.ops {
        match op {
            Op::Set(bit) => {
                let bit = *bit as usize % cap;
                model.insert(bit);
                s.set(bit);
            }
            Op::Clear(bit) => {
                let bit = *bit as usize % cap;
                model.remove(&bit);
                s.clear(bit);
            }
            Op::Test(bit) => {
                let bit = *bit as usize % cap;
                assert_eq!(s.test(bit), model.contains(&bit));
            }
            Op::Merge(bits) => {
                let mut other = SparseBitset::new(cap);
                let mut other_model = BTreeSet::new();
                for &bit in bits {
                    let bit = bit as usize % cap;
                    other.set(bit);
                    other_model.insert(bit);
                }
                let grew = !other_model.is_subset(&model);
                assert_eq!(s.merge(&other), grew);
                model.extend(other_model);
            }
            Op::Snapshot => {
                snapshots.push((s.clone(), model.clone()));
            }
        }
    }

    assert_eq!(s.count(), model.len());
    assert!(s.iter().eq(model.iter().cloned()));
    // Clones taken mid-run must be unaffected by later mutation.
    for (snap, snap_model) in &snapshots {
        assert!(snap.iter().eq(snap_model.iter().cloned()));
    }
});
