//! Adaptive sparse bit-set.
//!
//! A `SparseBitset` is worth using over a flat bit array when the
//! universe of potential bits is large but most of them stay zero,
//! with the set bits clustered in small scattered regions. Bits are
//! unset by default; a region that contains set bits is backed by a
//! fixed-size 1024-bit bucket node in an ordered map keyed by the
//! bucket's aligned offset. Small universes skip the map entirely and
//! use one flat array.

use std::cmp::Ordering;
use std::collections::btree_map;
use std::collections::BTreeMap;

pub const LOG2_BITS_PER_NODE: usize = 10;
pub const BITS_PER_NODE: usize = 1 << LOG2_BITS_PER_NODE;
const BIT_INDEX_MASK: usize = BITS_PER_NODE - 1;

const WORD_BITS: usize = 64;
const WORDS_PER_NODE: usize = BITS_PER_NODE / WORD_BITS;

/// Sets with a capacity below this many bits use one flat array
/// instead of the bucket map.
pub const SMALL_SET_THRESHOLD: usize = 4096;

fn words_for(bits: usize) -> usize {
    (bits + WORD_BITS - 1) / WORD_BITS
}

/// Union `src` into `dst`, reporting whether any bit went
/// unset-to-set.
fn merge_words(dst: &mut [u64], src: &[u64]) -> bool {
    let mut changed = false;
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        changed |= (s & !*d) != 0;
        *d |= s;
    }
    changed
}

/// A dense bucket covering bits `[offset, offset + BITS_PER_NODE)`;
/// the offset is the bucket's key in the node map.
#[derive(Clone, Debug, PartialEq, Eq)]
struct BitsetNode {
    words: [u64; WORDS_PER_NODE],
}

impl BitsetNode {
    fn empty() -> BitsetNode {
        BitsetNode {
            words: [0; WORDS_PER_NODE],
        }
    }

    fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[derive(Clone, Debug)]
enum Repr {
    /// One flat array of `capacity` bits.
    Dense(Box<[u64]>),
    /// Bucket nodes keyed by aligned offset; an absent bucket is all
    /// zero.
    Sparse(BTreeMap<usize, BitsetNode>),
}

/// A mutable set of integers in `[0, capacity)`, with storage
/// proportional to the number of populated regions rather than to the
/// capacity.
///
/// Indexing a bit at or beyond the capacity is a contract violation
/// and panics: the capacity is fixed at construction, and callers are
/// expected to size it to their universe up front.
pub struct SparseBitset {
    repr: Repr,
    capacity: usize,
}

impl SparseBitset {
    /// An empty set over `[0, capacity)`. Capacity 0 is legal: the
    /// set is permanently empty and every bit index is out of range.
    pub fn new(capacity: usize) -> SparseBitset {
        let repr = if capacity != 0 && capacity < SMALL_SET_THRESHOLD {
            Repr::Dense(vec![0u64; words_for(capacity)].into_boxed_slice())
        } else {
            Repr::Sparse(BTreeMap::new())
        };
        SparseBitset { repr, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn check_range(&self, bit: usize) {
        assert!(
            bit < self.capacity,
            "bit {} out of range for capacity {}",
            bit,
            self.capacity
        );
    }

    /// Set a bit. Idempotent.
    pub fn set(&mut self, bit: usize) {
        self.check_range(bit);
        match &mut self.repr {
            Repr::Dense(words) => {
                words[bit / WORD_BITS] |= 1u64 << (bit % WORD_BITS);
            }
            Repr::Sparse(nodes) => {
                let node = nodes
                    .entry(bit & !BIT_INDEX_MASK)
                    .or_insert_with(BitsetNode::empty);
                let idx = bit & BIT_INDEX_MASK;
                node.words[idx / WORD_BITS] |= 1u64 << (idx % WORD_BITS);
            }
        }
    }

    /// Clear a bit. Idempotent; clearing within an absent bucket
    /// allocates nothing.
    pub fn clear(&mut self, bit: usize) {
        self.check_range(bit);
        match &mut self.repr {
            Repr::Dense(words) => {
                words[bit / WORD_BITS] &= !(1u64 << (bit % WORD_BITS));
            }
            Repr::Sparse(nodes) => {
                if let Some(node) = nodes.get_mut(&(bit & !BIT_INDEX_MASK)) {
                    let idx = bit & BIT_INDEX_MASK;
                    node.words[idx / WORD_BITS] &= !(1u64 << (idx % WORD_BITS));
                }
            }
        }
    }

    pub fn test(&self, bit: usize) -> bool {
        self.check_range(bit);
        match &self.repr {
            Repr::Dense(words) => words[bit / WORD_BITS] & (1u64 << (bit % WORD_BITS)) != 0,
            Repr::Sparse(nodes) => match nodes.get(&(bit & !BIT_INDEX_MASK)) {
                Some(node) => {
                    let idx = bit & BIT_INDEX_MASK;
                    node.words[idx / WORD_BITS] & (1u64 << (idx % WORD_BITS)) != 0
                }
                None => false,
            },
        }
    }

    /// Total number of set bits. Walks the populated storage, so this
    /// is O(words), not O(1); fine for pressure estimation, wrong for
    /// a hot loop.
    pub fn count(&self) -> usize {
        match &self.repr {
            Repr::Dense(words) => words.iter().map(|w| w.count_ones() as usize).sum(),
            Repr::Sparse(nodes) => nodes.values().map(|node| node.count()).sum(),
        }
    }

    /// In-place union of `src` into `self`. Returns true iff at least
    /// one bit went unset-to-set. The backward dataflow uses this
    /// return value as its sole termination signal, so a change must
    /// never go unreported.
    ///
    /// Panics if the capacities differ.
    pub fn merge(&mut self, src: &SparseBitset) -> bool {
        assert_eq!(
            self.capacity, src.capacity,
            "merge of mismatched capacities"
        );
        match (&mut self.repr, &src.repr) {
            (Repr::Dense(dst), Repr::Dense(src_words)) => merge_words(dst, src_words),
            (Repr::Sparse(dst), Repr::Sparse(src_nodes)) => {
                let mut changed = false;
                for (&offset, node) in src_nodes {
                    // An empty source bucket contributes nothing;
                    // don't materialize a destination bucket for it.
                    if node.is_empty() {
                        continue;
                    }
                    let dst_node = dst.entry(offset).or_insert_with(BitsetNode::empty);
                    changed |= merge_words(&mut dst_node.words, &node.words);
                }
                changed
            }
            // The representation is a pure function of capacity, so
            // equal capacities always share a variant.
            _ => unreachable!(),
        }
    }

    /// Iterate the set bits in strictly ascending order. The borrow
    /// rules out mutation for the iterator's lifetime; any number of
    /// concurrent readers is fine.
    pub fn iter(&self) -> SetBits<'_> {
        let cursor = match &self.repr {
            Repr::Dense(words) => Cursor::Dense { words, next: 0 },
            Repr::Sparse(nodes) => Cursor::Sparse {
                nodes: nodes.iter(),
                node: None,
            },
        };
        SetBits {
            cursor,
            current: 0,
            base: 0,
        }
    }

    /// Total order for determinism checks: lexicographic by
    /// (populated bucket offset, bucket contents). Buckets emptied by
    /// `clear` compare as absent.
    ///
    /// Panics if the capacities differ.
    pub fn cmp(&self, other: &SparseBitset) -> Ordering {
        assert_eq!(
            self.capacity, other.capacity,
            "cmp of mismatched capacities"
        );
        match (&self.repr, &other.repr) {
            (Repr::Dense(a), Repr::Dense(b)) => a.cmp(b),
            (Repr::Sparse(a), Repr::Sparse(b)) => {
                let mut a_nodes = a.iter().filter(|(_, node)| !node.is_empty());
                let mut b_nodes = b.iter().filter(|(_, node)| !node.is_empty());
                loop {
                    match (a_nodes.next(), b_nodes.next()) {
                        (None, None) => return Ordering::Equal,
                        (None, Some(_)) => return Ordering::Less,
                        (Some(_), None) => return Ordering::Greater,
                        (Some((a_off, a_node)), Some((b_off, b_node))) => {
                            let ord = a_off
                                .cmp(b_off)
                                .then_with(|| a_node.words.cmp(&b_node.words));
                            if ord != Ordering::Equal {
                                return ord;
                            }
                        }
                    }
                }
            }
            _ => unreachable!(),
        }
    }
}

impl Clone for SparseBitset {
    /// Deep copy: the two sets share no storage afterward. Buckets
    /// emptied by `clear` are not carried over.
    fn clone(&self) -> SparseBitset {
        let repr = match &self.repr {
            Repr::Dense(words) => Repr::Dense(words.clone()),
            Repr::Sparse(nodes) => Repr::Sparse(
                nodes
                    .iter()
                    .filter(|(_, node)| !node.is_empty())
                    .map(|(&offset, node)| (offset, node.clone()))
                    .collect(),
            ),
        };
        SparseBitset {
            repr,
            capacity: self.capacity,
        }
    }
}

impl std::default::Default for SparseBitset {
    fn default() -> Self {
        SparseBitset::new(0)
    }
}

impl std::fmt::Debug for SparseBitset {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl PartialEq for SparseBitset {
    fn eq(&self, other: &SparseBitset) -> bool {
        self.capacity == other.capacity && self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SparseBitset {}

impl<'a> IntoIterator for &'a SparseBitset {
    type Item = usize;
    type IntoIter = SetBits<'a>;
    fn into_iter(self) -> SetBits<'a> {
        self.iter()
    }
}

enum Cursor<'a> {
    Dense {
        words: &'a [u64],
        next: usize,
    },
    Sparse {
        nodes: btree_map::Iter<'a, usize, BitsetNode>,
        /// Current bucket: node, offset, next word index within it.
        node: Option<(&'a BitsetNode, usize, usize)>,
    },
}

/// Ascending iterator over set bits; see [`SparseBitset::iter`].
pub struct SetBits<'a> {
    cursor: Cursor<'a>,
    /// Unconsumed bits of the current word.
    current: u64,
    /// Bit index of the current word's bit 0.
    base: usize,
}

impl<'a> SetBits<'a> {
    fn next_word(&mut self) -> Option<(usize, u64)> {
        match &mut self.cursor {
            Cursor::Dense { words, next } => {
                if *next < words.len() {
                    let word = words[*next];
                    let base = *next * WORD_BITS;
                    *next += 1;
                    Some((base, word))
                } else {
                    None
                }
            }
            Cursor::Sparse { nodes, node } => loop {
                if let Some((n, offset, next)) = node {
                    if *next < WORDS_PER_NODE {
                        let word = n.words[*next];
                        let base = *offset + *next * WORD_BITS;
                        *next += 1;
                        return Some((base, word));
                    }
                }
                match nodes.next() {
                    Some((&offset, n)) => *node = Some((n, offset, 0)),
                    None => return None,
                }
            },
        }
    }
}

impl<'a> Iterator for SetBits<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                return Some(self.base + bit);
            }
            let (base, word) = self.next_word()?;
            self.base = base;
            self.current = word;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    // Comfortably above the dense threshold, not bucket-aligned.
    const SPARSE_CAP: usize = (1 << 20) + 1;

    #[test]
    fn dense_for_small_sparse_for_large() {
        assert!(matches!(
            SparseBitset::new(SMALL_SET_THRESHOLD - 1).repr,
            Repr::Dense(_)
        ));
        assert!(matches!(
            SparseBitset::new(SMALL_SET_THRESHOLD).repr,
            Repr::Sparse(_)
        ));
        assert!(matches!(SparseBitset::new(0).repr, Repr::Sparse(_)));
    }

    #[test]
    fn set_clear_test_both_reprs() {
        for &cap in &[100, SPARSE_CAP] {
            let mut s = SparseBitset::new(cap);
            assert!(!s.test(3));
            s.set(3);
            s.set(3);
            assert!(s.test(3));
            s.clear(3);
            assert!(!s.test(3));
            s.clear(3);
            assert!(!s.test(3));
            // Clearing a bit in an untouched region is a no-op.
            s.clear(99);
            assert!(!s.test(99));
        }
    }

    #[test]
    fn no_interference() {
        let bits = [0usize, 1, 63, 64, 1023, 1024, 65535, 1 << 20];
        let mut s = SparseBitset::new(SPARSE_CAP);
        for &b in &bits {
            s.set(b);
        }
        s.clear(1024);
        for &b in &bits {
            assert_eq!(s.test(b), b != 1024, "bit {}", b);
        }
    }

    #[test]
    fn snapshot_isolation() {
        for &cap in &[100, SPARSE_CAP] {
            let mut s = SparseBitset::new(cap);
            s.set(1);
            s.set(50);
            let mut d = s.clone();
            s.clear(1);
            d.set(70);
            assert!(d.test(1) && d.test(50) && d.test(70));
            assert!(!s.test(1) && s.test(50) && !s.test(70));
        }
    }

    #[test]
    fn merge_union_and_changed_flag() {
        for &cap in &[100, SPARSE_CAP] {
            let mut a = SparseBitset::new(cap);
            let mut b = SparseBitset::new(cap);
            a.set(1);
            a.set(2);
            b.set(2);
            b.set(3);
            assert!(a.merge(&b));
            for &bit in &[1, 2, 3] {
                assert!(a.test(bit));
            }
            assert_eq!(a.count(), 3);
            // Second merge adds nothing.
            assert!(!a.merge(&b));
            assert_eq!(a.count(), 3);
        }
    }

    #[test]
    fn merge_skips_empty_source_buckets() {
        let mut a = SparseBitset::new(SPARSE_CAP);
        let mut b = SparseBitset::new(SPARSE_CAP);
        b.set(5000);
        b.clear(5000);
        assert!(!a.merge(&b));
        match &a.repr {
            Repr::Sparse(nodes) => assert!(nodes.is_empty()),
            _ => panic!("expected sparse repr"),
        }
    }

    #[test]
    fn count_consistency() {
        for &cap in &[100, SPARSE_CAP] {
            let mut s = SparseBitset::new(cap);
            let bits = [0usize, 7, 8, 63, 64, 99];
            for &b in &bits {
                s.set(b);
            }
            assert_eq!(s.count(), bits.len());
            s.clear(63);
            assert_eq!(s.count(), bits.len() - 1);
        }
    }

    #[test]
    fn iteration_ascending_no_dups() {
        for &cap in &[100, SPARSE_CAP] {
            let mut s = SparseBitset::new(cap);
            // Includes word and bucket boundaries.
            let mut bits = vec![99usize, 0, 64, 63, 1, 65];
            if cap > 1024 {
                bits.extend_from_slice(&[1023, 1024, 2047, 2048]);
            }
            for &b in &bits {
                s.set(b);
            }
            bits.sort();
            assert_eq!(s.iter().collect::<Vec<_>>(), bits);
        }
    }

    #[test]
    fn sparse_storage_scales_with_buckets() {
        let mut s = SparseBitset::new(1_048_577);
        let bits = [19usize, 422, 16383, 65535, 65539, 1048576];
        for &b in &bits {
            s.set(b);
        }
        assert_eq!(s.count(), 6);
        assert_eq!(s.iter().collect::<Vec<_>>(), bits);
        // The six bits land in five distinct 1024-bit buckets.
        match &s.repr {
            Repr::Sparse(nodes) => {
                assert_eq!(
                    nodes.keys().cloned().collect::<Vec<_>>(),
                    vec![0, 15360, 64512, 65536, 1048576]
                );
            }
            _ => panic!("expected sparse repr"),
        }
    }

    #[test]
    fn capacity_zero() {
        let mut a = SparseBitset::new(0);
        let b = SparseBitset::new(0);
        assert_eq!(a.count(), 0);
        assert_eq!(a.iter().count(), 0);
        assert!(!a.merge(&b));
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a, b);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn set_out_of_range_panics() {
        let mut s = SparseBitset::new(100);
        s.set(100);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_panics() {
        let s = SparseBitset::new(0);
        s.test(0);
    }

    #[test]
    #[should_panic(expected = "mismatched capacities")]
    fn merge_mismatched_capacities_panics() {
        let mut a = SparseBitset::new(100);
        let b = SparseBitset::new(200);
        a.merge(&b);
    }

    #[test]
    fn transient_empty_bucket_is_invisible() {
        let mut a = SparseBitset::new(SPARSE_CAP);
        let b = SparseBitset::new(SPARSE_CAP);
        a.set(2048);
        a.clear(2048);
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a, b);
        assert_eq!(a.count(), 0);
        assert_eq!(a.iter().count(), 0);
        // The pruning clone drops the empty bucket entirely.
        match &a.clone().repr {
            Repr::Sparse(nodes) => assert!(nodes.is_empty()),
            _ => panic!("expected sparse repr"),
        }
    }

    #[test]
    fn cmp_orders_by_first_divergence() {
        let mut a = SparseBitset::new(SPARSE_CAP);
        let mut b = SparseBitset::new(SPARSE_CAP);
        a.set(9000);
        b.set(9000);
        b.set(100_000);
        // a's bucket stream is a strict prefix of b's.
        assert_eq!(a.cmp(&b), Ordering::Less);
        assert_eq!(b.cmp(&a), Ordering::Greater);
        assert_ne!(a, b);
        a.set(100_000);
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a, b);
    }

    fn apply(model: &mut BTreeSet<usize>, s: &mut SparseBitset, ops: &[(bool, usize)], cap: usize) {
        for &(is_set, bit) in ops {
            let bit = bit % cap;
            if is_set {
                model.insert(bit);
                s.set(bit);
            } else {
                model.remove(&bit);
                s.clear(bit);
            }
        }
    }

    proptest! {
        #[test]
        fn model_differential(ops in proptest::collection::vec((any::<bool>(), 0usize..SPARSE_CAP), 0..200),
                              dense in any::<bool>()) {
            let cap = if dense { 1000 } else { SPARSE_CAP };
            let mut model = BTreeSet::new();
            let mut s = SparseBitset::new(cap);
            apply(&mut model, &mut s, &ops, cap);
            prop_assert_eq!(s.count(), model.len());
            prop_assert_eq!(s.iter().collect::<Vec<_>>(), model.iter().cloned().collect::<Vec<_>>());
            for &(_, bit) in &ops {
                prop_assert_eq!(s.test(bit % cap), model.contains(&(bit % cap)));
            }
        }

        #[test]
        fn merge_is_union(a_ops in proptest::collection::vec((any::<bool>(), 0usize..SPARSE_CAP), 0..100),
                          b_ops in proptest::collection::vec((any::<bool>(), 0usize..SPARSE_CAP), 0..100)) {
            let mut a_model = BTreeSet::new();
            let mut b_model = BTreeSet::new();
            let mut a = SparseBitset::new(SPARSE_CAP);
            let mut b = SparseBitset::new(SPARSE_CAP);
            apply(&mut a_model, &mut a, &a_ops, SPARSE_CAP);
            apply(&mut b_model, &mut b, &b_ops, SPARSE_CAP);
            let grew = !b_model.is_subset(&a_model);
            prop_assert_eq!(a.merge(&b), grew);
            let union: Vec<usize> = a_model.union(&b_model).cloned().collect();
            prop_assert_eq!(a.iter().collect::<Vec<_>>(), union);
            prop_assert!(!a.merge(&b));
        }
    }
}
