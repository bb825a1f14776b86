//! Backward liveness analysis.
//!
//! Computes, for every block, the set of values live on entry and on
//! exit, and for every use a "kill" flag: whether that use is the
//! last one in its block, in forward program order, before the value
//! is redefined or the block ends. A register allocator reads the
//! kill flag to decide when a value's storage can be reclaimed.
//!
//! Liveness is inherently backward (a value is live because of a
//! *future* use), so blocks are processed with a worklist rather than
//! any fixed visitation order: back edges and irreducible control
//! flow simply cause re-processing until the sets stop growing. The
//! fixed point exists because `merge` only ever adds bits over a
//! finite universe.

use crate::bitset::SparseBitset;
use crate::cfg;
use crate::entity::{EntityRef, PerEntity};
use crate::ir::{Block, FunctionBody, Value};
use fxhash::FxHashSet;
use smallvec::{smallvec, SmallVec};
use std::collections::VecDeque;

/// Kill flags for one block, shaped like the block: one row per
/// instruction (one flag per operand) plus one row for the
/// terminator's direct operands. Branch arguments have no flags: a
/// phi operand may feed several out-edges, so it is never a kill.
#[derive(Clone, Debug, Default)]
struct BlockKills {
    insts: Vec<SmallVec<[bool; 4]>>,
    term: SmallVec<[bool; 2]>,
}

#[derive(Clone, Debug)]
pub struct Liveness {
    /// Values live into each block. A block parameter used in its own
    /// block appears here: a phi defines its value on the in-edge, so
    /// it is already live at block entry.
    pub block_in: PerEntity<Block, SparseBitset>,
    /// Values live out of each block.
    pub block_out: PerEntity<Block, SparseBitset>,
    kills: PerEntity<Block, BlockKills>,
    blocks_processed: usize,
}

impl Liveness {
    pub fn compute(body: &FunctionBody) -> Liveness {
        let capacity = body.values.len();
        let mut result = Liveness {
            block_in: PerEntity::default(),
            block_out: PerEntity::default(),
            kills: PerEntity::default(),
            blocks_processed: 0,
        };

        let mut workqueue: VecDeque<Block> = VecDeque::new();
        let mut workqueue_set: FxHashSet<Block> = FxHashSet::default();

        // Seed the queue with every block, exit-first (postorder): a
        // backward analysis converges fastest when successors are
        // processed before their predecessors. Blocks unreachable
        // from the entry follow, so each block is processed at least
        // once either way.
        for block in cfg::postorder(body) {
            workqueue.push_back(block);
            workqueue_set.insert(block);
        }
        for (block, def) in body.blocks.entries() {
            result.block_in[block] = SparseBitset::new(capacity);
            result.block_out[block] = SparseBitset::new(capacity);
            let mut term_uses = 0;
            def.terminator.visit_direct_uses(|_| term_uses += 1);
            result.kills[block] = BlockKills {
                insts: def
                    .insts
                    .iter()
                    .map(|inst| smallvec![false; inst.uses.len()])
                    .collect(),
                term: smallvec![false; term_uses],
            };
            if !workqueue_set.contains(&block) {
                workqueue.push_back(block);
                workqueue_set.insert(block);
            }
        }

        while let Some(block) = workqueue.pop_front() {
            workqueue_set.remove(&block);
            result.blocks_processed += 1;
            result.process_block(body, block, &mut workqueue, &mut workqueue_set);
        }

        log::debug!(
            "liveness: {} blocks, {} values, fixed point after {} worklist steps",
            body.blocks.len(),
            capacity,
            result.blocks_processed
        );
        result
    }

    fn process_block(
        &mut self,
        body: &FunctionBody,
        block: Block,
        workqueue: &mut VecDeque<Block>,
        workqueue_set: &mut FxHashSet<Block>,
    ) {
        let def = &body.blocks[block];
        let mut live = self.block_out[block].clone();

        // The terminator's direct operands are the last uses in the
        // block.
        let kills = &mut self.kills[block];
        let mut term_pos = 0;
        def.terminator.visit_direct_uses(|u| {
            kills.term[term_pos] = mark_use(body, &mut live, u);
            term_pos += 1;
        });

        for (inst_pos, inst) in def.insts.iter().enumerate().rev() {
            // A definition ends liveness looking backward past it.
            for &d in &inst.defs {
                live.clear(d.index());
            }
            for (src_pos, &u) in inst.uses.iter().enumerate() {
                kills.insts[inst_pos][src_pos] = mark_use(body, &mut live, u);
            }
        }

        log::trace!("liveness: {}: live-in {:?}", block, live);
        self.block_in[block] = live;

        // Propagate into predecessors. Phis act in parallel on the
        // edge: all of this block's params die toward the
        // predecessor, then the branch args carried by that
        // particular edge become live. Phi-corner uses never kill
        // (the same source may feed several edges), so no flags are
        // recorded for them.
        for (i, &pred) in def.preds.iter().enumerate() {
            let succ_pos = def.pos_in_pred_succ[i];
            let mut edge = self.block_in[block].clone();
            for &param in &def.params {
                edge.clear(param.index());
            }
            body.blocks[pred]
                .terminator
                .visit_target(succ_pos, |target| {
                    debug_assert_eq!(target.block, block);
                    for &arg in &target.args {
                        assert!(
                            body.value_blocks[arg].is_valid(),
                            "use of undefined value {}",
                            arg
                        );
                        edge.set(arg.index());
                    }
                });
            if self.block_out[pred].merge(&edge) && !workqueue_set.contains(&pred) {
                log::trace!("liveness: live-out of {} grew; requeueing", pred);
                workqueue.push_back(pred);
                workqueue_set.insert(pred);
            }
        }
    }

    pub fn live_in(&self, block: Block) -> &SparseBitset {
        &self.block_in[block]
    }

    pub fn live_out(&self, block: Block) -> &SparseBitset {
        &self.block_out[block]
    }

    /// Kill flag for operand `src` of the instruction at position
    /// `inst` in `block`.
    pub fn inst_kill(&self, block: Block, inst: usize, src: usize) -> bool {
        self.kills[block].insts[inst][src]
    }

    /// Kill flag for the terminator's direct operand at position
    /// `src`, in `Terminator::visit_direct_uses` order.
    pub fn term_kill(&self, block: Block, src: usize) -> bool {
        self.kills[block].term[src]
    }

    /// How many worklist pops the fixed point took.
    pub fn blocks_processed(&self) -> usize {
        self.blocks_processed
    }
}

/// Record a (non-phi-corner) use walking backward: a value not yet
/// live becomes live here, and this use is the killing one.
fn mark_use(body: &FunctionBody, live: &mut SparseBitset, u: Value) -> bool {
    assert!(
        body.value_blocks[u].is_valid(),
        "use of undefined value {}",
        u
    );
    let kill = !live.test(u.index());
    if kill {
        live.set(u.index());
    }
    kill
}
