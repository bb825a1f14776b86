//! Control-flow graph traversal.

use crate::entity::PerEntity;
use crate::ir::{Block, FunctionBody};
use smallvec::{smallvec, SmallVec};

/// Postorder over the blocks reachable from the entry, computed with
/// an explicit DFS stack. Successor edges are visited in terminator
/// order. Blocks unreachable from the entry do not appear.
pub fn postorder(body: &FunctionBody) -> Vec<Block> {
    let mut ret = vec![];
    let mut visited: PerEntity<Block, bool> = PerEntity::default();

    // Stack of (block, next successor edge to visit).
    let mut stack: SmallVec<[(Block, usize); 64]> = smallvec![];
    visited[body.entry] = true;
    stack.push((body.entry, 0));

    while let Some(top) = stack.last_mut() {
        let block = top.0;
        let next_succ = top.1;
        let succs = &body.blocks[block].succs;
        if next_succ < succs.len() {
            top.1 += 1;
            let succ = succs[next_succ];
            if !visited[succ] {
                log::trace!("postorder: visiting {}", succ);
                visited[succ] = true;
                stack.push((succ, 0));
            }
        } else {
            ret.push(block);
            stack.pop();
        }
    }

    ret
}
