//! SSA-form intermediate representation: blocks, instructions, values.
//!
//! Phis are expressed as block parameters: a parameter of block `B` is
//! an SSA value defined at the head of `B`, and the value it takes on
//! a given in-edge is the corresponding argument of the predecessor's
//! branch (`BlockTarget::args`). Branch arguments are thus uses that
//! exist only on their edge, not inside either block.

use crate::declare_entity;
use crate::entity::{EntityRef, EntityVec, PerEntity};
use anyhow::{bail, Result};
use smallvec::SmallVec;

declare_entity!(Value, "v");
declare_entity!(Block, "block");

/// The unique definition site of an SSA value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueDef {
    /// The `usize`-th parameter of a block.
    BlockParam(Block, usize),
    /// The `usize`-th result of the instruction at the given position
    /// in a block.
    Inst(Block, usize, usize),
}

/// One instruction: the values it defines and the values it uses.
/// Opcodes and types have no bearing on liveness, so instructions
/// carry neither.
#[derive(Clone, Debug, Default)]
pub struct Inst {
    pub defs: SmallVec<[Value; 2]>,
    pub uses: SmallVec<[Value; 4]>,
}

#[derive(Clone, Debug)]
pub struct BlockTarget {
    pub block: Block,
    /// One argument per parameter of the target block: the phi
    /// operands carried by this edge.
    pub args: Vec<Value>,
}

impl std::fmt::Display for BlockTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let args = self
            .args
            .iter()
            .map(|arg| format!("{}", arg))
            .collect::<Vec<_>>();
        write!(f, "{}({})", self.block, args.join(", "))
    }
}

#[derive(Clone, Debug)]
pub enum Terminator {
    Br {
        target: BlockTarget,
    },
    CondBr {
        cond: Value,
        if_true: BlockTarget,
        if_false: BlockTarget,
    },
    Select {
        value: Value,
        targets: Vec<BlockTarget>,
        default: BlockTarget,
    },
    Return {
        values: Vec<Value>,
    },
    Unreachable,
    None,
}

impl std::default::Default for Terminator {
    fn default() -> Self {
        Terminator::None
    }
}

impl std::fmt::Display for Terminator {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Terminator::None => write!(f, "no_terminator")?,
            Terminator::Br { target } => write!(f, "br {}", target)?,
            Terminator::CondBr {
                cond,
                if_true,
                if_false,
            } => write!(f, "if {}, {}, {}", cond, if_true, if_false)?,
            Terminator::Select {
                value,
                targets,
                default,
            } => write!(
                f,
                "select {}, [{}], {}",
                value,
                targets
                    .iter()
                    .map(|target| format!("{}", target))
                    .collect::<Vec<_>>()
                    .join(", "),
                default
            )?,
            Terminator::Return { values } => write!(
                f,
                "return {}",
                values
                    .iter()
                    .map(|val| format!("{}", val))
                    .collect::<Vec<_>>()
                    .join(", ")
            )?,
            Terminator::Unreachable => write!(f, "unreachable")?,
        }
        Ok(())
    }
}

impl Terminator {
    pub fn visit_targets<F: FnMut(&BlockTarget)>(&self, mut f: F) {
        match self {
            Terminator::Return { .. } => {}
            Terminator::Br { ref target, .. } => f(target),
            Terminator::CondBr {
                ref if_true,
                ref if_false,
                ..
            } => {
                f(if_true);
                f(if_false);
            }
            Terminator::Select {
                ref targets,
                ref default,
                ..
            } => {
                f(default);
                for target in targets {
                    f(target);
                }
            }
            Terminator::None => {}
            Terminator::Unreachable => {}
        }
    }

    /// Visit the single target at the given successor index. Indices
    /// follow `visit_targets` order.
    pub fn visit_target<F: FnMut(&BlockTarget)>(&self, index: usize, mut f: F) {
        match (index, self) {
            (0, Terminator::Br { ref target, .. }) => f(target),
            (0, Terminator::CondBr { ref if_true, .. }) => f(if_true),
            (1, Terminator::CondBr { ref if_false, .. }) => f(if_false),
            (0, Terminator::Select { ref default, .. }) => f(default),
            (i, Terminator::Select { ref targets, .. }) if i <= targets.len() => {
                f(&targets[i - 1])
            }
            (i, this) => panic!("out of bounds: index {} term {}", i, this),
        }
    }

    pub fn visit_successors<F: FnMut(Block)>(&self, mut f: F) {
        self.visit_targets(|target| f(target.block));
    }

    /// Uses that are operands of the terminator itself: the branch
    /// condition, selector, or returned values. Branch arguments are
    /// *not* visited; they belong to their edge. The visit order here
    /// is the operand order used for kill flags.
    pub fn visit_direct_uses<F: FnMut(Value)>(&self, mut f: F) {
        match self {
            &Terminator::CondBr { cond, .. } => f(cond),
            &Terminator::Select { value, .. } => f(value),
            &Terminator::Return { ref values, .. } => {
                for &value in values {
                    f(value);
                }
            }
            _ => {}
        }
    }

    /// All uses: branch arguments first, then direct operands.
    pub fn visit_uses<F: FnMut(Value)>(&self, mut f: F) {
        self.visit_targets(|target| {
            for &arg in &target.args {
                f(arg);
            }
        });
        self.visit_direct_uses(f);
    }
}

#[derive(Clone, Debug, Default)]
pub struct BlockDef {
    /// Parameters of this block; each is an SSA value defined here.
    pub params: Vec<Value>,
    /// Instructions in this block.
    pub insts: Vec<Inst>,
    /// Terminator: branch or return.
    pub terminator: Terminator,
    /// Successor blocks.
    pub succs: Vec<Block>,
    /// For each successor block, our index in its `preds` array.
    pub pos_in_succ_pred: Vec<usize>,
    /// Predecessor blocks.
    pub preds: Vec<Block>,
    /// For each predecessor block, our index in its `succs` array.
    pub pos_in_pred_succ: Vec<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct FunctionBody {
    /// Entry block.
    pub entry: Block,
    /// Block bodies.
    pub blocks: EntityVec<Block, BlockDef>,
    /// Definition sites, indexed by `Value`. The length of this table
    /// is the total count of SSA values in the function.
    pub values: EntityVec<Value, ValueDef>,
    /// Block in which each value is defined; `Block::invalid()` if the
    /// value has not been placed.
    pub value_blocks: PerEntity<Value, Block>,
}

impl FunctionBody {
    pub fn new() -> FunctionBody {
        let mut blocks = EntityVec::default();
        let entry = blocks.push(BlockDef::default());
        FunctionBody {
            entry,
            blocks,
            values: EntityVec::default(),
            value_blocks: PerEntity::default(),
        }
    }

    pub fn add_block(&mut self) -> Block {
        let id = self.blocks.push(BlockDef::default());
        log::trace!("add_block: block {}", id);
        id
    }

    pub fn add_blockparam(&mut self, block: Block) -> Value {
        let pos = self.blocks[block].params.len();
        let value = self.values.push(ValueDef::BlockParam(block, pos));
        self.blocks[block].params.push(value);
        self.value_blocks[value] = block;
        log::trace!("add_blockparam: block {} param {} -> {}", block, pos, value);
        value
    }

    /// Append an instruction with `n_defs` fresh result values and the
    /// given operands; returns the results.
    pub fn add_inst(&mut self, block: Block, n_defs: usize, uses: &[Value]) -> SmallVec<[Value; 2]> {
        let pos = self.blocks[block].insts.len();
        let mut defs: SmallVec<[Value; 2]> = SmallVec::new();
        for i in 0..n_defs {
            let value = self.values.push(ValueDef::Inst(block, pos, i));
            self.value_blocks[value] = block;
            defs.push(value);
        }
        log::trace!(
            "add_inst: block {} inst {}: defs {:?} uses {:?}",
            block,
            pos,
            defs,
            uses
        );
        self.blocks[block].insts.push(Inst {
            defs: defs.clone(),
            uses: SmallVec::from_slice(uses),
        });
        defs
    }

    fn add_edge(&mut self, from: Block, to: Block) {
        let succ_pos = self.blocks[from].succs.len();
        let pred_pos = self.blocks[to].preds.len();
        self.blocks[from].succs.push(to);
        self.blocks[to].preds.push(from);
        self.blocks[from].pos_in_succ_pred.push(pred_pos);
        self.blocks[to].pos_in_pred_succ.push(succ_pos);
        log::trace!("add_edge: from {} to {}", from, to);
    }

    /// Set a block's terminator (exactly once) and wire up the
    /// predecessor/successor adjacency it implies.
    pub fn set_terminator(&mut self, block: Block, terminator: Terminator) {
        assert!(
            matches!(self.blocks[block].terminator, Terminator::None),
            "block {} already terminated",
            block
        );
        terminator.visit_successors(|succ| {
            self.add_edge(block, succ);
        });
        log::trace!("set_terminator: block {}: {}", block, terminator);
        self.blocks[block].terminator = terminator;
    }

    fn check_placed(&self, block: Block, value: Value) -> Result<()> {
        if self.values.get(value).is_none() || self.value_blocks[value].is_invalid() {
            bail!("block {}: use of unplaced value {}", block, value);
        }
        Ok(())
    }

    /// Check IR well-formedness: all blocks terminated, branch
    /// arguments matching target parameter counts, every use referring
    /// to a defined value, and every value sitting where its def-site
    /// record says it does.
    pub fn validate(&self) -> Result<()> {
        for (block, def) in self.blocks.entries() {
            if let Terminator::None = def.terminator {
                bail!("block {} has no terminator", block);
            }

            for (pos, &param) in def.params.iter().enumerate() {
                if self.values[param] != ValueDef::BlockParam(block, pos) {
                    bail!(
                        "value {} is param {} of block {} but records {:?}",
                        param,
                        pos,
                        block,
                        self.values[param]
                    );
                }
            }

            for (pos, inst) in def.insts.iter().enumerate() {
                for (i, &d) in inst.defs.iter().enumerate() {
                    if self.values[d] != ValueDef::Inst(block, pos, i) {
                        bail!(
                            "value {} is def {} of inst {} in block {} but records {:?}",
                            d,
                            i,
                            pos,
                            block,
                            self.values[d]
                        );
                    }
                }
                for &u in &inst.uses {
                    self.check_placed(block, u)?;
                }
            }

            let mut arity_err = None;
            def.terminator.visit_targets(|target| {
                let want = self.blocks[target.block].params.len();
                if arity_err.is_none() && target.args.len() != want {
                    arity_err = Some((target.block, target.args.len(), want));
                }
            });
            if let Some((succ, got, want)) = arity_err {
                bail!(
                    "block {}: branch to {} passes {} args, expected {}",
                    block,
                    succ,
                    got,
                    want
                );
            }

            let mut unplaced = None;
            def.terminator.visit_uses(|u| {
                if unplaced.is_none()
                    && (self.values.get(u).is_none() || self.value_blocks[u].is_invalid())
                {
                    unplaced = Some(u);
                }
            });
            if let Some(u) = unplaced {
                bail!("block {}: terminator uses unplaced value {}", block, u);
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for FunctionBody {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (block, def) in self.blocks.entries() {
            let params = def
                .params
                .iter()
                .map(|param| format!("{}", param))
                .collect::<Vec<_>>();
            writeln!(
                f,
                "{}({}): # preds: {:?} succs: {:?}",
                block,
                params.join(", "),
                def.preds,
                def.succs
            )?;
            for inst in &def.insts {
                let defs = inst
                    .defs
                    .iter()
                    .map(|d| format!("{}", d))
                    .collect::<Vec<_>>();
                let uses = inst
                    .uses
                    .iter()
                    .map(|u| format!("{}", u))
                    .collect::<Vec<_>>();
                writeln!(f, "  {} = inst({})", defs.join(", "), uses.join(", "))?;
            }
            writeln!(f, "  {}", def.terminator)?;
        }
        Ok(())
    }
}
