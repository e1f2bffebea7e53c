//! Basic blocks and their edge lists.

use std::fmt;

use crate::assembly::{FlowType, Instruction};
use crate::flow::ScopeId;

/// Stable handle to a block in a method's block arena.
///
/// Blocks reference each other only through these indices; the arena in
/// [`crate::flow::FlowGraph`] owns the blocks themselves, so loops in the
/// graph never create ownership cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub(crate) fn new(index: usize) -> BlockId {
        BlockId(index as u32)
    }

    /// Index of this block in the owning arena.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// A maximal straight-line run of instructions.
///
/// A block contains no control-flow instructions except possibly a single
/// terminator in last position. Its outgoing edges are described by two
/// fields kept in sync with the terminator's graph-form operand:
///
/// * `targets` - explicit branch targets: one for an unconditional branch or
///   leave, one for a conditional branch, N for a switch, none otherwise.
/// * `fall_through` - the successor reached without branching: the lexical
///   next block after a plain run, a conditional branch or a switch. `None`
///   for unconditional branches, leaves, returns, throws and region exits.
///
/// `sources` is the derived set of blocks listing this block as a successor.
/// It is an index maintained by the graph, not independently owned data.
#[derive(Debug)]
pub struct Block {
    pub(crate) instructions: Vec<Instruction>,
    pub(crate) scope: ScopeId,
    pub(crate) fall_through: Option<BlockId>,
    pub(crate) targets: Vec<BlockId>,
    pub(crate) sources: Vec<BlockId>,
}

impl Block {
    pub(crate) fn new(scope: ScopeId) -> Block {
        Block {
            instructions: Vec::new(),
            scope,
            fall_through: None,
            targets: Vec::new(),
            sources: Vec::new(),
        }
    }

    /// The instructions of this block, in execution order.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Mutable access to this block's instructions.
    ///
    /// Used by scope passes to rewrite instruction bodies in place. Rewrites
    /// that introduce or remove control-flow instructions must be followed by
    /// a repartition before code generation.
    pub fn instructions_mut(&mut self) -> &mut Vec<Instruction> {
        &mut self.instructions
    }

    /// The scope this block belongs to.
    #[must_use]
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// The fall-through successor, if any.
    #[must_use]
    pub fn fall_through(&self) -> Option<BlockId> {
        self.fall_through
    }

    /// The explicit branch targets of this block's terminator.
    #[must_use]
    pub fn targets(&self) -> &[BlockId] {
        &self.targets
    }

    /// Blocks that list this block as a successor.
    #[must_use]
    pub fn sources(&self) -> &[BlockId] {
        &self.sources
    }

    /// The last instruction, if the block is not empty.
    #[must_use]
    pub fn last(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    /// Flow type of the terminator, or [`FlowType::Sequential`] if the block
    /// ends without a control-flow instruction.
    #[must_use]
    pub fn terminator_flow(&self) -> FlowType {
        match self.instructions.last() {
            Some(instr) if instr.ends_block() => instr.flow_type(),
            _ => FlowType::Sequential,
        }
    }

    /// Returns whether this block transfers control unconditionally through a
    /// plain branch (not a leave).
    #[must_use]
    pub fn ends_in_branch(&self) -> bool {
        self.terminator_flow() == FlowType::UnconditionalBranch
    }

    /// Returns whether this block consists of nothing but a single
    /// unconditional transfer (branch or leave). Such blocks are trampolines
    /// that chains of jumps route through.
    #[must_use]
    pub fn is_trampoline(&self) -> bool {
        self.instructions.len() == 1
            && matches!(
                self.terminator_flow(),
                FlowType::UnconditionalBranch | FlowType::Leave
            )
    }
}
