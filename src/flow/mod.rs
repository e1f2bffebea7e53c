//! Block graph and scope tree for one method body.
//!
//! Ownership is layered: the scope tree owns blocks and child scopes
//! (tree ownership, no cycles), while branch edges form a separate overlay of
//! arena indices ([`BlockId`]) so that loops in the control flow never create
//! ownership cycles. [`FlowGraph`] is the arena; it is built by the parser in
//! [`crate::MethodFlow::build`] and mutated in place by the transformation
//! passes.

mod block;
mod parser;
mod scope;

pub use block::{Block, BlockId};
pub use scope::{Region, Scope, ScopeId, ScopeItem, ScopeKind};

pub(crate) use parser::parse;

use crate::assembly::Operand;
use crate::Result;

/// The block graph and scope tree of a single method.
///
/// One instance is created per method and processed end-to-end by one logical
/// thread of control; nothing here is shared between methods.
#[derive(Debug)]
pub struct FlowGraph {
    blocks: Vec<Block>,
    live: Vec<bool>,
    scopes: Vec<Scope>,
    regions: Vec<Region>,
    entry: BlockId,
}

impl FlowGraph {
    pub(crate) fn new() -> FlowGraph {
        let root = Scope::new(ScopeKind::Body, None);
        FlowGraph {
            blocks: Vec::new(),
            live: Vec::new(),
            scopes: vec![root],
            regions: Vec::new(),
            entry: BlockId::new(0),
        }
    }

    /// The method's entry block.
    #[must_use]
    pub fn entry(&self) -> BlockId {
        self.entry
    }

    /// The root body scope.
    #[must_use]
    pub fn root(&self) -> ScopeId {
        ScopeId::new(0)
    }

    /// The exception regions, in original handler-table order.
    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Shared access to a block.
    #[must_use]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    /// Mutable access to a block.
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    /// Shared access to a scope.
    #[must_use]
    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.index()]
    }

    /// Whether the block is still part of the graph.
    #[must_use]
    pub fn is_live(&self, id: BlockId) -> bool {
        self.live[id.index()]
    }

    /// Number of live blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.live.iter().filter(|live| **live).count()
    }

    /// All successors of a block: branch targets first, then the
    /// fall-through. An edge that appears twice (a conditional branch whose
    /// target is also its fall-through) is reported twice.
    #[must_use]
    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        let block = self.block(id);
        let mut successors = block.targets.clone();
        if let Some(fall_through) = block.fall_through {
            successors.push(fall_through);
        }
        successors
    }

    /// Every scope in the tree, pre-order: root first, each scope before its
    /// descendants, siblings in declaration order.
    #[must_use]
    pub fn scopes_preorder(&self) -> Vec<ScopeId> {
        let mut order = Vec::with_capacity(self.scopes.len());
        self.collect_scopes(self.root(), &mut order);
        order
    }

    fn collect_scopes(&self, scope: ScopeId, order: &mut Vec<ScopeId>) {
        order.push(scope);
        for item in &self.scopes[scope.index()].items {
            if let ScopeItem::Scope(child) = item {
                self.collect_scopes(*child, order);
            }
        }
    }

    /// Every live block, in scope-tree declaration order. This is the stable
    /// total order the local slot optimizer and the code generator iterate in.
    #[must_use]
    pub fn blocks_ordered(&self) -> Vec<BlockId> {
        let mut order = Vec::with_capacity(self.blocks.len());
        self.collect_blocks(self.root(), &mut order);
        order
    }

    fn collect_blocks(&self, scope: ScopeId, order: &mut Vec<BlockId>) {
        for item in &self.scopes[scope.index()].items {
            match item {
                ScopeItem::Block(block) => order.push(*block),
                ScopeItem::Scope(child) => self.collect_blocks(*child, order),
            }
        }
    }

    /// Every live block in a scope's subtree, declaration order.
    #[must_use]
    pub fn subtree_blocks(&self, scope: ScopeId) -> Vec<BlockId> {
        let mut order = Vec::new();
        self.collect_blocks(scope, &mut order);
        order
    }

    /// The first block of a scope's subtree, i.e. the block control enters
    /// the region through. `None` if the subtree holds no blocks.
    #[must_use]
    pub fn scope_entry(&self, scope: ScopeId) -> Option<BlockId> {
        match self.scopes[scope.index()].items.first()? {
            ScopeItem::Block(block) => Some(*block),
            ScopeItem::Scope(child) => self.scope_entry(*child),
        }
    }

    /// Whether `ancestor` is `scope` itself or one of its ancestors.
    #[must_use]
    pub fn is_ancestor(&self, ancestor: ScopeId, scope: ScopeId) -> bool {
        let mut current = Some(scope);
        while let Some(scope) = current {
            if scope == ancestor {
                return true;
            }
            current = self.scopes[scope.index()].parent;
        }
        false
    }

    /// The deepest scope that is an ancestor of (or equal to) both arguments.
    #[must_use]
    pub fn common_ancestor(&self, a: ScopeId, b: ScopeId) -> ScopeId {
        let mut current = Some(a);
        while let Some(scope) = current {
            if self.is_ancestor(scope, b) {
                return scope;
            }
            current = self.scopes[scope.index()].parent;
        }
        self.root()
    }

    // ── Construction (parser only) ─────────────────────────────────────────

    pub(crate) fn new_scope(&mut self, kind: ScopeKind, parent: ScopeId) -> ScopeId {
        let id = ScopeId::new(self.scopes.len());
        self.scopes.push(Scope::new(kind, Some(parent)));
        id
    }

    pub(crate) fn new_block(&mut self, scope: ScopeId) -> BlockId {
        let id = BlockId::new(self.blocks.len());
        self.blocks.push(Block::new(scope));
        self.live.push(true);
        id
    }

    pub(crate) fn push_item(&mut self, scope: ScopeId, item: ScopeItem) {
        self.scopes[scope.index()].items.push(item);
    }

    pub(crate) fn push_region(&mut self, region: Region) {
        self.regions.push(region);
    }

    pub(crate) fn set_entry(&mut self, entry: BlockId) {
        self.entry = entry;
    }

    /// Recomputes every block's source list from the edge fields. The parser
    /// wires edges directly and calls this once; passes afterwards maintain
    /// sources incrementally.
    pub(crate) fn rebuild_sources(&mut self) {
        for block in &mut self.blocks {
            block.sources.clear();
        }
        for index in 0..self.blocks.len() {
            if !self.live[index] {
                continue;
            }
            let id = BlockId::new(index);
            for successor in self.successors(id) {
                self.blocks[successor.index()].sources.push(id);
            }
        }
    }

    // ── Edge surgery ───────────────────────────────────────────────────────

    fn remove_source(&mut self, from: BlockId, of: BlockId) {
        let sources = &mut self.blocks[of.index()].sources;
        if let Some(position) = sources.iter().position(|source| *source == from) {
            sources.remove(position);
        }
    }

    pub(crate) fn set_fall_through(&mut self, block: BlockId, new: Option<BlockId>) {
        let old = self.blocks[block.index()].fall_through;
        if old == new {
            return;
        }
        if let Some(old) = old {
            self.remove_source(block, old);
        }
        if let Some(new) = new {
            self.blocks[new.index()].sources.push(block);
        }
        self.blocks[block.index()].fall_through = new;
    }

    /// Redirects a single-target terminator (branch, conditional branch or
    /// leave) to a new block, updating the graph-form operand and both edge
    /// indices.
    pub(crate) fn set_branch_target(&mut self, block: BlockId, new: BlockId) -> Result<()> {
        let old = match self.blocks[block.index()].targets.first() {
            Some(target) => *target,
            None => {
                return Err(invariant_error!(
                    "{} has no branch target to redirect",
                    block
                ))
            }
        };
        if old == new {
            return Ok(());
        }
        match self.blocks[block.index()].instructions.last_mut() {
            Some(instr) => match &mut instr.operand {
                Operand::Block(target) => *target = new,
                operand => {
                    return Err(invariant_error!(
                        "{} terminator carries {:?}, expected a block operand",
                        block,
                        operand
                    ))
                }
            },
            None => return Err(invariant_error!("{} is empty, cannot retarget", block)),
        }
        self.blocks[block.index()].targets[0] = new;
        self.remove_source(block, old);
        self.blocks[new.index()].sources.push(block);
        Ok(())
    }

    /// Adds an explicit branch-target edge, maintaining the target's sources.
    pub(crate) fn add_target(&mut self, block: BlockId, target: BlockId) {
        self.blocks[block.index()].targets.push(target);
        self.blocks[target.index()].sources.push(block);
    }

    /// Moves all outgoing edges of `from` onto `to`, fixing the successors'
    /// source lists. `from` is left with no outgoing edges.
    pub(crate) fn transfer_edges(&mut self, from: BlockId, to: BlockId) {
        let targets = std::mem::take(&mut self.blocks[from.index()].targets);
        let fall_through = self.blocks[from.index()].fall_through.take();
        for successor in targets.iter().copied().chain(fall_through) {
            self.remove_source(from, successor);
            self.blocks[successor.index()].sources.push(to);
        }
        self.blocks[to.index()].targets = targets;
        self.blocks[to.index()].fall_through = fall_through;
    }

    /// Drops all outgoing edges of a block, fixing the successors' source
    /// lists. The terminator instruction itself is left in place.
    pub(crate) fn clear_edges(&mut self, block: BlockId) {
        for successor in self.successors(block) {
            self.remove_source(block, successor);
        }
        let block = &mut self.blocks[block.index()];
        block.targets.clear();
        block.fall_through = None;
    }

    /// Removes a block from the graph: drops its outgoing edges, discards its
    /// instructions and unlinks it from its scope. The caller guarantees no
    /// live block still targets it.
    pub(crate) fn remove_block(&mut self, id: BlockId) {
        self.clear_edges(id);
        let scope = self.blocks[id.index()].scope;
        self.scopes[scope.index()]
            .items
            .retain(|item| *item != ScopeItem::Block(id));
        self.blocks[id.index()].instructions.clear();
        self.live[id.index()] = false;
    }

    /// Coalesces `tail` into `head`: drops `head`'s terminating branch if it
    /// has one, concatenates `tail`'s instructions onto `head`, and lets
    /// `head` inherit `tail`'s outgoing edges. The caller has verified that
    /// `head` is `tail`'s only source.
    pub(crate) fn merge_into(&mut self, head: BlockId, tail: BlockId) {
        self.clear_edges(head);
        if self.blocks[head.index()].ends_in_branch() {
            self.blocks[head.index()].instructions.pop();
        }

        let mut moved = std::mem::take(&mut self.blocks[tail.index()].instructions);
        self.blocks[head.index()].instructions.append(&mut moved);
        self.transfer_edges(tail, head);

        let scope = self.blocks[tail.index()].scope;
        self.scopes[scope.index()]
            .items
            .retain(|item| *item != ScopeItem::Block(tail));
        self.live[tail.index()] = false;
    }

    /// Creates a new block in `scope`, inserted into the scope's item list
    /// directly after `after`. Used when splitting a block in two.
    pub(crate) fn split_off_after(&mut self, scope: ScopeId, after: BlockId) -> BlockId {
        let id = self.new_block(scope);
        let items = &mut self.scopes[scope.index()].items;
        match items.iter().position(|item| *item == ScopeItem::Block(after)) {
            Some(position) => items.insert(position + 1, ScopeItem::Block(id)),
            None => items.push(ScopeItem::Block(id)),
        }
        id
    }

    /// Drops regions whose protected scope no longer holds any block, along
    /// with their now-empty scopes. Called after dead-block removal.
    pub(crate) fn prune_dead_regions(&mut self) {
        let empty: Vec<usize> = self
            .regions
            .iter()
            .enumerate()
            .filter(|(_, region)| self.scope_entry(region.try_scope).is_none())
            .map(|(index, _)| index)
            .collect();
        for index in empty.into_iter().rev() {
            self.regions.remove(index);
        }
        self.detach_empty_scopes(self.root());
    }

    fn detach_empty_scopes(&mut self, scope: ScopeId) {
        let children: Vec<ScopeId> = self.scopes[scope.index()]
            .items
            .iter()
            .filter_map(|item| match item {
                ScopeItem::Scope(child) => Some(*child),
                ScopeItem::Block(_) => None,
            })
            .collect();
        for child in children {
            self.detach_empty_scopes(child);
            if self.scopes[child.index()].items.is_empty() {
                self.scopes[scope.index()]
                    .items
                    .retain(|item| *item != ScopeItem::Scope(child));
            }
        }
    }
}
