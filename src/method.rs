//! Per-method pipeline entry point.

use crate::assembly::{ExceptionHandler, Instruction, Local};
use crate::codegen;
use crate::deobfuscation::{self, ScopePass};
use crate::flow::{self, FlowGraph};
use crate::Result;

/// One method's control flow, from parse to regeneration.
///
/// A `MethodFlow` owns the scope tree, every block and instruction, and the
/// method's local list for the duration of processing. It is created once per
/// method and dropped when the rewritten body has been produced; nothing is
/// shared between methods, so independent callers may process methods in
/// parallel with one `MethodFlow` each.
///
/// # Examples
///
/// ```rust
/// use blockscope::{assembly::Instruction, MethodFlow};
///
/// // br 0x07; nop; nop; ret - the nops are unreachable.
/// let instructions = vec![
///     Instruction::br(0x07),
///     Instruction::nop(),
///     Instruction::nop(),
///     Instruction::ret(),
/// ];
/// let mut flow = MethodFlow::build(instructions, &[], vec![])?;
/// flow.remove_dead_blocks()?;
/// let (rewritten, handlers) = flow.generate()?;
///
/// assert_eq!(rewritten.len(), 2); // br; ret
/// assert!(handlers.is_empty());
/// # Ok::<(), blockscope::Error>(())
/// ```
#[derive(Debug)]
pub struct MethodFlow {
    graph: FlowGraph,
    locals: Vec<Local>,
}

impl MethodFlow {
    /// Parses a flat instruction list and its exception-handler table into a
    /// block graph and scope tree.
    ///
    /// Instruction offsets are recomputed from encoded sizes; branch targets
    /// and region boundaries in the input refer to those offsets.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] when the input cannot describe a
    /// valid method: an empty body, a branch target or region boundary that
    /// does not align with an instruction, exception regions that overlap
    /// without nesting, or a branch into the interior of a protected region.
    /// On error no partial graph is left live.
    pub fn build(
        instructions: Vec<Instruction>,
        handlers: &[ExceptionHandler],
        locals: Vec<Local>,
    ) -> Result<MethodFlow> {
        let graph = flow::parse(instructions, handlers)?;
        Ok(MethodFlow { graph, locals })
    }

    /// The block graph and scope tree.
    #[must_use]
    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    /// Mutable access to the graph, for callers driving their own passes.
    pub fn graph_mut(&mut self) -> &mut FlowGraph {
        &mut self.graph
    }

    /// The method's current local list.
    #[must_use]
    pub fn locals(&self) -> &[Local] {
        &self.locals
    }

    /// Runs the full deobfuscation sequence: leave normalization, then the
    /// given scope passes over every scope in pre-order, dead-block removal,
    /// and finally per-scope merging, repartitioning and leave normalization
    /// to clean up what the passes left behind. Returns the number of dead
    /// blocks removed.
    ///
    /// # Errors
    ///
    /// Propagates failures from the scope passes, and
    /// [`crate::Error::Invariant`] when a pass corrupted the graph.
    pub fn deobfuscate(&mut self, passes: &mut [Box<dyn ScopePass>]) -> Result<usize> {
        deobfuscation::run_pipeline(&mut self.graph, passes)
    }

    /// Removes blocks unreachable from the method entry (handler entries of
    /// live regions count as reachable). Returns the number removed; running
    /// it again immediately returns 0.
    pub fn remove_dead_blocks(&mut self) -> Result<usize> {
        deobfuscation::remove_dead_blocks(&mut self.graph)
    }

    /// Normalizes obfuscated region exits in every scope. Returns the number
    /// of terminators rewritten.
    pub fn normalize_leaves(&mut self) -> Result<usize> {
        let mut rewritten = 0;
        for scope in self.graph.scopes_preorder() {
            rewritten += deobfuscation::normalize_leaves(&mut self.graph, scope)?;
        }
        Ok(rewritten)
    }

    /// Coalesces eligible block pairs in every scope. Returns the number of
    /// merges performed.
    pub fn merge_blocks(&mut self) -> usize {
        let mut merged = 0;
        for scope in self.graph.scopes_preorder() {
            merged += deobfuscation::merge_blocks(&mut self.graph, scope);
        }
        merged
    }

    /// Re-derives block boundaries in every scope after instruction rewrites.
    pub fn repartition(&mut self) -> Result<()> {
        for scope in self.graph.scopes_preorder() {
            deobfuscation::repartition(&mut self.graph, scope)?;
        }
        Ok(())
    }

    /// Compacts the local-variable list to the referenced slots, renumbered
    /// in first-use order with shortest-form encodings. Returns the number of
    /// locals removed.
    pub fn optimize_locals(&mut self) -> Result<usize> {
        deobfuscation::optimize_locals(&mut self.graph, &mut self.locals)
    }

    /// Flattens the graph back into a linear instruction stream and a
    /// regenerated exception-handler table. The graph is left untouched, so
    /// further passes may run and regenerate again.
    pub fn generate(&self) -> Result<(Vec<Instruction>, Vec<ExceptionHandler>)> {
        codegen::generate(&self.graph)
    }
}
