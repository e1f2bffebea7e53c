//! Transformation passes over the block graph.
//!
//! The pipeline applies passes in a fixed order: leave normalization, the
//! caller's scope passes, dead-block removal, then per-scope merging,
//! repartitioning and a final leave normalization. All passes mutate the
//! graph in place and preserve observable behavior.

mod dead;
mod leave;
mod locals;
mod merge;

pub(crate) use dead::remove_dead_blocks;
pub(crate) use leave::normalize_leaves;
pub(crate) use locals::optimize_locals;
pub(crate) use merge::{merge_blocks, repartition};

use crate::flow::{FlowGraph, ScopeId};
use crate::Result;

/// A scope-level transformation hook.
///
/// The pipeline guarantees pre-order traversal (root first, siblings in
/// declaration order) and that each scope is visited exactly once per run.
/// What a pass does inside a scope is its own business: it may rewrite
/// instruction bodies, retarget branches through the graph's API, or do
/// nothing. A pass that rewrites control-flow instructions relies on the
/// repartition step that follows to restore block-boundary invariants.
pub trait ScopePass {
    /// Name of the pass, for diagnostics.
    fn name(&self) -> &'static str;

    /// Applies the pass to one scope. Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// Returns an error when the pass detects state it cannot handle; the
    /// pipeline aborts for this method.
    fn apply(&mut self, graph: &mut FlowGraph, scope: ScopeId) -> Result<bool>;
}

/// Runs the full deobfuscation sequence over one method's graph. Returns the
/// number of dead blocks removed along the way.
pub(crate) fn run_pipeline(
    graph: &mut FlowGraph,
    passes: &mut [Box<dyn ScopePass>],
) -> Result<usize> {
    for scope in graph.scopes_preorder() {
        normalize_leaves(graph, scope)?;
    }
    for scope in graph.scopes_preorder() {
        for pass in passes.iter_mut() {
            pass.apply(graph, scope)?;
        }
    }
    let removed = remove_dead_blocks(graph)?;
    for scope in graph.scopes_preorder() {
        merge_blocks(graph, scope);
        repartition(graph, scope)?;
        normalize_leaves(graph, scope)?;
    }
    Ok(removed)
}
