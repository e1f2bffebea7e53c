//! Dead-block removal.
//!
//! Reachability starts at the method entry and follows outgoing edges.
//! Handler and filter entry blocks are reachable through exceptional control
//! transfer, so they count as roots whenever their protected region still has
//! a reachable block; a region whose try went entirely dead dies with it.
//! The walk runs to a fixpoint because waking a handler can make further try
//! regions reachable.

use std::collections::HashSet;

use crate::flow::{BlockId, FlowGraph};
use crate::Result;

/// Removes every block unreachable from its scope's entry semantics and
/// returns the number of blocks removed. Idempotent: a second run removes
/// nothing.
pub(crate) fn remove_dead_blocks(graph: &mut FlowGraph) -> Result<usize> {
    let mut reached: HashSet<BlockId> = HashSet::new();
    walk(graph, graph.entry(), &mut reached);

    // Handler entries wake up once their try region is live; a woken handler
    // can in turn make nested regions live, so iterate until stable.
    loop {
        let mut roots: Vec<BlockId> = Vec::new();
        for region in graph.regions() {
            let try_live = graph
                .subtree_blocks(region.try_scope())
                .iter()
                .any(|block| reached.contains(block));
            if !try_live {
                continue;
            }
            for scope in std::iter::once(region.handler_scope()).chain(region.filter_scope()) {
                if let Some(entry) = graph.scope_entry(scope) {
                    if !reached.contains(&entry) {
                        roots.push(entry);
                    }
                }
            }
        }
        if roots.is_empty() {
            break;
        }
        for root in roots {
            walk(graph, root, &mut reached);
        }
    }

    let dead: Vec<BlockId> = graph
        .blocks_ordered()
        .into_iter()
        .filter(|block| !reached.contains(block))
        .collect();

    for block in &dead {
        for source in graph.block(*block).sources() {
            if reached.contains(source) {
                return Err(invariant_error!(
                    "dead block {} still has a live incoming edge from {}",
                    block,
                    source
                ));
            }
        }
    }

    for block in &dead {
        graph.remove_block(*block);
    }
    graph.prune_dead_regions();
    Ok(dead.len())
}

fn walk(graph: &FlowGraph, from: BlockId, reached: &mut HashSet<BlockId>) {
    let mut worklist = vec![from];
    while let Some(block) = worklist.pop() {
        if !reached.insert(block) {
            continue;
        }
        for successor in graph.successors(block) {
            if !reached.contains(&successor) {
                worklist.push(successor);
            }
        }
    }
}
