//! Local variable slot compaction.
//!
//! Obfuscators pad methods with unused locals and scatter references over a
//! sparse index space. This pass renumbers the referenced slots onto
//! `[0, used)` in first-use order and re-encodes every reference with the
//! shortest legal opcode form for its new index. First-use order is total and
//! reproducible: blocks in scope-tree declaration order, instructions in
//! block order.

use std::collections::HashMap;

use crate::assembly::{Instruction, Local, LocalRef};
use crate::flow::FlowGraph;
use crate::Result;

/// Drops unreferenced locals and renumbers the rest densely, rewriting every
/// load, store and address-of to the shortest encoding of its new index.
/// Returns the number of locals removed; 0 means every declared local was
/// referenced and nothing was touched.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] when an instruction references a slot
/// past the end of the declared local list.
pub(crate) fn optimize_locals(graph: &mut FlowGraph, locals: &mut Vec<Local>) -> Result<usize> {
    if locals.is_empty() {
        return Ok(0);
    }

    let order = graph.blocks_ordered();
    let mut new_index: HashMap<u16, u16> = HashMap::new();
    let mut first_use: Vec<u16> = Vec::new();
    for id in &order {
        for instr in graph.block(*id).instructions() {
            if let Some((_, slot)) = instr.local_ref() {
                if usize::from(slot) >= locals.len() {
                    return Err(malformed_error!(
                        "local slot {} referenced but only {} locals declared",
                        slot,
                        locals.len()
                    ));
                }
                new_index.entry(slot).or_insert_with(|| {
                    first_use.push(slot);
                    (first_use.len() - 1) as u16
                });
            }
        }
    }

    if first_use.len() == locals.len() {
        return Ok(0);
    }

    for id in &order {
        for instr in graph.block_mut(*id).instructions_mut() {
            if let Some((kind, slot)) = instr.local_ref() {
                let index = new_index[&slot];
                *instr = match kind {
                    LocalRef::Load => Instruction::load_local(index),
                    LocalRef::Store => Instruction::store_local(index),
                    LocalRef::Address => Instruction::load_local_address(index),
                };
            }
        }
    }

    let removed = locals.len() - first_use.len();
    *locals = first_use
        .iter()
        .map(|slot| locals[usize::from(*slot)].clone())
        .collect();
    Ok(removed)
}
