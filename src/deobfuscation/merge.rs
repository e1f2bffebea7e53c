//! Block merging and repartitioning.
//!
//! Merging coalesces a block with its sole successor when nothing else can
//! reach that successor, dropping the jump between them. Repartitioning is
//! the opposite direction: after passes have rewritten instruction bodies, a
//! block may carry control-flow instructions in its interior; each such block
//! is split back into maximal straight-line runs, staying in its scope.

use crate::assembly::{FlowType, Operand};
use crate::flow::{BlockId, FlowGraph, ScopeId};
use crate::Result;

/// Coalesces eligible block pairs among `scope`'s direct blocks. Returns the
/// number of merges performed.
///
/// A pair is eligible when the first block either falls through or ends in a
/// plain unconditional branch (never a leave, which carries region-exit
/// semantics), the successor lives in the same scope, the successor's only
/// incoming edge is this one, and the successor is neither the method entry
/// nor its scope's entry block.
pub(crate) fn merge_blocks(graph: &mut FlowGraph, scope: ScopeId) -> usize {
    let mut merged = 0;
    loop {
        let mut changed = false;
        let heads: Vec<BlockId> = graph.scope(scope).blocks().collect();
        for head in heads {
            if !graph.is_live(head) {
                continue;
            }
            let tail = {
                let block = graph.block(head);
                match block.terminator_flow() {
                    FlowType::Sequential => block.fall_through(),
                    FlowType::UnconditionalBranch => block.targets().first().copied(),
                    _ => None,
                }
            };
            let Some(tail) = tail else { continue };
            if tail == head || tail == graph.entry() {
                continue;
            }
            if graph.block(tail).scope() != scope {
                continue;
            }
            if graph.scope_entry(scope) == Some(tail) {
                continue;
            }
            let sources = graph.block(tail).sources();
            if sources.len() != 1 || sources[0] != head {
                continue;
            }
            graph.merge_into(head, tail);
            merged += 1;
            changed = true;
        }
        if !changed {
            break;
        }
    }
    merged
}

/// Splits every direct block of `scope` whose interior contains control-flow
/// instructions, restoring the invariant that a block has at most one
/// terminator, in last position. New blocks stay in the same scope, inserted
/// right after the block they were split from.
pub(crate) fn repartition(graph: &mut FlowGraph, scope: ScopeId) -> Result<()> {
    let blocks: Vec<BlockId> = graph.scope(scope).blocks().collect();
    for id in blocks {
        let mut current = id;
        loop {
            let split_at = {
                let instructions = graph.block(current).instructions();
                match instructions.iter().position(|instr| instr.ends_block()) {
                    Some(position) if position + 1 < instructions.len() => position,
                    _ => break,
                }
            };
            let rest = graph
                .block_mut(current)
                .instructions_mut()
                .split_off(split_at + 1);
            let successor = graph.split_off_after(scope, current);
            *graph.block_mut(successor).instructions_mut() = rest;
            graph.transfer_edges(current, successor);
            rewire_terminator(graph, current, successor)?;
            current = successor;
        }
    }
    Ok(())
}

/// Re-derives a block's outgoing edges from its terminator after a split.
/// `next` is the newly created successor holding the split-off tail.
fn rewire_terminator(graph: &mut FlowGraph, block: BlockId, next: BlockId) -> Result<()> {
    let flow = graph.block(block).terminator_flow();
    match flow {
        FlowType::Sequential => {
            graph.set_fall_through(block, Some(next));
        }
        FlowType::UnconditionalBranch | FlowType::Leave => {
            let target = interior_target(graph, block)?;
            graph.add_target(block, target);
        }
        FlowType::ConditionalBranch => {
            let target = interior_target(graph, block)?;
            graph.add_target(block, target);
            graph.set_fall_through(block, Some(next));
        }
        FlowType::Switch => {
            let targets = match graph.block(block).last().map(|instr| &instr.operand) {
                Some(Operand::SwitchBlocks(targets)) => targets.clone(),
                operand => {
                    return Err(invariant_error!(
                        "switch in {} carries {:?}, expected block targets",
                        block,
                        operand
                    ))
                }
            };
            for target in targets {
                graph.add_target(block, target);
            }
            graph.set_fall_through(block, Some(next));
        }
        FlowType::Return | FlowType::Throw | FlowType::EndFinally | FlowType::EndFilter => {}
        FlowType::Call => {
            return Err(invariant_error!("call classified as a terminator in {}", block))
        }
    }
    Ok(())
}

fn interior_target(graph: &FlowGraph, block: BlockId) -> Result<BlockId> {
    match graph.block(block).last().map(|instr| &instr.operand) {
        Some(Operand::Block(target)) => Ok(*target),
        operand => Err(invariant_error!(
            "terminator in {} carries {:?}, expected a block operand",
            block,
            operand
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{
        opcodes, ExceptionHandler, ExceptionHandlerFlags, Instruction, Operand, Token,
    };
    use crate::deobfuscation::remove_dead_blocks;
    use crate::flow::parse;

    #[test]
    fn merge_concatenates_and_inherits_successors() {
        // The br targets the run right behind it, which nothing else
        // reaches, so the two blocks collapse into one and the br is gone.
        let instructions = vec![
            Instruction::nop(),
            Instruction::br(0x06),
            Instruction::nop(),
            Instruction::ret(),
        ];
        let mut graph = parse(instructions, &[]).unwrap();
        remove_dead_blocks(&mut graph).unwrap();
        let before: usize = graph
            .blocks_ordered()
            .iter()
            .map(|block| graph.block(*block).instructions().len())
            .sum();

        let root = graph.root();
        let merged = merge_blocks(&mut graph, root);
        assert_eq!(merged, 1);
        assert_eq!(graph.block_count(), 1);

        // The br disappeared; everything else survived.
        let after: usize = graph
            .blocks_ordered()
            .iter()
            .map(|block| graph.block(*block).instructions().len())
            .sum();
        assert_eq!(after, before - 1);

        let entry = graph.entry();
        assert!(graph.block(entry).targets().is_empty());
        assert!(graph.block(entry).fall_through().is_none());
    }

    #[test]
    fn merge_skips_join_points() {
        // Two predecessors reach the ret block at 0x0A, so it must not be
        // merged into either.
        let instructions = vec![
            Instruction::new(crate::assembly::opcodes::BRTRUE, Operand::Target(0x0A)),
            Instruction::br(0x0A),
            Instruction::ret(),
        ];
        let mut graph = parse(instructions, &[]).unwrap();
        let root = graph.root();
        assert_eq!(merge_blocks(&mut graph, root), 0);
        assert_eq!(graph.block_count(), 3);
    }

    #[test]
    fn merge_stops_at_scope_boundaries() {
        // The try's br is the sole way into the ret at 0x0B, but that ret
        // lives in the method body, not the try, so the pair stays apart.
        //
        //   0x00: br 0x0B        try   0x00..0x05
        //   0x05: pop            catch 0x05..0x0B
        //   0x06: leave 0x0C
        //   0x0B: ret
        //   0x0C: ret
        let instructions = vec![
            Instruction::br(0x0B),
            Instruction::new(opcodes::POP, Operand::None),
            Instruction::leave(0x0C),
            Instruction::ret(),
            Instruction::ret(),
        ];
        let handlers = [ExceptionHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_offset: 0x00,
            try_length: 0x05,
            handler_offset: 0x05,
            handler_length: 0x06,
            catch_type: Some(Token::new(0x0100_0010)),
            filter_offset: 0,
        }];
        let mut graph = parse(instructions, &handlers).unwrap();
        let entry = graph.entry();

        let try_scope = graph.block(entry).scope();
        assert_eq!(merge_blocks(&mut graph, try_scope), 0);
        assert_eq!(graph.block_count(), 4);
    }

    #[test]
    fn repartition_splits_interior_terminators() {
        let instructions = vec![Instruction::nop(), Instruction::ret()];
        let mut graph = parse(instructions, &[]).unwrap();
        let entry = graph.entry();

        // Simulate a pass stitching a second ret-terminated run onto the
        // entry block.
        graph
            .block_mut(entry)
            .instructions_mut()
            .extend([Instruction::nop(), Instruction::ret()]);

        let root = graph.root();
        repartition(&mut graph, root).unwrap();
        assert_eq!(graph.block_count(), 2);
        for block in graph.blocks_ordered() {
            let instructions = graph.block(block).instructions();
            assert_eq!(instructions.len(), 2);
            assert!(instructions[1].ends_block());
            assert!(!instructions[0].ends_block());
        }
    }
}
