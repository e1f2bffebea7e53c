//! Flattens the block graph back into a linear instruction stream.
//!
//! Layout follows the scope tree: a pre-order walk of each scope's item list,
//! so every region's blocks stay contiguous and the regenerated handler table
//! can describe them as ranges. Branches are emitted in their short form
//! first and grow to the long form only when their displacement demands it;
//! growing is monotonic, so the sizing loop terminates. A block whose
//! fall-through successor is not the lexically next block gets an explicit
//! minimal branch appended.

use std::collections::HashMap;

use crate::assembly::{
    opcodes, ExceptionHandler, FlowType, Instruction, Operand,
};
use crate::flow::{BlockId, FlowGraph, ScopeId};
use crate::Result;

/// One slot of the emission stream. Branches keep their target symbolic
/// until the sizing fixpoint has settled every offset.
enum Emit {
    Fixed(Instruction),
    Branch {
        short_op: u8,
        long_op: u8,
        target: BlockId,
        long: bool,
    },
    Switch {
        targets: Vec<BlockId>,
    },
}

impl Emit {
    fn branch(short_op: u8, target: BlockId) -> Emit {
        Emit::Branch {
            short_op,
            long_op: if short_op == opcodes::LEAVE_S {
                opcodes::LEAVE
            } else {
                short_op + opcodes::BRANCH_LONG_DELTA
            },
            target,
            long: false,
        }
    }

    fn size(&self) -> u32 {
        match self {
            Emit::Fixed(instr) => instr.encoded_size(),
            Emit::Branch { long, .. } => {
                if *long {
                    5
                } else {
                    2
                }
            }
            Emit::Switch { targets } => 5 + 4 * targets.len() as u32,
        }
    }
}

/// Regenerates the linear instruction stream and the exception-handler table
/// from the graph. Every live block appears exactly once, in scope-and-
/// declaration order; every branch operand is rewritten to the final byte
/// offset of its target block.
pub(crate) fn generate(graph: &FlowGraph) -> Result<(Vec<Instruction>, Vec<ExceptionHandler>)> {
    let layout = graph.blocks_ordered();
    if layout.is_empty() {
        return Err(invariant_error!("graph has no blocks to lay out"));
    }

    let mut stream: Vec<Emit> = Vec::new();
    let mut block_first_emit: HashMap<BlockId, usize> = HashMap::with_capacity(layout.len());
    let mut block_emit_spans: Vec<(BlockId, usize)> = Vec::with_capacity(layout.len());

    for (position, id) in layout.iter().copied().enumerate() {
        let start = stream.len();
        block_first_emit.insert(id, start);
        let next = layout.get(position + 1).copied();
        emit_block(graph, id, next, &mut stream)?;
        block_emit_spans.push((id, start));
    }

    // Short-to-long promotion fixpoint. Offsets only ever grow, and each
    // branch flips to long at most once.
    let mut offsets = vec![0u32; stream.len() + 1];
    loop {
        let mut offset = 0;
        for (index, emit) in stream.iter().enumerate() {
            offsets[index] = offset;
            offset += emit.size();
        }
        offsets[stream.len()] = offset;

        let mut grew = false;
        for index in 0..stream.len() {
            let (target, long) = match &stream[index] {
                Emit::Branch { target, long, .. } => (*target, *long),
                _ => continue,
            };
            if long {
                continue;
            }
            let target_offset = i64::from(offsets[block_first_emit[&target]]);
            let displacement = target_offset - i64::from(offsets[index] + 2);
            if i8::try_from(displacement).is_err() {
                if let Emit::Branch { long, .. } = &mut stream[index] {
                    *long = true;
                }
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    let instructions = stream
        .iter()
        .map(|emit| match emit {
            Emit::Fixed(instr) => instr.clone(),
            Emit::Branch {
                short_op,
                long_op,
                target,
                long,
            } => {
                let opcode = if *long { *long_op } else { *short_op };
                let target = offsets[block_first_emit[target]];
                Instruction::new(opcode, Operand::Target(target))
            }
            Emit::Switch { targets } => {
                let resolved = targets
                    .iter()
                    .map(|target| offsets[block_first_emit[target]])
                    .collect();
                Instruction::new(opcodes::SWITCH, Operand::Switch(resolved))
            }
        })
        .collect();

    let handlers = rebuild_handlers(graph, &layout, &block_emit_spans, &stream, &offsets)?;
    Ok((instructions, handlers))
}

/// Emits one block: its plain instructions, then whatever its terminator and
/// fall-through demand. A fall-through whose successor is not the lexically
/// next block materializes as a minimal branch.
fn emit_block(
    graph: &FlowGraph,
    id: BlockId,
    next: Option<BlockId>,
    stream: &mut Vec<Emit>,
) -> Result<()> {
    let block = graph.block(id);
    let flow = block.terminator_flow();
    let body = match flow {
        FlowType::Sequential => block.instructions(),
        _ => &block.instructions()[..block.instructions().len() - 1],
    };
    for instr in body {
        if instr.ends_block() {
            return Err(invariant_error!(
                "{} carries an interior control-flow instruction, repartition missed it",
                id
            ));
        }
        stream.push(Emit::Fixed(instr.clone()));
    }

    let target = || -> Result<BlockId> {
        match block.last().map(|instr| &instr.operand) {
            Some(Operand::Block(target)) => Ok(*target),
            operand => Err(invariant_error!(
                "terminator of {} carries {:?}, expected a block operand",
                id,
                operand
            )),
        }
    };
    let fall_through = |stream: &mut Vec<Emit>| -> Result<()> {
        match block.fall_through() {
            Some(fall) if next == Some(fall) => Ok(()),
            Some(fall) => {
                stream.push(Emit::branch(opcodes::BR_S, fall));
                Ok(())
            }
            None => Err(invariant_error!("{} lost its fall-through edge", id)),
        }
    };

    match flow {
        FlowType::Sequential => fall_through(stream)?,
        FlowType::UnconditionalBranch => {
            // Kept even when the target is the next block; dropping jumps is
            // the merge pass's job, not the generator's.
            stream.push(Emit::branch(opcodes::BR_S, target()?));
        }
        FlowType::Leave => {
            // A leave triggers the finally chain, so it is never elided even
            // when its target is the next block.
            stream.push(Emit::branch(opcodes::LEAVE_S, target()?));
        }
        FlowType::ConditionalBranch => {
            let instr = block.last().ok_or_else(|| invariant_error!("{} is empty", id))?;
            let short_op = if (opcodes::BRFALSE..=opcodes::BLT_UN).contains(&instr.opcode) {
                instr.opcode - opcodes::BRANCH_LONG_DELTA
            } else {
                instr.opcode
            };
            stream.push(Emit::branch(short_op, target()?));
            fall_through(stream)?;
        }
        FlowType::Switch => {
            let targets = match block.last().map(|instr| &instr.operand) {
                Some(Operand::SwitchBlocks(targets)) => targets.clone(),
                operand => {
                    return Err(invariant_error!(
                        "switch in {} carries {:?}, expected block targets",
                        id,
                        operand
                    ))
                }
            };
            stream.push(Emit::Switch { targets });
            fall_through(stream)?;
        }
        FlowType::Return | FlowType::Throw | FlowType::EndFinally | FlowType::EndFilter => {
            if let Some(instr) = block.last() {
                stream.push(Emit::Fixed(instr.clone()));
            }
        }
        FlowType::Call => {
            return Err(invariant_error!("call classified as a terminator in {}", id))
        }
    }
    Ok(())
}

/// Rebuilds the exception-handler table from the scope extents of the final
/// layout, in the original clause order.
fn rebuild_handlers(
    graph: &FlowGraph,
    layout: &[BlockId],
    block_emit_spans: &[(BlockId, usize)],
    stream: &[Emit],
    offsets: &[u32],
) -> Result<Vec<ExceptionHandler>> {
    let mut block_bounds: HashMap<BlockId, (u32, u32)> = HashMap::with_capacity(layout.len());
    for (position, (id, first_emit)) in block_emit_spans.iter().enumerate() {
        let start = offsets[*first_emit];
        let end = match block_emit_spans.get(position + 1) {
            Some((_, next_emit)) => offsets[*next_emit],
            None => offsets[stream.len()],
        };
        block_bounds.insert(*id, (start, end));
    }

    let scope_bounds = |scope: ScopeId| -> Result<(u32, u32)> {
        let blocks = graph.subtree_blocks(scope);
        let first = blocks
            .first()
            .ok_or_else(|| invariant_error!("region scope {} has no blocks", scope))?;
        let last = blocks
            .last()
            .ok_or_else(|| invariant_error!("region scope {} has no blocks", scope))?;
        Ok((block_bounds[first].0, block_bounds[last].1))
    };

    let mut handlers = Vec::with_capacity(graph.regions().len());
    for region in graph.regions() {
        let (try_start, try_end) = scope_bounds(region.try_scope())?;
        let (handler_start, handler_end) = scope_bounds(region.handler_scope())?;
        let filter_offset = match region.filter_scope() {
            Some(filter) => scope_bounds(filter)?.0,
            None => 0,
        };
        handlers.push(ExceptionHandler {
            flags: region.flags(),
            try_offset: try_start,
            try_length: try_end - try_start,
            handler_offset: handler_start,
            handler_length: handler_end - handler_start,
            catch_type: region.catch_type(),
            filter_offset,
        });
    }
    Ok(handlers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{ExceptionHandlerFlags, Token};
    use crate::flow::parse;

    #[test]
    fn canonical_stream_survives_regeneration() {
        let graph = parse(vec![Instruction::nop(), Instruction::ret()], &[]).unwrap();
        let (instructions, handlers) = generate(&graph).unwrap();
        assert_eq!(instructions, vec![Instruction::nop(), Instruction::ret()]);
        assert!(handlers.is_empty());
    }

    #[test]
    fn branch_to_next_block_shrinks_but_survives() {
        let graph = parse(vec![Instruction::br(0x05), Instruction::ret()], &[]).unwrap();
        let (instructions, _) = generate(&graph).unwrap();
        assert_eq!(
            instructions,
            vec![
                Instruction::new(opcodes::BR_S, Operand::Target(2)),
                Instruction::ret(),
            ]
        );
    }

    #[test]
    fn near_branch_stays_short() {
        // 127 bytes of padding: the largest displacement a short branch
        // reaches.
        let mut instructions = vec![Instruction::br(5 + 127)];
        instructions.extend(std::iter::repeat_with(Instruction::nop).take(127));
        instructions.push(Instruction::ret());
        let graph = parse(instructions, &[]).unwrap();

        let (out, _) = generate(&graph).unwrap();
        assert_eq!(out[0].opcode, opcodes::BR_S);
        assert_eq!(out[0].operand, Operand::Target(2 + 127));
    }

    #[test]
    fn far_branch_grows_to_long_form() {
        let mut instructions = vec![Instruction::br(5 + 128)];
        instructions.extend(std::iter::repeat_with(Instruction::nop).take(128));
        instructions.push(Instruction::ret());
        let graph = parse(instructions, &[]).unwrap();

        let (out, _) = generate(&graph).unwrap();
        assert_eq!(out[0].opcode, opcodes::BR);
        // The branch itself occupies 5 bytes once promoted.
        assert_eq!(out[0].operand, Operand::Target(5 + 128));
    }

    #[test]
    fn leave_is_never_elided() {
        // A leave to the lexically next block still has to run the finally
        // chain, so no stage may ever drop it.
        let graph = parse(vec![Instruction::leave(0x05), Instruction::ret()], &[]).unwrap();
        let (instructions, _) = generate(&graph).unwrap();
        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions[0].opcode, opcodes::LEAVE_S);
        assert_eq!(instructions[0].operand, Operand::Target(2));
    }

    #[test]
    fn handler_table_tracks_new_offsets() {
        //   0x00: br 0x0B        try   0x00..0x05
        //   0x05: pop            catch 0x05..0x0B
        //   0x06: leave 0x0B
        //   0x0B: ret
        let instructions = vec![
            Instruction::br(0x0B),
            Instruction::new(opcodes::POP, Operand::None),
            Instruction::leave(0x0B),
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
        let graph = parse(instructions, &handlers).unwrap();

        let (out, new_handlers) = generate(&graph).unwrap();
        // Everything shrinks to short forms: br.s; pop; leave.s; ret.
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].opcode, opcodes::BR_S);
        assert_eq!(out[0].operand, Operand::Target(5));
        assert_eq!(out[2].opcode, opcodes::LEAVE_S);

        assert_eq!(new_handlers.len(), 1);
        let clause = &new_handlers[0];
        assert_eq!(clause.try_offset, 0);
        assert_eq!(clause.try_length, 2);
        assert_eq!(clause.handler_offset, 2);
        assert_eq!(clause.handler_length, 3);
        assert_eq!(clause.catch_type, Some(Token::new(0x0100_0010)));
    }

    #[test]
    fn non_adjacent_fall_through_materializes_a_branch() {
        //   0x00: brtrue 0x07   (A, falls through to B)
        //   0x05: nop           (B)
        //   0x06: ret
        //   0x07: ret           (C)
        let instructions = vec![
            Instruction::new(opcodes::BRTRUE, Operand::Target(0x07)),
            Instruction::nop(),
            Instruction::ret(),
            Instruction::ret(),
        ];
        let mut graph = parse(instructions, &[]).unwrap();
        let blocks = graph.blocks_ordered();
        let (a, b, c) = (blocks[0], blocks[1], blocks[2]);

        // Swap A's edges so its fall-through is no longer the lexically next
        // block; the generator has to make the implicit edge explicit.
        graph.set_branch_target(a, b).unwrap();
        graph.set_fall_through(a, Some(c));

        let (out, _) = generate(&graph).unwrap();
        assert_eq!(
            out,
            vec![
                Instruction::new(opcodes::BRTRUE_S, Operand::Target(4)),
                Instruction::new(opcodes::BR_S, Operand::Target(6)),
                Instruction::nop(),
                Instruction::ret(),
                Instruction::ret(),
            ]
        );
    }

    #[test]
    fn switch_targets_are_reresolved() {
        //   0x00: ldc.i4.0
        //   0x01: switch [0x0E, 0x0F]   (13 bytes, falls through to 0x0E)
        //   0x0E: nop
        //   0x0F: ret
        let instructions = vec![
            Instruction::new(opcodes::LDC_I4_0, Operand::None),
            Instruction::new(opcodes::SWITCH, Operand::Switch(vec![0x0E, 0x0F])),
            Instruction::nop(),
            Instruction::ret(),
        ];
        let graph = parse(instructions.clone(), &[]).unwrap();
        let (out, _) = generate(&graph).unwrap();
        assert_eq!(out, instructions);
    }
}
