//! Builds the scope tree and block graph from a flat instruction list and its
//! exception-handler table.
//!
//! Block boundaries are the method entry, every branch/switch target, the
//! instruction following any block terminator, and every region boundary.
//! Regions nest into the scope tree; ranges that overlap without nesting are
//! malformed input. Parsing either produces a complete graph or fails with no
//! partial graph left live.

use std::collections::{HashMap, HashSet};

use crate::assembly::{
    opcodes, ExceptionHandler, ExceptionHandlerFlags, FlowType, Instruction, Operand,
};
use crate::flow::{BlockId, FlowGraph, Region, ScopeId, ScopeItem, ScopeKind};
use crate::Result;

/// One half-open byte range that becomes a scope: a try, filter or handler
/// part of a region. Identical try ranges of sibling clauses share a scope.
#[derive(Debug)]
struct Extent {
    start: u32,
    end: u32,
    kind: ScopeKind,
    /// (region index, part) pairs this extent realizes.
    regions: Vec<(usize, Part)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Try,
    Filter,
    Handler,
}

pub(crate) fn parse(
    instructions: Vec<Instruction>,
    handlers: &[ExceptionHandler],
) -> Result<FlowGraph> {
    if instructions.is_empty() {
        return Err(malformed_error!("method body has no instructions"));
    }

    // Byte offset of every instruction, recomputed from encoded sizes.
    let mut offsets = Vec::with_capacity(instructions.len());
    let mut offset_index = HashMap::with_capacity(instructions.len());
    let mut offset = 0u32;
    for (index, instr) in instructions.iter().enumerate() {
        validate_operand(instr, offset)?;
        offsets.push(offset);
        offset_index.insert(offset, index);
        offset += instr.encoded_size();
    }
    let end = offset;

    let mut leaders: HashSet<u32> = HashSet::new();
    leaders.insert(0);

    for (index, instr) in instructions.iter().enumerate() {
        if instr.ends_block() {
            let next = offsets[index] + instr.encoded_size();
            if next < end {
                leaders.insert(next);
            }
        }
        for target in branch_targets(instr) {
            if !offset_index.contains_key(&target) {
                return Err(malformed_error!(
                    "branch target 0x{:X} does not align with an instruction boundary",
                    target
                ));
            }
            leaders.insert(target);
        }
    }

    let extents = collect_extents(handlers, &offset_index, end)?;
    for extent in &extents {
        leaders.insert(extent.start);
        if extent.end < end {
            leaders.insert(extent.end);
        }
    }

    let mut leaders: Vec<u32> = leaders.into_iter().collect();
    leaders.sort_unstable();

    let mut graph = FlowGraph::new();
    let blocks = build_tree(&mut graph, &instructions, &offsets, &leaders, extents, handlers, end)?;

    wire_edges(&mut graph, &blocks)?;
    graph.rebuild_sources();
    validate_branch_scopes(&graph)?;

    let entry = blocks
        .first()
        .copied()
        .ok_or_else(|| invariant_error!("partitioning produced no blocks"))?;
    graph.set_entry(entry);
    Ok(graph)
}

/// Rejects instructions whose operand does not match what the opcode family
/// requires. Graph-form operands are an internal representation and are not
/// accepted at the input boundary.
fn validate_operand(instr: &Instruction, offset: u32) -> Result<()> {
    if matches!(
        instr.operand,
        Operand::Block(_) | Operand::SwitchBlocks(_)
    ) {
        return Err(malformed_error!(
            "instruction at 0x{:X} carries a graph-form operand",
            offset
        ));
    }
    match instr.flow_type() {
        FlowType::UnconditionalBranch | FlowType::ConditionalBranch | FlowType::Leave => {
            if !matches!(instr.operand, Operand::Target(_)) {
                return Err(malformed_error!(
                    "{} at 0x{:X} carries no branch target",
                    instr.mnemonic(),
                    offset
                ));
            }
        }
        FlowType::Switch => {
            if !matches!(instr.operand, Operand::Switch(_)) {
                return Err(malformed_error!(
                    "switch at 0x{:X} carries no target table",
                    offset
                ));
            }
        }
        _ => {}
    }
    let needs_local_operand = if instr.prefix == opcodes::FE_PREFIX {
        matches!(
            instr.opcode,
            opcodes::FE_LDLOC | opcodes::FE_STLOC | opcodes::FE_LDLOCA
        )
    } else {
        matches!(
            instr.opcode,
            opcodes::LDLOC_S | opcodes::STLOC_S | opcodes::LDLOCA_S
        )
    };
    if needs_local_operand && !matches!(instr.operand, Operand::Local(_)) {
        return Err(malformed_error!(
            "{} at 0x{:X} carries no local-slot operand",
            instr.mnemonic(),
            offset
        ));
    }
    Ok(())
}

fn branch_targets(instr: &Instruction) -> Vec<u32> {
    match (&instr.operand, instr.flow_type()) {
        (Operand::Target(target), FlowType::UnconditionalBranch)
        | (Operand::Target(target), FlowType::ConditionalBranch)
        | (Operand::Target(target), FlowType::Leave) => vec![*target],
        (Operand::Switch(targets), FlowType::Switch) => targets.clone(),
        _ => Vec::new(),
    }
}

fn handler_scope_kind(flags: ExceptionHandlerFlags) -> Result<ScopeKind> {
    if flags.contains(ExceptionHandlerFlags::FINALLY) {
        Ok(ScopeKind::Finally)
    } else if flags.contains(ExceptionHandlerFlags::FAULT) {
        Ok(ScopeKind::Fault)
    } else if flags.is_empty() || flags == ExceptionHandlerFlags::FILTER {
        // Typed clauses and the handler part of a filter clause both execute
        // as catch handlers.
        Ok(ScopeKind::Catch)
    } else {
        Err(malformed_error!(
            "unrecognized exception clause flags 0x{:X}",
            flags.bits()
        ))
    }
}

/// Turns the handler table into scope extents, validating alignment and
/// well-nesting. Sibling catch clauses protecting the same range share one
/// try extent. When ranges coincide exactly, a handler or filter extent
/// encloses a try extent (a try can exactly fill the handler it sits in);
/// two coinciding non-try extents are malformed.
fn collect_extents(
    handlers: &[ExceptionHandler],
    offset_index: &HashMap<u32, usize>,
    end: u32,
) -> Result<Vec<Extent>> {
    let aligned = |offset: u32| offset == end || offset_index.contains_key(&offset);

    let mut extents: Vec<Extent> = Vec::new();
    let mut push = |start: u32, stop: u32, kind: ScopeKind, region: usize, part: Part| -> Result<()> {
        if start >= stop || !aligned(start) || !aligned(stop) || stop > end {
            return Err(malformed_error!(
                "exception region 0x{:X}..0x{:X} does not align with instruction boundaries",
                start,
                stop
            ));
        }
        if kind == ScopeKind::Try {
            // Sibling clauses protecting the same range share one try scope.
            if let Some(existing) = extents.iter_mut().find(|extent| {
                extent.start == start && extent.end == stop && extent.kind == ScopeKind::Try
            }) {
                existing.regions.push((region, part));
                return Ok(());
            }
        } else if extents.iter().any(|extent| {
            extent.start == start && extent.end == stop && extent.kind != ScopeKind::Try
        }) {
            // A try may exactly fill a handler or filter it nests inside (the
            // sort puts the enclosing extent first); two coinciding non-try
            // extents have no such reading.
            return Err(malformed_error!(
                "exception regions 0x{:X}..0x{:X} coincide but neither is a try range",
                start,
                stop
            ));
        }
        extents.push(Extent {
            start,
            end: stop,
            kind,
            regions: vec![(region, part)],
        });
        Ok(())
    };

    for (index, handler) in handlers.iter().enumerate() {
        let handler_kind = handler_scope_kind(handler.flags)?;
        push(handler.try_offset, handler.try_end(), ScopeKind::Try, index, Part::Try)?;
        push(
            handler.handler_offset,
            handler.handler_end(),
            handler_kind,
            index,
            Part::Handler,
        )?;
        if handler.is_filter() {
            push(
                handler.filter_offset,
                handler.handler_offset,
                ScopeKind::Filter,
                index,
                Part::Filter,
            )?;
        }
    }

    // Outer-before-inner order: by start, widest first. A try range equal to
    // a handler range nests inside it, so try sorts after non-try.
    extents.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then(b.end.cmp(&a.end))
            .then((a.kind == ScopeKind::Try).cmp(&(b.kind == ScopeKind::Try)))
    });

    let mut stack: Vec<u32> = Vec::new();
    for extent in &extents {
        while matches!(stack.last(), Some(top) if *top <= extent.start) {
            stack.pop();
        }
        if let Some(top) = stack.last() {
            if extent.end > *top {
                return Err(malformed_error!(
                    "exception region 0x{:X}..0x{:X} overlaps another region without nesting",
                    extent.start,
                    extent.end
                ));
            }
        }
        stack.push(extent.end);
    }

    Ok(extents)
}

/// Sweeps the leader offsets once, opening scopes where extents start and
/// creating one block per leader run, each assigned to the innermost open
/// scope. Returns the blocks in layout order.
fn build_tree(
    graph: &mut FlowGraph,
    instructions: &[Instruction],
    offsets: &[u32],
    leaders: &[u32],
    extents: Vec<Extent>,
    handlers: &[ExceptionHandler],
    end: u32,
) -> Result<Vec<BlockId>> {
    struct RegionScopes {
        try_scope: Option<ScopeId>,
        filter_scope: Option<ScopeId>,
        handler_scope: Option<ScopeId>,
    }
    let mut region_scopes: Vec<RegionScopes> = handlers
        .iter()
        .map(|_| RegionScopes {
            try_scope: None,
            filter_scope: None,
            handler_scope: None,
        })
        .collect();

    let mut open: Vec<(u32, ScopeId)> = Vec::new();
    let mut next_extent = 0;
    let mut blocks = Vec::with_capacity(leaders.len());
    let mut instr_cursor = 0usize;

    for (position, leader) in leaders.iter().copied().enumerate() {
        while matches!(open.last(), Some((stop, _)) if *stop <= leader) {
            open.pop();
        }
        while next_extent < extents.len() && extents[next_extent].start == leader {
            let extent = &extents[next_extent];
            let parent = open.last().map_or(graph.root(), |(_, scope)| *scope);
            let scope = graph.new_scope(extent.kind, parent);
            graph.push_item(parent, ScopeItem::Scope(scope));
            for (region, part) in &extent.regions {
                let slots = &mut region_scopes[*region];
                match part {
                    Part::Try => slots.try_scope = Some(scope),
                    Part::Filter => slots.filter_scope = Some(scope),
                    Part::Handler => slots.handler_scope = Some(scope),
                }
            }
            open.push((extent.end, scope));
            next_extent += 1;
        }

        let scope = open.last().map_or(graph.root(), |(_, scope)| *scope);
        let block = graph.new_block(scope);
        graph.push_item(scope, ScopeItem::Block(block));

        let stop = leaders.get(position + 1).copied().unwrap_or(end);
        let mut run = Vec::new();
        while instr_cursor < instructions.len() && offsets[instr_cursor] < stop {
            run.push(instructions[instr_cursor].clone());
            instr_cursor += 1;
        }
        graph.block_mut(block).instructions = run;
        blocks.push(block);
    }

    if instr_cursor != instructions.len() {
        return Err(invariant_error!(
            "block partition covered {} of {} instructions",
            instr_cursor,
            instructions.len()
        ));
    }

    for (index, slots) in region_scopes.into_iter().enumerate() {
        let handler = &handlers[index];
        let (try_scope, handler_scope) = match (slots.try_scope, slots.handler_scope) {
            (Some(try_scope), Some(handler_scope)) => (try_scope, handler_scope),
            _ => {
                return Err(invariant_error!(
                    "exception region {} was not assigned its scopes",
                    index
                ))
            }
        };
        graph.push_region(Region {
            flags: handler.flags,
            try_scope,
            filter_scope: slots.filter_scope,
            handler_scope,
            catch_type: handler.catch_type,
        });
    }

    Ok(blocks)
}

/// Resolves every terminator's byte-offset operand to a block and installs
/// the outgoing edges. Operands switch to graph form here.
fn wire_edges(graph: &mut FlowGraph, blocks: &[BlockId]) -> Result<()> {
    let mut block_at: HashMap<u32, BlockId> = HashMap::with_capacity(blocks.len());
    let mut offset = 0u32;
    for block in blocks {
        block_at.insert(offset, *block);
        offset += graph
            .block(*block)
            .instructions()
            .iter()
            .map(Instruction::encoded_size)
            .sum::<u32>();
    }

    for (position, id) in blocks.iter().copied().enumerate() {
        let next = blocks.get(position + 1).copied();
        let flow = graph.block(id).terminator_flow();

        let resolve = |target: u32| -> Result<BlockId> {
            block_at.get(&target).copied().ok_or_else(|| {
                malformed_error!("branch target 0x{:X} does not align with a block boundary", target)
            })
        };
        let fall = |next: Option<BlockId>| -> Result<BlockId> {
            next.ok_or_else(|| malformed_error!("control falls off the end of the method"))
        };

        match flow {
            FlowType::Sequential | FlowType::Call => {
                let next = fall(next)?;
                graph.block_mut(id).fall_through = Some(next);
            }
            FlowType::UnconditionalBranch | FlowType::Leave => {
                let target = terminator_target(graph, id)?;
                let target = resolve(target)?;
                let block = graph.block_mut(id);
                if let Some(instr) = block.instructions.last_mut() {
                    instr.operand = Operand::Block(target);
                }
                block.targets.push(target);
            }
            FlowType::ConditionalBranch => {
                let target = terminator_target(graph, id)?;
                let target = resolve(target)?;
                let next = fall(next)?;
                let block = graph.block_mut(id);
                if let Some(instr) = block.instructions.last_mut() {
                    instr.operand = Operand::Block(target);
                }
                block.targets.push(target);
                block.fall_through = Some(next);
            }
            FlowType::Switch => {
                let raw = match graph.block(id).last().map(|instr| &instr.operand) {
                    Some(Operand::Switch(targets)) => targets.clone(),
                    _ => return Err(invariant_error!("{} switch lost its target table", id)),
                };
                let mut resolved = Vec::with_capacity(raw.len());
                for target in raw {
                    resolved.push(resolve(target)?);
                }
                let next = fall(next)?;
                let block = graph.block_mut(id);
                block.targets = resolved.clone();
                block.fall_through = Some(next);
                if let Some(instr) = block.instructions.last_mut() {
                    instr.operand = Operand::SwitchBlocks(resolved);
                }
            }
            FlowType::Return | FlowType::Throw | FlowType::EndFinally | FlowType::EndFilter => {}
        }
    }
    Ok(())
}

fn terminator_target(graph: &FlowGraph, id: BlockId) -> Result<u32> {
    match graph.block(id).last().map(|instr| &instr.operand) {
        Some(Operand::Target(target)) => Ok(*target),
        _ => Err(invariant_error!("{} terminator lost its target operand", id)),
    }
}

/// A branch may target its own scope or an ancestor scope freely. Entering a
/// descendant scope is only legal when every scope crossed on the way down is
/// a try entered exactly at its entry block; branching into a handler, a
/// filter, or the interior of a try is malformed.
fn validate_branch_scopes(graph: &FlowGraph) -> Result<()> {
    for id in graph.blocks_ordered() {
        let from = graph.block(id).scope();
        for target in graph.block(id).targets() {
            let to = graph.block(*target).scope();
            let ancestor = graph.common_ancestor(from, to);
            let mut scope = to;
            while scope != ancestor {
                if graph.scope(scope).kind() != ScopeKind::Try
                    || graph.scope_entry(scope) != Some(*target)
                {
                    return Err(malformed_error!(
                        "{} branches into the interior of protected region {}",
                        id,
                        scope
                    ));
                }
                scope = match graph.scope(scope).parent() {
                    Some(parent) => parent,
                    None => break,
                };
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{Instruction, Token};
    use crate::Error;

    fn catch_clause(try_offset: u32, try_length: u32, handler_offset: u32, handler_length: u32) -> ExceptionHandler {
        ExceptionHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_offset,
            try_length,
            handler_offset,
            handler_length,
            catch_type: Some(Token::new(0x0100_0001)),
            filter_offset: 0,
        }
    }

    #[test]
    fn partitions_at_targets_and_terminators() {
        // br 0x07; nop; nop; ret -> {br}, {nop, nop}, {ret}
        let instructions = vec![
            Instruction::br(0x07),
            Instruction::nop(),
            Instruction::nop(),
            Instruction::ret(),
        ];
        let graph = parse(instructions, &[]).unwrap();
        let blocks = graph.blocks_ordered();
        assert_eq!(blocks.len(), 3);
        assert_eq!(graph.block(blocks[0]).instructions().len(), 1);
        assert_eq!(graph.block(blocks[1]).instructions().len(), 2);
        assert_eq!(graph.block(blocks[2]).instructions().len(), 1);

        // The branch skips the nops; the nop run falls into the ret.
        assert_eq!(graph.block(blocks[0]).targets(), &[blocks[2]]);
        assert_eq!(graph.block(blocks[1]).fall_through(), Some(blocks[2]));
        assert_eq!(graph.block(blocks[2]).sources().len(), 2);
        assert_eq!(graph.entry(), blocks[0]);
    }

    #[test]
    fn empty_body_is_malformed() {
        assert!(matches!(parse(vec![], &[]), Err(Error::Malformed { .. })));
    }

    #[test]
    fn misaligned_branch_target_is_malformed() {
        // The br occupies bytes 0..5, so 0x03 lands inside it.
        let instructions = vec![Instruction::br(0x03), Instruction::ret()];
        assert!(matches!(
            parse(instructions, &[]),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn falling_off_the_end_is_malformed() {
        assert!(matches!(
            parse(vec![Instruction::nop()], &[]),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn partially_overlapping_regions_are_malformed() {
        let mut instructions: Vec<Instruction> =
            std::iter::repeat_with(Instruction::nop).take(10).collect();
        instructions.push(Instruction::ret());
        let handlers = [
            catch_clause(0, 5, 5, 5),
            catch_clause(2, 5, 7, 3), // 2..7 overlaps 0..5 without nesting
        ];
        assert!(matches!(
            parse(instructions, &handlers),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn sibling_catches_share_one_try_scope() {
        //   0x00: leave 0x11     try    0x00..0x05
        //   0x05: pop            catch1 0x05..0x0B
        //   0x06: leave 0x11
        //   0x0B: pop            catch2 0x0B..0x11
        //   0x0C: leave 0x11
        //   0x11: ret
        let instructions = vec![
            Instruction::leave(0x11),
            Instruction::new(opcodes::POP, Operand::None),
            Instruction::leave(0x11),
            Instruction::new(opcodes::POP, Operand::None),
            Instruction::leave(0x11),
            Instruction::ret(),
        ];
        let handlers = [catch_clause(0, 5, 5, 6), catch_clause(0, 5, 11, 6)];
        let graph = parse(instructions, &handlers).unwrap();

        let regions = graph.regions();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].try_scope(), regions[1].try_scope());
        assert_ne!(regions[0].handler_scope(), regions[1].handler_scope());
        // Root, the shared try, and one scope per catch.
        assert_eq!(graph.scopes_preorder().len(), 4);
    }

    #[test]
    fn filter_clause_builds_filter_and_handler_scopes() {
        //   0x00: leave 0x0E     try     0x00..0x05
        //   0x05: ldc.i4.1       filter  0x05..0x08
        //   0x06: endfilter
        //   0x08: pop            handler 0x08..0x0E
        //   0x09: leave 0x0E
        //   0x0E: ret
        let instructions = vec![
            Instruction::leave(0x0E),
            Instruction::new(opcodes::LDC_I4_1, Operand::None),
            Instruction::prefixed(opcodes::FE_ENDFILTER, Operand::None),
            Instruction::new(opcodes::POP, Operand::None),
            Instruction::leave(0x0E),
            Instruction::ret(),
        ];
        let handlers = [ExceptionHandler {
            flags: ExceptionHandlerFlags::FILTER,
            try_offset: 0,
            try_length: 5,
            handler_offset: 8,
            handler_length: 6,
            catch_type: None,
            filter_offset: 5,
        }];
        let graph = parse(instructions, &handlers).unwrap();

        let region = &graph.regions()[0];
        let filter = region.filter_scope().expect("filter scope");
        assert_eq!(graph.scope(filter).kind(), ScopeKind::Filter);
        assert_eq!(graph.scope(region.handler_scope()).kind(), ScopeKind::Catch);
        assert_eq!(graph.scope(region.try_scope()).kind(), ScopeKind::Try);

        let filter_entry = graph.scope_entry(filter).expect("filter entry");
        assert_eq!(
            graph.block(filter_entry).instructions()[0],
            Instruction::new(opcodes::LDC_I4_1, Operand::None)
        );
    }

    #[test]
    fn try_filling_an_entire_handler_nests_inside_it() {
        // An inner try whose range is exactly the outer catch body:
        //
        //   0x00: leave 0x10     outer try   0x00..0x05
        //   0x05: leave 0x10     outer catch 0x05..0x0A = inner try
        //   0x0A: pop            inner catch 0x0A..0x10
        //   0x0B: leave 0x10
        //   0x10: ret
        let instructions = vec![
            Instruction::leave(0x10),
            Instruction::leave(0x10),
            Instruction::new(opcodes::POP, Operand::None),
            Instruction::leave(0x10),
            Instruction::ret(),
        ];
        let handlers = [catch_clause(0, 5, 5, 5), catch_clause(5, 5, 10, 6)];
        let graph = parse(instructions, &handlers).unwrap();

        let regions = graph.regions();
        assert_eq!(regions.len(), 2);
        let inner_try = graph.scope(regions[1].try_scope());
        assert_eq!(inner_try.kind(), ScopeKind::Try);
        assert_eq!(inner_try.parent(), Some(regions[0].handler_scope()));
        // Root, outer try, outer catch, inner try, inner catch.
        assert_eq!(graph.scopes_preorder().len(), 5);
    }

    #[test]
    fn coinciding_handler_ranges_are_malformed() {
        // Two handler bodies over the same range cannot nest either way.
        let instructions = vec![
            Instruction::leave(0x0B),
            Instruction::new(opcodes::POP, Operand::None),
            Instruction::leave(0x0B),
            Instruction::ret(),
        ];
        let handlers = [
            catch_clause(0, 5, 5, 6),
            ExceptionHandler {
                flags: ExceptionHandlerFlags::FINALLY,
                try_offset: 0,
                try_length: 5,
                handler_offset: 5,
                handler_length: 6,
                catch_type: None,
                filter_offset: 0,
            },
        ];
        assert!(matches!(
            parse(instructions, &handlers),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn branch_into_a_handler_is_malformed() {
        //   0x00: br 0x0A        (jumps straight into the catch)
        //   0x05: leave 0x10     try   0x05..0x0A
        //   0x0A: pop            catch 0x0A..0x10
        //   0x0B: leave 0x10
        //   0x10: ret
        let instructions = vec![
            Instruction::br(0x0A),
            Instruction::leave(0x10),
            Instruction::new(opcodes::POP, Operand::None),
            Instruction::leave(0x10),
            Instruction::ret(),
        ];
        let handlers = [catch_clause(5, 5, 10, 6)];
        assert!(matches!(
            parse(instructions, &handlers),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn branch_to_a_nested_try_entry_is_accepted() {
        //   0x00: br 0x05
        //   0x05: leave 0x10     try   0x05..0x0A
        //   0x0A: pop            catch 0x0A..0x10
        //   0x0B: leave 0x10
        //   0x10: ret
        let instructions = vec![
            Instruction::br(0x05),
            Instruction::leave(0x10),
            Instruction::new(opcodes::POP, Operand::None),
            Instruction::leave(0x10),
            Instruction::ret(),
        ];
        let handlers = [catch_clause(5, 5, 10, 6)];
        let graph = parse(instructions, &handlers).unwrap();
        assert_eq!(graph.regions().len(), 1);
    }
}
