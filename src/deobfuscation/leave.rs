//! Normalization of obfuscated protected-region exits.
//!
//! Obfuscators hide the real destination of a region exit behind chains of
//! single-instruction jump blocks, or emit a plain `br` where only a `leave`
//! is legal. This pass collapses such chains onto the true destination and
//! rewrites region-exiting branches into canonical leaves. The recognized
//! pattern is deliberately narrow (see [`normalize_leaves`]); anything it is
//! not sure about is left untouched.

use std::collections::HashSet;

use crate::assembly::{opcodes, FlowType};
use crate::flow::{BlockId, FlowGraph, ScopeId, ScopeKind};
use crate::Result;

/// Rewrites unconditional exits among `scope`'s direct blocks to their final
/// destination and converts region-exiting plain branches into leaves.
/// Returns the number of terminators rewritten.
///
/// Chain following only hops through trampolines: blocks holding exactly one
/// plain `br`, living in the source's own scope or an ancestor of it. Leave
/// trampolines are never hopped through, since skipping a `leave` could skip
/// the finally chain it triggers. A `br` becomes a `leave` only when its
/// target sits in a strict ancestor scope and every region being exited is a
/// try or a catch; finally, fault and filter bodies cannot leave.
pub(crate) fn normalize_leaves(graph: &mut FlowGraph, scope: ScopeId) -> Result<usize> {
    let mut rewritten = 0;
    let blocks: Vec<BlockId> = graph.scope(scope).blocks().collect();
    for id in blocks {
        let flow = graph.block(id).terminator_flow();
        if !matches!(flow, FlowType::UnconditionalBranch | FlowType::Leave) {
            continue;
        }
        let start = match graph.block(id).targets().first() {
            Some(target) => *target,
            None => continue,
        };

        let source_scope = graph.block(id).scope();
        let mut seen: HashSet<BlockId> = HashSet::from([id]);
        let mut target = start;
        loop {
            if !seen.insert(target) {
                break; // jump cycle, keep the last stop before it closes
            }
            let hop = graph.block(target);
            if !(hop.is_trampoline() && hop.ends_in_branch()) {
                break;
            }
            let hop_scope = hop.scope();
            if hop_scope != source_scope && !graph.is_ancestor(hop_scope, source_scope) {
                break;
            }
            target = hop.targets()[0];
        }

        let target_scope = graph.block(target).scope();
        let (accept, convert) = match flow {
            FlowType::Leave => (graph.is_ancestor(target_scope, source_scope), false),
            FlowType::UnconditionalBranch => {
                if target_scope == source_scope {
                    (true, false)
                } else if graph.is_ancestor(target_scope, source_scope)
                    && exits_only_try_and_catch(graph, source_scope, target_scope)
                {
                    (true, true)
                } else {
                    (false, false)
                }
            }
            _ => (false, false),
        };
        if !accept {
            continue;
        }

        let mut changed = false;
        if convert {
            if let Some(instr) = graph.block_mut(id).instructions_mut().last_mut() {
                instr.prefix = 0;
                instr.opcode = opcodes::LEAVE;
                changed = true;
            }
        }
        if target != start {
            graph.set_branch_target(id, target)?;
            changed = true;
        }
        if changed {
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

/// Whether every scope from `from` (inclusive) up to `to` (exclusive) is a
/// try or catch region, i.e. one a `leave` may legally exit.
fn exits_only_try_and_catch(graph: &FlowGraph, from: ScopeId, to: ScopeId) -> bool {
    let mut current = from;
    while current != to {
        match graph.scope(current).kind() {
            ScopeKind::Try | ScopeKind::Catch => {}
            ScopeKind::Body | ScopeKind::Filter | ScopeKind::Finally | ScopeKind::Fault => {
                return false
            }
        }
        current = match graph.scope(current).parent() {
            Some(parent) => parent,
            None => return false,
        };
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{
        ExceptionHandler, ExceptionHandlerFlags, Instruction, Operand, Token,
    };
    use crate::flow::parse;

    #[test]
    fn branch_chain_collapses_to_final_target() {
        // br 0x05; ret; br 0x0F; nop... the entry branches to a trampoline
        // at 0x05 which forwards to the ret at the end.
        //
        //   0x00: br 0x0A      (entry)
        //   0x05: ret          (unrelated join target, keeps offsets honest)
        //   0x06: nop
        //   0x07: nop
        //   0x08: nop
        //   0x09: nop
        //   0x0A: br 0x05      (trampoline)
        let instructions = vec![
            Instruction::br(0x0A),
            Instruction::ret(),
            Instruction::nop(),
            Instruction::nop(),
            Instruction::nop(),
            Instruction::nop(),
            Instruction::br(0x05),
        ];
        let mut graph = parse(instructions, &[]).unwrap();
        let entry = graph.entry();
        let root = graph.root();
        let rewritten = normalize_leaves(&mut graph, root).unwrap();
        assert_eq!(rewritten, 1);

        let target = graph.block(entry).targets()[0];
        assert_eq!(graph.block(target).last().unwrap(), &Instruction::ret());
    }

    #[test]
    fn region_exiting_branch_becomes_leave() {
        // try { br 0x0B } catch { leave 0x0B }; ret - the br illegally
        // jumps straight out of the try.
        //
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
        let mut graph = parse(instructions, &handlers).unwrap();
        let entry = graph.entry();

        let try_scope = graph.block(entry).scope();
        let rewritten = normalize_leaves(&mut graph, try_scope).unwrap();
        assert_eq!(rewritten, 1);
        assert_eq!(graph.block(entry).terminator_flow(), FlowType::Leave);
    }

    #[test]
    fn leave_chain_hops_through_a_branch_trampoline() {
        // The try's leave lands on a single-br block in the method body,
        // which forwards to the real ret. The leave is retargeted onto the
        // ret directly and keeps its region-exit semantics.
        //
        //   0x00: leave 0x0B     try   0x00..0x05
        //   0x05: pop            catch 0x05..0x0B
        //   0x06: leave 0x0B
        //   0x0B: br 0x10        (trampoline)
        //   0x10: ret
        let instructions = vec![
            Instruction::leave(0x0B),
            Instruction::new(opcodes::POP, Operand::None),
            Instruction::leave(0x0B),
            Instruction::br(0x10),
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
        let rewritten = normalize_leaves(&mut graph, try_scope).unwrap();
        assert_eq!(rewritten, 1);

        let target = graph.block(entry).targets()[0];
        assert_eq!(graph.block(target).last().unwrap(), &Instruction::ret());
        assert_eq!(graph.block(entry).terminator_flow(), FlowType::Leave);
    }

    #[test]
    fn leave_out_of_finally_is_not_fabricated() {
        // A br inside a finally body must stay a br even when it targets an
        // outer scope; finally exits only through endfinally.
        //
        //   0x00: leave 0x0C     try     0x00..0x05
        //   0x05: br 0x0C        finally 0x05..0x0C  (malformed on purpose)
        //   0x0A: endfinally
        //   0x0B: nop
        //   0x0C: ret
        let instructions = vec![
            Instruction::leave(0x0C),
            Instruction::br(0x0C),
            Instruction::new(opcodes::ENDFINALLY, Operand::None),
            Instruction::nop(),
            Instruction::ret(),
        ];
        let handlers = [ExceptionHandler {
            flags: ExceptionHandlerFlags::FINALLY,
            try_offset: 0x00,
            try_length: 0x05,
            handler_offset: 0x05,
            handler_length: 0x07,
            catch_type: None,
            filter_offset: 0,
        }];
        let mut graph = parse(instructions, &handlers).unwrap();

        let mut total = 0;
        for scope in graph.scopes_preorder() {
            total += normalize_leaves(&mut graph, scope).unwrap();
        }
        assert_eq!(total, 0);
    }
}
