//! CIL instruction representation.
//!
//! The pipeline does not decode raw IL bytes. Callers hand it already-decoded
//! instructions (an opcode pair plus an operand) and receive rewritten
//! instructions of the same shape back. Branch operands exist in two forms:
//! the linear form ([`Operand::Target`] / [`Operand::Switch`], absolute byte
//! offsets into the method body) used at the input and output boundary, and
//! the graph form ([`Operand::Block`] / [`Operand::SwitchBlocks`]) used while
//! the instruction lives inside a block graph.

use std::fmt;

use crate::assembly::opcodes::*;
use crate::flow::BlockId;

/// A metadata token referencing a row in a metadata table (ECMA-335 §II.22).
///
/// The pipeline never resolves tokens; it carries them through unchanged on
/// call instructions, field accesses and local-variable type references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u32);

impl Token {
    /// Creates a new token from a raw 32-bit value.
    #[must_use]
    pub fn new(value: u32) -> Token {
        Token(value)
    }

    /// Returns the raw 32-bit token value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// An immediate value embedded in an instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    /// Signed 8-bit integer (e.g. `ldc.i4.s`)
    Int8(i8),
    /// Unsigned 8-bit integer
    UInt8(u8),
    /// Signed 16-bit integer
    Int16(i16),
    /// Unsigned 16-bit integer
    UInt16(u16),
    /// Signed 32-bit integer (e.g. `ldc.i4`)
    Int32(i32),
    /// Unsigned 32-bit integer
    UInt32(u32),
    /// Signed 64-bit integer (e.g. `ldc.i8`)
    Int64(i64),
    /// 32-bit floating point (e.g. `ldc.r4`)
    Float32(f32),
    /// 64-bit floating point (e.g. `ldc.r8`)
    Float64(f64),
}

impl Immediate {
    /// Returns the encoded size of this immediate in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        match self {
            Immediate::Int8(_) | Immediate::UInt8(_) => 1,
            Immediate::Int16(_) | Immediate::UInt16(_) => 2,
            Immediate::Int32(_) | Immediate::UInt32(_) | Immediate::Float32(_) => 4,
            Immediate::Int64(_) | Immediate::Float64(_) => 8,
        }
    }
}

/// The operand of an instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand present
    None,
    /// Immediate value (constant embedded in instruction)
    Immediate(Immediate),
    /// Branch target as an absolute byte offset into the method body (linear form)
    Target(u32),
    /// Switch table as absolute byte offsets into the method body (linear form)
    Switch(Vec<u32>),
    /// Branch target resolved to a block (graph form)
    Block(BlockId),
    /// Switch table resolved to blocks (graph form)
    SwitchBlocks(Vec<BlockId>),
    /// Metadata token reference
    Token(Token),
    /// Local variable index
    Local(u16),
    /// Method argument index
    Argument(u16),
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum FlowType {
    /// Normal execution continues to next instruction
    Sequential,
    /// Conditional branch to another location
    ConditionalBranch,
    /// Always branches to another location (unconditional jump)
    UnconditionalBranch,
    /// Call to another method
    Call,
    /// Returns from current method (also `jmp`, which never falls through)
    Return,
    /// Multi-way branch (switch statement)
    Switch,
    /// Exception throwing (`throw` and `rethrow`)
    Throw,
    /// End of finally or fault block
    EndFinally,
    /// End of filter block
    EndFilter,
    /// Leave protected region (try/catch/finally)
    Leave,
}

/// The kind of access a local-variable reference performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalRef {
    /// Load the local's value (`ldloc` family)
    Load,
    /// Store into the local (`stloc` family)
    Store,
    /// Load the local's address (`ldloca` family)
    Address,
}

/// A single decoded CIL instruction.
///
/// Identity is structural: two instructions with the same opcode bytes and
/// operand are the same instruction. Passes rewrite instructions in place by
/// replacing them within the owning block's sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Prefix byte (0 if no prefix, `0xFE` for two-byte opcodes)
    pub prefix: u8,
    /// Primary opcode byte (the second byte for `0xFE`-prefixed opcodes)
    pub opcode: u8,
    /// The operand data for this instruction
    pub operand: Operand,
}

impl Instruction {
    /// Creates a single-byte-opcode instruction.
    #[must_use]
    pub fn new(opcode: u8, operand: Operand) -> Instruction {
        Instruction {
            prefix: 0,
            opcode,
            operand,
        }
    }

    /// Creates a two-byte instruction with the `0xFE` prefix.
    #[must_use]
    pub fn prefixed(opcode: u8, operand: Operand) -> Instruction {
        Instruction {
            prefix: FE_PREFIX,
            opcode,
            operand,
        }
    }

    /// Creates a `nop`.
    #[must_use]
    pub fn nop() -> Instruction {
        Instruction::new(NOP, Operand::None)
    }

    /// Creates a `ret`.
    #[must_use]
    pub fn ret() -> Instruction {
        Instruction::new(RET, Operand::None)
    }

    /// Creates a long-form `br` to an absolute byte offset (linear form).
    #[must_use]
    pub fn br(target: u32) -> Instruction {
        Instruction::new(BR, Operand::Target(target))
    }

    /// Creates a long-form `leave` to an absolute byte offset (linear form).
    #[must_use]
    pub fn leave(target: u32) -> Instruction {
        Instruction::new(LEAVE, Operand::Target(target))
    }

    /// Creates the shortest legal load of local `index`.
    ///
    /// Indices 0-3 use the zero-operand shorthand, indices up to 255 the
    /// one-byte `ldloc.s` form, anything larger the full `ldloc` form.
    #[must_use]
    pub fn load_local(index: u16) -> Instruction {
        match index {
            0..=3 => Instruction::new(LDLOC_0 + index as u8, Operand::None),
            4..=0xFF => Instruction::new(LDLOC_S, Operand::Local(index)),
            _ => Instruction::prefixed(FE_LDLOC, Operand::Local(index)),
        }
    }

    /// Creates the shortest legal store into local `index`.
    #[must_use]
    pub fn store_local(index: u16) -> Instruction {
        match index {
            0..=3 => Instruction::new(STLOC_0 + index as u8, Operand::None),
            4..=0xFF => Instruction::new(STLOC_S, Operand::Local(index)),
            _ => Instruction::prefixed(FE_STLOC, Operand::Local(index)),
        }
    }

    /// Creates the shortest legal address-of for local `index`.
    ///
    /// `ldloca` has no 0-3 shorthand, only the short/long split at 255.
    #[must_use]
    pub fn load_local_address(index: u16) -> Instruction {
        if index <= 0xFF {
            Instruction::new(LDLOCA_S, Operand::Local(index))
        } else {
            Instruction::prefixed(FE_LDLOCA, Operand::Local(index))
        }
    }

    /// Returns how this instruction affects control flow.
    #[must_use]
    pub fn flow_type(&self) -> FlowType {
        if self.prefix == FE_PREFIX {
            return match self.opcode {
                FE_ENDFILTER => FlowType::EndFilter,
                FE_RETHROW => FlowType::Throw,
                _ => FlowType::Sequential,
            };
        }
        match self.opcode {
            BR_S | BR => FlowType::UnconditionalBranch,
            BRFALSE_S..=BLT_UN_S | BRFALSE..=BLT_UN => FlowType::ConditionalBranch,
            SWITCH => FlowType::Switch,
            LEAVE | LEAVE_S => FlowType::Leave,
            RET | JMP => FlowType::Return,
            THROW => FlowType::Throw,
            ENDFINALLY => FlowType::EndFinally,
            CALL | CALLI | CALLVIRT => FlowType::Call,
            _ => FlowType::Sequential,
        }
    }

    /// Returns whether this instruction ends a basic block.
    #[must_use]
    pub fn ends_block(&self) -> bool {
        !matches!(self.flow_type(), FlowType::Sequential | FlowType::Call)
    }

    /// Returns the local-variable slot this instruction references, if any,
    /// together with the kind of access.
    ///
    /// The zero-operand shorthands (`ldloc.0` through `stloc.3`) encode their
    /// slot in the opcode; every other form carries it as an operand.
    #[must_use]
    pub fn local_ref(&self) -> Option<(LocalRef, u16)> {
        let slot = |operand: &Operand| match operand {
            Operand::Local(index) => *index,
            _ => 0,
        };
        if self.prefix == FE_PREFIX {
            return match self.opcode {
                FE_LDLOC => Some((LocalRef::Load, slot(&self.operand))),
                FE_STLOC => Some((LocalRef::Store, slot(&self.operand))),
                FE_LDLOCA => Some((LocalRef::Address, slot(&self.operand))),
                _ => None,
            };
        }
        match self.opcode {
            LDLOC_0..=LDLOC_3 => Some((LocalRef::Load, u16::from(self.opcode - LDLOC_0))),
            STLOC_0..=STLOC_3 => Some((LocalRef::Store, u16::from(self.opcode - STLOC_0))),
            LDLOC_S => Some((LocalRef::Load, slot(&self.operand))),
            STLOC_S => Some((LocalRef::Store, slot(&self.operand))),
            LDLOCA_S => Some((LocalRef::Address, slot(&self.operand))),
            _ => None,
        }
    }

    /// Returns the encoded size of this instruction in bytes.
    ///
    /// The size is derived from the opcode family, so a short-form branch
    /// counts 2 bytes and its long-form twin 5, regardless of whether the
    /// operand is currently in linear or graph form.
    #[must_use]
    pub fn encoded_size(&self) -> u32 {
        let opcode_len = if self.prefix == FE_PREFIX { 2 } else { 1 };
        opcode_len + self.operand_size()
    }

    fn operand_size(&self) -> u32 {
        if self.prefix == FE_PREFIX {
            return match self.opcode {
                FE_LDARG | FE_LDARGA | FE_STARG | FE_LDLOC | FE_LDLOCA | FE_STLOC => 2,
                _ => self.fallback_operand_size(),
            };
        }
        match self.opcode {
            BR_S..=BLT_UN_S | LEAVE_S => 1,
            BR..=BLT_UN | LEAVE => 4,
            SWITCH => match &self.operand {
                Operand::Switch(targets) => 4 + 4 * targets.len() as u32,
                Operand::SwitchBlocks(targets) => 4 + 4 * targets.len() as u32,
                _ => 4,
            },
            LDARG_S | LDARGA_S | STARG_S | LDLOC_S | LDLOCA_S | STLOC_S | LDC_I4_S => 1,
            _ => self.fallback_operand_size(),
        }
    }

    fn fallback_operand_size(&self) -> u32 {
        match &self.operand {
            Operand::None => 0,
            Operand::Immediate(imm) => imm.size(),
            Operand::Token(_) => 4,
            Operand::Target(_) | Operand::Block(_) => 4,
            Operand::Switch(targets) => 4 + 4 * targets.len() as u32,
            Operand::SwitchBlocks(targets) => 4 + 4 * targets.len() as u32,
            Operand::Local(_) | Operand::Argument(_) => 2,
        }
    }

    /// Human-readable mnemonic for tracing and test output.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        if self.prefix == FE_PREFIX {
            return match self.opcode {
                FE_LDARG => "ldarg",
                FE_LDARGA => "ldarga",
                FE_STARG => "starg",
                FE_LDLOC => "ldloc",
                FE_LDLOCA => "ldloca",
                FE_STLOC => "stloc",
                FE_ENDFILTER => "endfilter",
                FE_RETHROW => "rethrow",
                _ => "unknown",
            };
        }
        match self.opcode {
            NOP => "nop",
            BREAK => "break",
            LDARG_0 => "ldarg.0",
            LDARG_1 => "ldarg.1",
            LDARG_2 => "ldarg.2",
            LDARG_3 => "ldarg.3",
            LDLOC_0 => "ldloc.0",
            LDLOC_1 => "ldloc.1",
            LDLOC_2 => "ldloc.2",
            LDLOC_3 => "ldloc.3",
            STLOC_0 => "stloc.0",
            STLOC_1 => "stloc.1",
            STLOC_2 => "stloc.2",
            STLOC_3 => "stloc.3",
            LDARG_S => "ldarg.s",
            LDARGA_S => "ldarga.s",
            STARG_S => "starg.s",
            LDLOC_S => "ldloc.s",
            LDLOCA_S => "ldloca.s",
            STLOC_S => "stloc.s",
            LDNULL => "ldnull",
            LDC_I4_M1 => "ldc.i4.m1",
            LDC_I4_0 => "ldc.i4.0",
            LDC_I4_1 => "ldc.i4.1",
            LDC_I4_2 => "ldc.i4.2",
            LDC_I4_3 => "ldc.i4.3",
            LDC_I4_4 => "ldc.i4.4",
            LDC_I4_5 => "ldc.i4.5",
            LDC_I4_6 => "ldc.i4.6",
            LDC_I4_7 => "ldc.i4.7",
            LDC_I4_8 => "ldc.i4.8",
            LDC_I4_S => "ldc.i4.s",
            LDC_I4 => "ldc.i4",
            LDC_I8 => "ldc.i8",
            LDC_R4 => "ldc.r4",
            LDC_R8 => "ldc.r8",
            DUP => "dup",
            POP => "pop",
            JMP => "jmp",
            CALL => "call",
            CALLI => "calli",
            RET => "ret",
            BR_S => "br.s",
            BRFALSE_S => "brfalse.s",
            BRTRUE_S => "brtrue.s",
            BEQ_S => "beq.s",
            BGE_S => "bge.s",
            BGT_S => "bgt.s",
            BLE_S => "ble.s",
            BLT_S => "blt.s",
            BNE_UN_S => "bne.un.s",
            BGE_UN_S => "bge.un.s",
            BGT_UN_S => "bgt.un.s",
            BLE_UN_S => "ble.un.s",
            BLT_UN_S => "blt.un.s",
            BR => "br",
            BRFALSE => "brfalse",
            BRTRUE => "brtrue",
            BEQ => "beq",
            BGE => "bge",
            BGT => "bgt",
            BLE => "ble",
            BLT => "blt",
            BNE_UN => "bne.un",
            BGE_UN => "bge.un",
            BGT_UN => "bgt.un",
            BLE_UN => "ble.un",
            BLT_UN => "blt.un",
            SWITCH => "switch",
            CALLVIRT => "callvirt",
            THROW => "throw",
            ENDFINALLY => "endfinally",
            LEAVE => "leave",
            LEAVE_S => "leave.s",
            _ => "unknown",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operand {
            Operand::None => write!(f, "{}", self.mnemonic()),
            operand => write!(f, "{} {:?}", self.mnemonic(), operand),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthand_locals_encode_slot_in_opcode() {
        for index in 0..4u16 {
            let load = Instruction::load_local(index);
            assert_eq!(load.operand, Operand::None);
            assert_eq!(load.local_ref(), Some((LocalRef::Load, index)));
            assert_eq!(load.encoded_size(), 1);

            let store = Instruction::store_local(index);
            assert_eq!(store.local_ref(), Some((LocalRef::Store, index)));
            assert_eq!(store.encoded_size(), 1);
        }
    }

    #[test]
    fn local_encoding_splits_at_boundaries() {
        let short = Instruction::load_local(4);
        assert_eq!(short.opcode, LDLOC_S);
        assert_eq!(short.encoded_size(), 2);

        let edge = Instruction::load_local(255);
        assert_eq!(edge.opcode, LDLOC_S);

        let long = Instruction::load_local(256);
        assert_eq!(long.prefix, FE_PREFIX);
        assert_eq!(long.opcode, FE_LDLOC);
        assert_eq!(long.encoded_size(), 4);
    }

    #[test]
    fn ldloca_has_no_shorthand() {
        let addr = Instruction::load_local_address(0);
        assert_eq!(addr.opcode, LDLOCA_S);
        assert_eq!(addr.operand, Operand::Local(0));
        assert_eq!(addr.local_ref(), Some((LocalRef::Address, 0)));

        let far = Instruction::load_local_address(300);
        assert_eq!(far.opcode, FE_LDLOCA);
    }

    #[test]
    fn flow_types() {
        assert_eq!(Instruction::nop().flow_type(), FlowType::Sequential);
        assert_eq!(Instruction::ret().flow_type(), FlowType::Return);
        assert_eq!(Instruction::br(0).flow_type(), FlowType::UnconditionalBranch);
        assert_eq!(Instruction::leave(0).flow_type(), FlowType::Leave);
        assert_eq!(
            Instruction::new(BRTRUE_S, Operand::Target(0)).flow_type(),
            FlowType::ConditionalBranch
        );
        assert_eq!(
            Instruction::prefixed(FE_ENDFILTER, Operand::None).flow_type(),
            FlowType::EndFilter
        );
        assert_eq!(
            Instruction::new(ENDFINALLY, Operand::None).flow_type(),
            FlowType::EndFinally
        );
    }

    #[test]
    fn branch_sizes_follow_opcode_form() {
        let short = Instruction::new(BR_S, Operand::Target(0));
        assert_eq!(short.encoded_size(), 2);
        let long = Instruction::br(0);
        assert_eq!(long.encoded_size(), 5);
        let switch = Instruction::new(SWITCH, Operand::Switch(vec![0, 0, 0]));
        assert_eq!(switch.encoded_size(), 17);
        let leave_s = Instruction::new(LEAVE_S, Operand::Target(0));
        assert_eq!(leave_s.encoded_size(), 2);
    }
}
