//! Instruction model the block pipeline consumes and produces.
//!
//! This is the adapter surface between the pipeline and whatever decoded the
//! method body: instructions as opcode-plus-operand pairs, the exception
//! handler table, and the method's local variable list. See
//! [`Instruction`] for the two operand forms (linear byte offsets at the
//! boundary, block references inside the graph).

mod exceptions;
mod instruction;
pub mod opcodes;

pub use exceptions::{ExceptionHandler, ExceptionHandlerFlags, Local};
pub use instruction::{FlowType, Immediate, Instruction, LocalRef, Operand, Token};
