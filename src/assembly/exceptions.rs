//! Exception handler table entries for CIL method bodies.
//!
//! The handler table is consumed at parse time to build the scope tree and
//! regenerated by the code generator with offsets valid for the rewritten
//! instruction stream. Offsets are byte offsets into the method body, as
//! specified by ECMA-335.

use bitflags::bitflags;

use crate::assembly::Token;

bitflags! {
    /// Exception handler flags defining the type of exception handling clause.
    ///
    /// These flags determine how the exception handler processes exceptions and
    /// control flow within try/catch/finally blocks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed exception clause.
        ///
        /// The `catch_type` field contains the metadata token of the exception type
        /// that this handler catches. This is the most common exception handler type.
        const EXCEPTION = 0x0000;

        /// An exception filter and handler clause.
        ///
        /// Uses a filter expression to determine whether to handle the exception.
        /// The filter code is executed before the handler to test the exception.
        const FILTER = 0x0001;

        /// A finally clause.
        ///
        /// Code that executes regardless of whether an exception occurs. Finally
        /// blocks are guaranteed to run during normal execution and exception handling.
        const FINALLY = 0x0002;

        /// A fault clause (finally that executes only on exception).
        ///
        /// Similar to finally, but only executes when an exception is thrown,
        /// not during normal execution flow.
        const FAULT = 0x0004;
    }
}

/// Exception handler defining a try region and its handling code within a method.
///
/// Each entry specifies the protected region (try block), the handler region, and
/// for filter clauses the filter region that precedes the handler. Ranges are
/// half-open byte ranges; `try_offset + try_length` is the offset of the first
/// instruction after the try block.
///
/// # Layout in IL
///
/// ```text
/// try {
///     // try_offset -> try_offset + try_length
///     // Protected code region
/// }
/// catch (ExceptionType) {
///     // handler_offset -> handler_offset + handler_length
///     // Exception handling code
/// }
/// ```
///
/// # References
/// - ECMA-335 6th Edition, Partition II, Section 25.4.6 - Exception Handling
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionHandler {
    /// Flags describing the type of exception handler (catch, filter, finally, fault).
    pub flags: ExceptionHandlerFlags,
    /// Offset in bytes of try block from start of method body.
    pub try_offset: u32,
    /// Length in bytes of the try block.
    pub try_length: u32,
    /// Location of the handler for this try block.
    pub handler_offset: u32,
    /// Size of the handler code in bytes.
    pub handler_length: u32,
    /// If flags == EXCEPTION, the token of the type this handler catches.
    pub catch_type: Option<Token>,
    /// Offset in method body where the filter region starts, for FILTER clauses.
    /// The filter region ends where the handler region begins.
    pub filter_offset: u32,
}

impl ExceptionHandler {
    /// Returns whether this entry is a filter clause.
    #[must_use]
    pub fn is_filter(&self) -> bool {
        self.flags.contains(ExceptionHandlerFlags::FILTER)
    }

    /// Offset of the first byte after the try block.
    #[must_use]
    pub fn try_end(&self) -> u32 {
        self.try_offset + self.try_length
    }

    /// Offset of the first byte after the handler block.
    #[must_use]
    pub fn handler_end(&self) -> u32 {
        self.handler_offset + self.handler_length
    }
}

/// A local variable slot declared by a method body.
///
/// The pipeline only needs the slot's identity and its type token; it never
/// interprets the type. The local slot optimizer rewrites the method's local
/// list to contain only referenced slots, in first-use order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Local {
    /// Metadata token of the local's type signature element.
    pub ty: Token,
}

impl Local {
    /// Creates a new local of the given type.
    #[must_use]
    pub fn new(ty: Token) -> Local {
        Local { ty }
    }
}
