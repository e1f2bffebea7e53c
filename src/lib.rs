// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]

//! # blockscope
//!
//! Control-flow reconstruction and optimization for CIL method bodies.
//!
//! `blockscope` turns a flat instruction stream plus its exception-handler
//! table into a structured representation - a block graph layered over a
//! scope tree mirroring the method's try/catch/filter/finally nesting - runs
//! semantics-preserving transformation passes over it (dead-block removal,
//! leave normalization, block merging and repartitioning, local-slot
//! compaction), and flattens the result back into a linear stream with
//! minimal branch encodings and a regenerated handler table. It is the
//! middle/back-end of a deobfuscation pipeline: the host decodes and encodes
//! IL bytes, `blockscope` rewrites the method's shape.
//!
//! ## Quick Start
//!
//! ```rust
//! use blockscope::{assembly::Instruction, MethodFlow};
//!
//! // br 0x07; nop; nop; ret - a jump over two unreachable nops.
//! let instructions = vec![
//!     Instruction::br(0x07),
//!     Instruction::nop(),
//!     Instruction::nop(),
//!     Instruction::ret(),
//! ];
//!
//! let mut flow = MethodFlow::build(instructions, &[], vec![])?;
//! flow.remove_dead_blocks()?;
//! let (rewritten, _handlers) = flow.generate()?;
//! assert_eq!(rewritten.len(), 2); // br.s; ret
//! # Ok::<(), blockscope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`assembly`] - the instruction model the pipeline consumes and produces:
//!   opcode constants, [`assembly::Instruction`], the exception-handler table
//!   and local-variable list.
//! - [`flow`] - the per-method [`flow::FlowGraph`]: arena-owned blocks, the
//!   scope tree, and the non-owning edge overlay between blocks.
//! - [`deobfuscation`] - the transformation passes and the [`ScopePass`]
//!   extension point for caller-supplied scope-level rewrites.
//! - [`MethodFlow`] - the per-method pipeline entry point, parse through
//!   regeneration.
//!
//! Processing is single-threaded and synchronous; each method's graph is
//! exclusively owned, so hosts parallelize across methods by giving each
//! worker its own [`MethodFlow`].
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result`]. Malformed input (misaligned
//! branch targets, non-nested exception regions) fails the one method's
//! pipeline with [`Error::Malformed`] and no partial output; a pass that
//! breaks a graph invariant surfaces as [`Error::Invariant`] rather than
//! silently corrupt code. Finding nothing to do is success: passes return a
//! zero count, not an error.

#[macro_use]
pub(crate) mod error;

pub mod assembly;
pub mod deobfuscation;
pub mod flow;

mod codegen;
mod method;

/// `blockscope` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is
/// always [`Error`]. Used consistently throughout the crate for all fallible
/// operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `blockscope` Error type
///
/// The main error type for all operations in this crate. [`Error::Malformed`]
/// marks input that cannot describe a valid method body; [`Error::Invariant`]
/// marks a pass defect detected before it could corrupt output.
pub use error::Error;

/// Per-method pipeline entry point.
///
/// See [`MethodFlow`] for parsing, running passes, and regenerating the
/// instruction stream.
pub use method::MethodFlow;

pub use deobfuscation::ScopePass;
