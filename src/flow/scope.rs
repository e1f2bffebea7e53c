//! The scope tree mirroring a method's exception-handling regions.

use std::fmt;

use crate::assembly::{ExceptionHandlerFlags, Token};
use crate::flow::BlockId;

/// Stable handle to a scope in a method's scope arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u32);

impl ScopeId {
    pub(crate) fn new(index: usize) -> ScopeId {
        ScopeId(index as u32)
    }

    /// Index of this scope in the owning arena.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// The kind of region a scope represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ScopeKind {
    /// The method's top-level body.
    Body,
    /// A protected (try) region.
    Try,
    /// A filter region preceding a filtered handler.
    Filter,
    /// A typed or filter-dispatched exception handler.
    Catch,
    /// A finally region.
    Finally,
    /// A fault region (finally that only runs on exception).
    Fault,
}

/// One entry in a scope's ordered content list.
///
/// A scope's direct blocks and child scopes are interleaved in declaration
/// order; the code generator walks this list to lay the method out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeItem {
    /// A block directly owned by the scope.
    Block(BlockId),
    /// A nested child scope.
    Scope(ScopeId),
}

/// A node of the scope tree.
///
/// The root scope is the method body; every other scope is one exception
/// region. The tree owns its content: each block belongs to exactly one
/// scope, and the union of all scopes' blocks covers the method exactly once.
#[derive(Debug)]
pub struct Scope {
    pub(crate) kind: ScopeKind,
    pub(crate) parent: Option<ScopeId>,
    pub(crate) items: Vec<ScopeItem>,
}

impl Scope {
    pub(crate) fn new(kind: ScopeKind, parent: Option<ScopeId>) -> Scope {
        Scope {
            kind,
            parent,
            items: Vec::new(),
        }
    }

    /// The kind of region this scope represents.
    #[must_use]
    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// The parent scope; `None` only for the root body scope.
    #[must_use]
    pub fn parent(&self) -> Option<ScopeId> {
        self.parent
    }

    /// The scope's direct blocks and child scopes, in declaration order.
    #[must_use]
    pub fn items(&self) -> &[ScopeItem] {
        &self.items
    }

    /// Direct child blocks in declaration order, skipping nested scopes.
    pub fn blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.items.iter().filter_map(|item| match item {
            ScopeItem::Block(block) => Some(*block),
            ScopeItem::Scope(_) => None,
        })
    }
}

/// Handler-table metadata tying a try scope to its handler scope.
///
/// Regions survive in declaration order so the regenerated handler table
/// keeps the original clause ordering. Several regions may share one try
/// scope (a try with multiple catch clauses).
#[derive(Debug, Clone)]
pub struct Region {
    pub(crate) flags: ExceptionHandlerFlags,
    pub(crate) try_scope: ScopeId,
    pub(crate) filter_scope: Option<ScopeId>,
    pub(crate) handler_scope: ScopeId,
    pub(crate) catch_type: Option<Token>,
}

impl Region {
    /// Clause kind flags from the original handler table entry.
    #[must_use]
    pub fn flags(&self) -> ExceptionHandlerFlags {
        self.flags
    }

    /// The protected scope of this region.
    #[must_use]
    pub fn try_scope(&self) -> ScopeId {
        self.try_scope
    }

    /// The filter scope, present only for filter clauses.
    #[must_use]
    pub fn filter_scope(&self) -> Option<ScopeId> {
        self.filter_scope
    }

    /// The handler scope of this region.
    #[must_use]
    pub fn handler_scope(&self) -> ScopeId {
        self.handler_scope
    }

    /// Token of the caught exception type, for typed clauses.
    #[must_use]
    pub fn catch_type(&self) -> Option<Token> {
        self.catch_type
    }
}
