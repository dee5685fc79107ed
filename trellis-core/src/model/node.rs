//! Graph Nodes
//!
//! A node is a definition placed at a location (scope + context). Nodes are
//! immutable; a changed value is a new node with a new id.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::definition::{Definition, NodeKind};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Generate a new unique id.
            pub fn new() -> Self {
                static COUNTER: AtomicU64 = AtomicU64::new(1);
                Self(COUNTER.fetch_add(1, Ordering::Relaxed))
            }

            /// Get the raw id value.
            pub fn raw(&self) -> u64 {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Unique identifier for a node in the store.
    NodeId
);
id_type!(
    /// Identifies a scope: an independent graph root.
    ScopeId
);
id_type!(
    /// Identifies a context: an independent set of variable slots.
    ContextId
);

impl ScopeId {
    /// The scope every graph starts with.
    pub const ROOT: ScopeId = ScopeId(0);
}

impl ContextId {
    /// The context every graph starts with.
    pub const ROOT: ContextId = ContextId(0);
}

/// Where a node lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Location {
    pub scope: ScopeId,
    pub context: ContextId,
}

impl Location {
    /// The root scope and context.
    pub const ROOT: Location = Location {
        scope: ScopeId::ROOT,
        context: ContextId::ROOT,
    };

    /// Build a location.
    pub fn new(scope: ScopeId, context: ContextId) -> Self {
        Self { scope, context }
    }
}

impl Default for Location {
    fn default() -> Self {
        Self::ROOT
    }
}

/// A node registered in the store.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    location: Location,
    definition: Definition,
}

impl Node {
    pub(crate) fn new(id: NodeId, location: Location, definition: Definition) -> Self {
        Self {
            id,
            location,
            definition,
        }
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Where the node lives.
    pub fn location(&self) -> Location {
        self.location
    }

    /// The definition.
    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    /// Get the node's kind.
    pub fn kind(&self) -> NodeKind {
        self.definition.node_kind()
    }
}
