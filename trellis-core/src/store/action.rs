//! Actions
//!
//! An action pairs a node with an operation. Cacheable actions are shared by
//! every equivalent request and live as long as something references them:
//! an external hold (handle or subscription) or a dependent action that read
//! their result.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

use crate::model::{Definition, NodeId};
use crate::source::Cleanup;
use crate::subscription::{Observer, SubscriptionId};

/// Unique identifier for an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ActionId(u64);

impl ActionId {
    /// Generate a new unique action ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of an action.
///
/// `Uninitialized -> Pending -> Resolved | Error`, back to `Pending` while
/// re-resolving after an invalidation, and `Disposed` once removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionState {
    /// Registered, never run.
    Uninitialized,
    /// Running, or resolved to a pending node.
    Pending,
    /// Resolved to a non-error node.
    Resolved,
    /// Resolved to an error node.
    Error,
    /// Removed from the store.
    Disposed,
}

/// Connection state of a source-backed action.
#[derive(Default)]
pub(crate) struct SourceSlot {
    /// Token of the live connection; emissions carrying another token are stale.
    pub(crate) connection: Option<u64>,
    /// Latest emitted definition.
    pub(crate) latest: Option<Definition>,
}

/// An action together with its cache bookkeeping.
pub(crate) struct ActionRecord {
    pub(crate) id: ActionId,
    pub(crate) node: NodeId,
    pub(crate) operation: crate::store::OperationId,
    pub(crate) cacheable: bool,
    pub(crate) state: ActionState,
    pub(crate) result: Option<NodeId>,

    /// Actions this one read during its latest resolution.
    pub(crate) dependencies: IndexSet<ActionId>,

    /// Actions that read this one.
    pub(crate) dependents: IndexSet<ActionId>,

    pub(crate) observers: IndexMap<SubscriptionId, Observer>,

    /// External references: handles, subscriptions, in-flight one-shots.
    pub(crate) holds: usize,

    /// Resource cleanups registered by the handler.
    pub(crate) cleanups: Vec<Cleanup>,

    /// Set while the handler runs. Requests that find it set are cycles.
    pub(crate) resolving: bool,

    pub(crate) source: SourceSlot,

    /// Number of completed resolutions.
    pub(crate) resolutions: u64,
}

impl ActionRecord {
    pub(crate) fn new(
        node: NodeId,
        operation: crate::store::OperationId,
        cacheable: bool,
    ) -> Self {
        Self {
            id: ActionId::new(),
            node,
            operation,
            cacheable,
            state: ActionState::Uninitialized,
            result: None,
            dependencies: IndexSet::new(),
            dependents: IndexSet::new(),
            observers: IndexMap::new(),
            holds: 0,
            cleanups: Vec::new(),
            resolving: false,
            source: SourceSlot::default(),
            resolutions: 0,
        }
    }

    /// Holds plus dependents.
    pub(crate) fn ref_count(&self) -> usize {
        self.holds + self.dependents.len()
    }

    /// Whether nothing references this action any more.
    ///
    /// An action that is still running is never collected; its caller
    /// releases it once the run completes.
    pub(crate) fn is_collectable(&self) -> bool {
        self.ref_count() == 0 && !self.resolving
    }
}
