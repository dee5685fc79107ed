//! Subscriptions
//!
//! A subscription is an observer attached to a cached action. It holds a
//! reference on the action, so the action (and everything it read) stays
//! cached for as long as at least one subscription or handle is alive.
//!
//! Disposing a subscription is idempotent and also happens on drop. When the
//! last reference goes away the action is torn down synchronously, inside
//! the disposing call, and the cleanups registered by its handlers run.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::Serialize;

use crate::error::{ErrorInfo, GraphError};
use crate::graph::Shared;
use crate::model::{Json, Node, NodeId, NodeKind};
use crate::resolve::engine;
use crate::store::{ActionId, ActionState};

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Generate a new unique subscription ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback receiving the results of an action.
pub type Observer = Arc<dyn Fn(&GraphResult) + Send + Sync>;

/// What an observer sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum GraphResult {
    /// A plain value. `nil` reads as `null`.
    Value(Json),
    /// A structural node such as a tree, addressed by id.
    Node {
        /// The node's id.
        id: NodeId,
        /// The node's kind.
        kind: NodeKind,
    },
    /// Not available yet.
    Pending,
    /// Resolution failed.
    Error(ErrorInfo),
}

impl GraphResult {
    /// Read a result node.
    pub fn from_node(node: &Node) -> Self {
        if let Some(value) = node.definition().as_value() {
            return Self::Value(value);
        }
        match node.kind() {
            NodeKind::Pending => Self::Pending,
            NodeKind::Error => match node.definition().as_error() {
                Some(info) => Self::Error(info.clone()),
                None => Self::Pending,
            },
            kind => Self::Node { id: node.id(), kind },
        }
    }

    /// The value, if this is one.
    pub fn as_value(&self) -> Option<&Json> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The error, if this is one.
    pub fn as_error(&self) -> Option<&ErrorInfo> {
        match self {
            Self::Error(info) => Some(info),
            _ => None,
        }
    }

    /// Whether the result is still pending.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Handle to an observer registered on a cached action.
///
/// Dropping the subscription disposes it.
pub struct Subscription {
    shared: Weak<Shared>,
    id: SubscriptionId,
    action: ActionId,
    disposed: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(shared: Weak<Shared>, id: SubscriptionId, action: ActionId) -> Self {
        Self {
            shared,
            id,
            action,
            disposed: AtomicBool::new(false),
        }
    }

    /// Get the subscription's ID.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The observed action.
    pub fn action(&self) -> ActionId {
        self.action
    }

    /// Whether [`dispose`](Self::dispose) already ran.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stop observing and release the action. Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            engine::unobserve(&shared, self.id, self.action);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("action", &self.action)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Handle to a resolved action.
///
/// For cacheable operations the handle holds the cached action alive until it
/// is dropped. Side-effecting operations ran once; the handle only keeps the
/// result they produced.
pub struct ActionHandle {
    shared: Weak<Shared>,
    action: Option<ActionId>,
    snapshot: Option<GraphResult>,
    released: AtomicBool,
}

impl ActionHandle {
    pub(crate) fn cached(shared: Weak<Shared>, action: ActionId) -> Self {
        Self {
            shared,
            action: Some(action),
            snapshot: None,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn one_shot(shared: Weak<Shared>, result: GraphResult) -> Self {
        Self {
            shared,
            action: None,
            snapshot: Some(result),
            released: AtomicBool::new(true),
        }
    }

    /// The cached action, or `None` for a side-effecting operation.
    pub fn id(&self) -> Option<ActionId> {
        self.action
    }

    /// The latest result.
    pub fn result(&self) -> Result<GraphResult, GraphError> {
        if let Some(result) = &self.snapshot {
            return Ok(result.clone());
        }
        let (shared, action) = self.live()?;
        engine::current_result(&shared, action)
    }

    /// Lifecycle state of the action.
    pub fn state(&self) -> ActionState {
        match self.live() {
            Ok((shared, action)) => shared
                .store
                .lock()
                .try_action(action)
                .map_or(ActionState::Disposed, |record| record.state),
            Err(_) => ActionState::Disposed,
        }
    }

    /// Observe the action. The latest result is delivered immediately.
    pub fn subscribe<F>(&self, observer: F) -> Result<Subscription, GraphError>
    where
        F: Fn(&GraphResult) + Send + Sync + 'static,
    {
        let (shared, action) = self.live()?;
        let _driver = shared.driver.lock();
        engine::hold_existing(&shared, action)?;
        let subscription = engine::observe(&shared, action, Arc::new(observer), "handle");
        if subscription.is_err() {
            engine::release(&shared, action);
        }
        subscription
    }

    /// Release the hold early. Safe to call more than once.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let (Some(shared), Some(action)) = (self.shared.upgrade(), self.action) {
            let _driver = shared.driver.lock();
            engine::release(&shared, action);
        }
    }

    fn live(&self) -> Result<(Arc<Shared>, ActionId), GraphError> {
        let action = self.action.ok_or(GraphError::Disposed)?;
        if self.released.load(Ordering::SeqCst) {
            return Err(GraphError::Disposed);
        }
        let shared = self.shared.upgrade().ok_or(GraphError::Disposed)?;
        if shared.is_disposed() {
            return Err(GraphError::Disposed);
        }
        Ok((shared, action))
    }
}

impl Drop for ActionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ActionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHandle")
            .field("action", &self.action)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}
