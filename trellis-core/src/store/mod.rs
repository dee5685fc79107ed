//! Scope/Context Store
//!
//! The store is the single mutable structure of a graph instance. It is an
//! arena: nodes, operations and actions are addressed by integer ids, so a
//! reference cycle in the user's graph is just a pair of ids, never an
//! ownership cycle.
//!
//! # Indexes
//!
//! - `node_keys`: (location, definition identity) -> node, so structurally
//!   equal definitions share a node.
//! - `requests`: (node, operation) -> cacheable action, the request
//!   equivalence index.
//! - `node_index`: node -> live actions targeting it, used to fan
//!   invalidation out from a mutated node.
//!
//! # Collection
//!
//! Actions are reference counted (holds + dependents). When the count drops
//! to zero the action is removed, its dependencies are released in turn and
//! nodes and operations nobody refers to any more are dropped. Variable
//! slots are not collected; they live as long as the store.

mod action;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

use crate::error::GraphError;
use crate::model::{ContextId, Definition, Json, Location, Node, NodeId, NodeKind, Operation, ScopeId};
use crate::source::Cleanup;
use crate::subscription::SubscriptionId;

pub use action::{ActionId, ActionState};
pub(crate) use action::ActionRecord;

/// Unique identifier for an interned operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct OperationId(u64);

impl OperationId {
    /// Generate a new unique operation ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Key of a node: where it lives and what it is.
pub(crate) type NodeKey = (Location, Arc<str>);

/// Counters describing the work a graph has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    /// Handler runs of cacheable and one-shot actions.
    pub resolutions: u64,
    /// Requests answered by an existing cached action.
    pub cache_hits: u64,
    /// Non-cacheable actions executed.
    pub one_shots: u64,
    /// Propagation passes run.
    pub passes: u64,
    /// Observer deliveries made by propagation passes.
    pub notifications: u64,
    /// Actions removed from the store.
    pub disposals: u64,
}

/// A live subscription, as seen by inspection.
pub(crate) struct SubscriptionRecord {
    pub(crate) action: ActionId,
    pub(crate) debug: String,
}

/// Queue of pending invalidations.
#[derive(Default)]
pub(crate) struct Propagation {
    /// A pass is running; new seeds wait in the queue.
    pub(crate) active: bool,
    /// Handlers currently running. Passes never start underneath one.
    pub(crate) in_flight: usize,
    pub(crate) queue: IndexSet<ActionId>,
}

/// Backing store of one graph instance.
pub(crate) struct Store {
    nodes: HashMap<NodeId, Arc<Node>>,
    node_keys: HashMap<NodeKey, NodeId>,
    node_refs: HashMap<NodeId, usize>,

    operations: HashMap<OperationId, Operation>,
    operation_keys: HashMap<Arc<str>, OperationId>,
    operation_refs: HashMap<OperationId, usize>,

    actions: IndexMap<ActionId, ActionRecord>,
    requests: HashMap<(NodeId, OperationId), ActionId>,
    node_index: HashMap<NodeId, IndexSet<ActionId>>,

    variables: HashMap<NodeKey, Json>,
    scopes: IndexMap<ScopeId, Definition>,
    contexts: IndexSet<ContextId>,

    pub(crate) subscriptions: IndexMap<SubscriptionId, SubscriptionRecord>,
    pub(crate) propagation: Propagation,
    pub(crate) stats: Stats,
}

impl Store {
    /// Create a store whose root scope is `root`.
    pub(crate) fn new(root: Definition) -> Self {
        let mut scopes = IndexMap::new();
        scopes.insert(ScopeId::ROOT, root);
        let mut contexts = IndexSet::new();
        contexts.insert(ContextId::ROOT);

        Self {
            nodes: HashMap::new(),
            node_keys: HashMap::new(),
            node_refs: HashMap::new(),
            operations: HashMap::new(),
            operation_keys: HashMap::new(),
            operation_refs: HashMap::new(),
            actions: IndexMap::new(),
            requests: HashMap::new(),
            node_index: HashMap::new(),
            variables: HashMap::new(),
            scopes,
            contexts,
            subscriptions: IndexMap::new(),
            propagation: Propagation::default(),
            stats: Stats::default(),
        }
    }

    // ------------------------------------------------------------------------
    // Scopes and contexts
    // ------------------------------------------------------------------------

    pub(crate) fn add_scope(&mut self, root: Definition) -> ScopeId {
        let id = ScopeId::new();
        self.scopes.insert(id, root);
        id
    }

    pub(crate) fn add_context(&mut self) -> ContextId {
        let id = ContextId::new();
        self.contexts.insert(id);
        id
    }

    pub(crate) fn scope_root(&self, scope: ScopeId) -> Result<&Definition, GraphError> {
        self.scopes
            .get(&scope)
            .ok_or_else(|| GraphError::not_found("scope", scope.raw()))
    }

    pub(crate) fn check_location(&self, location: Location) -> Result<(), GraphError> {
        self.scope_root(location.scope)?;
        if !self.contexts.contains(&location.context) {
            return Err(GraphError::not_found("context", location.context.raw()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------------

    /// Return the node for `definition` at `location`, registering it if new.
    pub(crate) fn get_or_create_node(
        &mut self,
        location: Location,
        definition: &Definition,
    ) -> Arc<Node> {
        let key = (location, Arc::clone(definition.identity()));
        if let Some(id) = self.node_keys.get(&key) {
            if let Some(node) = self.nodes.get(id) {
                return Arc::clone(node);
            }
        }

        let node = Arc::new(Node::new(NodeId::new(), location, definition.clone()));
        self.node_keys.insert(key, node.id());
        self.nodes.insert(node.id(), Arc::clone(&node));
        node
    }

    /// Look a node up without registering it.
    pub(crate) fn find_node(&self, location: Location, definition: &Definition) -> Option<&Arc<Node>> {
        let key = (location, Arc::clone(definition.identity()));
        self.node_keys.get(&key).and_then(|id| self.nodes.get(id))
    }

    pub(crate) fn get_node(&self, id: NodeId) -> Result<&Arc<Node>, GraphError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| GraphError::not_found("node", id.raw()))
    }

    pub(crate) fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    fn retain_node(&mut self, id: NodeId) {
        *self.node_refs.entry(id).or_insert(0) += 1;
    }

    fn release_node(&mut self, id: NodeId) {
        let remaining = match self.node_refs.get_mut(&id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining > 0 {
            return;
        }

        self.node_refs.remove(&id);
        self.node_index.remove(&id);
        if let Some(node) = self.nodes.remove(&id) {
            self.node_keys
                .remove(&(node.location(), Arc::clone(node.definition().identity())));
        }
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    fn intern_operation(&mut self, operation: &Operation) -> OperationId {
        if let Some(id) = self.operation_keys.get(operation.identity()) {
            *self.operation_refs.entry(*id).or_insert(0) += 1;
            return *id;
        }

        let id = OperationId::new();
        self.operation_keys.insert(Arc::clone(operation.identity()), id);
        self.operations.insert(id, operation.clone());
        self.operation_refs.insert(id, 1);
        id
    }

    fn release_operation(&mut self, id: OperationId) {
        let remaining = match self.operation_refs.get_mut(&id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining > 0 {
            return;
        }

        self.operation_refs.remove(&id);
        if let Some(operation) = self.operations.remove(&id) {
            self.operation_keys.remove(operation.identity());
        }
    }

    pub(crate) fn get_operation(&self, id: OperationId) -> Result<&Operation, GraphError> {
        self.operations
            .get(&id)
            .ok_or_else(|| GraphError::not_found("operation", id.raw()))
    }

    pub(crate) fn operations(&self) -> impl Iterator<Item = (&OperationId, &Operation)> {
        self.operations.iter()
    }

    // ------------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------------

    pub(crate) fn get_action(&self, id: ActionId) -> Result<&ActionRecord, GraphError> {
        self.actions
            .get(&id)
            .ok_or_else(|| GraphError::not_found("action", id.raw()))
    }

    pub(crate) fn get_action_mut(&mut self, id: ActionId) -> Result<&mut ActionRecord, GraphError> {
        self.actions
            .get_mut(&id)
            .ok_or_else(|| GraphError::not_found("action", id.raw()))
    }

    pub(crate) fn try_action(&self, id: ActionId) -> Option<&ActionRecord> {
        self.actions.get(&id)
    }

    pub(crate) fn try_action_mut(&mut self, id: ActionId) -> Option<&mut ActionRecord> {
        self.actions.get_mut(&id)
    }

    pub(crate) fn actions(&self) -> impl Iterator<Item = &ActionRecord> {
        self.actions.values()
    }

    /// The cached action answering `operation` on `node`, if one is live.
    pub(crate) fn find_action(&self, node: NodeId, operation: &Operation) -> Option<ActionId> {
        let operation = self.operation_keys.get(operation.identity())?;
        self.requests.get(&(node, *operation)).copied()
    }

    /// Request-equivalence lookup: reuse a live cached action or register a
    /// new one. Non-cacheable operations always get a fresh action.
    ///
    /// Returns the action id and whether it was created.
    pub(crate) fn acquire(&mut self, node: &Node, operation: &Operation) -> (ActionId, bool) {
        if operation.is_cacheable() {
            if let Some(id) = self.find_action(node.id(), operation) {
                self.stats.cache_hits += 1;
                tracing::trace!(action = %id, %operation, "cache hit");
                return (id, false);
            }
        }

        let operation_id = self.intern_operation(operation);
        let record = ActionRecord::new(node.id(), operation_id, operation.is_cacheable());
        let id = record.id;
        if record.cacheable {
            self.requests.insert((node.id(), operation_id), id);
        }
        self.node_index.entry(node.id()).or_default().insert(id);
        self.retain_node(node.id());
        self.actions.insert(id, record);

        tracing::trace!(action = %id, node = %node.id(), %operation, "cache miss");
        (id, true)
    }

    /// Live actions targeting `node`.
    pub(crate) fn index_actions_for_node(&self, node: NodeId) -> Vec<ActionId> {
        self.node_index
            .get(&node)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|id| self.actions.contains_key(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record that `parent` read `child`.
    pub(crate) fn add_edge(&mut self, parent: ActionId, child: ActionId) {
        if let Some(record) = self.actions.get_mut(&child) {
            record.dependents.insert(parent);
        }
        if let Some(record) = self.actions.get_mut(&parent) {
            record.dependencies.insert(child);
        }
    }

    /// Store a completed resolution.
    ///
    /// Swaps the dependency set for the one recorded during this run,
    /// releases dependencies that were not read again and returns whether
    /// the result node changed.
    pub(crate) fn complete_action(
        &mut self,
        id: ActionId,
        result: NodeId,
        dependencies: IndexSet<ActionId>,
        cleanups: &mut Vec<Cleanup>,
    ) -> Result<bool, GraphError> {
        let state = match self.get_node(result)?.kind() {
            NodeKind::Error => ActionState::Error,
            NodeKind::Pending => ActionState::Pending,
            _ => ActionState::Resolved,
        };

        let record = self.get_action_mut(id)?;
        record.resolving = false;
        record.resolutions += 1;
        record.state = state;
        let previous = record.result.replace(result);
        let stale: Vec<ActionId> = record
            .dependencies
            .iter()
            .copied()
            .filter(|dep| !dependencies.contains(dep))
            .collect();
        record.dependencies = dependencies;

        self.retain_node(result);
        if let Some(previous) = previous {
            self.release_node(previous);
        }

        for dep in stale {
            if let Some(child) = self.actions.get_mut(&dep) {
                child.dependents.swap_remove(&id);
            }
            self.collect(dep, cleanups);
        }
        self.collect(id, cleanups);

        Ok(previous != Some(result))
    }

    /// Undo a run that failed with an integrity error: keep the previous
    /// dependencies and drop the edges added during the run.
    pub(crate) fn abort_action(
        &mut self,
        id: ActionId,
        added: &IndexSet<ActionId>,
        cleanups: &mut Vec<Cleanup>,
    ) {
        let kept: IndexSet<ActionId> = match self.actions.get_mut(&id) {
            Some(record) => {
                record.resolving = false;
                record.dependencies.clone()
            }
            None => IndexSet::new(),
        };
        for dep in added.iter().filter(|dep| !kept.contains(*dep)) {
            if let Some(child) = self.actions.get_mut(dep) {
                child.dependents.swap_remove(&id);
            }
            self.collect(*dep, cleanups);
        }
        self.collect(id, cleanups);
    }

    /// Remove an action and un-index it. Releases its node, result and
    /// operation; does not touch its dependencies.
    pub(crate) fn remove_action(&mut self, id: ActionId) -> Option<ActionRecord> {
        let mut record = self.actions.swap_remove(&id)?;
        record.state = ActionState::Disposed;

        if record.cacheable && self.requests.get(&(record.node, record.operation)) == Some(&id) {
            self.requests.remove(&(record.node, record.operation));
        }
        if let Some(ids) = self.node_index.get_mut(&record.node) {
            ids.swap_remove(&id);
        }
        if let Some(result) = record.result {
            self.release_node(result);
        }
        self.release_node(record.node);
        self.release_operation(record.operation);

        self.stats.disposals += 1;
        tracing::debug!(action = %id, "action disposed");
        Some(record)
    }

    /// Dispose `id` if nothing references it, then everything it alone kept
    /// alive. Cleanups are collected for the caller to run outside the lock.
    pub(crate) fn collect(&mut self, id: ActionId, cleanups: &mut Vec<Cleanup>) {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let collectable = self
                .actions
                .get(&id)
                .is_some_and(ActionRecord::is_collectable);
            if !collectable {
                continue;
            }
            if let Some(mut record) = self.remove_action(id) {
                cleanups.append(&mut record.cleanups);
                for dep in record.dependencies.drain(..) {
                    if let Some(child) = self.actions.get_mut(&dep) {
                        child.dependents.swap_remove(&id);
                    }
                    work.push(dep);
                }
            }
        }
    }

    /// Drop every action, node and subscription. Scopes, contexts and
    /// variable slots survive.
    pub(crate) fn clear(&mut self) -> Vec<Cleanup> {
        let mut cleanups = Vec::new();
        for (_, mut record) in self.actions.drain(..) {
            cleanups.append(&mut record.cleanups);
        }
        self.nodes.clear();
        self.node_keys.clear();
        self.node_refs.clear();
        self.operations.clear();
        self.operation_keys.clear();
        self.operation_refs.clear();
        self.requests.clear();
        self.node_index.clear();
        self.subscriptions.clear();
        self.propagation.queue.clear();
        cleanups
    }

    // ------------------------------------------------------------------------
    // Variable slots
    // ------------------------------------------------------------------------

    pub(crate) fn variable(&self, node: &Node) -> Option<&Json> {
        self.variables
            .get(&(node.location(), Arc::clone(node.definition().identity())))
    }

    pub(crate) fn write_variable(&mut self, node: &Node, value: Option<Json>) {
        let key = (node.location(), Arc::clone(node.definition().identity()));
        match value {
            Some(value) => {
                self.variables.insert(key, value);
            }
            None => {
                self.variables.remove(&key);
            }
        }
    }
}
