//! Resolution Context
//!
//! A [`ResolveCx`] is handed to every handler invocation. It knows which
//! action is running and records every action the handler reads, so the
//! dependency set of an action is exactly what its latest run touched.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexSet;
use serde_json::Map;

use super::{engine, Interrupt, Outcome};
use crate::config::GraphConfig;
use crate::error::{ErrorCode, ErrorInfo};
use crate::graph::Shared;
use crate::model::{Definition, DefinitionKind, Json, Location, Node, Operation};
use crate::propagate;
use crate::source::{Cleanup, Emitter, Source};
use crate::store::ActionId;

/// A child result as seen by a handler that tolerates pending and errors.
#[derive(Debug, Clone)]
pub enum Settled {
    /// The child produced a node.
    Ready(Arc<Node>),
    /// The child is pending.
    Pending,
    /// The child failed.
    Failed(ErrorInfo),
}

impl Settled {
    fn from_node(node: Arc<Node>) -> Self {
        match node.definition().kind() {
            DefinitionKind::Pending => Self::Pending,
            DefinitionKind::Error(info) => Self::Failed(info.clone()),
            _ => Self::Ready(node),
        }
    }

    /// Short-circuit pending and failed results.
    pub fn ready(self) -> Result<Arc<Node>, Interrupt> {
        match self {
            Self::Ready(node) => Ok(node),
            Self::Pending => Err(Interrupt::Pending),
            Self::Failed(info) => Err(Interrupt::Error(info)),
        }
    }
}

/// Handler-side view of the graph while one action runs.
pub struct ResolveCx<'g> {
    shared: &'g Shared,
    action: ActionId,
    location: Location,
    depth: usize,
    dependencies: IndexSet<ActionId>,
}

impl<'g> ResolveCx<'g> {
    pub(crate) fn new(shared: &'g Shared, action: ActionId, location: Location, depth: usize) -> Self {
        Self {
            shared,
            action,
            location,
            depth,
            dependencies: IndexSet::new(),
        }
    }

    pub(crate) fn into_dependencies(self) -> IndexSet<ActionId> {
        self.dependencies
    }

    /// The running action.
    pub fn action(&self) -> ActionId {
        self.action
    }

    /// Where the running action's node lives.
    pub fn location(&self) -> Location {
        self.location
    }

    /// Nesting depth of the running action.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The graph's configuration.
    pub fn config(&self) -> &GraphConfig {
        &self.shared.config
    }

    /// Register `definition` in the current location.
    pub fn node(&mut self, definition: &Definition) -> Arc<Node> {
        self.shared
            .store
            .lock()
            .get_or_create_node(self.location, definition)
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Apply `operation` to `definition` and return the result node.
    ///
    /// Pending and failed results interrupt the handler.
    pub fn resolve(&mut self, definition: &Definition, operation: &Operation) -> Result<Arc<Node>, Interrupt> {
        self.settle(definition, operation)?.ready()
    }

    /// [`resolve`](Self::resolve) for an already registered node.
    pub fn resolve_node(&mut self, node: &Node, operation: &Operation) -> Result<Arc<Node>, Interrupt> {
        self.settle_node(node, operation)?.ready()
    }

    /// Apply `operation` to `definition` without short-circuiting.
    pub fn settle(&mut self, definition: &Definition, operation: &Operation) -> Result<Settled, Interrupt> {
        let node = self.node(definition);
        self.settle_node(&node, operation)
    }

    /// [`settle`](Self::settle) for an already registered node.
    pub fn settle_node(&mut self, node: &Node, operation: &Operation) -> Result<Settled, Interrupt> {
        if !operation.is_cacheable() {
            let result = engine::execute_once(self.shared, node, operation, self.depth + 1)?;
            return Ok(Settled::from_node(result));
        }

        let (child, created) = {
            let mut store = self.shared.store.lock();
            let (child, created) = store.acquire(node, operation);
            if child == self.action || store.get_action(child)?.resolving {
                tracing::debug!(action = %self.action, child = %child, "cyclic request");
                return Ok(Settled::Failed(ErrorInfo::cyclic(child.raw())));
            }
            store.add_edge(self.action, child);
            (child, created)
        };
        self.dependencies.insert(child);

        if created {
            engine::run_action(self.shared, child, self.depth + 1)?;
        }

        let store = self.shared.store.lock();
        match store.get_action(child)?.result {
            Some(result) => Ok(Settled::from_node(Arc::clone(store.get_node(result)?))),
            None => Ok(Settled::Pending),
        }
    }

    /// Evaluate `definition` hop by hop until a static node is reached.
    ///
    /// Unlike [`resolve`](Self::resolve) this stops at the first static node,
    /// so arrays keep their item definitions.
    pub fn resolve_static(&mut self, definition: &Definition) -> Result<Arc<Node>, Interrupt> {
        let evaluate = Operation::evaluate();
        let mut node = self.node(definition);
        let mut seen = HashSet::new();
        while !node.definition().is_static() {
            if !seen.insert(node.id()) {
                return Err(Interrupt::Error(ErrorInfo::new(
                    ErrorCode::Cyclic,
                    format!("{} evaluates back to itself", node.definition()),
                )));
            }
            node = self.resolve_node(&node, &evaluate)?;
        }
        Settled::from_node(node).ready()
    }

    /// Apply a side-effecting operation to `node` and return its result.
    pub fn execute(&mut self, node: &Node, operation: &Operation) -> Outcome {
        let result = engine::execute_once(self.shared, node, operation, self.depth + 1)?;
        Ok(result.definition().clone())
    }

    // ------------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------------

    /// Resolve `definition` all the way down to JSON.
    ///
    /// Trees become objects and arrays become arrays; anything else that is
    /// not value-like is a type mismatch.
    pub fn resolve_value(&mut self, definition: &Definition) -> Result<Json, Interrupt> {
        let node = self.resolve(definition, &Operation::resolve())?;
        self.node_value(&node)
    }

    /// The JSON form of an already resolved node.
    pub fn node_value(&mut self, node: &Node) -> Result<Json, Interrupt> {
        if let Some(value) = node.definition().as_value() {
            return Ok(value);
        }
        match node.definition().kind() {
            DefinitionKind::Tree(branches) => {
                let mut object = Map::new();
                for (key, branch) in branches {
                    object.insert(key.clone(), self.resolve_value(branch)?);
                }
                Ok(Json::Object(object))
            }
            DefinitionKind::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Json::Array),
            _ => Err(Interrupt::Error(ErrorInfo::new(
                ErrorCode::TypeMismatch,
                format!("expected a value, found {}", node.kind()),
            ))),
        }
    }

    /// Resolve every definition to JSON.
    ///
    /// All of them are requested before any interruption is reported, so
    /// every dependency is recorded. An error wins over pending.
    pub fn resolve_all(&mut self, definitions: &[Definition]) -> Result<Vec<Json>, Interrupt> {
        let mut values = Vec::with_capacity(definitions.len());
        let mut pending = false;
        let mut failure = None;

        for definition in definitions {
            match self.resolve_value(definition) {
                Ok(value) => values.push(value),
                Err(Interrupt::Pending) => pending = true,
                Err(Interrupt::Error(info)) => {
                    failure.get_or_insert(info);
                }
                Err(fatal) => return Err(fatal),
            }
        }

        match (failure, pending) {
            (Some(info), _) => Err(Interrupt::Error(info)),
            (None, true) => Err(Interrupt::Pending),
            (None, false) => Ok(values),
        }
    }

    // ------------------------------------------------------------------------
    // Scope state
    // ------------------------------------------------------------------------

    /// The root definition of the current scope.
    pub fn scope_root(&self) -> Result<Definition, Interrupt> {
        let store = self.shared.store.lock();
        Ok(store.scope_root(self.location.scope)?.clone())
    }

    /// Current value of a variable node.
    pub fn variable(&self, node: &Node) -> Json {
        let store = self.shared.store.lock();
        if let Some(value) = store.variable(node) {
            return value.clone();
        }
        match node.definition().kind() {
            DefinitionKind::Variable { initial, .. } => initial.clone(),
            _ => Json::Null,
        }
    }

    /// Write (or with `None`, clear) a variable slot and invalidate the
    /// cached actions targeting it.
    pub fn write_variable(&mut self, node: &Node, value: Option<Json>) {
        let seeds = {
            let mut store = self.shared.store.lock();
            store.write_variable(node, value);
            store
                .index_actions_for_node(node.id())
                .into_iter()
                .filter(|id| store.try_action(*id).is_some_and(|record| record.cacheable))
                .collect::<Vec<_>>()
        };
        tracing::trace!(node = %node.id(), seeds = seeds.len(), "variable written");
        propagate::schedule(self.shared, seeds);
    }

    /// Register a cleanup to run when the current action is disposed.
    pub fn on_dispose(&mut self, cleanup: Cleanup) {
        let orphaned = {
            let mut store = self.shared.store.lock();
            match store.try_action_mut(self.action) {
                Some(record) => {
                    record.cleanups.push(cleanup);
                    None
                }
                None => Some(cleanup),
            }
        };
        if let Some(cleanup) = orphaned {
            cleanup();
        }
    }

    /// Connect `source` for the current action on first use and return the
    /// latest value it emitted.
    pub fn connect_source(&mut self, source: &Arc<dyn Source>) -> Result<Option<Definition>, Interrupt> {
        let emitter = {
            let mut store = self.shared.store.lock();
            let record = store.get_action_mut(self.action)?;
            if record.source.connection.is_some() {
                return Ok(record.source.latest.clone());
            }
            let emitter = Emitter::new(self.shared.weak(), self.action);
            record.source.connection = Some(emitter.token());
            emitter
        };

        tracing::debug!(action = %self.action, "connecting source");
        let cleanup = source.connect(emitter);
        self.on_dispose(cleanup);

        let store = self.shared.store.lock();
        Ok(store.get_action(self.action)?.source.latest.clone())
    }
}
