//! Graph Instances
//!
//! A [`Graph`] owns one store, one handler registry and one configuration.
//! Graphs are independent: nothing is shared through globals, so several can
//! live in the same process.
//!
//! # Driving the graph
//!
//! Every public entry point takes the graph's driver lock, a re-entrant
//! mutex. Only one thread drives a graph at a time, but the driving thread
//! may re-enter freely: observers and handlers can call back into the graph.
//! Work requested while a propagation pass is running is queued and drained
//! before the outermost call returns.
//!
//! Synchronous chains therefore deliver within the triggering call. Values
//! produced by asynchronous sources are delivered when they are emitted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use serde::Serialize;
use tracing::span::EnteredSpan;

use crate::config::GraphConfig;
use crate::error::GraphError;
use crate::inspect::{self, Snapshot};
use crate::model::{ContextId, Definition, Json, Location, Node, Operation, ScopeId};
use crate::propagate;
use crate::resolve::{engine, Registry};
use crate::store::{Stats, Store};
use crate::subscription::{ActionHandle, GraphResult, Subscription};

/// State shared by a graph and the handles it gives out.
pub(crate) struct Shared {
    this: Weak<Shared>,
    pub(crate) store: Mutex<Store>,
    pub(crate) driver: ReentrantMutex<()>,
    pub(crate) registry: Registry,
    pub(crate) config: GraphConfig,
    disposed: AtomicBool,
}

impl Shared {
    pub(crate) fn weak(&self) -> Weak<Shared> {
        self.this.clone()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let cleanups = self.store.get_mut().clear();
        engine::run_cleanups(cleanups);
    }
}

struct Entered<'a> {
    _span: EnteredSpan,
    _driver: ReentrantMutexGuard<'a, ()>,
}

/// A dataflow graph.
///
/// Cloning is cheap; clones drive the same graph. A clone made with
/// [`at`](Self::at) addresses another scope or context.
///
/// ```rust
/// use trellis_core::{Definition, Graph, GraphResult};
/// use serde_json::json;
///
/// let name = Definition::variable("first");
/// let graph = Graph::new(Definition::tree([("name", name.clone())]));
///
/// let greeting = Definition::map(Definition::reference(["name"]), |name| {
///     json!(format!("hello {}", name.as_str().unwrap_or_default()))
/// });
/// assert_eq!(graph.get(greeting.clone()).unwrap(), GraphResult::Value(json!("hello first")));
///
/// graph.set(name, "second").unwrap();
/// assert_eq!(graph.get(greeting).unwrap(), GraphResult::Value(json!("hello second")));
/// ```
#[derive(Clone)]
pub struct Graph {
    shared: Arc<Shared>,
    location: Location,
}

impl Graph {
    /// Create a graph whose root scope is `root`.
    pub fn new(root: impl Into<Definition>) -> Self {
        Self::with_config(root, GraphConfig::default())
    }

    /// Create a graph with a custom configuration.
    pub fn with_config(root: impl Into<Definition>, config: GraphConfig) -> Self {
        Self::with_registry(root, config, Registry::standard())
    }

    /// Create a graph with a custom configuration and handler registry.
    pub fn with_registry(root: impl Into<Definition>, config: GraphConfig, registry: Registry) -> Self {
        let root = root.into();
        tracing::debug!(label = %config.label, root = %root, "graph created");
        let shared = Arc::new_cyclic(|this| Shared {
            this: this.clone(),
            store: Mutex::new(Store::new(root)),
            driver: ReentrantMutex::new(()),
            registry,
            config,
            disposed: AtomicBool::new(false),
        });
        Self {
            shared,
            location: Location::ROOT,
        }
    }

    /// The configuration.
    pub fn config(&self) -> &GraphConfig {
        &self.shared.config
    }

    /// The handler registry.
    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// The scope and context this handle addresses.
    pub fn location(&self) -> Location {
        self.location
    }

    /// A handle on the same graph addressing another location.
    pub fn at(&self, location: Location) -> Result<Graph, GraphError> {
        let _entered = self.enter()?;
        self.shared.store.lock().check_location(location)?;
        Ok(Self {
            shared: Arc::clone(&self.shared),
            location,
        })
    }

    /// Add a scope rooted at `root`. Scopes share nothing with each other.
    pub fn create_scope(&self, root: impl Into<Definition>) -> Result<ScopeId, GraphError> {
        let _entered = self.enter()?;
        let scope = self.shared.store.lock().add_scope(root.into());
        tracing::debug!(%scope, "scope created");
        Ok(scope)
    }

    /// Add a context: a fresh set of variable slots over the same scopes.
    pub fn fork_context(&self) -> Result<ContextId, GraphError> {
        let _entered = self.enter()?;
        let context = self.shared.store.lock().add_context();
        tracing::debug!(%context, "context created");
        Ok(context)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Observe the resolved value of `definition`.
    ///
    /// The current result is delivered before this returns; later results
    /// are delivered whenever they change.
    pub fn subscribe<F>(&self, definition: impl Into<Definition>, observer: F) -> Result<Subscription, GraphError>
    where
        F: Fn(&GraphResult) + Send + Sync + 'static,
    {
        let definition = definition.into();
        let _entered = self.enter()?;
        let node = self.node(&definition)?;
        let action = engine::hold(&self.shared, &node, &Operation::resolve())?;
        let subscription = engine::observe(&self.shared, action, Arc::new(observer), definition.to_string());
        if subscription.is_err() {
            engine::release(&self.shared, action);
        }
        propagate::flush(&self.shared)?;
        subscription
    }

    /// Apply `operation` to `definition`.
    ///
    /// Cacheable operations return a handle on the shared cached action.
    /// Side-effecting operations run once and the handle carries their
    /// result.
    pub fn resolve(&self, definition: impl Into<Definition>, operation: Operation) -> Result<ActionHandle, GraphError> {
        let definition = definition.into();
        let _entered = self.enter()?;
        let node = self.node(&definition)?;
        let handle = if operation.is_cacheable() {
            let action = engine::hold(&self.shared, &node, &operation)?;
            ActionHandle::cached(self.shared.weak(), action)
        } else {
            let result = engine::execute_once(&self.shared, &node, &operation, 0)?;
            ActionHandle::one_shot(self.shared.weak(), GraphResult::from_node(&result))
        };
        propagate::flush(&self.shared)?;
        Ok(handle)
    }

    /// Read the resolved value of `definition` once.
    ///
    /// Nothing stays cached unless something else holds it.
    pub fn get(&self, definition: impl Into<Definition>) -> Result<GraphResult, GraphError> {
        let definition = definition.into();
        let _entered = self.enter()?;
        let node = self.node(&definition)?;
        let action = engine::hold(&self.shared, &node, &Operation::resolve())?;
        let result = engine::current_result(&self.shared, action);
        engine::release(&self.shared, action);
        propagate::flush(&self.shared)?;
        result
    }

    /// Wait until `definition` resolves to something other than pending.
    pub async fn settle(&self, definition: impl Into<Definition>) -> Result<GraphResult, GraphError> {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        let sender = Mutex::new(Some(sender));
        let subscription = self.subscribe(definition, move |result| {
            if result.is_pending() {
                return;
            }
            if let Some(sender) = sender.lock().take() {
                let _ = sender.send(result.clone());
            }
        })?;
        let result = receiver.await.map_err(|_| GraphError::Disposed);
        subscription.dispose();
        result
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Write a variable. `definition` may be the variable itself or any
    /// path that evaluates to it.
    pub fn set(&self, definition: impl Into<Definition>, value: impl Into<Json>) -> Result<GraphResult, GraphError> {
        self.execute(definition.into(), Operation::set(value))
    }

    /// [`set`](Self::set) for any serialisable value.
    pub fn set_serialized<T: Serialize + ?Sized>(
        &self,
        definition: impl Into<Definition>,
        value: &T,
    ) -> Result<GraphResult, GraphError> {
        self.execute(definition.into(), Operation::set_serialized(value)?)
    }

    /// Restore a variable's initial value.
    pub fn reset(&self, definition: impl Into<Definition>) -> Result<GraphResult, GraphError> {
        self.execute(definition.into(), Operation::reset())
    }

    /// Invoke an action node.
    pub fn call(&self, definition: impl Into<Definition>, args: Vec<Json>) -> Result<GraphResult, GraphError> {
        self.execute(definition.into(), Operation::call(args))
    }

    /// Re-run every cached action targeting `definition` and propagate.
    ///
    /// Useful for computed nodes reading state outside the graph.
    pub fn invalidate(&self, definition: impl Into<Definition>) -> Result<(), GraphError> {
        let definition = definition.into();
        let _entered = self.enter()?;
        let seeds = {
            let store = self.shared.store.lock();
            store.check_location(self.location)?;
            match store.find_node(self.location, &definition) {
                Some(node) => store.index_actions_for_node(node.id()),
                None => Vec::new(),
            }
        };
        tracing::debug!(definition = %definition, seeds = seeds.len(), "invalidated");
        propagate::schedule(&self.shared, seeds);
        propagate::flush(&self.shared)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Point-in-time dump of the store.
    pub fn inspect(&self) -> Result<Snapshot, GraphError> {
        let _entered = self.enter()?;
        let store = self.shared.store.lock();
        Ok(inspect::snapshot(&store, &self.shared.registry))
    }

    /// Work counters.
    pub fn stats(&self) -> Stats {
        self.shared.store.lock().stats
    }

    /// Tear down every cached action and run their cleanups.
    ///
    /// Later calls fail with [`GraphError::Disposed`]; outstanding
    /// subscriptions become inert.
    pub fn dispose(&self) {
        let _driver = self.shared.driver.lock();
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let cleanups = self.shared.store.lock().clear();
        tracing::debug!(label = %self.shared.config.label, cleanups = cleanups.len(), "graph disposed");
        engine::run_cleanups(cleanups);
    }

    /// Whether [`dispose`](Self::dispose) ran.
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    fn enter(&self) -> Result<Entered<'_>, GraphError> {
        let span = tracing::debug_span!("graph", label = %self.shared.config.label).entered();
        let driver = self.shared.driver.lock();
        if self.is_disposed() {
            return Err(GraphError::Disposed);
        }
        Ok(Entered {
            _span: span,
            _driver: driver,
        })
    }

    fn node(&self, definition: &Definition) -> Result<Arc<Node>, GraphError> {
        let mut store = self.shared.store.lock();
        store.check_location(self.location)?;
        Ok(store.get_or_create_node(self.location, definition))
    }

    fn execute(&self, definition: Definition, operation: Operation) -> Result<GraphResult, GraphError> {
        let _entered = self.enter()?;
        let node = self.node(&definition)?;
        let result = engine::execute_once(&self.shared, &node, &operation, 0)?;
        propagate::flush(&self.shared)?;
        Ok(GraphResult::from_node(&result))
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("label", &self.shared.config.label)
            .field("location", &self.location)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn empty() -> Definition {
        Definition::tree(Vec::<(String, Definition)>::new())
    }

    #[test]
    fn disposed_graph_rejects_calls() {
        let graph = Graph::new(empty());
        graph.dispose();
        assert!(graph.is_disposed());
        assert_eq!(graph.get(Definition::value(1)), Err(GraphError::Disposed));
        graph.dispose();
    }

    #[test]
    fn unknown_locations_are_not_found() {
        let graph = Graph::new(empty());
        let location = Location::new(ScopeId::new(), ContextId::ROOT);
        assert!(matches!(
            graph.at(location),
            Err(GraphError::NotFound { kind: "scope", .. })
        ));
    }

    #[test]
    fn scopes_have_their_own_roots() {
        let graph = Graph::new(Definition::tree([("a", Definition::value(1))]));
        let scope = graph
            .create_scope(Definition::tree([("a", Definition::value(2))]))
            .unwrap();
        let other = graph.at(Location::new(scope, ContextId::ROOT)).unwrap();

        let a = Definition::reference(["a"]);
        assert_eq!(graph.get(a.clone()).unwrap(), GraphResult::Value(json!(1)));
        assert_eq!(other.get(a).unwrap(), GraphResult::Value(json!(2)));
    }

    #[test]
    fn one_shot_reads_leave_nothing_cached() {
        let graph = Graph::new(empty());
        graph.get(Definition::value("foo")).unwrap();
        let snapshot = graph.inspect().unwrap();
        assert!(snapshot.cache.actions.is_empty());
        assert!(snapshot.cache.nodes.is_empty());
    }
}
