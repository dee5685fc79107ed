//! Asynchronous Sources
//!
//! A source node is backed by something that produces values over time: a
//! future, a channel, a timer. The graph connects a source the first time its
//! evaluation runs and keeps the connection for as long as the cached action
//! lives. Disposing the action runs the cleanup returned by `connect`, which
//! is how pending work gets cancelled.
//!
//! Each emission replaces the source's latest value and re-evaluates it
//! through the normal propagation path, so downstream nodes see sources like
//! any other changing input.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::ErrorInfo;
use crate::graph::Shared;
use crate::model::{identity::next_instance, Definition};
use crate::propagate;
use crate::store::ActionId;

/// Releases whatever a connection holds. Runs exactly once.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Something that produces definitions over time.
pub trait Source: Send + Sync {
    /// Start producing values into `emitter`.
    ///
    /// The returned cleanup runs when the connection is no longer needed.
    fn connect(&self, emitter: Emitter) -> Cleanup;
}

/// Handle a source uses to deliver values to the graph.
///
/// Emitters are cheap to clone and outlive neither the graph nor the
/// connection: emissions after disposal are dropped.
#[derive(Clone)]
pub struct Emitter {
    shared: Weak<Shared>,
    action: ActionId,
    token: u64,
}

impl Emitter {
    pub(crate) fn new(shared: Weak<Shared>, action: ActionId) -> Self {
        Self {
            shared,
            action,
            token: next_instance(),
        }
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    /// Deliver a new value.
    ///
    /// When called while the graph is idle this runs a propagation pass and
    /// notifies observers before returning.
    pub fn emit(&self, definition: Definition) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let _driver = shared.driver.lock();

        let schedule = {
            let mut store = shared.store.lock();
            match store.try_action_mut(self.action) {
                Some(record) if record.source.connection == Some(self.token) => {
                    record.source.latest = Some(definition);
                    !record.resolving
                }
                _ => {
                    tracing::trace!(action = %self.action, "dropping stale emission");
                    false
                }
            }
        };

        if schedule {
            propagate::schedule(&shared, [self.action]);
            if let Err(error) = propagate::flush(&shared) {
                tracing::error!(%error, action = %self.action, "propagation after emission failed");
            }
        }
    }

    /// Deliver a failure.
    pub fn fail(&self, info: impl Into<ErrorInfo>) {
        self.emit(Definition::error(info));
    }

    /// Whether the connection this emitter belongs to is still live.
    pub fn is_connected(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let store = shared.store.lock();
        store
            .try_action(self.action)
            .is_some_and(|record| record.source.connection == Some(self.token))
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("action", &self.action)
            .field("token", &self.token)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Closure sources
// ----------------------------------------------------------------------------

struct FnSource<F>(F);

impl<F> Source for FnSource<F>
where
    F: Fn(Emitter) -> Cleanup + Send + Sync,
{
    fn connect(&self, emitter: Emitter) -> Cleanup {
        (self.0)(emitter)
    }
}

/// A source node driven by a closure.
pub fn from_fn<F>(connect: F) -> Definition
where
    F: Fn(Emitter) -> Cleanup + Send + Sync + 'static,
{
    Definition::source(Arc::new(FnSource(connect)))
}

// ----------------------------------------------------------------------------
// Future sources
// ----------------------------------------------------------------------------

type BoxFuture = Pin<Box<dyn Future<Output = Result<Definition, ErrorInfo>> + Send>>;

struct FutureSource {
    make: Box<dyn Fn() -> BoxFuture + Send + Sync>,
}

impl Source for FutureSource {
    fn connect(&self, emitter: Emitter) -> Cleanup {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let future = (self.make)();
                let task = handle.spawn(async move {
                    let definition = future.await.unwrap_or_else(Definition::error);
                    emitter.emit(definition);
                });
                Box::new(move || task.abort())
            }
            Err(_) => {
                emitter.fail(ErrorInfo::resolution(
                    "future-backed source requires a tokio runtime",
                ));
                Box::new(|| {})
            }
        }
    }
}

/// A source node that runs a future on the current tokio runtime.
///
/// A new future is created for every connection. Disposing the node aborts
/// the task.
pub fn from_future<F, Fut>(make: F) -> Definition
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Definition, ErrorInfo>> + Send + 'static,
{
    Definition::source(Arc::new(FutureSource {
        make: Box::new(move || Box::pin(make())),
    }))
}

// ----------------------------------------------------------------------------
// Deferred
// ----------------------------------------------------------------------------

#[derive(Default)]
struct DeferredState {
    emitters: Vec<Emitter>,
    value: Option<Definition>,
    connections: usize,
    cancellations: usize,
}

/// A source settled by hand.
///
/// Connections made after [`Deferred::resolve`] receive the value
/// immediately.
#[derive(Clone, Default)]
pub struct Deferred {
    state: Arc<Mutex<DeferredState>>,
}

impl Deferred {
    /// Create an unsettled source.
    pub fn new() -> Self {
        Self::default()
    }

    /// A source definition backed by this deferred value.
    ///
    /// Every call creates a distinct node identity; keep the returned
    /// definition to refer to the same node.
    pub fn definition(&self) -> Definition {
        Definition::source(Arc::new(self.clone()))
    }

    /// Settle with a value, notifying live connections.
    pub fn resolve(&self, definition: Definition) {
        let emitters = {
            let mut state = self.state.lock();
            state.value = Some(definition.clone());
            state.emitters.clone()
        };
        for emitter in emitters {
            emitter.emit(definition.clone());
        }
    }

    /// Settle with an error.
    pub fn reject(&self, info: impl Into<ErrorInfo>) {
        self.resolve(Definition::error(info));
    }

    /// Number of connections made so far.
    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    /// Number of connections cleaned up so far.
    pub fn cancellations(&self) -> usize {
        self.state.lock().cancellations
    }

    /// Whether any connection is live.
    pub fn is_connected(&self) -> bool {
        !self.state.lock().emitters.is_empty()
    }
}

impl Source for Deferred {
    fn connect(&self, emitter: Emitter) -> Cleanup {
        let token = emitter.token();
        let value = {
            let mut state = self.state.lock();
            state.connections += 1;
            state.emitters.push(emitter.clone());
            state.value.clone()
        };
        if let Some(value) = value {
            emitter.emit(value);
        }

        let state = Arc::clone(&self.state);
        Box::new(move || {
            let mut state = state.lock();
            state.emitters.retain(|emitter| emitter.token() != token);
            state.cancellations += 1;
        })
    }
}
