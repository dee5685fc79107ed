//! Resolution engine: running actions and managing their references.
//!
//! Every function here expects the caller to hold the graph's driver lock.
//! The store lock is only taken for bookkeeping and is always released
//! before a handler, observer or cleanup runs.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::{Interrupt, ResolveCx};
use crate::error::{ErrorCode, ErrorInfo, GraphError};
use crate::graph::Shared;
use crate::model::{Definition, Node, NodeKind, Operation};
use crate::source::Cleanup;
use crate::store::{ActionId, ActionState, SubscriptionRecord};
use crate::subscription::{GraphResult, Observer, Subscription, SubscriptionId};

/// Run cleanups collected from disposed actions.
pub(crate) fn run_cleanups(cleanups: Vec<Cleanup>) {
    for cleanup in cleanups {
        cleanup();
    }
}

/// Run the handler of `id` and store its result.
///
/// Returns whether the result node changed.
pub(crate) fn run_action(shared: &Shared, id: ActionId, depth: usize) -> Result<bool, GraphError> {
    let (node, operation) = {
        let mut store = shared.store.lock();
        let record = store.get_action_mut(id)?;
        record.resolving = true;
        if record.state == ActionState::Uninitialized {
            record.state = ActionState::Pending;
        }
        let (node, operation) = (record.node, record.operation);
        let node = Arc::clone(store.get_node(node)?);
        let operation = store.get_operation(operation)?.clone();
        store.stats.resolutions += 1;
        store.propagation.in_flight += 1;
        (node, operation)
    };
    tracing::trace!(action = %id, node = %node.id(), %operation, depth, "running action");

    let mut cx = ResolveCx::new(shared, id, node.location(), depth);
    let outcome = if matches!(node.kind(), NodeKind::Error | NodeKind::Pending) {
        Ok(node.definition().clone())
    } else if depth > shared.config.max_depth {
        Err(Interrupt::Error(ErrorInfo::new(
            ErrorCode::DepthExceeded,
            format!("resolution exceeded {} nested actions", shared.config.max_depth),
        )))
    } else {
        dispatch(shared, &mut cx, &node, &operation)
    };
    let dependencies = cx.into_dependencies();

    let mut cleanups = Vec::new();
    let completed = {
        let mut store = shared.store.lock();
        store.propagation.in_flight = store.propagation.in_flight.saturating_sub(1);
        let result = match outcome {
            Ok(definition) => Ok(definition),
            Err(Interrupt::Pending) => Ok(Definition::pending()),
            Err(Interrupt::Error(info)) => Ok(Definition::error(info)),
            Err(Interrupt::Fatal(error)) => Err(error),
        };
        match result {
            Ok(definition) => {
                let result = store.get_or_create_node(node.location(), &definition);
                store.complete_action(id, result.id(), dependencies, &mut cleanups)
            }
            Err(error) => {
                store.abort_action(id, &dependencies, &mut cleanups);
                Err(error)
            }
        }
    };
    run_cleanups(cleanups);
    completed
}

fn dispatch(shared: &Shared, cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> super::Outcome {
    if !shared.config.catch_panics {
        return shared.registry.dispatch(cx, node, operation);
    }
    match panic::catch_unwind(AssertUnwindSafe(|| shared.registry.dispatch(cx, node, operation))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            tracing::warn!(node = %node.id(), %operation, %message, "handler panicked");
            Err(Interrupt::Error(ErrorInfo::new(ErrorCode::Panic, message)))
        }
    }
}

/// Run a side-effecting operation once and dispose its action.
pub(crate) fn execute_once(
    shared: &Shared,
    node: &Node,
    operation: &Operation,
    depth: usize,
) -> Result<Arc<Node>, GraphError> {
    let id = {
        let mut store = shared.store.lock();
        let (id, _) = store.acquire(node, operation);
        store.get_action_mut(id)?.holds += 1;
        store.stats.one_shots += 1;
        id
    };

    let run = run_action(shared, id, depth);
    let result = {
        let store = shared.store.lock();
        store
            .get_action(id)
            .and_then(|record| record.result.ok_or_else(|| GraphError::not_found("result", id.raw())))
            .and_then(|result| store.get_node(result).cloned())
    };
    release(shared, id);
    run?;
    result
}

/// Take a hold on the action for `operation` on `node`, running it if it
/// is new.
pub(crate) fn hold(shared: &Shared, node: &Node, operation: &Operation) -> Result<ActionId, GraphError> {
    let (id, created) = {
        let mut store = shared.store.lock();
        let (id, created) = store.acquire(node, operation);
        store.get_action_mut(id)?.holds += 1;
        (id, created)
    };
    if created {
        if let Err(error) = run_action(shared, id, 0) {
            release(shared, id);
            return Err(error);
        }
    }
    Ok(id)
}

/// Take another hold on a live action.
pub(crate) fn hold_existing(shared: &Shared, id: ActionId) -> Result<(), GraphError> {
    shared.store.lock().get_action_mut(id)?.holds += 1;
    Ok(())
}

/// Drop a hold, disposing the action if nothing else references it.
pub(crate) fn release(shared: &Shared, id: ActionId) {
    let mut cleanups = Vec::new();
    {
        let mut store = shared.store.lock();
        if let Some(record) = store.try_action_mut(id) {
            record.holds = record.holds.saturating_sub(1);
        }
        store.collect(id, &mut cleanups);
    }
    run_cleanups(cleanups);
}

/// Attach an observer to an action the caller already holds. The hold
/// becomes the subscription's. The latest result is replayed at once.
pub(crate) fn observe(
    shared: &Shared,
    action: ActionId,
    observer: Observer,
    debug: impl Into<String>,
) -> Result<Subscription, GraphError> {
    let id = SubscriptionId::new();
    let latest = {
        let mut store = shared.store.lock();
        let record = store.get_action_mut(action)?;
        record.observers.insert(id, Arc::clone(&observer));
        let latest = record.result;
        store.subscriptions.insert(
            id,
            SubscriptionRecord {
                action,
                debug: debug.into(),
            },
        );
        match latest {
            Some(result) => Some(GraphResult::from_node(store.get_node(result)?)),
            None => None,
        }
    };
    tracing::debug!(subscription = %id, %action, "subscribed");

    let subscription = Subscription::new(shared.weak(), id, action);
    if let Some(latest) = latest {
        observer(&latest);
    }
    Ok(subscription)
}

/// Detach an observer and release its hold.
pub(crate) fn unobserve(shared: &Shared, id: SubscriptionId, action: ActionId) {
    let _driver = shared.driver.lock();
    let removed = {
        let mut store = shared.store.lock();
        store.subscriptions.swap_remove(&id);
        store
            .try_action_mut(action)
            .and_then(|record| record.observers.swap_remove(&id))
    };
    if removed.is_some() {
        tracing::debug!(subscription = %id, %action, "unsubscribed");
        release(shared, action);
    }
}

/// The latest result of a live action.
pub(crate) fn current_result(shared: &Shared, id: ActionId) -> Result<GraphResult, GraphError> {
    let store = shared.store.lock();
    match store.get_action(id)?.result {
        Some(result) => Ok(GraphResult::from_node(store.get_node(result)?)),
        None => Ok(GraphResult::Pending),
    }
}
