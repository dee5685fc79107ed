//! Invalidation & Propagation
//!
//! When an input changes (a variable is written, a source emits, or a caller
//! invalidates a node) the cached actions that read it must re-run, and so
//! must everything that read *them*.
//!
//! # Algorithm
//!
//! Invalidations are queued as seed actions. A pass takes the whole queue and:
//!
//! 1. Walks `dependents` edges breadth-first from the seeds, with a visited
//!    set, to collect every action that may be affected.
//! 2. Sorts them topologically (dependencies before dependents).
//! 3. Re-runs each seed, and each other action only if one of its
//!    dependencies produced a different result node in this pass.
//! 4. Notifies the observers of every action whose result changed, once,
//!    after the whole pass.
//!
//! Invalidations raised while a pass is running (by handlers or observers)
//! wait in the queue and are drained by a follow-up pass, so one pass never
//! visits an action twice.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::error::GraphError;
use crate::graph::Shared;
use crate::resolve::engine;
use crate::store::{ActionId, Store};
use crate::subscription::{GraphResult, Observer, SubscriptionId};

/// Queue actions for re-resolution.
pub(crate) fn schedule(shared: &Shared, seeds: impl IntoIterator<Item = ActionId>) {
    shared.store.lock().propagation.queue.extend(seeds);
}

/// Drain the queue.
///
/// Does nothing while a pass or a handler is already running; the outermost
/// caller drains what was queued underneath it.
pub(crate) fn flush(shared: &Shared) -> Result<(), GraphError> {
    {
        let mut store = shared.store.lock();
        let propagation = &mut store.propagation;
        if propagation.active || propagation.in_flight > 0 || propagation.queue.is_empty() {
            return Ok(());
        }
        propagation.active = true;
    }

    let outcome = loop {
        let seeds: Vec<ActionId> = shared.store.lock().propagation.queue.drain(..).collect();
        if seeds.is_empty() {
            break Ok(());
        }
        if let Err(error) = run_pass(shared, seeds) {
            break Err(error);
        }
    };

    shared.store.lock().propagation.active = false;
    outcome
}

fn run_pass(shared: &Shared, seeds: Vec<ActionId>) -> Result<(), GraphError> {
    let order = {
        let mut store = shared.store.lock();
        store.stats.passes += 1;
        let affected = collect_affected(&store, &seeds);
        topological_sort(&store, affected)
    };
    tracing::debug!(seeds = seeds.len(), affected = order.len(), "propagation pass");

    let seeds: HashSet<ActionId> = seeds.into_iter().collect();
    let mut changed = Vec::new();
    let mut changed_set = HashSet::new();

    for &id in &order {
        let stale = {
            let store = shared.store.lock();
            match store.try_action(id) {
                Some(record) if !record.resolving => {
                    seeds.contains(&id)
                        || record.dependencies.iter().any(|dep| changed_set.contains(dep))
                }
                _ => false,
            }
        };
        if stale && engine::run_action(shared, id, 0)? {
            changed.push(id);
            changed_set.insert(id);
        }
    }

    let deliveries = {
        let mut store = shared.store.lock();

        // Readers attached during this pass were not part of the ordering.
        let visited: HashSet<ActionId> = order.iter().copied().collect();
        let late: Vec<ActionId> = changed
            .iter()
            .filter_map(|id| store.try_action(*id))
            .flat_map(|record| record.dependents.iter().copied())
            .filter(|dependent| !visited.contains(dependent))
            .collect();
        store.propagation.queue.extend(late);

        let deliveries = collect_deliveries(&store, &changed);
        store.stats.notifications += deliveries
            .iter()
            .map(|(observers, _)| observers.len() as u64)
            .sum::<u64>();
        deliveries
    };

    for (observers, result) in deliveries {
        for (id, observer) in observers {
            // An earlier observer may have disposed this one.
            if !shared.store.lock().subscriptions.contains_key(&id) {
                continue;
            }
            observer(&result);
        }
    }
    Ok(())
}

/// Every action reachable from `seeds` through `dependents`, seeds included.
fn collect_affected(store: &Store, seeds: &[ActionId]) -> Vec<ActionId> {
    let mut affected = Vec::new();
    let mut visited = HashSet::new();
    let mut queue: VecDeque<ActionId> = seeds.iter().copied().collect();

    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        if let Some(record) = store.try_action(id) {
            affected.push(id);
            queue.extend(record.dependents.iter().copied());
        }
    }
    affected
}

/// Order `actions` so that dependencies come before dependents.
///
/// Actions caught in a cycle keep their discovery order at the end.
fn topological_sort(store: &Store, actions: Vec<ActionId>) -> Vec<ActionId> {
    let members: HashSet<ActionId> = actions.iter().copied().collect();
    let mut in_degree: HashMap<ActionId, usize> = HashMap::new();
    let mut result = Vec::with_capacity(actions.len());
    let mut queue = VecDeque::new();

    for &id in &actions {
        if let Some(record) = store.try_action(id) {
            let degree = record
                .dependencies
                .iter()
                .filter(|dep| members.contains(dep))
                .count();
            in_degree.insert(id, degree);
            if degree == 0 {
                queue.push_back(id);
            }
        }
    }

    // Kahn's algorithm
    while let Some(id) = queue.pop_front() {
        result.push(id);
        if let Some(record) = store.try_action(id) {
            for dependent in &record.dependents {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }
    }

    if result.len() < in_degree.len() {
        let placed: HashSet<ActionId> = result.iter().copied().collect();
        result.extend(actions.into_iter().filter(|id| !placed.contains(id)));
    }
    result
}

type Delivery = (Vec<(SubscriptionId, Observer)>, GraphResult);

fn collect_deliveries(store: &Store, changed: &[ActionId]) -> Vec<Delivery> {
    changed
        .iter()
        .filter_map(|id| {
            let record = store.try_action(*id)?;
            if record.observers.is_empty() {
                return None;
            }
            let node = store.get_node(record.result?).ok()?;
            Some((
                record
                    .observers
                    .iter()
                    .map(|(id, observer)| (*id, Arc::clone(observer)))
                    .collect(),
                GraphResult::from_node(node),
            ))
        })
        .collect()
}
