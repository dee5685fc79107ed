//! Inspection
//!
//! A [`Snapshot`] is a read-only, point-in-time dump of a graph's store,
//! meant for external tooling. It serialises to
//!
//! ```text
//! { nodeTypes, cache: { nodes, operations, actions, cache }, subscriptions }
//! ```
//!
//! as JSON or MessagePack. `cache.actions` lists action records;
//! `cache.cache` lists request-index entries: a cacheable (node, operation)
//! pair maps to one `instance`, a side-effecting pair to the `instances`
//! currently executing.
//!
//! [`Snapshot::edges`] and [`Snapshot::forest`] derive the dependency view
//! tooling draws: which node produced which, grouped into independent trees.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::Serialize;

use crate::error::GraphError;
use crate::model::{ContextId, Json, NodeId, NodeKind, OperationKind, ScopeId};
use crate::resolve::Registry;
use crate::store::{ActionId, ActionState, OperationId, Store};
use crate::subscription::SubscriptionId;

/// Point-in-time dump of a graph.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Node kinds the graph's registry handles.
    pub node_types: Vec<NodeKind>,
    pub cache: CacheSnapshot,
    pub subscriptions: Vec<SubscriptionSnapshot>,
}

/// The store's tables.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub nodes: Vec<NodeSnapshot>,
    pub operations: Vec<OperationSnapshot>,
    pub actions: Vec<ActionSnapshot>,
    pub cache: Vec<CacheEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub scope: ScopeId,
    pub context: ContextId,
    pub kind: NodeKind,
    pub definition: Json,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationSnapshot {
    pub id: OperationId,
    pub kind: OperationKind,
    pub operation: Json,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionSnapshot {
    pub id: ActionId,
    pub node: NodeId,
    pub operation: OperationId,
    pub kind: OperationKind,
    pub state: ActionState,
    pub result: Option<NodeId>,
    pub dependencies: Vec<ActionId>,
    pub holds: usize,
    pub resolutions: u64,
}

/// A (node, operation) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct RequestKey {
    pub node: NodeId,
    pub operation: OperationId,
}

/// An entry of the request index.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CacheEntry {
    /// A cacheable request and the action answering it.
    Cached {
        action: RequestKey,
        cacheable: bool,
        instance: ActionId,
    },
    /// A side-effecting request and its executions in flight.
    OneShot {
        action: RequestKey,
        cacheable: bool,
        instances: Vec<ActionId>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSnapshot {
    pub id: SubscriptionId,
    pub action: ActionId,
    pub debug: String,
}

/// A node produced by applying `operation` to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub operation: OperationKind,
}

/// A connected group of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tree {
    pub nodes: Vec<NodeId>,
    pub edges: Vec<Edge>,
}

pub(crate) fn snapshot(store: &Store, registry: &Registry) -> Snapshot {
    let mut nodes: Vec<NodeSnapshot> = store
        .nodes()
        .map(|node| NodeSnapshot {
            id: node.id(),
            scope: node.location().scope,
            context: node.location().context,
            kind: node.kind(),
            definition: node.definition().describe(),
        })
        .collect();
    nodes.sort_by_key(|node| node.id);

    let mut operations: Vec<OperationSnapshot> = store
        .operations()
        .map(|(id, operation)| OperationSnapshot {
            id: *id,
            kind: operation.kind(),
            operation: operation.describe(),
        })
        .collect();
    operations.sort_by_key(|operation| operation.id);

    let mut actions = Vec::new();
    let mut cached = BTreeMap::new();
    let mut one_shots: BTreeMap<RequestKey, Vec<ActionId>> = BTreeMap::new();
    for record in store.actions() {
        let kind = store
            .get_operation(record.operation)
            .map(|operation| operation.kind())
            .unwrap_or(OperationKind::Evaluate);
        actions.push(ActionSnapshot {
            id: record.id,
            node: record.node,
            operation: record.operation,
            kind,
            state: record.state,
            result: record.result,
            dependencies: record.dependencies.iter().copied().collect(),
            holds: record.holds,
            resolutions: record.resolutions,
        });

        let key = RequestKey {
            node: record.node,
            operation: record.operation,
        };
        if record.cacheable {
            cached.insert(key, record.id);
        } else {
            one_shots.entry(key).or_default().push(record.id);
        }
    }
    actions.sort_by_key(|action| action.id);

    let mut cache: Vec<CacheEntry> = cached
        .into_iter()
        .map(|(action, instance)| CacheEntry::Cached {
            action,
            cacheable: true,
            instance,
        })
        .collect();
    cache.extend(one_shots.into_iter().map(|(action, instances)| CacheEntry::OneShot {
        action,
        cacheable: false,
        instances,
    }));

    let subscriptions = store
        .subscriptions
        .iter()
        .map(|(id, record)| SubscriptionSnapshot {
            id: *id,
            action: record.action,
            debug: record.debug.clone(),
        })
        .collect();

    Snapshot {
        node_types: registry.node_types(),
        cache: CacheSnapshot {
            nodes,
            operations,
            actions,
            cache,
        },
        subscriptions,
    }
}

impl Snapshot {
    /// Encode as JSON.
    pub fn to_json(&self) -> Result<String, GraphError> {
        serde_json::to_string(self).map_err(|e| GraphError::Encode(e.to_string()))
    }

    /// Encode as MessagePack, with field names.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, GraphError> {
        rmp_serde::to_vec_named(self).map_err(|e| GraphError::Encode(e.to_string()))
    }

    /// `root()` nodes stand for the tree they evaluate to.
    fn aliases(&self) -> HashMap<NodeId, NodeId> {
        let kinds: HashMap<NodeId, NodeKind> =
            self.cache.nodes.iter().map(|node| (node.id, node.kind)).collect();
        self.cache
            .actions
            .iter()
            .filter(|action| {
                action.kind == OperationKind::Evaluate
                    && kinds.get(&action.node) == Some(&NodeKind::Root)
            })
            .filter_map(|action| Some((action.node, action.result?)))
            .collect()
    }

    /// Production edges between nodes.
    ///
    /// `resolve` is a composition of other operations and contributes no
    /// edges of its own.
    pub fn edges(&self) -> Vec<Edge> {
        let aliases = self.aliases();
        let canonical = |id: NodeId| aliases.get(&id).copied().unwrap_or(id);

        let edges: BTreeSet<Edge> = self
            .cache
            .actions
            .iter()
            .filter(|action| action.kind != OperationKind::Resolve)
            .filter_map(|action| {
                Some(Edge {
                    from: canonical(action.node),
                    to: canonical(action.result?),
                    operation: action.kind,
                })
            })
            .filter(|edge| edge.from != edge.to)
            .collect();
        edges.into_iter().collect()
    }

    /// Independent dependency trees, ordered by their smallest node id.
    pub fn forest(&self) -> Vec<Tree> {
        let aliases = self.aliases();
        let nodes: BTreeSet<NodeId> = self
            .cache
            .nodes
            .iter()
            .map(|node| aliases.get(&node.id).copied().unwrap_or(node.id))
            .collect();
        let edges = self.edges();

        let mut adjacent: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for edge in &edges {
            adjacent.entry(edge.from).or_default().push(edge.to);
            adjacent.entry(edge.to).or_default().push(edge.from);
        }

        let mut seen = BTreeSet::new();
        let mut forest = Vec::new();
        for &start in &nodes {
            if !seen.insert(start) {
                continue;
            }
            let mut members = BTreeSet::from([start]);
            let mut queue = VecDeque::from([start]);
            while let Some(id) = queue.pop_front() {
                for &next in adjacent.get(&id).into_iter().flatten() {
                    if seen.insert(next) {
                        members.insert(next);
                        queue.push_back(next);
                    }
                }
            }
            forest.push(Tree {
                edges: edges
                    .iter()
                    .copied()
                    .filter(|edge| members.contains(&edge.from))
                    .collect(),
                nodes: members.into_iter().collect(),
            });
        }
        forest
    }
}
