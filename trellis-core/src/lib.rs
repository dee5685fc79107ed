//! Trellis Core
//!
//! This crate provides the graph cache and query-resolution engine of the
//! Trellis dataflow graph. Application state and derived computations are
//! described as a graph of nodes (values, trees, computations, references,
//! collections); consumers subscribe to paths and receive updates when the
//! data they read changes.
//!
//! It implements:
//!
//! - Structural identity for nodes and operations, so equal requests share
//!   one cached action
//! - A store of nodes, operations and actions with reference-counted
//!   collection
//! - A resolver dispatching through a per-graph handler registry
//! - Subscriptions with replay of the latest result
//! - Invalidation that re-runs only the affected actions, in dependency
//!   order, and notifies each changed subscription once
//!
//! # Architecture
//!
//! - `model`: definitions, operations, nodes and their identities
//! - `store`: the arena of nodes, operations and cached actions
//! - `resolve`: handler registry, resolution context and built-in handlers
//! - `propagate`: invalidation passes
//! - `subscription`: observers, subscriptions and action handles
//! - `source`: asynchronous value sources
//! - `graph`: the public entry point
//! - `inspect`: serialisable store snapshots
//!
//! # Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use trellis_core::{Definition, Graph, GraphResult, Path};
//! use serde_json::json;
//!
//! let count = Definition::variable(1);
//! let doubled = Definition::map(count.clone(), |n| json!(n.as_i64().unwrap_or(0) * 2));
//! let graph = Graph::new(Definition::tree([("count", count), ("doubled", doubled)]));
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&seen);
//! let _subscription = graph
//!     .subscribe(Path::root().get("doubled"), move |result| {
//!         sink.lock().unwrap().push(result.clone());
//!     })
//!     .unwrap();
//!
//! graph.set(Path::root().get("count"), 5).unwrap();
//!
//! assert_eq!(
//!     *seen.lock().unwrap(),
//!     vec![GraphResult::Value(json!(2)), GraphResult::Value(json!(10))]
//! );
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod inspect;
pub mod model;
pub mod path;
mod propagate;
pub mod resolve;
pub mod source;
pub mod store;
pub mod subscription;

pub use config::GraphConfig;
pub use error::{ErrorCode, ErrorInfo, GraphError};
pub use graph::Graph;
pub use inspect::Snapshot;
pub use model::{
    Definition, DefinitionKind, Json, Key, Location, Node, NodeId, NodeKind, Operation,
    OperationKind, ScopeId, ContextId, Transform,
};
pub use path::Path;
pub use resolve::{Handler, Interrupt, Outcome, Registry, ResolveCx, Settled};
pub use source::{Cleanup, Deferred, Emitter, Source};
pub use store::{ActionId, ActionState, Stats};
pub use subscription::{ActionHandle, GraphResult, Subscription, SubscriptionId};
