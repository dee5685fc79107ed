//! Action Resolver
//!
//! Turns a (node, operation) request into a cached action and runs the
//! handler that produces its result.
//!
//! # Handlers
//!
//! A handler is a plain function looked up in a [`Registry`] by node kind and
//! operation kind. It receives a [`ResolveCx`] through which it requests the
//! results of other (node, operation) pairs; every such request records a
//! dependency edge at the moment it is made.
//!
//! Handlers never block. When a dependency is pending the handler returns
//! [`Interrupt::Pending`] and the action settles on a pending node. Once the
//! dependency produces a value, propagation runs the handler again from the
//! top; requests it already made are answered from the cache, so the replay
//! is cheap and deterministic.
//!
//! # Short-circuits
//!
//! Error and pending nodes answer every operation with themselves without
//! consulting the registry. Combinators that tolerate them (`if_pending`,
//! `catch_error`) inspect their child's result through
//! [`ResolveCx::settle`] instead.

mod context;
pub(crate) mod engine;
pub mod handlers;

use std::collections::HashMap;
use std::fmt;

use crate::error::{ErrorCode, ErrorInfo, GraphError};
use crate::model::{Definition, Node, NodeKind, Operation, OperationKind};

pub use context::{ResolveCx, Settled};

/// Why a handler stopped before producing a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interrupt {
    /// A dependency is not available yet.
    Pending,
    /// Resolution failed. Becomes an error node.
    Error(ErrorInfo),
    /// The store is inconsistent. Aborts the whole request.
    Fatal(GraphError),
}

impl From<ErrorInfo> for Interrupt {
    fn from(info: ErrorInfo) -> Self {
        Self::Error(info)
    }
}

impl From<GraphError> for Interrupt {
    fn from(error: GraphError) -> Self {
        Self::Fatal(error)
    }
}

/// What a handler returns.
pub type Outcome = Result<Definition, Interrupt>;

/// A resolution handler.
pub type Handler = fn(&mut ResolveCx<'_>, &Node, &Operation) -> Outcome;

/// Lookup table of handlers, keyed by node kind and operation kind.
///
/// Each graph owns its registry, so graphs in the same process can run
/// different handler sets.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<(NodeKind, OperationKind), Handler>,
}

impl Registry {
    /// A registry with no handlers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in handlers for every node kind.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        handlers::install(&mut registry);
        registry
    }

    /// Register `handler`, returning the one it replaces.
    pub fn register(
        &mut self,
        kind: NodeKind,
        operation: OperationKind,
        handler: Handler,
    ) -> Option<Handler> {
        self.handlers.insert((kind, operation), handler)
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, kind: NodeKind, operation: OperationKind, handler: Handler) -> Self {
        self.register(kind, operation, handler);
        self
    }

    /// The handler for a pair, if registered.
    pub fn handler(&self, kind: NodeKind, operation: OperationKind) -> Option<Handler> {
        self.handlers.get(&(kind, operation)).copied()
    }

    /// Node kinds with at least one handler, in declaration order.
    pub fn node_types(&self) -> Vec<NodeKind> {
        NodeKind::ALL
            .into_iter()
            .filter(|kind| {
                OperationKind::ALL
                    .into_iter()
                    .any(|operation| self.handlers.contains_key(&(*kind, operation)))
            })
            .collect()
    }

    /// Run the handler for `operation` on `node`.
    ///
    /// Pairs without a handler pass through dynamic nodes: the node is
    /// evaluated and the operation applied to the result.
    pub(crate) fn dispatch(&self, cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
        if let Some(handler) = self.handler(node.kind(), operation.kind()) {
            return handler(cx, node, operation);
        }
        if operation.kind() != OperationKind::Evaluate
            && self.handler(node.kind(), OperationKind::Evaluate).is_some()
        {
            return handlers::pass_through(cx, node, operation);
        }
        Err(Interrupt::Error(ErrorInfo::new(
            ErrorCode::Unsupported,
            format!("{} nodes do not support {}", node.kind(), operation.kind()),
        )))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pairs: Vec<_> = self.handlers.keys().collect();
        pairs.sort();
        f.debug_struct("Registry").field("handlers", &pairs).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nothing(_: &mut ResolveCx<'_>, _: &Node, _: &Operation) -> Outcome {
        Ok(Definition::nil())
    }

    #[test]
    fn standard_registry_covers_every_kind() {
        let registry = Registry::standard();
        assert_eq!(registry.node_types(), NodeKind::ALL.to_vec());
        assert!(registry.handler(NodeKind::Variable, OperationKind::Set).is_some());
        assert!(registry.handler(NodeKind::Value, OperationKind::Set).is_none());
    }

    #[test]
    fn register_replaces_handlers() {
        let mut registry = Registry::empty();
        assert!(registry
            .register(NodeKind::Value, OperationKind::Resolve, nothing)
            .is_none());
        assert!(registry
            .register(NodeKind::Value, OperationKind::Resolve, nothing)
            .is_some());
        assert_eq!(registry.node_types(), vec![NodeKind::Value]);
    }

    #[test]
    fn registries_are_independent() {
        let custom = Registry::standard().with(NodeKind::Value, OperationKind::Evaluate, nothing);
        assert!(custom.handler(NodeKind::Value, OperationKind::Evaluate).is_some());
        assert!(Registry::standard()
            .handler(NodeKind::Value, OperationKind::Evaluate)
            .is_none());
    }
}
