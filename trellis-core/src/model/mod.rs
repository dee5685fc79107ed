//! Node & Operation Model
//!
//! Immutable descriptions of values, computations and the operations that
//! can be applied to them. Every definition and operation has a canonical
//! identity; structurally equal requests collapse onto the same identity and
//! therefore onto the same cached action.

mod definition;
pub mod identity;
mod node;
mod operation;

pub use definition::{CallFn, ComputeFn, Definition, DefinitionKind, NodeKind, RecoverFn};
pub use identity::{FnRef, Json};
pub use node::{ContextId, Location, Node, NodeId, ScopeId};
pub use operation::{Key, MapFn, Operation, OperationKind, OperationSpec, Predicate, Transform};
