//! Path builder.
//!
//! Paths are the usual way to address data in a graph:
//!
//! ```rust
//! use trellis_core::{Path, Transform};
//!
//! let first_done = Path::root()
//!     .get("todos")
//!     .items(vec![Transform::where_eq("done", &true).unwrap(), Transform::Take(1)]);
//! ```
//!
//! A path is just a chain of `get`/`items` definitions over a base; it
//! converts into a [`Definition`] wherever one is expected.

use crate::error::{ErrorInfo, GraphError};
use crate::model::{Definition, Key, Operation, OperationSpec, Transform};

/// A query path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    definition: Definition,
}

impl Path {
    /// Start at the root of the current scope.
    pub fn root() -> Self {
        Self::from_definition(Definition::root())
    }

    /// Start at an arbitrary definition.
    pub fn from_definition(definition: Definition) -> Self {
        Self { definition }
    }

    /// Rebuild a path from the cacheable operations applied to `base`.
    ///
    /// `evaluate` and `resolve` steps are implied by the steps after them and
    /// are skipped. Side-effecting operations cannot be part of a query.
    pub fn from_operations(base: Definition, operations: &[Operation]) -> Result<Self, GraphError> {
        let mut path = Self::from_definition(base);
        for operation in operations {
            path = match operation.spec() {
                OperationSpec::Evaluate | OperationSpec::Resolve => path,
                OperationSpec::GetChild(key) => path.get(key.clone()),
                OperationSpec::GetItems(transforms) => path.items(transforms.clone()),
                _ => return Err(GraphError::InvalidPath(operation.to_string())),
            };
        }
        Ok(path)
    }

    /// Select a child.
    pub fn get(self, key: impl Into<Key>) -> Self {
        Self::from_definition(Definition::get(self.definition, key))
    }

    /// List a collection.
    pub fn items(self, transforms: Vec<Transform>) -> Self {
        Self::from_definition(Definition::items(self.definition, transforms))
    }

    /// Fall back to `fallback` while the path is pending.
    pub fn or_pending(self, fallback: Definition) -> Self {
        Self::from_definition(Definition::if_pending(self.definition, fallback))
    }

    /// Recover from errors on the path.
    pub fn or_error<F>(self, recover: F) -> Self
    where
        F: Fn(&ErrorInfo) -> Definition + Send + Sync + 'static,
    {
        Self::from_definition(Definition::catch_error(self.definition, recover))
    }

    /// The definition this path builds.
    pub fn definition(&self) -> &Definition {
        &self.definition
    }
}

impl From<Path> for Definition {
    fn from(path: Path) -> Self {
        path.definition
    }
}
