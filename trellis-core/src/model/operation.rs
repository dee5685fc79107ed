//! Operations
//!
//! An operation is an immutable description of what was asked of a node.
//! Its identity is computed once, at construction, from its type and
//! parameters (see [`identity`](super::identity) for the equality rules).

use std::fmt::{self, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::identity::{canonical_json, to_param, write_canonical_json, write_json_string, FnRef, Json};
use crate::error::GraphError;

/// A child key: a branch name or a collection index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    /// Branch of a tree or field of an object value.
    Name(String),
    /// Position in an array.
    Index(usize),
}

impl Key {
    pub(crate) fn write_identity(&self, out: &mut String) {
        match self {
            Self::Name(name) => write_json_string(out, name),
            Self::Index(index) => {
                let _ = write!(out, "{index}");
            }
        }
    }

    pub(crate) fn describe(&self) -> Json {
        match self {
            Self::Name(name) => Json::String(name.clone()),
            Self::Index(index) => json!(index),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Index(index) => write!(f, "{index}"),
        }
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// Predicate used by [`Transform::Filter`].
pub type Predicate = FnRef<dyn Fn(&Json) -> bool + Send + Sync>;

/// Mapping used by [`Transform::Map`].
pub type MapFn = FnRef<dyn Fn(&Json) -> Json + Send + Sync>;

/// A step applied by `getItems` to a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    /// Keep items whose value satisfies the predicate.
    Filter(Predicate),
    /// Keep object items whose `field` equals `equals`.
    Where {
        /// Field name looked up on each item.
        field: String,
        /// Value the field must equal.
        equals: Json,
    },
    /// Replace each item with the mapped value.
    Map(MapFn),
    /// Keep the first `n` items.
    Take(usize),
    /// Drop the first `n` items.
    Skip(usize),
}

impl Transform {
    /// Filter by a predicate over item values.
    pub fn filter<F>(predicate: F) -> Self
    where
        F: Fn(&Json) -> bool + Send + Sync + 'static,
    {
        Self::Filter(FnRef::from_arc(Arc::new(predicate)))
    }

    /// Map item values.
    pub fn map<F>(mapping: F) -> Self
    where
        F: Fn(&Json) -> Json + Send + Sync + 'static,
    {
        Self::Map(FnRef::from_arc(Arc::new(mapping)))
    }

    /// Structural filter on an object field.
    pub fn where_eq<T: Serialize + ?Sized>(
        field: impl Into<String>,
        equals: &T,
    ) -> Result<Self, GraphError> {
        Ok(Self::Where {
            field: field.into(),
            equals: to_param("getItems", equals)?,
        })
    }

    fn write_identity(&self, out: &mut String) {
        match self {
            Self::Filter(predicate) => {
                out.push_str("filter(");
                predicate.write_identity(out);
                out.push(')');
            }
            Self::Where { field, equals } => {
                out.push_str("where(");
                write_json_string(out, field);
                out.push(',');
                write_canonical_json(out, equals);
                out.push(')');
            }
            Self::Map(mapping) => {
                out.push_str("map(");
                mapping.write_identity(out);
                out.push(')');
            }
            Self::Take(n) => {
                let _ = write!(out, "take({n})");
            }
            Self::Skip(n) => {
                let _ = write!(out, "skip({n})");
            }
        }
    }

    fn describe(&self) -> Json {
        match self {
            Self::Filter(predicate) => json!({ "type": "filter", "fn": format!("{predicate:?}") }),
            Self::Where { field, equals } => {
                json!({ "type": "where", "field": field, "equals": equals })
            }
            Self::Map(mapping) => json!({ "type": "map", "fn": format!("{mapping:?}") }),
            Self::Take(n) => json!({ "type": "take", "count": n }),
            Self::Skip(n) => json!({ "type": "skip", "count": n }),
        }
    }
}

/// Discriminant of an operation, used as a registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    /// One evaluation hop of a dynamic node.
    Evaluate,
    /// Evaluate repeatedly until a static node is reached.
    Resolve,
    /// Select a child.
    GetChild,
    /// List a collection.
    GetItems,
    /// Write a variable.
    Set,
    /// Restore a variable's initial value.
    Reset,
    /// Invoke an action node.
    Call,
}

impl OperationKind {
    /// All operation kinds.
    pub const ALL: [OperationKind; 7] = [
        Self::Evaluate,
        Self::Resolve,
        Self::GetChild,
        Self::GetItems,
        Self::Set,
        Self::Reset,
        Self::Call,
    ];

    /// Whether results of this operation may be shared between requests.
    ///
    /// Side-effecting operations always re-execute.
    pub fn is_cacheable(self) -> bool {
        matches!(
            self,
            Self::Evaluate | Self::Resolve | Self::GetChild | Self::GetItems
        )
    }

    /// Stable name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Evaluate => "evaluate",
            Self::Resolve => "resolve",
            Self::GetChild => "getChild",
            Self::GetItems => "getItems",
            Self::Set => "set",
            Self::Reset => "reset",
            Self::Call => "call",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationSpec {
    Evaluate,
    Resolve,
    GetChild(Key),
    GetItems(Vec<Transform>),
    Set(Json),
    Reset,
    Call(Vec<Json>),
}

struct Inner {
    spec: OperationSpec,
    identity: Arc<str>,
}

/// An immutable operation with a precomputed identity.
///
/// Cloning is cheap; clones share identity.
#[derive(Clone)]
pub struct Operation(Arc<Inner>);

impl Operation {
    fn from_spec(spec: OperationSpec) -> Self {
        let identity = Self::compute_identity(&spec);
        Self(Arc::new(Inner {
            spec,
            identity: identity.into(),
        }))
    }

    /// `evaluate`
    pub fn evaluate() -> Self {
        Self::from_spec(OperationSpec::Evaluate)
    }

    /// `resolve`, the operation subscriptions are made of.
    pub fn resolve() -> Self {
        Self::from_spec(OperationSpec::Resolve)
    }

    /// `getChild(key)`
    pub fn get_child(key: impl Into<Key>) -> Self {
        Self::from_spec(OperationSpec::GetChild(key.into()))
    }

    /// `getItems(transforms)`
    pub fn get_items(transforms: Vec<Transform>) -> Self {
        Self::from_spec(OperationSpec::GetItems(transforms))
    }

    /// `set(value)`
    pub fn set(value: impl Into<Json>) -> Self {
        Self::from_spec(OperationSpec::Set(value.into()))
    }

    /// `set(value)` for any serialisable value.
    pub fn set_serialized<T: Serialize + ?Sized>(value: &T) -> Result<Self, GraphError> {
        Ok(Self::set(to_param("set", value)?))
    }

    /// `reset`
    pub fn reset() -> Self {
        Self::from_spec(OperationSpec::Reset)
    }

    /// `call(args)`
    pub fn call(args: Vec<Json>) -> Self {
        Self::from_spec(OperationSpec::Call(args))
    }

    /// `call(args)` for any serialisable argument list.
    pub fn call_serialized<T: Serialize + ?Sized>(args: &[&T]) -> Result<Self, GraphError> {
        let args = args
            .iter()
            .map(|arg| to_param("call", *arg))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::call(args))
    }

    /// The parameters.
    pub fn spec(&self) -> &OperationSpec {
        &self.0.spec
    }

    /// The discriminant.
    pub fn kind(&self) -> OperationKind {
        match self.0.spec {
            OperationSpec::Evaluate => OperationKind::Evaluate,
            OperationSpec::Resolve => OperationKind::Resolve,
            OperationSpec::GetChild(_) => OperationKind::GetChild,
            OperationSpec::GetItems(_) => OperationKind::GetItems,
            OperationSpec::Set(_) => OperationKind::Set,
            OperationSpec::Reset => OperationKind::Reset,
            OperationSpec::Call(_) => OperationKind::Call,
        }
    }

    /// Shorthand for `kind().is_cacheable()`.
    pub fn is_cacheable(&self) -> bool {
        self.kind().is_cacheable()
    }

    /// Canonical identity string.
    pub fn identity(&self) -> &Arc<str> {
        &self.0.identity
    }

    /// JSON description for inspection.
    pub fn describe(&self) -> Json {
        let kind = self.kind().as_str();
        match &self.0.spec {
            OperationSpec::GetChild(key) => json!({ "type": kind, "key": key.describe() }),
            OperationSpec::GetItems(transforms) => json!({
                "type": kind,
                "transforms": transforms.iter().map(Transform::describe).collect::<Vec<_>>(),
            }),
            OperationSpec::Set(value) => json!({ "type": kind, "value": value }),
            OperationSpec::Call(args) => json!({ "type": kind, "args": args }),
            _ => json!({ "type": kind }),
        }
    }

    fn compute_identity(spec: &OperationSpec) -> String {
        let mut out = String::new();
        match spec {
            OperationSpec::Evaluate => out.push_str("evaluate()"),
            OperationSpec::Resolve => out.push_str("resolve()"),
            OperationSpec::GetChild(key) => {
                out.push_str("getChild(");
                key.write_identity(&mut out);
                out.push(')');
            }
            OperationSpec::GetItems(transforms) => {
                out.push_str("getItems([");
                for (i, transform) in transforms.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    transform.write_identity(&mut out);
                }
                out.push_str("])");
            }
            OperationSpec::Set(value) => {
                out.push_str("set(");
                out.push_str(&canonical_json(value));
                out.push(')');
            }
            OperationSpec::Reset => out.push_str("reset()"),
            OperationSpec::Call(args) => {
                out.push_str("call(");
                write_canonical_json(&mut out, &Json::Array(args.clone()));
                out.push(')');
            }
        }
        out
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.0.identity == other.0.identity
    }
}

impl Eq for Operation {}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.identity)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn structural_parameters_collapse() {
        let a = Operation::set(json!({ "x": 1, "y": [1, 2] }));
        let b = Operation::set(json!({ "y": [1, 2], "x": 1 }));
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a, Operation::set(json!({ "x": 1, "y": [2, 1] })));
    }

    #[test]
    fn key_kinds_are_distinct() {
        assert_ne!(Operation::get_child("0"), Operation::get_child(0usize));
        assert_eq!(Operation::get_child("a"), Operation::get_child("a"));
    }

    #[test]
    fn function_transforms_use_reference_identity() {
        let filter = Transform::filter(|v| v.as_i64() == Some(1));
        let a = Operation::get_items(vec![filter.clone(), Transform::Take(2)]);
        let b = Operation::get_items(vec![filter, Transform::Take(2)]);
        let c = Operation::get_items(vec![
            Transform::filter(|v| v.as_i64() == Some(1)),
            Transform::Take(2),
        ]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn where_transform_is_structural() {
        let a = Operation::get_items(vec![Transform::where_eq("done", &true).unwrap()]);
        let b = Operation::get_items(vec![Transform::where_eq("done", &true).unwrap()]);
        assert_eq!(a, b);
    }

    #[test]
    fn cacheability_follows_kind() {
        assert!(Operation::evaluate().is_cacheable());
        assert!(Operation::get_items(vec![]).is_cacheable());
        assert!(!Operation::set(1).is_cacheable());
        assert!(!Operation::call(vec![]).is_cacheable());
        assert!(!Operation::reset().is_cacheable());
    }

    #[test]
    fn unserializable_set_is_rejected() {
        let mut map = HashMap::new();
        map.insert(vec![1u8], 1);
        assert!(matches!(
            Operation::set_serialized(&map),
            Err(GraphError::UnserializableOperation { operation: "set", .. })
        ));
    }
}
