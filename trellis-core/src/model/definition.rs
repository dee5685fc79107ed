//! Node Definitions
//!
//! A definition describes a value or a computation. It is the "what" of a
//! node: the store turns a definition placed at a location into a node with
//! a stable id.
//!
//! # Static and dynamic definitions
//!
//! Static definitions (values, trees, arrays, errors, ...) are already
//! answers. Dynamic definitions (computed values, variables, references, ...)
//! must be evaluated, possibly several hops, before they produce a static
//! node. The `resolve` operation performs that walk.

use std::fmt::{self, Write};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::json;
use smallvec::SmallVec;

use super::identity::{canonical_json, next_instance, write_json_string, FnRef, Json};
use super::operation::{Key, Transform};
use crate::error::ErrorInfo;
use crate::source::Source;

/// Function combining resolved dependency values.
pub type ComputeFn = FnRef<dyn Fn(&[Json]) -> Result<Definition, ErrorInfo> + Send + Sync>;

/// Function producing a fallback for a failed target.
pub type RecoverFn = FnRef<dyn Fn(&ErrorInfo) -> Definition + Send + Sync>;

/// Function invoked by `call`.
pub type CallFn = FnRef<dyn Fn(&[Json]) -> Result<Definition, ErrorInfo> + Send + Sync>;

/// Discriminant of a definition, used as a registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    Value,
    Nil,
    Error,
    Pending,
    Tree,
    Array,
    Computed,
    Variable,
    Reference,
    Root,
    Get,
    Items,
    IfPending,
    CatchError,
    Action,
    Source,
    QuerySet,
    QuerySetResult,
}

impl NodeKind {
    /// All node kinds.
    pub const ALL: [NodeKind; 18] = [
        Self::Value,
        Self::Nil,
        Self::Error,
        Self::Pending,
        Self::Tree,
        Self::Array,
        Self::Computed,
        Self::Variable,
        Self::Reference,
        Self::Root,
        Self::Get,
        Self::Items,
        Self::IfPending,
        Self::CatchError,
        Self::Action,
        Self::Source,
        Self::QuerySet,
        Self::QuerySetResult,
    ];

    /// Static kinds are answers; dynamic kinds need evaluation.
    pub fn is_static(self) -> bool {
        matches!(
            self,
            Self::Value
                | Self::Nil
                | Self::Error
                | Self::Pending
                | Self::Tree
                | Self::Array
                | Self::Action
                | Self::QuerySetResult
        )
    }

    /// Stable name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Nil => "nil",
            Self::Error => "error",
            Self::Pending => "pending",
            Self::Tree => "tree",
            Self::Array => "array",
            Self::Computed => "computed",
            Self::Variable => "variable",
            Self::Reference => "ref",
            Self::Root => "root",
            Self::Get => "get",
            Self::Items => "items",
            Self::IfPending => "ifPending",
            Self::CatchError => "catchError",
            Self::Action => "action",
            Self::Source => "source",
            Self::QuerySet => "querySet",
            Self::QuerySetResult => "querySetResult",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The variants of a definition.
pub enum DefinitionKind {
    Value(Json),
    Nil,
    Error(ErrorInfo),
    Pending,
    Tree(IndexMap<String, Definition>),
    Array(Vec<Definition>),
    Computed {
        dependencies: Vec<Definition>,
        combine: ComputeFn,
    },
    Variable {
        initial: Json,
        instance: u64,
    },
    Reference(SmallVec<[Key; 4]>),
    Root,
    Get {
        target: Definition,
        key: Key,
    },
    Items {
        target: Definition,
        transforms: Vec<Transform>,
    },
    IfPending {
        target: Definition,
        fallback: Definition,
    },
    CatchError {
        target: Definition,
        recover: RecoverFn,
    },
    Action(CallFn),
    Source {
        source: Arc<dyn Source>,
        instance: u64,
    },
    QuerySet(IndexMap<String, Definition>),
    QuerySetResult(IndexMap<String, Json>),
}

struct Inner {
    kind: DefinitionKind,
    identity: Arc<str>,
}

/// An immutable node definition with a precomputed identity.
///
/// Cloning is cheap and preserves identity, which matters for stateful
/// definitions: a cloned variable is the *same* variable.
#[derive(Clone)]
pub struct Definition(Arc<Inner>);

impl Definition {
    fn from_kind(kind: DefinitionKind) -> Self {
        let identity = compute_identity(&kind);
        Self(Arc::new(Inner {
            kind,
            identity: identity.into(),
        }))
    }

    /// A plain value.
    pub fn value(value: impl Into<Json>) -> Self {
        Self::from_kind(DefinitionKind::Value(value.into()))
    }

    /// The absent value.
    pub fn nil() -> Self {
        Self::from_kind(DefinitionKind::Nil)
    }

    /// An error carried as data.
    pub fn error(info: impl Into<ErrorInfo>) -> Self {
        Self::from_kind(DefinitionKind::Error(info.into()))
    }

    /// A value that is not available yet.
    pub fn pending() -> Self {
        Self::from_kind(DefinitionKind::Pending)
    }

    /// A branch node.
    pub fn tree<I, K>(branches: I) -> Self
    where
        I: IntoIterator<Item = (K, Definition)>,
        K: Into<String>,
    {
        Self::from_kind(DefinitionKind::Tree(
            branches.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    /// A collection.
    pub fn array(items: impl IntoIterator<Item = Definition>) -> Self {
        Self::from_kind(DefinitionKind::Array(items.into_iter().collect()))
    }

    /// A computed node: resolves `dependencies` to values and combines them.
    pub fn computed<F>(dependencies: Vec<Definition>, combine: F) -> Self
    where
        F: Fn(&[Json]) -> Result<Definition, ErrorInfo> + Send + Sync + 'static,
    {
        Self::from_kind(DefinitionKind::Computed {
            dependencies,
            combine: FnRef::from_arc(Arc::new(combine)),
        })
    }

    /// A computed node over a single dependency producing a plain value.
    pub fn map<F>(dependency: Definition, mapping: F) -> Self
    where
        F: Fn(&Json) -> Json + Send + Sync + 'static,
    {
        Self::computed(vec![dependency], move |values| {
            Ok(Self::value(mapping(&values[0])))
        })
    }

    /// A new variable slot holding `initial` until it is set.
    pub fn variable(initial: impl Into<Json>) -> Self {
        Self::from_kind(DefinitionKind::Variable {
            initial: initial.into(),
            instance: next_instance(),
        })
    }

    /// A reference to a path below the scope root.
    pub fn reference<I, K>(path: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        Self::from_kind(DefinitionKind::Reference(
            path.into_iter().map(Into::into).collect(),
        ))
    }

    /// The root tree of the current scope.
    pub fn root() -> Self {
        Self::from_kind(DefinitionKind::Root)
    }

    /// `getChild(key)` applied to whatever `target` resolves to.
    pub fn get(target: Definition, key: impl Into<Key>) -> Self {
        Self::from_kind(DefinitionKind::Get {
            target,
            key: key.into(),
        })
    }

    /// `getItems(transforms)` applied to whatever `target` resolves to.
    pub fn items(target: Definition, transforms: Vec<Transform>) -> Self {
        Self::from_kind(DefinitionKind::Items { target, transforms })
    }

    /// `target`, or `fallback` while `target` is pending.
    pub fn if_pending(target: Definition, fallback: Definition) -> Self {
        Self::from_kind(DefinitionKind::IfPending { target, fallback })
    }

    /// `target`, or the recovered definition when `target` fails.
    pub fn catch_error<F>(target: Definition, recover: F) -> Self
    where
        F: Fn(&ErrorInfo) -> Definition + Send + Sync + 'static,
    {
        Self::from_kind(DefinitionKind::CatchError {
            target,
            recover: FnRef::from_arc(Arc::new(recover)),
        })
    }

    /// A callable node.
    pub fn action<F>(body: F) -> Self
    where
        F: Fn(&[Json]) -> Result<Definition, ErrorInfo> + Send + Sync + 'static,
    {
        Self::from_kind(DefinitionKind::Action(FnRef::from_arc(Arc::new(body))))
    }

    /// A node backed by an asynchronous source.
    pub fn source(source: Arc<dyn Source>) -> Self {
        Self::from_kind(DefinitionKind::Source {
            source,
            instance: next_instance(),
        })
    }

    /// Resolve every field and combine them into one result.
    pub fn query_set<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Definition)>,
        K: Into<String>,
    {
        Self::from_kind(DefinitionKind::QuerySet(
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    /// The combined answer of a query set.
    pub fn query_set_result(fields: IndexMap<String, Json>) -> Self {
        Self::from_kind(DefinitionKind::QuerySetResult(fields))
    }

    /// The variant.
    pub fn kind(&self) -> &DefinitionKind {
        &self.0.kind
    }

    /// The discriminant.
    pub fn node_kind(&self) -> NodeKind {
        match self.0.kind {
            DefinitionKind::Value(_) => NodeKind::Value,
            DefinitionKind::Nil => NodeKind::Nil,
            DefinitionKind::Error(_) => NodeKind::Error,
            DefinitionKind::Pending => NodeKind::Pending,
            DefinitionKind::Tree(_) => NodeKind::Tree,
            DefinitionKind::Array(_) => NodeKind::Array,
            DefinitionKind::Computed { .. } => NodeKind::Computed,
            DefinitionKind::Variable { .. } => NodeKind::Variable,
            DefinitionKind::Reference(_) => NodeKind::Reference,
            DefinitionKind::Root => NodeKind::Root,
            DefinitionKind::Get { .. } => NodeKind::Get,
            DefinitionKind::Items { .. } => NodeKind::Items,
            DefinitionKind::IfPending { .. } => NodeKind::IfPending,
            DefinitionKind::CatchError { .. } => NodeKind::CatchError,
            DefinitionKind::Action(_) => NodeKind::Action,
            DefinitionKind::Source { .. } => NodeKind::Source,
            DefinitionKind::QuerySet(_) => NodeKind::QuerySet,
            DefinitionKind::QuerySetResult(_) => NodeKind::QuerySetResult,
        }
    }

    /// Canonical identity string.
    pub fn identity(&self) -> &Arc<str> {
        &self.0.identity
    }

    /// Shorthand for `node_kind().is_static()`.
    pub fn is_static(&self) -> bool {
        self.node_kind().is_static()
    }

    /// The plain value, for value-like definitions.
    pub fn as_value(&self) -> Option<Json> {
        match &self.0.kind {
            DefinitionKind::Value(value) => Some(value.clone()),
            DefinitionKind::Nil => Some(Json::Null),
            DefinitionKind::QuerySetResult(fields) => Some(Json::Object(
                fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            )),
            _ => None,
        }
    }

    /// The error, for error definitions.
    pub fn as_error(&self) -> Option<&ErrorInfo> {
        match &self.0.kind {
            DefinitionKind::Error(info) => Some(info),
            _ => None,
        }
    }

    /// The query path this definition reads, for root/get/ref chains.
    pub fn path_hint(&self) -> Option<SmallVec<[Key; 4]>> {
        match &self.0.kind {
            DefinitionKind::Root => Some(SmallVec::new()),
            DefinitionKind::Reference(keys) => Some(keys.clone()),
            DefinitionKind::Get { target, key } => {
                let mut path = target.path_hint()?;
                path.push(key.clone());
                Some(path)
            }
            _ => None,
        }
    }

    /// JSON description for inspection.
    pub fn describe(&self) -> Json {
        let kind = self.node_kind().as_str();
        match &self.0.kind {
            DefinitionKind::Value(value) => json!({ "type": kind, "value": value }),
            DefinitionKind::Error(info) => json!({ "type": kind, "error": info }),
            DefinitionKind::Tree(branches) => json!({
                "type": kind,
                "branches": branches.iter()
                    .map(|(k, v)| (k.clone(), v.describe()))
                    .collect::<serde_json::Map<_, _>>(),
            }),
            DefinitionKind::Array(items) => json!({
                "type": kind,
                "items": items.iter().map(Definition::describe).collect::<Vec<_>>(),
            }),
            DefinitionKind::Computed { dependencies, combine } => json!({
                "type": kind,
                "dependencies": dependencies.iter().map(Definition::describe).collect::<Vec<_>>(),
                "fn": format!("{combine:?}"),
            }),
            DefinitionKind::Variable { initial, instance } => {
                json!({ "type": kind, "initial": initial, "instance": instance })
            }
            DefinitionKind::Reference(keys) => json!({ "type": kind, "path": keys }),
            DefinitionKind::Get { target, key } => {
                json!({ "type": kind, "target": target.describe(), "key": key.describe() })
            }
            DefinitionKind::Items { target, .. } => {
                json!({ "type": kind, "target": target.describe() })
            }
            DefinitionKind::IfPending { target, fallback } => json!({
                "type": kind,
                "target": target.describe(),
                "fallback": fallback.describe(),
            }),
            DefinitionKind::CatchError { target, recover } => json!({
                "type": kind,
                "target": target.describe(),
                "fn": format!("{recover:?}"),
            }),
            DefinitionKind::Action(body) => json!({ "type": kind, "fn": format!("{body:?}") }),
            DefinitionKind::Source { instance, .. } => json!({ "type": kind, "instance": instance }),
            DefinitionKind::QuerySet(fields) => json!({
                "type": kind,
                "fields": fields.iter()
                    .map(|(k, v)| (k.clone(), v.describe()))
                    .collect::<serde_json::Map<_, _>>(),
            }),
            DefinitionKind::QuerySetResult(fields) => json!({ "type": kind, "fields": fields }),
            DefinitionKind::Nil | DefinitionKind::Pending | DefinitionKind::Root => {
                json!({ "type": kind })
            }
        }
    }
}

fn write_list(out: &mut String, items: &[Definition]) {
    out.push('[');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(item.identity());
    }
    out.push(']');
}

fn write_fields<'a, V, I, F>(out: &mut String, fields: I, mut write_value: F)
where
    I: IntoIterator<Item = (&'a String, V)>,
    F: FnMut(&mut String, V),
{
    let mut fields: Vec<(&String, V)> = fields.into_iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));
    out.push('{');
    for (i, (key, value)) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_json_string(out, key);
        out.push(':');
        write_value(out, value);
    }
    out.push('}');
}

fn compute_identity(kind: &DefinitionKind) -> String {
    let mut out = String::new();
    match kind {
        DefinitionKind::Value(value) => {
            out.push_str("value(");
            out.push_str(&canonical_json(value));
            out.push(')');
        }
        DefinitionKind::Nil => out.push_str("nil()"),
        DefinitionKind::Error(info) => {
            let _ = write!(out, "error({},", info.code.as_str());
            write_json_string(&mut out, &info.message);
            if let Some(path) = &info.path {
                out.push(',');
                for key in path {
                    out.push('/');
                    key.write_identity(&mut out);
                }
            }
            out.push(')');
        }
        DefinitionKind::Pending => out.push_str("pending()"),
        DefinitionKind::Tree(branches) => {
            out.push_str("tree(");
            write_fields(&mut out, branches.iter(), |out, v| out.push_str(v.identity()));
            out.push(')');
        }
        DefinitionKind::Array(items) => {
            out.push_str("array(");
            write_list(&mut out, items);
            out.push(')');
        }
        DefinitionKind::Computed {
            dependencies,
            combine,
        } => {
            out.push_str("computed(");
            write_list(&mut out, dependencies);
            out.push(',');
            combine.write_identity(&mut out);
            out.push(')');
        }
        DefinitionKind::Variable { initial, instance } => {
            let _ = write!(out, "variable(#{instance},{})", canonical_json(initial));
        }
        DefinitionKind::Reference(keys) => {
            out.push_str("ref(");
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                key.write_identity(&mut out);
            }
            out.push(')');
        }
        DefinitionKind::Root => out.push_str("root()"),
        DefinitionKind::Get { target, key } => {
            let _ = write!(out, "get({},", target.identity());
            key.write_identity(&mut out);
            out.push(')');
        }
        DefinitionKind::Items { target, transforms } => {
            let _ = write!(out, "items({},", target.identity());
            out.push_str(crate::model::Operation::get_items(transforms.clone()).identity());
            out.push(')');
        }
        DefinitionKind::IfPending { target, fallback } => {
            let _ = write!(out, "ifPending({},{})", target.identity(), fallback.identity());
        }
        DefinitionKind::CatchError { target, recover } => {
            let _ = write!(out, "catchError({},", target.identity());
            recover.write_identity(&mut out);
            out.push(')');
        }
        DefinitionKind::Action(body) => {
            out.push_str("action(");
            body.write_identity(&mut out);
            out.push(')');
        }
        DefinitionKind::Source { instance, .. } => {
            let _ = write!(out, "source(#{instance})");
        }
        DefinitionKind::QuerySet(fields) => {
            out.push_str("querySet(");
            write_fields(&mut out, fields.iter(), |out, v| out.push_str(v.identity()));
            out.push(')');
        }
        DefinitionKind::QuerySetResult(fields) => {
            out.push_str("querySetResult(");
            write_fields(&mut out, fields.iter(), |out, v| {
                out.push_str(&canonical_json(v))
            });
            out.push(')');
        }
    }
    out
}

impl PartialEq for Definition {
    fn eq(&self, other: &Self) -> bool {
        self.0.identity == other.0.identity
    }
}

impl Eq for Definition {}

impl std::hash::Hash for Definition {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.identity.hash(state);
    }
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.identity)
    }
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.identity)
    }
}
