//! Identity Canonicalisation
//!
//! Every definition and operation carries a canonical identity string.
//! Two requests are equivalent exactly when their identities are equal, so
//! the rules here decide what the cache shares:
//!
//! - JSON parameters compare structurally. Arrays are order-sensitive, object
//!   keys are written in sorted order so `{a, b}` and `{b, a}` collapse.
//! - Function parameters compare by reference. Closures are never inspected;
//!   the `Arc` allocation they live in is their identity.
//! - Stateful definitions (variables, sources) carry an instance number, so
//!   two separately constructed variables never share a slot.

use std::fmt::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::error::GraphError;

/// Shorthand for the JSON value type used throughout the graph.
pub type Json = serde_json::Value;

/// Allocate a fresh instance number for a stateful definition.
pub(crate) fn next_instance() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Write `value` in canonical form.
pub fn write_canonical_json(out: &mut String, value: &Json) {
    match value {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(out, key);
                out.push(':');
                write_canonical_json(out, &map[key.as_str()]);
            }
            out.push('}');
        }
        Json::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_json(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Canonical string for a JSON value.
pub fn canonical_json(value: &Json) -> String {
    let mut out = String::new();
    write_canonical_json(&mut out, value);
    out
}

pub(crate) fn write_json_string(out: &mut String, text: &str) {
    out.push_str(&Json::String(text.to_string()).to_string());
}

/// Convert a serialisable parameter into JSON for use in an operation.
pub(crate) fn to_param<T: Serialize + ?Sized>(
    operation: &'static str,
    value: &T,
) -> Result<Json, GraphError> {
    serde_json::to_value(value).map_err(|e| GraphError::UnserializableOperation {
        operation,
        reason: e.to_string(),
    })
}

/// A function parameter compared by reference.
///
/// Cloning a `FnRef` keeps its identity; wrapping the same closure twice
/// produces two different identities.
pub struct FnRef<F: ?Sized>(Arc<F>);

impl<F: ?Sized> FnRef<F> {
    /// Wrap an already shared function.
    pub fn from_arc(function: Arc<F>) -> Self {
        Self(function)
    }

    /// Reference identity of the function.
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Borrow the function.
    pub fn get(&self) -> &F {
        &self.0
    }

    pub(crate) fn write_identity(&self, out: &mut String) {
        // Infallible for String.
        let _ = write!(out, "fn@{:x}", self.address());
    }
}

impl<F: ?Sized> Clone for FnRef<F> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<F: ?Sized> PartialEq for FnRef<F> {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl<F: ?Sized> Eq for FnRef<F> {}

impl<F: ?Sized> fmt::Debug for FnRef<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn@{:x}", self.address())
    }
}
