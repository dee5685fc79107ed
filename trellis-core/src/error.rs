//! Error Types
//!
//! Two kinds of failure exist in the engine and they travel differently:
//!
//! - [`GraphError`] is returned from public entry points. Only integrity
//!   failures (a missing id in the store), unusable inputs and disposal
//!   surface this way.
//!
//! - [`ErrorInfo`] is the *data* form of a failed resolution. A handler that
//!   fails produces an error node carrying an `ErrorInfo`; that node flows
//!   downstream like any other value so combinators such as `catch_error`
//!   can intercept it.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

use crate::model::Key;

/// Errors returned by the public graph API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A node, operation, action, scope or context id is missing from the store.
    ///
    /// This indicates an inconsistent cache and is never defaulted away.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up.
        kind: &'static str,
        /// The raw id.
        id: u64,
    },

    /// An operation parameter could not be turned into a stable identity.
    #[error("cannot derive identity for {operation} operation: {reason}")]
    UnserializableOperation {
        /// The operation type name.
        operation: &'static str,
        /// Why serialisation failed.
        reason: String,
    },

    /// An action was requested while it was already resolving.
    #[error("cyclic resolution detected at action {action}")]
    CyclicResolution {
        /// The raw action id.
        action: u64,
    },

    /// The graph was disposed.
    #[error("graph has been disposed")]
    Disposed,

    /// A path step cannot be expressed as a query.
    #[error("invalid path step: {0}")]
    InvalidPath(String),

    /// A snapshot could not be encoded.
    #[error("failed to encode snapshot: {0}")]
    Encode(String),

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl GraphError {
    pub(crate) fn not_found(kind: &'static str, id: u64) -> Self {
        let error = Self::NotFound { kind, id };
        tracing::error!(%error, "store integrity failure");
        error
    }
}

/// Classifies an [`ErrorInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A handler or user function reported a failure.
    Resolution,
    /// Resolution looped back onto an action that was still resolving.
    Cyclic,
    /// The node type does not support the operation.
    Unsupported,
    /// A child key does not exist.
    InvalidKey,
    /// A value had the wrong shape for the operation.
    TypeMismatch,
    /// Resolution nested deeper than the configured limit.
    DepthExceeded,
    /// A handler panicked.
    Panic,
}

impl ErrorCode {
    /// Stable name used in identities and snapshots.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolution => "resolution",
            Self::Cyclic => "cyclic",
            Self::Unsupported => "unsupported",
            Self::InvalidKey => "invalid_key",
            Self::TypeMismatch => "type_mismatch",
            Self::DepthExceeded => "depth_exceeded",
            Self::Panic => "panic",
        }
    }
}

/// A resolution failure carried through the graph as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// What kind of failure this is.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// The query path that produced the error, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<SmallVec<[Key; 4]>>,
}

impl ErrorInfo {
    /// Create an error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: None,
        }
    }

    /// A generic resolution failure, as returned by user functions.
    pub fn resolution(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Resolution, message)
    }

    pub(crate) fn cyclic(action: u64) -> Self {
        Self::new(
            ErrorCode::Cyclic,
            GraphError::CyclicResolution { action }.to_string(),
        )
    }

    /// Attach a path if none is recorded yet.
    ///
    /// The innermost annotation wins, it is the most precise one.
    pub fn at_path(mut self, path: Option<SmallVec<[Key; 4]>>) -> Self {
        if self.path.is_none() {
            self.path = path;
        }
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(path) = &self.path {
            let segments: Vec<String> = path.iter().map(ToString::to_string).collect();
            write!(f, " (at {})", segments.join("."))?;
        }
        Ok(())
    }
}

impl From<&str> for ErrorInfo {
    fn from(message: &str) -> Self {
        Self::resolution(message)
    }
}

impl From<String> for ErrorInfo {
    fn from(message: String) -> Self {
        Self::resolution(message)
    }
}
