//! Graph configuration.

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Tunables for one graph instance.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```rust
/// use trellis_core::GraphConfig;
///
/// let config = GraphConfig::from_json(r#"{ "max_depth": 32 }"#).unwrap();
/// assert_eq!(config.max_depth, 32);
/// assert!(config.catch_panics);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Label attached to tracing spans of this graph.
    pub label: String,

    /// Maximum nesting of resolutions before an action fails with
    /// `depth_exceeded`. Resolution recurses on the calling thread, so the
    /// default fits a 2 MiB thread stack.
    pub max_depth: usize,

    /// Turn handler panics into `panic` error nodes instead of unwinding
    /// through the caller.
    pub catch_panics: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            label: "graph".to_string(),
            max_depth: 64,
            catch_panics: true,
        }
    }
}

impl GraphConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(source: &str) -> Result<Self, GraphError> {
        serde_json::from_str(source).map_err(|e| GraphError::Config(e.to_string()))
    }

    /// Set the label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the maximum resolution depth.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = GraphConfig::from_json("{}").unwrap();
        assert_eq!(config, GraphConfig::default());
    }

    #[test]
    fn rejects_malformed_json() {
        let err = GraphConfig::from_json("{ max_depth: }").unwrap_err();
        assert!(matches!(err, GraphError::Config(_)));
    }
}
