//! Row shapes shared by the document and the durable store.
//!
//! The document keeps each row as a JSON string keyed by its id; the store
//! keeps the same fields as relational rows. Reconciliation compares the two
//! field by field.

use serde::{Deserialize, Serialize};

/// A single mind-map node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    /// Opaque style blob (JSON) owned by the editor
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub collapsed: bool,
    #[serde(default)]
    pub sort_order: i64,
}

impl NodeRecord {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            text: text.into(),
            x: 0.0,
            y: 0.0,
            style: None,
            collapsed: false,
            sort_order: 0,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.x = x;
        self.y = y;
        self
    }
}

/// A link between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
}

impl ConnectionRecord {
    pub fn new(
        id: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            label: None,
            style: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_json_is_camel_case() {
        let node = NodeRecord::new("n1", "Root").with_parent("n0").at(10.0, 20.0);
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"parentId\":\"n0\""));
        assert!(json.contains("\"sortOrder\":0"));
    }

    #[test]
    fn test_node_json_missing_fields_default() {
        let node: NodeRecord = serde_json::from_str(r#"{"id":"n1"}"#).unwrap();
        assert_eq!(node, NodeRecord::new("n1", ""));
    }

    #[test]
    fn test_connection_builder() {
        let conn = ConnectionRecord::new("c1", "a", "b").with_label("depends on");
        assert_eq!(conn.label.as_deref(), Some("depends on"));
        assert_eq!(conn.source_id, "a");
    }
}
