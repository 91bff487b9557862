//! Common metadata for stored resources

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Object metadata carried by templates and hardware records
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name, unique per kind
    pub name: String,

    /// Unique identifier, assigned on first insert
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uuid>,

    /// Labels for organizing resources
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    /// Creation timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl ObjectMeta {
    /// Create new metadata with just a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Fill in the uid and creation timestamp if they are not set yet
    pub fn stamp(&mut self) {
        if self.uid.is_none() {
            self.uid = Some(Uuid::now_v7());
        }
        if self.creation_timestamp.is_none() {
            self.creation_timestamp = Some(chrono::Utc::now());
        }
    }
}

/// Type metadata for stored resources
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    /// API version (e.g., "anvil.metal/v1")
    pub api_version: String,

    /// Kind (e.g., "Hardware", "Template")
    pub kind: String,
}

impl TypeMeta {
    /// Type metadata for Hardware
    pub fn hardware() -> Self {
        Self {
            api_version: crate::API_VERSION.to_string(),
            kind: "Hardware".to_string(),
        }
    }

    /// Type metadata for Template
    pub fn template() -> Self {
        Self {
            api_version: crate::API_VERSION.to_string(),
            kind: "Template".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_meta_new() {
        let meta = ObjectMeta::new("ubuntu-2404");
        assert_eq!(meta.name, "ubuntu-2404");
        assert!(meta.uid.is_none());
        assert!(meta.labels.is_empty());
    }

    #[test]
    fn test_stamp_is_idempotent() {
        let mut meta = ObjectMeta::new("test");
        meta.stamp();
        let uid = meta.uid;
        let created = meta.creation_timestamp;
        assert!(uid.is_some());

        meta.stamp();
        assert_eq!(meta.uid, uid);
        assert_eq!(meta.creation_timestamp, created);
    }

    #[test]
    fn test_type_meta() {
        let meta = TypeMeta::template();
        assert_eq!(meta.api_version, "anvil.metal/v1");
        assert_eq!(meta.kind, "Template");
    }
}
