mod json;
mod sqlite;

pub use json::JsonBackend;
pub use sqlite::SqliteBackend;

use spectral_core::MemoryEntry;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("entry not found: {0}")]
    NotFound(Uuid),
    #[error("storage is closed")]
    Closed,
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Filter for `StorageBackend::query`. All set fields must match; `tags`
/// matches when the entry carries at least one of the listed tags.
#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    pub category: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub tags: Vec<String>,
    pub key: Option<String>,
}

impl MemoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    pub fn entity_type(mut self, entity_type: &str) -> Self {
        self.entity_type = Some(entity_type.to_string());
        self
    }

    pub fn entity_id(mut self, entity_id: &str) -> Self {
        self.entity_id = Some(entity_id.to_string());
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = Some(key.to_string());
        self
    }

    pub fn matches(&self, entry: &MemoryEntry) -> bool {
        if let Some(category) = &self.category {
            if &entry.category != category {
                return false;
            }
        }
        if let Some(entity_type) = &self.entity_type {
            if &entry.entity_type != entity_type {
                return false;
            }
        }
        if let Some(entity_id) = &self.entity_id {
            if entry.entity_id.as_deref() != Some(entity_id.as_str()) {
                return false;
            }
        }
        if let Some(key) = &self.key {
            if &entry.key != key {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| entry.tags.contains(t)) {
            return false;
        }
        true
    }
}

/// Abstract keyed store for memory entries. Implementations must support
/// concurrent readers with single-writer consistency; results are ordered
/// newest first.
pub trait StorageBackend: Send + Sync {
    fn create(&self, entry: &MemoryEntry) -> Result<(), StorageError>;
    fn read(&self, id: Uuid) -> Result<Option<MemoryEntry>, StorageError>;
    fn update(&self, entry: &MemoryEntry) -> Result<(), StorageError>;
    fn delete(&self, id: Uuid) -> Result<bool, StorageError>;
    fn list_all(&self) -> Result<Vec<MemoryEntry>, StorageError>;
    fn query(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>, StorageError>;
    /// Flush any buffered state; backends reject operations afterwards.
    fn close(&self) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use spectral_core::Provenance;

    fn sample(category: &str, key: &str, tags: &[&str]) -> MemoryEntry {
        MemoryEntry {
            id: Uuid::now_v7(),
            category: category.to_string(),
            key: key.to_string(),
            value: serde_json::json!({"k": key}),
            entity_type: "test".to_string(),
            entity_id: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            timestamp: Utc::now(),
            provenance: Provenance::new("tests", None),
        }
    }

    #[test]
    fn query_matches_any_listed_tag() {
        let entry = sample("knowledge_chunks", "c1", &["tool_knowledge", "source:doc"]);
        assert!(MemoryQuery::new().tag("tool_knowledge").matches(&entry));
        assert!(MemoryQuery::new()
            .tag("missing")
            .tag("source:doc")
            .matches(&entry));
        assert!(!MemoryQuery::new().tag("missing").matches(&entry));
    }

    #[test]
    fn query_combines_filters_conjunctively() {
        let entry = sample("executions", "e1", &["python"]);
        assert!(MemoryQuery::new()
            .category("executions")
            .tag("python")
            .matches(&entry));
        assert!(!MemoryQuery::new()
            .category("conversations")
            .tag("python")
            .matches(&entry));
    }
}
