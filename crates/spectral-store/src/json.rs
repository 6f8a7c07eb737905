use crate::{MemoryQuery, StorageBackend, StorageError};
use serde::{Deserialize, Serialize};
use spectral_core::MemoryEntry;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default, Serialize, Deserialize)]
struct JsonDocument {
    entries: BTreeMap<Uuid, MemoryEntry>,
}

/// Single-document flavor of the keyed store for small deployments: all
/// entries live in one pretty-printed JSON file, held in memory behind an
/// `RwLock` and rewritten atomically (temp file + rename) on every mutation.
pub struct JsonBackend {
    path: PathBuf,
    state: RwLock<JsonDocument>,
    closed: AtomicBool,
}

impl JsonBackend {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let path = dir.join("memory.json");
        let state = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            JsonDocument::default()
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn persist(&self, doc: &JsonDocument) -> Result<(), StorageError> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(doc)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn sorted_newest_first(mut entries: Vec<MemoryEntry>) -> Vec<MemoryEntry> {
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        entries
    }
}

impl StorageBackend for JsonBackend {
    fn create(&self, entry: &MemoryEntry) -> Result<(), StorageError> {
        self.check_open()?;
        let mut doc = self.state.write().expect("json store lock poisoned");
        if doc.entries.contains_key(&entry.id) {
            return Err(StorageError::Backend(format!(
                "duplicate entry id {}",
                entry.id
            )));
        }
        doc.entries.insert(entry.id, entry.clone());
        self.persist(&doc)
    }

    fn read(&self, id: Uuid) -> Result<Option<MemoryEntry>, StorageError> {
        self.check_open()?;
        let doc = self.state.read().expect("json store lock poisoned");
        Ok(doc.entries.get(&id).cloned())
    }

    fn update(&self, entry: &MemoryEntry) -> Result<(), StorageError> {
        self.check_open()?;
        let mut doc = self.state.write().expect("json store lock poisoned");
        if !doc.entries.contains_key(&entry.id) {
            return Err(StorageError::NotFound(entry.id));
        }
        doc.entries.insert(entry.id, entry.clone());
        self.persist(&doc)
    }

    fn delete(&self, id: Uuid) -> Result<bool, StorageError> {
        self.check_open()?;
        let mut doc = self.state.write().expect("json store lock poisoned");
        let removed = doc.entries.remove(&id).is_some();
        if removed {
            self.persist(&doc)?;
        }
        Ok(removed)
    }

    fn list_all(&self) -> Result<Vec<MemoryEntry>, StorageError> {
        self.check_open()?;
        let doc = self.state.read().expect("json store lock poisoned");
        Ok(Self::sorted_newest_first(
            doc.entries.values().cloned().collect(),
        ))
    }

    fn query(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>, StorageError> {
        self.check_open()?;
        let doc = self.state.read().expect("json store lock poisoned");
        Ok(Self::sorted_newest_first(
            doc.entries
                .values()
                .filter(|e| query.matches(e))
                .cloned()
                .collect(),
        ))
    }

    fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use spectral_core::Provenance;
    use tempfile::TempDir;

    fn entry(key: &str) -> MemoryEntry {
        MemoryEntry {
            id: Uuid::now_v7(),
            category: "preferences".to_string(),
            key: key.to_string(),
            value: serde_json::json!({"key": key}),
            entity_type: "preference".to_string(),
            entity_id: None,
            tags: vec!["pref".to_string()],
            timestamp: Utc::now(),
            provenance: Provenance::new("tests", None),
        }
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let id;
        {
            let backend = JsonBackend::open(dir.path()).expect("open");
            let e = entry("volume");
            id = e.id;
            backend.create(&e).expect("create");
        }
        let backend = JsonBackend::open(dir.path()).expect("reopen");
        let loaded = backend.read(id).expect("read").expect("present");
        assert_eq!(loaded.key, "volume");
    }

    #[test]
    fn delete_is_reported_and_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let backend = JsonBackend::open(dir.path()).expect("open");
        let e = entry("tmp");
        backend.create(&e).expect("create");
        assert!(backend.delete(e.id).expect("delete"));
        assert!(!backend.delete(e.id).expect("delete again"));
        assert!(backend.read(e.id).expect("read").is_none());
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let backend = JsonBackend::open(dir.path()).expect("open");
        let e = entry("dup");
        backend.create(&e).expect("create");
        assert!(backend.create(&e).is_err());
    }

    #[test]
    fn list_orders_newest_first() {
        let dir = TempDir::new().expect("tempdir");
        let backend = JsonBackend::open(dir.path()).expect("open");
        let mut older = entry("older");
        older.timestamp = Utc::now() - chrono::Duration::seconds(60);
        let newer = entry("newer");
        backend.create(&older).expect("create older");
        backend.create(&newer).expect("create newer");
        let all = backend.list_all().expect("list");
        assert_eq!(all[0].key, "newer");
        assert_eq!(all[1].key, "older");
    }
}
