use chrono::Utc;
use serde_json::Value;
use spectral_core::{
    ConversationMemory, ExecutionMemory, MemoryEntry, Provenance, CATEGORY_CONVERSATIONS,
    CATEGORY_EXECUTIONS, CATEGORY_PREFERENCES, CATEGORY_TASKS,
};
use spectral_store::{MemoryQuery, StorageBackend, StorageError};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Parameters for a generic memory write.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub category: String,
    pub key: String,
    pub value: Value,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub tags: Vec<String>,
    pub module: String,
    pub task_id: Option<String>,
}

impl NewMemory {
    pub fn new(category: &str, key: &str, value: Value) -> Self {
        Self {
            category: category.to_string(),
            key: key.to_string(),
            value,
            entity_type: category.trim_end_matches('s').to_string(),
            entity_id: None,
            tags: Vec::new(),
            module: "memory".to_string(),
            task_id: None,
        }
    }

    pub fn entity(mut self, entity_type: &str, entity_id: Option<&str>) -> Self {
        self.entity_type = entity_type.to_string();
        self.entity_id = entity_id.map(str::to_string);
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn from_module(mut self, module: &str, task_id: Option<&str>) -> Self {
        self.module = module.to_string();
        self.task_id = task_id.map(str::to_string);
        self
    }
}

/// Semantic layer over the storage backend. Entries are exclusively owned
/// here: callers get clones, and mutation happens only through
/// `update_memory`, which restamps `timestamp` and provenance.
pub struct MemoryService {
    backend: Arc<dyn StorageBackend>,
}

impl MemoryService {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn create_memory(&self, new: NewMemory) -> Result<Uuid, StorageError> {
        let entry = MemoryEntry {
            id: Uuid::now_v7(),
            category: new.category,
            key: new.key,
            value: new.value,
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            tags: new.tags,
            timestamp: Utc::now(),
            provenance: Provenance::new(&new.module, new.task_id.as_deref()),
        };
        self.backend.create(&entry)?;
        Ok(entry.id)
    }

    pub fn get_memory(&self, id: Uuid) -> Result<Option<MemoryEntry>, StorageError> {
        self.backend.read(id)
    }

    /// Replace an entry's value (and optionally tags), refreshing the
    /// timestamp and `provenance.updated_at`.
    pub fn update_memory(
        &self,
        id: Uuid,
        value: Value,
        tags: Option<Vec<String>>,
    ) -> Result<(), StorageError> {
        let Some(mut entry) = self.backend.read(id)? else {
            return Err(StorageError::NotFound(id));
        };
        entry.value = value;
        if let Some(tags) = tags {
            entry.tags = tags;
        }
        entry.timestamp = Utc::now();
        entry.provenance.updated_at = entry.timestamp;
        self.backend.update(&entry)
    }

    pub fn delete_memory(&self, id: Uuid) -> Result<bool, StorageError> {
        self.backend.delete(id)
    }

    pub fn list_memories(&self) -> Result<Vec<MemoryEntry>, StorageError> {
        self.backend.list_all()
    }

    pub fn get_memories_by_category(
        &self,
        category: &str,
    ) -> Result<Vec<MemoryEntry>, StorageError> {
        self.backend.query(&MemoryQuery::new().category(category))
    }

    pub fn get_memories_by_entity(
        &self,
        entity_type: &str,
        entity_id: Option<&str>,
    ) -> Result<Vec<MemoryEntry>, StorageError> {
        let mut query = MemoryQuery::new().entity_type(entity_type);
        if let Some(entity_id) = entity_id {
            query = query.entity_id(entity_id);
        }
        self.backend.query(&query)
    }

    pub fn get_memories_by_tags(&self, tags: &[String]) -> Result<Vec<MemoryEntry>, StorageError> {
        let mut query = MemoryQuery::new();
        for tag in tags {
            query = query.tag(tag);
        }
        self.backend.query(&query)
    }

    /// First entry whose semantic key matches, newest first.
    pub fn get_memory_by_key(&self, key: &str) -> Result<Option<MemoryEntry>, StorageError> {
        Ok(self
            .backend
            .query(&MemoryQuery::new().key(key))?
            .into_iter()
            .next())
    }

    // ── User preferences ────────────────────────────────────────────────────

    pub fn set_user_preference(&self, key: &str, value: Value) -> Result<Uuid, StorageError> {
        if let Some(existing) = self
            .backend
            .query(&MemoryQuery::new().category(CATEGORY_PREFERENCES).key(key))?
            .into_iter()
            .next()
        {
            self.update_memory(existing.id, value, None)?;
            return Ok(existing.id);
        }
        self.create_memory(
            NewMemory::new(CATEGORY_PREFERENCES, key, value).entity("preference", None),
        )
    }

    pub fn get_user_preferences(&self) -> Result<BTreeMap<String, Value>, StorageError> {
        let mut out = BTreeMap::new();
        for entry in self.get_memories_by_category(CATEGORY_PREFERENCES)? {
            out.entry(entry.key).or_insert(entry.value);
        }
        Ok(out)
    }

    // ── Task history ────────────────────────────────────────────────────────

    pub fn record_task(
        &self,
        task_id: &str,
        description: &str,
        outcome: Value,
    ) -> Result<Uuid, StorageError> {
        self.create_memory(
            NewMemory::new(
                CATEGORY_TASKS,
                task_id,
                serde_json::json!({"description": description, "outcome": outcome}),
            )
            .entity("task", Some(task_id))
            .from_module("memory", Some(task_id)),
        )
    }

    pub fn get_task_history(&self, limit: Option<usize>) -> Result<Vec<MemoryEntry>, StorageError> {
        let mut entries = self.get_memories_by_category(CATEGORY_TASKS)?;
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    // ── Conversation / execution specializations ────────────────────────────

    /// Persist a full turn. Each execution in the turn's history is also
    /// written as its own entry, linked to the turn by `entity_id`.
    pub fn save_conversation_turn(
        &self,
        conversation: &ConversationMemory,
    ) -> Result<Uuid, StorageError> {
        let turn_key = format!("turn-{}", conversation.turn_id);
        let id = self.create_memory(
            NewMemory::new(
                CATEGORY_CONVERSATIONS,
                &turn_key,
                serde_json::to_value(conversation)?,
            )
            .entity("conversation", Some(&conversation.turn_id.to_string()))
            .tags(conversation.context_tags.clone()),
        )?;
        for execution in &conversation.execution_history {
            // An execution may already be persisted by the path that ran
            // it; keep the link unique.
            let key = format!("execution-{}", execution.execution_id);
            if self.get_memory_by_key(&key)?.is_none() {
                self.save_execution(execution, conversation.turn_id)?;
            }
        }
        Ok(id)
    }

    pub fn save_execution(
        &self,
        execution: &ExecutionMemory,
        turn_id: Uuid,
    ) -> Result<Uuid, StorageError> {
        self.create_memory(
            NewMemory::new(
                CATEGORY_EXECUTIONS,
                &format!("execution-{}", execution.execution_id),
                serde_json::to_value(execution)?,
            )
            .entity("execution", Some(&turn_id.to_string()))
            .tags(execution.tags.clone()),
        )
    }

    pub fn get_conversation_history(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationMemory>, StorageError> {
        let mut out = Vec::new();
        for entry in self.get_memories_by_category(CATEGORY_CONVERSATIONS)? {
            if let Ok(conversation) = serde_json::from_value(entry.value) {
                out.push(conversation);
            }
        }
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn executions(&self) -> Result<Vec<ExecutionMemory>, StorageError> {
        let mut out = Vec::new();
        for entry in self.get_memories_by_category(CATEGORY_EXECUTIONS)? {
            if let Ok(execution) = serde_json::from_value(entry.value) {
                out.push(execution);
            }
        }
        Ok(out)
    }

    /// Rank stored executions against a free-form query. Candidates must
    /// share at least a word or substring with the query; ties break by
    /// Jaro-Winkler similarity over the description.
    pub fn search_by_description(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionMemory>, StorageError> {
        let query_lc = query.to_lowercase();
        let query_words: Vec<&str> = query_lc.split_whitespace().collect();
        let mut scored: Vec<(f64, ExecutionMemory)> = Vec::new();
        for execution in self.executions()? {
            let desc_lc = execution.description.to_lowercase();
            let request_lc = execution.user_request.to_lowercase();
            let overlaps = query_words
                .iter()
                .any(|w| w.len() > 2 && (desc_lc.contains(w) || request_lc.contains(w)));
            if !overlaps && !desc_lc.contains(&query_lc) {
                continue;
            }
            let score = strsim::jaro_winkler(&query_lc, &desc_lc)
                .max(strsim::jaro_winkler(&query_lc, &request_lc));
            scored.push((score, execution));
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(limit).map(|(_, e)| e).collect())
    }

    pub fn get_executions_by_tag(
        &self,
        tag: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionMemory>, StorageError> {
        let mut out = Vec::new();
        for entry in self
            .backend
            .query(&MemoryQuery::new().category(CATEGORY_EXECUTIONS).tag(tag))?
        {
            if let Ok(execution) = serde_json::from_value(entry.value) {
                out.push(execution);
            }
        }
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// File paths recorded by the execution that best matches `description`.
    pub fn get_file_locations(&self, description: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .search_by_description(description, 1)?
            .into_iter()
            .next()
            .map(|e| e.file_locations)
            .unwrap_or_default())
    }

    /// Human-readable transcript of the most recent turns, oldest first,
    /// for direct prompt injection.
    pub fn get_recent_context(&self, num_turns: usize) -> Result<String, StorageError> {
        let mut turns = self.get_conversation_history(Some(num_turns))?;
        turns.reverse();
        let mut out = String::new();
        for turn in &turns {
            out.push_str(&format!("User: {}\n", turn.user_message.trim()));
            out.push_str(&format!("Assistant: {}\n", turn.assistant_response.trim()));
        }
        Ok(out.trim_end().to_string())
    }

    pub fn clear_all(&self) -> Result<usize, StorageError> {
        let entries = self.backend.list_all()?;
        let mut removed = 0;
        for entry in entries {
            if self.backend.delete(entry.id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Flush and close the backend; all later operations fail with
    /// `StorageError::Closed`.
    pub fn shutdown(&self) -> Result<(), StorageError> {
        self.backend.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral_store::SqliteBackend;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> MemoryService {
        let backend = SqliteBackend::open(dir.path()).expect("open backend");
        MemoryService::new(Arc::new(backend))
    }

    fn execution(description: &str, files: &[&str]) -> ExecutionMemory {
        ExecutionMemory {
            execution_id: Uuid::now_v7(),
            timestamp: Utc::now(),
            user_request: description.to_string(),
            description: description.to_string(),
            code_generated: String::new(),
            file_locations: files.iter().map(|f| f.to_string()).collect(),
            output: "ok".to_string(),
            success: true,
            tags: vec!["python".to_string()],
            execution_time_ms: Some(12),
            error_message: None,
        }
    }

    #[test]
    fn update_refreshes_timestamp_and_provenance() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(&dir);
        let id = service
            .create_memory(NewMemory::new("preferences", "volume", serde_json::json!(3)))
            .expect("create");
        let before = service.get_memory(id).expect("get").expect("present");
        std::thread::sleep(std::time::Duration::from_millis(5));
        service
            .update_memory(id, serde_json::json!(7), None)
            .expect("update");
        let after = service.get_memory(id).expect("get").expect("present");
        assert_eq!(after.value, serde_json::json!(7));
        assert!(after.timestamp > before.timestamp);
        assert!(after.provenance.updated_at > before.provenance.updated_at);
        assert_eq!(after.provenance.created_at, before.provenance.created_at);
    }

    #[test]
    fn missing_lookups_return_empty_not_error() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(&dir);
        assert!(service
            .get_memory(Uuid::now_v7())
            .expect("get")
            .is_none());
        assert!(service
            .get_memory_by_key("nothing")
            .expect("by key")
            .is_none());
        assert!(service
            .search_by_description("anything", 5)
            .expect("search")
            .is_empty());
    }

    #[test]
    fn conversation_turn_links_executions_by_turn_id() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(&dir);
        let turn_id = Uuid::now_v7();
        let conversation = ConversationMemory {
            turn_id,
            timestamp: Utc::now(),
            user_message: "create hello.txt".to_string(),
            assistant_response: "done".to_string(),
            execution_history: vec![execution("Created hello.txt", &["/tmp/s/hello.txt"])],
            context_tags: vec![],
            session_id: None,
            embedding: None,
        };
        service
            .save_conversation_turn(&conversation)
            .expect("save turn");

        let linked = service
            .get_memories_by_entity("execution", Some(&turn_id.to_string()))
            .expect("linked");
        assert_eq!(linked.len(), 1);
    }

    #[test]
    fn search_by_description_ranks_best_match_first() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(&dir);
        let turn = Uuid::now_v7();
        service
            .save_execution(&execution("Created file hello.txt in sandbox", &[]), turn)
            .expect("save");
        service
            .save_execution(&execution("Launched the calculator application", &[]), turn)
            .expect("save");

        let hits = service
            .search_by_description("created hello file", 5)
            .expect("search");
        assert!(!hits.is_empty());
        assert!(hits[0].description.contains("hello.txt"));
    }

    #[test]
    fn file_locations_come_from_best_matching_execution() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(&dir);
        service
            .save_execution(
                &execution("Created the file hello.txt", &["/tmp/sandbox/hello.txt"]),
                Uuid::now_v7(),
            )
            .expect("save");
        let files = service
            .get_file_locations("that hello file")
            .expect("locations");
        assert_eq!(files, vec!["/tmp/sandbox/hello.txt".to_string()]);
    }

    #[test]
    fn recent_context_renders_transcript_oldest_first() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(&dir);
        for (idx, (user, assistant)) in
            [("hi", "hello"), ("list files", "two files found")].iter().enumerate()
        {
            let conversation = ConversationMemory {
                turn_id: Uuid::now_v7(),
                timestamp: Utc::now() + chrono::Duration::milliseconds(idx as i64),
                user_message: user.to_string(),
                assistant_response: assistant.to_string(),
                execution_history: vec![],
                context_tags: vec![],
                session_id: None,
                embedding: None,
            };
            service
                .save_conversation_turn(&conversation)
                .expect("save turn");
        }
        let context = service.get_recent_context(5).expect("context");
        let hi = context.find("User: hi").expect("first turn present");
        let list = context.find("User: list files").expect("second turn present");
        assert!(hi < list);
    }

    #[test]
    fn preferences_upsert_in_place() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(&dir);
        let first = service
            .set_user_preference("theme", serde_json::json!("dark"))
            .expect("set");
        let second = service
            .set_user_preference("theme", serde_json::json!("light"))
            .expect("set again");
        assert_eq!(first, second);
        let prefs = service.get_user_preferences().expect("prefs");
        assert_eq!(prefs["theme"], serde_json::json!("light"));
    }

    #[test]
    fn shutdown_rejects_new_operations() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(&dir);
        service.shutdown().expect("shutdown");
        assert!(matches!(
            service.list_memories(),
            Err(StorageError::Closed)
        ));
    }
}
