use crate::{MemoryQuery, StorageBackend, StorageError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use spectral_core::{MemoryEntry, Provenance, CATEGORY_EXECUTIONS};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Forward-only schema migrations keyed by version. Applied under
/// `PRAGMA user_version`; each batch must be safe to re-run on a database
/// that already carries it.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS entries (
            id TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            tags TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            provenance TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_entries_category ON entries(category);
         CREATE INDEX IF NOT EXISTS idx_entries_entity_type ON entries(entity_type);
         CREATE INDEX IF NOT EXISTS idx_entries_timestamp ON entries(timestamp);",
    ),
    (
        2,
        "CREATE INDEX IF NOT EXISTS idx_entries_category_key ON entries(category, key);",
    ),
];

/// Row-oriented flavor of the keyed store: one SQLite file with indexed
/// columns on `category`, `entity_type`, `entity_id`, and `timestamp`.
/// Connections are opened per call (concurrent readers; SQLite serializes
/// the single writer).
pub struct SqliteBackend {
    db_path: PathBuf,
    closed: AtomicBool,
}

impl SqliteBackend {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;
        let backend = Self {
            db_path: dir.join("memory.sqlite"),
            closed: AtomicBool::new(false),
        };
        backend.init_db()?;
        Ok(backend)
    }

    fn init_db(&self) -> Result<(), StorageError> {
        let conn = self.raw_conn()?;
        let current: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        for (version, sql) in MIGRATIONS {
            if *version > current {
                conn.execute_batch(sql)?;
                conn.pragma_update(None, "user_version", version)?;
            }
        }
        // Idempotent column adds for databases created by older builds.
        ensure_column(&conn, "entries", "entity_id", "TEXT")?;
        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_entries_entity_id ON entries(entity_id);",
        )?;
        backfill_legacy_code_field(&conn)?;
        Ok(())
    }

    fn raw_conn(&self) -> Result<Connection, StorageError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    fn conn(&self) -> Result<Connection, StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        self.raw_conn()
    }
}

/// Add a column when the table does not carry it yet.
fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<(), StorageError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |r| r.get::<_, String>(1))?
        .collect::<Result<_, _>>()?;
    if !existing.iter().any(|name| name == column) {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
    }
    Ok(())
}

/// Older builds stored generated code under a `code` field inside execution
/// documents. Copy it into `code_generated` wherever the new field is empty.
fn backfill_legacy_code_field(conn: &Connection) -> Result<(), StorageError> {
    let mut stmt =
        conn.prepare("SELECT id, value FROM entries WHERE category = ?1 AND value LIKE '%\"code\"%'")?;
    let rows: Vec<(String, String)> = stmt
        .query_map([CATEGORY_EXECUTIONS], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<_, _>>()?;

    for (id, raw) in rows {
        let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&raw) else {
            continue;
        };
        let legacy = value
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let current = value
            .get("code_generated")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if legacy.is_empty() || !current.is_empty() {
            continue;
        }
        value["code_generated"] = serde_json::Value::String(legacy);
        conn.execute(
            "UPDATE entries SET value = ?1 WHERE id = ?2",
            params![serde_json::to_string(&value)?, id],
        )?;
    }
    Ok(())
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let id: String = row.get(0)?;
    let timestamp: String = row.get(6)?;
    let tags: String = row.get(5)?;
    let provenance: String = row.get(7)?;
    Ok(MemoryEntry {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        category: row.get(1)?,
        key: row.get(2)?,
        value: serde_json::from_str(&row.get::<_, String>(3)?)
            .unwrap_or(serde_json::Value::Null),
        entity_type: row.get(4)?,
        entity_id: row.get(8)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        timestamp: timestamp
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        provenance: serde_json::from_str(&provenance)
            .unwrap_or_else(|_| Provenance::new("unknown", None)),
    })
}

const ENTRY_COLUMNS: &str =
    "id, category, key, value, entity_type, tags, timestamp, provenance, entity_id";

impl StorageBackend for SqliteBackend {
    fn create(&self, entry: &MemoryEntry) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO entries (id, category, key, value, entity_type, entity_id, tags, timestamp, provenance)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.id.to_string(),
                entry.category,
                entry.key,
                serde_json::to_string(&entry.value)?,
                entry.entity_type,
                entry.entity_id,
                serde_json::to_string(&entry.tags)?,
                entry.timestamp.to_rfc3339(),
                serde_json::to_string(&entry.provenance)?,
            ],
        )?;
        Ok(())
    }

    fn read(&self, id: Uuid) -> Result<Option<MemoryEntry>, StorageError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(row_to_entry(row)?));
        }
        Ok(None)
    }

    fn update(&self, entry: &MemoryEntry) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE entries SET category = ?2, key = ?3, value = ?4, entity_type = ?5,
                    entity_id = ?6, tags = ?7, timestamp = ?8, provenance = ?9
             WHERE id = ?1",
            params![
                entry.id.to_string(),
                entry.category,
                entry.key,
                serde_json::to_string(&entry.value)?,
                entry.entity_type,
                entry.entity_id,
                serde_json::to_string(&entry.tags)?,
                entry.timestamp.to_rfc3339(),
                serde_json::to_string(&entry.provenance)?,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(entry.id));
        }
        Ok(())
    }

    fn delete(&self, id: Uuid) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM entries WHERE id = ?1", [id.to_string()])?;
        Ok(changed > 0)
    }

    fn list_all(&self) -> Result<Vec<MemoryEntry>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries ORDER BY timestamp DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], row_to_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn query(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>, StorageError> {
        let conn = self.conn()?;
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(category) = &query.category {
            args.push(category.clone());
            clauses.push(format!("category = ?{}", args.len()));
        }
        if let Some(entity_type) = &query.entity_type {
            args.push(entity_type.clone());
            clauses.push(format!("entity_type = ?{}", args.len()));
        }
        if let Some(entity_id) = &query.entity_id {
            args.push(entity_id.clone());
            clauses.push(format!("entity_id = ?{}", args.len()));
        }
        if let Some(key) = &query.key {
            args.push(key.clone());
            clauses.push(format!("key = ?{}", args.len()));
        }
        if !query.tags.is_empty() {
            // Substring membership over the serialized tag array; the exact
            // match is re-checked on the deserialized entry below.
            let mut tag_clauses = Vec::new();
            for tag in &query.tags {
                args.push(format!("%\"{tag}\"%"));
                tag_clauses.push(format!("tags LIKE ?{}", args.len()));
            }
            clauses.push(format!("({})", tag_clauses.join(" OR ")));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries {where_sql} ORDER BY timestamp DESC, id DESC"
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_entry)?;
        let mut out = Vec::new();
        for row in rows {
            let entry = row?;
            if query.matches(&entry) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
