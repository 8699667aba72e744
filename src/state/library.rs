use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension};
use tokio::task;

use super::data::{Collection, CollectionSpec, Record};
use crate::error::{Result, StoreError};

/// Schema version written to `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 1;

/// The Library is the local catalog database.
/// It holds every collection (projects, files, models, training sessions,
/// settings) as JSON rows keyed by string id, with one column per
/// declared secondary index.
///
/// All operations run their SQL on the blocking pool, one statement per
/// call, so each write is a single commit. There are no transactions
/// spanning collections.
#[derive(Clone)]
pub struct Library {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

/// Raw row pulled out of a collection table
type Row = (String, Option<Vec<u8>>);

impl Library {
    /// Open (or create) the catalog at `db_path` and initialize the schema.
    ///
    /// Fails with `StoreOpen` when the file cannot be opened and with
    /// `VersionConflict` when it was written by a newer schema.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&db_path).map_err(|source| StoreError::StoreOpen {
            path: db_path.display().to_string(),
            source,
        })?;

        let library = Library {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        };
        library.init_schema()?;

        tracing::info!("📁 Local store opened at: {}", library.db_path.display());
        Ok(library)
    }

    /// Open a throwaway in-memory catalog
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::StoreOpen {
            path: ":memory:".to_string(),
            source,
        })?;
        let library = Library {
            conn: Arc::new(Mutex::new(conn)),
            db_path: PathBuf::from(":memory:"),
        };
        library.init_schema()?;
        Ok(library)
    }

    /// Create every declared collection table and its indexes.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        let found: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if found > SCHEMA_VERSION {
            return Err(StoreError::VersionConflict {
                found,
                supported: SCHEMA_VERSION,
            });
        }

        for collection in Collection::ALL {
            let spec = collection.spec();

            let mut columns = vec![format!("{} TEXT PRIMARY KEY", spec.key)];
            columns.extend(spec.indices.iter().map(|ix| format!("{} TEXT", index_column(ix))));
            if spec.blob {
                columns.push("blob BLOB".to_string());
            }
            columns.push("body TEXT NOT NULL".to_string());

            conn.execute(
                &format!("CREATE TABLE IF NOT EXISTS {} ({})", spec.name, columns.join(", ")),
                [],
            )?;

            for ix in spec.indices {
                conn.execute(
                    &format!(
                        "CREATE INDEX IF NOT EXISTS idx_{name}_{col} ON {name}({col})",
                        name = spec.name,
                        col = index_column(ix),
                    ),
                    [],
                )?;
            }
        }

        if found < SCHEMA_VERSION {
            conn.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
        }

        tracing::debug!("Local store schema at version {}", SCHEMA_VERSION);
        Ok(())
    }

    /// Get the path to the database file
    pub fn path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Insert a new record, generating an id when it has none.
    /// Returns the stored record.
    pub async fn add<T: Record>(&self, mut record: T) -> Result<T> {
        if record.id().is_empty() {
            record.set_id(generate_id());
        }
        let spec = T::COLLECTION.spec();
        let encoded = Encoded::from_record(&record, &spec)?;
        let id = record.id().to_string();

        let outcome = self
            .with_conn(move |conn| {
                let (sql, values) = encoded.insert_sql(&spec, "INSERT");
                conn.execute(&sql, params_from_iter(values.iter()))
                    .map(|_| ())
                    .map_err(|err| duplicate_or(err, spec.name, &encoded.id))
            })
            .await;

        outcome?;
        tracing::debug!("Added {} record {}", spec.name, id);
        Ok(record)
    }

    /// Insert or replace a record by id
    pub async fn put<T: Record>(&self, record: &T) -> Result<()> {
        let spec = T::COLLECTION.spec();
        let encoded = Encoded::from_record(record, &spec)?;

        self.with_conn(move |conn| {
            let (sql, values) = encoded.insert_sql(&spec, "INSERT OR REPLACE");
            conn.execute(&sql, params_from_iter(values.iter()))?;
            Ok(())
        })
        .await
    }

    /// Fetch one record by id
    pub async fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        let spec = T::COLLECTION.spec();
        let id = id.to_string();

        let row: Option<Row> = self
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {} FROM {} WHERE {} = ?1",
                    select_columns(&spec),
                    spec.name,
                    spec.key
                );
                let row = conn
                    .query_row(&sql, [&id], |row| read_row(row, &spec))
                    .optional()?;
                Ok(row)
            })
            .await?;

        row.map(decode::<T>).transpose()
    }

    /// Fetch one record by id, failing with `NotFound` when it does not exist
    pub async fn require<T: Record>(&self, id: &str) -> Result<T> {
        self.get::<T>(id).await?.ok_or_else(|| StoreError::NotFound {
            collection: T::COLLECTION.name(),
            id: id.to_string(),
        })
    }

    /// Every record of a collection, in insertion order
    pub async fn get_all<T: Record>(&self) -> Result<Vec<T>> {
        let spec = T::COLLECTION.spec();

        let rows: Vec<Row> = self
            .with_conn(move |conn| {
                let sql = format!("SELECT {} FROM {} ORDER BY rowid", select_columns(&spec), spec.name);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], |row| read_row(row, &spec))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(decode::<T>).collect()
    }

    /// Records whose secondary index `index` equals `value`, in insertion order
    pub async fn get_by_index<T: Record>(&self, index: &str, value: &str) -> Result<Vec<T>> {
        let spec = T::COLLECTION.spec();
        if !spec.indices.contains(&index) {
            return Err(StoreError::UnknownIndex {
                collection: spec.name,
                index: index.to_string(),
            });
        }
        let column = index_column(index);
        let value = value.to_string();

        let rows: Vec<Row> = self
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {} FROM {} WHERE {} = ?1 ORDER BY rowid",
                    select_columns(&spec),
                    spec.name,
                    column
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([&value], |row| read_row(row, &spec))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(decode::<T>).collect()
    }

    /// Replace an existing record. Fails with `NotFound` if the id is unknown.
    pub async fn update<T: Record>(&self, record: &T) -> Result<()> {
        let spec = T::COLLECTION.spec();
        let encoded = Encoded::from_record(record, &spec)?;

        let changed = self
            .with_conn(move |conn| {
                let mut assignments: Vec<String> = spec
                    .indices
                    .iter()
                    .enumerate()
                    .map(|(i, ix)| format!("{} = ?{}", index_column(ix), i + 2))
                    .collect();
                let mut next = spec.indices.len() + 2;
                if spec.blob {
                    assignments.push(format!("blob = ?{}", next));
                    next += 1;
                }
                assignments.push(format!("body = ?{}", next));

                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = ?1",
                    spec.name,
                    assignments.join(", "),
                    spec.key
                );
                let changed = conn.execute(&sql, params_from_iter(encoded.values(&spec).iter()))?;
                Ok(changed)
            })
            .await?;

        if changed == 0 {
            return Err(StoreError::NotFound {
                collection: spec.name,
                id: record.id().to_string(),
            });
        }
        Ok(())
    }

    /// Remove a record by id. Returns whether a row was deleted.
    pub async fn delete<T: Record>(&self, id: &str) -> Result<bool> {
        let spec = T::COLLECTION.spec();
        let id = id.to_string();

        let changed = self
            .with_conn(move |conn| {
                let sql = format!("DELETE FROM {} WHERE {} = ?1", spec.name, spec.key);
                let changed = conn.execute(&sql, [&id])?;
                Ok(changed)
            })
            .await?;

        Ok(changed > 0)
    }

    /// Number of records in a collection
    pub async fn count<T: Record>(&self) -> Result<usize> {
        let spec = T::COLLECTION.spec();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", spec.name), [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    /// Run raw SQL against the catalog
    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        self.with_conn(move |conn| Ok(conn.execute_batch(&sql)?)).await
    }

    /// Run a closure against the shared connection on the blocking pool
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Task join error: {}", e),
            ))
        })?
    }
}

/// A record flattened into column values, ready to bind
struct Encoded {
    id: String,
    index_values: Vec<Option<String>>,
    blob: Option<Vec<u8>>,
    body: String,
}

impl Encoded {
    fn from_record<T: Record>(record: &T, spec: &CollectionSpec) -> Result<Self> {
        Ok(Encoded {
            id: record.id().to_string(),
            index_values: spec.indices.iter().map(|ix| record.index_value(ix)).collect(),
            blob: if spec.blob { record.blob().map(|b| b.to_vec()) } else { None },
            body: serde_json::to_string(record)?,
        })
    }

    /// Bound values in column order: id, indices, blob (if declared), body
    fn values(&self, spec: &CollectionSpec) -> Vec<Value> {
        let mut values = vec![Value::Text(self.id.clone())];
        values.extend(
            self.index_values
                .iter()
                .map(|v| v.clone().map(Value::Text).unwrap_or(Value::Null)),
        );
        if spec.blob {
            values.push(self.blob.clone().map(Value::Blob).unwrap_or(Value::Null));
        }
        values.push(Value::Text(self.body.clone()));
        values
    }

    fn insert_sql(&self, spec: &CollectionSpec, verb: &str) -> (String, Vec<Value>) {
        let mut columns = vec![spec.key.to_string()];
        columns.extend(spec.indices.iter().map(|ix| index_column(ix)));
        if spec.blob {
            columns.push("blob".to_string());
        }
        columns.push("body".to_string());

        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "{} INTO {} ({}) VALUES ({})",
            verb,
            spec.name,
            columns.join(", "),
            placeholders.join(", ")
        );
        (sql, self.values(spec))
    }
}

fn index_column(index: &str) -> String {
    format!("ix_{}", index)
}

fn select_columns(spec: &CollectionSpec) -> &'static str {
    if spec.blob {
        "body, blob"
    } else {
        "body, NULL"
    }
}

fn read_row(row: &rusqlite::Row<'_>, _spec: &CollectionSpec) -> rusqlite::Result<Row> {
    Ok((row.get(0)?, row.get(1)?))
}

fn decode<T: Record>((body, blob): Row) -> Result<T> {
    let mut record: T = serde_json::from_str(&body)?;
    if let Some(bytes) = blob {
        record.attach_blob(bytes);
    }
    Ok(record)
}

fn duplicate_or(err: rusqlite::Error, collection: &'static str, id: &str) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _) if code.code == ErrorCode::ConstraintViolation => {
            StoreError::Duplicate {
                collection,
                id: id.to_string(),
            }
        }
        _ => StoreError::from(err),
    }
}

/// Timestamp plus random suffix. Unique within one process, not across processes.
pub fn generate_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("{}-{}", Utc::now().timestamp_millis(), suffix)
}

// Implement Debug for better error messages
impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("db_path", &self.db_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::data::{
        FileLocation, FileRecord, Project, ProjectStatus, Setting, SessionStatus, TrainingConfig,
        TrainingSession,
    };

    fn project(name: &str) -> Project {
        let now = Utc::now();
        Project {
            id: String::new(),
            name: name.to_string(),
            description: None,
            status: ProjectStatus::Created,
            stage: "created".to_string(),
            progress: 0,
            created: now,
            updated: now,
        }
    }

    fn file(project_id: &str, name: &str, inline: Option<Vec<u8>>) -> FileRecord {
        FileRecord {
            id: String::new(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            size: inline.as_ref().map(|b| b.len() as u64).unwrap_or(0),
            mime_type: "text/csv".to_string(),
            uploaded_at: Utc::now(),
            location: if inline.is_some() { FileLocation::InlineBlob } else { FileLocation::DurableStore },
            inline_content: inline,
            analysis: None,
        }
    }

    #[tokio::test]
    async fn test_add_generates_id_and_get_round_trips() {
        let library = Library::open_in_memory().unwrap();
        let stored = library.add(project("Demo")).await.unwrap();
        assert!(!stored.id.is_empty());
        assert!(stored.id.contains('-'));

        let fetched: Project = library.require(&stored.id).await.unwrap();
        assert_eq!(fetched, stored);
        assert!(library.get::<Project>("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_id() {
        let library = Library::open_in_memory().unwrap();
        let stored = library.add(project("Demo")).await.unwrap();
        let err = library.add(stored.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { collection: "projects", .. }));
    }

    #[tokio::test]
    async fn test_update_is_idempotent() {
        let library = Library::open_in_memory().unwrap();
        let mut stored = library.add(project("Demo")).await.unwrap();
        stored.progress = 42;
        stored.status = ProjectStatus::Training;

        library.update(&stored).await.unwrap();
        let once: Project = library.require(&stored.id).await.unwrap();
        library.update(&stored).await.unwrap();
        let twice: Project = library.require(&stored.id).await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.progress, 42);
        assert_eq!(library.count::<Project>().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_record_fails() {
        let library = Library::open_in_memory().unwrap();
        let mut ghost = project("Ghost");
        ghost.id = "nope".to_string();
        let err = library.update(&ghost).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_get_by_index_filters_and_keeps_blob() {
        let library = Library::open_in_memory().unwrap();
        library.add(file("p1", "a.csv", Some(b"a,b\n1,2\n".to_vec()))).await.unwrap();
        library.add(file("p2", "b.csv", None)).await.unwrap();
        library.add(file("p1", "c.csv", None)).await.unwrap();

        let files: Vec<FileRecord> = library.get_by_index("projectId", "p1").await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "a.csv");
        assert_eq!(files[0].inline_content.as_deref(), Some(&b"a,b\n1,2\n"[..]));
        assert!(files[1].inline_content.is_none());

        let err = library.get_by_index::<FileRecord>("name", "a.csv").await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownIndex { .. }));
    }

    #[tokio::test]
    async fn test_index_follows_updates() {
        let library = Library::open_in_memory().unwrap();
        let mut session = library
            .add(TrainingSession {
                id: String::new(),
                project_id: "p1".to_string(),
                status: SessionStatus::Training,
                config: TrainingConfig::default(),
                started_at: Utc::now(),
                completed_at: None,
                progress: 0,
                current_epoch: None,
                current_loss: None,
                current_accuracy: None,
                model_id: None,
                error: None,
            })
            .await
            .unwrap();

        let running: Vec<TrainingSession> = library.get_by_index("status", "training").await.unwrap();
        assert_eq!(running.len(), 1);

        session.status = SessionStatus::Completed;
        library.update(&session).await.unwrap();
        let running: Vec<TrainingSession> = library.get_by_index("status", "training").await.unwrap();
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn test_put_and_delete_settings() {
        let library = Library::open_in_memory().unwrap();
        let setting = Setting { key: "theme".into(), value: serde_json::json!("dark") };
        library.put(&setting).await.unwrap();
        library.put(&Setting { value: serde_json::json!("light"), ..setting.clone() }).await.unwrap();

        let fetched: Setting = library.require("theme").await.unwrap();
        assert_eq!(fetched.value, serde_json::json!("light"));

        assert!(library.delete::<Setting>("theme").await.unwrap());
        assert!(!library.delete::<Setting>("theme").await.unwrap());
    }

    #[tokio::test]
    async fn test_settings_table_keyed_by_key_column() {
        let library = Library::open_in_memory().unwrap();
        library
            .put(&Setting { key: "storage.strategy".into(), value: serde_json::json!("inline_blob") })
            .await
            .unwrap();

        let conn = library.conn.lock();
        let key: String = conn
            .query_row("SELECT key FROM settings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(key, "storage.strategy");
        assert!(conn.prepare("SELECT id FROM settings").is_err());
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("PRAGMA user_version = 99").unwrap();
        }
        let err = Library::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { found: 99, .. }));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let ids: std::collections::HashSet<String> = (0..500).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 500);
    }
}
