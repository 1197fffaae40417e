use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use eventsense_common::{Run, RunId};
use rusqlite::{Connection, OptionalExtension, params};

/// Current version of the persisted run document.
pub const RUN_SCHEMA_VERSION: i64 = 1;

/// Async-safe handle to the run database.
///
/// Wraps `RunDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<RunDb>>,
}

impl DbHandle {
    pub fn new(db: RunDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RunDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Run documents keyed by run id.
pub struct RunDb {
    conn: Connection,
}

impl RunDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    run_id TEXT PRIMARY KEY,
                    schema_version INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    document TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
                ",
            )
            .context("Failed to run migrations")?;
        Ok(())
    }

    pub fn upsert_run(&self, run: &Run) -> Result<()> {
        let document = serde_json::to_string(run).context("Failed to serialize run")?;
        self.conn
            .execute(
                "INSERT INTO runs (run_id, schema_version, status, document, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(run_id) DO UPDATE SET
                    schema_version = excluded.schema_version,
                    status = excluded.status,
                    document = excluded.document,
                    updated_at = excluded.updated_at",
                params![
                    run.run_id.as_str(),
                    RUN_SCHEMA_VERSION,
                    run.status.as_str(),
                    document,
                    run.created_at.to_rfc3339(),
                    run.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to persist run {}", run.run_id))?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT schema_version, document FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query run")?;
        row.map(|(version, document)| decode_document(version, &document))
            .transpose()
    }

    pub fn load_runs(&self) -> Result<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare("SELECT schema_version, document FROM runs ORDER BY created_at")
            .context("Failed to prepare run listing")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .context("Failed to list runs")?;
        let mut runs = Vec::new();
        for row in rows {
            let (version, document) = row.context("Failed to read run row")?;
            runs.push(decode_document(version, &document)?);
        }
        Ok(runs)
    }

    pub fn delete_run(&self, run_id: &RunId) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM runs WHERE run_id = ?1", params![run_id.as_str()])
            .context("Failed to delete run")?;
        Ok(deleted > 0)
    }
}

/// Decode a stored document, migrating older schema versions forward.
fn decode_document(version: i64, document: &str) -> Result<Run> {
    let mut value: serde_json::Value =
        serde_json::from_str(document).context("Corrupt run document")?;
    if version > RUN_SCHEMA_VERSION {
        anyhow::bail!(
            "Run document schema version {} is newer than supported version {}",
            version,
            RUN_SCHEMA_VERSION
        );
    }
    if version < 1 {
        migrate_v0_to_v1(&mut value);
    }
    serde_json::from_value(value).context("Failed to decode run document")
}

/// Version 0 documents stored the selected day as `selected_day` and had no
/// artifacts checkpoint.
fn migrate_v0_to_v1(value: &mut serde_json::Value) {
    if let Some(params) = value.get_mut("params").and_then(|p| p.as_object_mut())
        && !params.contains_key("selected_day_et")
        && let Some(day) = params.remove("selected_day")
    {
        params.insert("selected_day_et".to_string(), day);
    }
    if let Some(obj) = value.as_object_mut() {
        obj.entry("artifacts")
            .or_insert_with(|| serde_json::json!({}));
    }
}
