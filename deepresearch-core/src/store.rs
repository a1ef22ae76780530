//! Durable task and result storage backed by embedded SQLite.
//!
//! Opens the database in WAL mode so readers proceed while a writer holds
//! the write lock. Transient `SQLITE_BUSY` / `SQLITE_LOCKED` conditions are
//! retried with exponential backoff; structural errors surface immediately.
//! Every operation, including the backoff sleeps, runs on the blocking
//! thread pool so a contended write never stalls a runtime worker.

use crate::error::{ResearchError, Result};
use crate::types::{ResearchResult, ResearchTask, Source, TaskStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Initial backoff delay for transient lock contention.
const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(100);
/// Backoff multiplier per retry.
const RETRY_FACTOR: u32 = 2;
/// Upper bound on a single backoff sleep.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);
/// Maximum number of retries after the initial attempt.
const RETRY_MAX_ATTEMPTS: u32 = 3;

/// Typed partial update for a task row. Unset fields are left untouched.
///
/// `updated_at` is always advanced by the store on apply.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub provider_handle: Option<String>,
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub current_action: Option<String>,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub cost_usd: Option<f64>,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn current_action(mut self, action: impl Into<String>) -> Self {
        self.current_action = Some(action.into());
        self
    }

    pub fn provider_handle(mut self, handle: impl Into<String>) -> Self {
        self.provider_handle = Some(handle.into());
        self
    }

    pub fn tokens(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = Some(tokens_in);
        self.tokens_out = Some(tokens_out);
        self
    }

    pub fn cost_usd(mut self, cost: f64) -> Self {
        self.cost_usd = Some(cost);
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    /// Whether the update touches anything besides `error_message`.
    fn touches_more_than_error(&self) -> bool {
        self.provider_handle.is_some()
            || self.status.is_some()
            || self.progress.is_some()
            || self.current_action.is_some()
            || self.tokens_in.is_some()
            || self.tokens_out.is_some()
            || self.cost_usd.is_some()
            || self.completed_at.is_some()
    }

    fn is_empty(&self) -> bool {
        !self.touches_more_than_error() && self.error_message.is_none()
    }
}

/// SQLite-backed state store for research tasks and results.
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ResearchError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(storage_err)?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(storage_err)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                provider_handle TEXT,
                query TEXT NOT NULL,
                model TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                progress INTEGER NOT NULL DEFAULT 0,
                current_action TEXT NOT NULL DEFAULT '',
                notify_on_done INTEGER NOT NULL DEFAULT 1,
                max_wait_hours INTEGER NOT NULL DEFAULT 8,
                tokens_in INTEGER NOT NULL DEFAULT 0,
                tokens_out INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0.0,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at);

            CREATE TABLE IF NOT EXISTS results (
                task_id TEXT PRIMARY KEY,
                report TEXT NOT NULL DEFAULT '',
                sources_json TEXT NOT NULL DEFAULT '[]',
                metadata_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(task_id)
            );
            "#,
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Insert or replace a task row. All columns are overwritten; callers
    /// that want to merge must read-modify-write. Refuses to downgrade a
    /// terminal row to a non-terminal status.
    pub async fn save_task(&self, task: &ResearchTask) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let task = task.clone();
        with_retry("save_task", move || {
            let conn = conn.lock().unwrap();

            let existing: Option<String> = conn
                .query_row(
                    "SELECT status FROM tasks WHERE task_id = ?1",
                    [task.task_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(current) = existing.as_deref().and_then(TaskStatus::parse) {
                if current.is_terminal() && !task.status.is_terminal() {
                    return Ok(Err(ResearchError::Storage {
                        message: format!(
                            "refusing to downgrade task {} from {} to {}",
                            task.task_id, current, task.status
                        ),
                    }));
                }
            }

            conn.execute(
                r#"
                INSERT OR REPLACE INTO tasks
                    (task_id, provider_handle, query, model, status, progress,
                     current_action, notify_on_done, max_wait_hours, tokens_in,
                     tokens_out, cost_usd, error_message, created_at, updated_at,
                     completed_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                "#,
                params![
                    task.task_id.to_string(),
                    task.provider_handle,
                    task.query,
                    task.model,
                    task.status.as_str(),
                    task.progress as i64,
                    task.current_action,
                    task.notify_on_done as i64,
                    task.max_wait_hours as i64,
                    task.tokens_in as i64,
                    task.tokens_out as i64,
                    task.cost_usd,
                    task.error_message,
                    task.created_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                    task.completed_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(Ok(()))
        })
        .await?
    }

    /// Fetch a task by id.
    pub async fn get_task(&self, task_id: &Uuid) -> Result<Option<ResearchTask>> {
        let conn = Arc::clone(&self.conn);
        let task_id = *task_id;
        with_retry("get_task", move || {
            let conn = conn.lock().unwrap();
            let task = conn
                .query_row(
                    "SELECT * FROM tasks WHERE task_id = ?1",
                    [task_id.to_string()],
                    row_to_task,
                )
                .optional()?;
            Ok(task)
        })
        .await
    }

    /// Apply an atomic partial update to a task row.
    ///
    /// Fails with `NotFound` if the row is absent. On a terminal row, any
    /// update that would alter more than `error_message` is a silent no-op.
    pub async fn update_task(&self, task_id: &Uuid, update: &TaskUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let conn = Arc::clone(&self.conn);
        let task_id = *task_id;
        let update = update.clone();
        with_retry("update_task", move || {
            let conn = conn.lock().unwrap();

            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM tasks WHERE task_id = ?1",
                    [task_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(current) = current.as_deref().and_then(TaskStatus::parse) else {
                return Ok(Err(ResearchError::NotFound { task_id }));
            };

            // On a terminal row, only the error_message bookkeeping write
            // goes through; anything else is a silent no-op.
            if current.is_terminal() && update.touches_more_than_error() {
                return Ok(Ok(()));
            }

            let mut clauses: Vec<String> = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(handle) = &update.provider_handle {
                clauses.push("provider_handle = ?".into());
                values.push(Box::new(handle.clone()));
            }
            if let Some(status) = &update.status {
                clauses.push("status = ?".into());
                values.push(Box::new(status.as_str().to_string()));
            }
            if let Some(progress) = update.progress {
                clauses.push("progress = ?".into());
                values.push(Box::new(progress as i64));
            }
            if let Some(action) = &update.current_action {
                clauses.push("current_action = ?".into());
                values.push(Box::new(action.clone()));
            }
            if let Some(tokens_in) = update.tokens_in {
                clauses.push("tokens_in = ?".into());
                values.push(Box::new(tokens_in as i64));
            }
            if let Some(tokens_out) = update.tokens_out {
                clauses.push("tokens_out = ?".into());
                values.push(Box::new(tokens_out as i64));
            }
            if let Some(cost) = update.cost_usd {
                clauses.push("cost_usd = ?".into());
                values.push(Box::new(cost));
            }
            if let Some(message) = &update.error_message {
                clauses.push("error_message = ?".into());
                values.push(Box::new(message.clone()));
            }
            if let Some(at) = update.completed_at {
                clauses.push("completed_at = ?".into());
                values.push(Box::new(at.to_rfc3339()));
            }

            clauses.push("updated_at = ?".into());
            values.push(Box::new(Utc::now().to_rfc3339()));
            values.push(Box::new(task_id.to_string()));

            let sql = format!(
                "UPDATE tasks SET {} WHERE task_id = ?",
                clauses.join(", ")
            );
            let value_refs: Vec<&dyn rusqlite::ToSql> =
                values.iter().map(|v| v.as_ref()).collect();
            conn.execute(&sql, value_refs.as_slice())?;
            Ok(Ok(()))
        })
        .await?
    }

    /// Tasks that need to be resumed on startup: every row whose status is
    /// `running_sync` or `running_async`, with its provider handle.
    pub async fn get_incomplete_tasks(&self) -> Result<Vec<(Uuid, Option<String>)>> {
        let conn = Arc::clone(&self.conn);
        with_retry("get_incomplete_tasks", move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT task_id, provider_handle FROM tasks
                 WHERE status IN ('running_sync', 'running_async')",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let id: String = row.get(0)?;
                    let handle: Option<String> = row.get(1)?;
                    Ok((id, handle))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map(|rows| {
            rows.into_iter()
                .filter_map(|(id, handle)| Uuid::parse_str(&id).ok().map(|id| (id, handle)))
                .collect()
        })
    }

    /// Insert (or replace) the result row for a task.
    /// Fails with `NotFound` if no task row exists.
    pub async fn save_result(&self, task_id: &Uuid, result: &ResearchResult) -> Result<()> {
        let sources_json = serde_json::to_string(&result.sources)?;
        let metadata_json = serde_json::to_string(&result.metadata)?;
        let conn = Arc::clone(&self.conn);
        let task_id = *task_id;
        let report = result.report.clone();
        let created_at = result.created_at;
        with_retry("save_result", move || {
            let conn = conn.lock().unwrap();
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM tasks WHERE task_id = ?1",
                    [task_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Ok(Err(ResearchError::NotFound { task_id }));
            }
            conn.execute(
                r#"
                INSERT OR REPLACE INTO results
                    (task_id, report, sources_json, metadata_json, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    task_id.to_string(),
                    report,
                    sources_json,
                    metadata_json,
                    created_at.to_rfc3339(),
                ],
            )?;
            Ok(Ok(()))
        })
        .await?
    }

    /// Fetch the result row for a task, if any.
    pub async fn get_result(&self, task_id: &Uuid) -> Result<Option<ResearchResult>> {
        let conn = Arc::clone(&self.conn);
        let task_id = *task_id;
        with_retry("get_result", move || {
            let conn = conn.lock().unwrap();
            let result = conn
                .query_row(
                    "SELECT * FROM results WHERE task_id = ?1",
                    [task_id.to_string()],
                    row_to_result,
                )
                .optional()?;
            Ok(result)
        })
        .await
    }

    /// Delete a task and its result. Returns whether a task row was removed.
    pub async fn delete_task(&self, task_id: &Uuid) -> Result<bool> {
        let conn = Arc::clone(&self.conn);
        let task_id = *task_id;
        with_retry("delete_task", move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "DELETE FROM results WHERE task_id = ?1",
                [task_id.to_string()],
            )?;
            let removed = conn.execute(
                "DELETE FROM tasks WHERE task_id = ?1",
                [task_id.to_string()],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    /// List tasks, most recent first.
    pub async fn list_tasks(&self, limit: usize) -> Result<Vec<ResearchTask>> {
        let conn = Arc::clone(&self.conn);
        with_retry("list_tasks", move || {
            let conn = conn.lock().unwrap();
            let mut stmt =
                conn.prepare("SELECT * FROM tasks ORDER BY created_at DESC LIMIT ?1")?;
            let tasks = stmt
                .query_map([limit as i64], row_to_task)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
        .await
    }
}

/// Run a storage operation on the blocking pool, retrying transient lock
/// contention with exponential backoff. Only `SQLITE_BUSY` / `SQLITE_LOCKED`
/// are retried; all other errors map to `Storage` and surface immediately.
/// The backoff sleeps happen on the blocking thread, never on a runtime
/// worker.
async fn with_retry<T, F>(op: &'static str, mut f: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut delay = RETRY_INITIAL_DELAY;
        let mut attempt = 0u32;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt < RETRY_MAX_ATTEMPTS => {
                    attempt += 1;
                    warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "database busy, retrying"
                    );
                    std::thread::sleep(delay);
                    delay = (delay * RETRY_FACTOR).min(RETRY_MAX_DELAY);
                }
                Err(err) => return Err(storage_err(err)),
            }
        }
    })
    .await
    .map_err(|e| ResearchError::Storage {
        message: format!("storage operation panicked: {e}"),
    })?
}

/// Whether a rusqlite error is transient lock contention worth retrying.
fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn storage_err(err: rusqlite::Error) -> ResearchError {
    ResearchError::Storage {
        message: err.to_string(),
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_task(row: &Row) -> rusqlite::Result<ResearchTask> {
    let id_str: String = row.get("task_id")?;
    let status_str: String = row.get("status")?;
    let created_at_str: String = row.get("created_at")?;
    let updated_at_str: String = row.get("updated_at")?;
    let completed_at_str: Option<String> = row.get("completed_at")?;

    Ok(ResearchTask {
        task_id: Uuid::parse_str(&id_str).unwrap_or_default(),
        provider_handle: row.get("provider_handle")?,
        query: row.get("query")?,
        model: row.get("model")?,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Pending),
        progress: row.get::<_, i64>("progress")? as u8,
        current_action: row.get("current_action")?,
        notify_on_done: row.get::<_, i64>("notify_on_done")? != 0,
        max_wait_hours: row.get::<_, i64>("max_wait_hours")? as u32,
        tokens_in: row.get::<_, i64>("tokens_in")? as u64,
        tokens_out: row.get::<_, i64>("tokens_out")? as u64,
        cost_usd: row.get("cost_usd")?,
        error_message: row.get("error_message")?,
        created_at: parse_datetime(&created_at_str),
        updated_at: parse_datetime(&updated_at_str),
        completed_at: completed_at_str.as_deref().map(parse_datetime),
    })
}

fn row_to_result(row: &Row) -> rusqlite::Result<ResearchResult> {
    let id_str: String = row.get("task_id")?;
    let sources_json: String = row.get("sources_json")?;
    let metadata_json: String = row.get("metadata_json")?;
    let created_at_str: String = row.get("created_at")?;

    let sources: Vec<Source> = serde_json::from_str(&sources_json).unwrap_or_default();
    let metadata: serde_json::Value =
        serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({}));

    Ok(ResearchResult {
        task_id: Uuid::parse_str(&id_str).unwrap_or_default(),
        report: row.get("report")?,
        sources,
        metadata,
        created_at: parse_datetime(&created_at_str),
    })
}
