//! SQLite database layer for the workflow engine.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::EngineError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, EngineError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| EngineError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("[Database] SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::Database(format!("Failed to open in-memory db: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    ///
    /// The connection mutex is held for the whole closure, so a
    /// check-then-insert inside one call is atomic.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, EngineError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, EngineError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| EngineError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), EngineError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflow_states (
                    workflow_id         TEXT PRIMARY KEY,
                    business_id         TEXT NOT NULL,
                    workflow_type       TEXT NOT NULL,
                    status              TEXT NOT NULL DEFAULT 'PENDING',
                    current_step        TEXT NOT NULL,
                    data                TEXT NOT NULL DEFAULT '{}',
                    error_message       TEXT,
                    retry_count         INTEGER NOT NULL DEFAULT 0,
                    retry_not_before    INTEGER,
                    version             INTEGER NOT NULL DEFAULT 0,
                    created_at          INTEGER NOT NULL,
                    updated_at          INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_workflow_states_business ON workflow_states(business_id);

                CREATE TABLE IF NOT EXISTS approval_requests (
                    id                  TEXT PRIMARY KEY,
                    workflow_id         TEXT NOT NULL,
                    step_name           TEXT NOT NULL,
                    description         TEXT NOT NULL DEFAULT '',
                    data_to_approve     TEXT NOT NULL DEFAULT '{}',
                    requested_by        TEXT NOT NULL,
                    requested_at        INTEGER NOT NULL,
                    approved_by         TEXT,
                    approved_at         INTEGER,
                    decision_reason     TEXT,
                    status              TEXT NOT NULL DEFAULT 'PENDING'
                );
                CREATE INDEX IF NOT EXISTS idx_approval_requests_workflow ON approval_requests(workflow_id);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_approval_requests_one_pending
                    ON approval_requests(workflow_id) WHERE status = 'PENDING';

                CREATE TABLE IF NOT EXISTS audit_entries (
                    seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
                    id                  TEXT NOT NULL UNIQUE,
                    timestamp           INTEGER NOT NULL,
                    actor               TEXT NOT NULL,
                    action              TEXT NOT NULL,
                    resource            TEXT NOT NULL,
                    resource_id         TEXT NOT NULL,
                    business_id         TEXT NOT NULL,
                    workflow_id         TEXT,
                    details             TEXT NOT NULL DEFAULT '{}'
                );
                CREATE INDEX IF NOT EXISTS idx_audit_entries_business ON audit_entries(business_id, timestamp);
                CREATE INDEX IF NOT EXISTS idx_audit_entries_workflow ON audit_entries(workflow_id);

                CREATE TRIGGER IF NOT EXISTS audit_entries_no_update
                    BEFORE UPDATE ON audit_entries
                    BEGIN SELECT RAISE(ABORT, 'audit entries are immutable'); END;
                CREATE TRIGGER IF NOT EXISTS audit_entries_no_delete
                    BEFORE DELETE ON audit_entries
                    BEGIN SELECT RAISE(ABORT, 'audit entries are immutable'); END;

                CREATE TABLE IF NOT EXISTS cost_entries (
                    seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
                    id                  TEXT NOT NULL UNIQUE,
                    timestamp           INTEGER NOT NULL,
                    business_id         TEXT NOT NULL,
                    workflow_id         TEXT,
                    provider            TEXT NOT NULL,
                    model               TEXT NOT NULL,
                    units_used          INTEGER NOT NULL DEFAULT 0,
                    cost                TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_cost_entries_business ON cost_entries(business_id, timestamp);

                CREATE TRIGGER IF NOT EXISTS cost_entries_no_update
                    BEFORE UPDATE ON cost_entries
                    BEGIN SELECT RAISE(ABORT, 'cost entries are immutable'); END;
                CREATE TRIGGER IF NOT EXISTS cost_entries_no_delete
                    BEFORE DELETE ON cost_entries
                    BEGIN SELECT RAISE(ABORT, 'cost entries are immutable'); END;
                ",
            )?;
            Ok(())
        })
    }
}
