//! Local SQLite database layer for the payroll engine.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings
//! helpers, and the chunked batch writer used by bulk posting phases.
//!
//! Finalizing a run can touch more rows than fit comfortably in one
//! transaction on the hosted stores this schema mirrors, so bulk writes go
//! through [`BatchWriter`]: statements are grouped into transactions of at
//! most `MAX_BATCH_OPS` operations, each chunk committed independently. A
//! crash between chunks leaves a partially-posted run; the finalize path's
//! void-then-recreate step makes re-running it safe.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::{PayrollError, PayrollResult};

/// Managed state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Maximum statements per committed batch in bulk write phases.
pub(crate) const MAX_BATCH_OPS: usize = 450;

/// Initialize the database at `{data_dir}/payroll.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> PayrollResult<DbState> {
    fs::create_dir_all(data_dir).map_err(|e| PayrollError::store("create data dir", e))?;

    let db_path = data_dir.join("payroll.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)
                .map_err(|e| PayrollError::store("database open after retry", e))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> PayrollResult<()> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| PayrollError::store("create schema_version", e))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: staff directory, shift store, transaction ledger, settings.
fn migrate_v1(conn: &Connection) -> PayrollResult<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- staff directory
        CREATE TABLE IF NOT EXISTS staff (
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'staff',
            is_active INTEGER NOT NULL DEFAULT 1,
            default_hourly_rate REAL NOT NULL DEFAULT 0,
            rate_history TEXT NOT NULL DEFAULT '[]',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- staff shifts (one timed work session + cash count)
        CREATE TABLE IF NOT EXISTS staff_shifts (
            id TEXT PRIMARY KEY,
            staff_id TEXT NOT NULL,
            staff_name TEXT,
            start_time TEXT,
            end_time TEXT,
            cash_count TEXT,
            system_total REAL,
            total_cash REAL,
            expenses_total REAL,
            payroll_run_id TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- transaction ledger (single-sided; corrections are void + recreate)
        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            category TEXT NOT NULL CHECK (category IN ('debit', 'credit')),
            amount REAL NOT NULL,
            happened_at TEXT NOT NULL,
            staff_id TEXT NOT NULL,
            shift_id TEXT,
            expense_type TEXT,
            beneficiary_staff_id TEXT,
            beneficiary_staff_name TEXT,
            payroll_run_id TEXT,
            voided INTEGER NOT NULL DEFAULT 0,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            description TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_shifts_start_time ON staff_shifts(start_time);
        CREATE INDEX IF NOT EXISTS idx_shifts_staff ON staff_shifts(staff_id);
        CREATE INDEX IF NOT EXISTS idx_shifts_run ON staff_shifts(payroll_run_id);
        CREATE INDEX IF NOT EXISTS idx_txn_shift ON transactions(shift_id);
        CREATE INDEX IF NOT EXISTS idx_txn_run ON transactions(payroll_run_id);
        CREATE INDEX IF NOT EXISTS idx_txn_expense_type ON transactions(expense_type);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| PayrollError::store("migration v1", e))?;
    Ok(())
}

/// Migration v2: payroll run documents (run, lines, overrides, paystubs).
fn migrate_v2(conn: &Connection) -> PayrollResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS payroll_runs (
            id TEXT PRIMARY KEY,
            period_start TEXT NOT NULL,
            period_end TEXT NOT NULL,
            pay_date TEXT NOT NULL,
            posting_mode TEXT NOT NULL DEFAULT 'per-staff',
            status TEXT NOT NULL DEFAULT 'draft',
            total_gross REAL NOT NULL DEFAULT 0,
            total_deductions REAL NOT NULL DEFAULT 0,
            total_net REAL NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS payroll_lines (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES payroll_runs(id) ON DELETE CASCADE,
            staff_id TEXT NOT NULL,
            staff_name TEXT,
            hourly_rate REAL NOT NULL DEFAULT 0,
            minutes_worked INTEGER NOT NULL DEFAULT 0,
            gross REAL NOT NULL DEFAULT 0,
            advances REAL NOT NULL DEFAULT 0,
            shortages REAL NOT NULL DEFAULT 0,
            other_deductions REAL NOT NULL DEFAULT 0,
            net REAL NOT NULL DEFAULT 0,
            adjustments TEXT NOT NULL DEFAULT '[]',
            source_shift_ids TEXT NOT NULL DEFAULT '[]',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(run_id, staff_id)
        );

        CREATE TABLE IF NOT EXISTS shift_overrides (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES payroll_runs(id) ON DELETE CASCADE,
            shift_id TEXT NOT NULL,
            override_start TEXT,
            override_end TEXT,
            excluded INTEGER NOT NULL DEFAULT 0,
            minutes_used INTEGER NOT NULL DEFAULT 0,
            expense_date TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            UNIQUE(run_id, shift_id)
        );

        CREATE TABLE IF NOT EXISTS paystubs (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES payroll_runs(id) ON DELETE CASCADE,
            staff_id TEXT NOT NULL,
            staff_name TEXT,
            hourly_rate REAL NOT NULL DEFAULT 0,
            minutes_worked INTEGER NOT NULL DEFAULT 0,
            gross REAL NOT NULL DEFAULT 0,
            total_deductions REAL NOT NULL DEFAULT 0,
            net REAL NOT NULL DEFAULT 0,
            shifts TEXT NOT NULL DEFAULT '[]',
            deductions TEXT NOT NULL DEFAULT '[]',
            created_at TEXT DEFAULT (datetime('now')),
            UNIQUE(run_id, staff_id)
        );

        CREATE INDEX IF NOT EXISTS idx_lines_run ON payroll_lines(run_id);
        CREATE INDEX IF NOT EXISTS idx_overrides_run ON shift_overrides(run_id);
        CREATE INDEX IF NOT EXISTS idx_paystubs_run ON paystubs(run_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| PayrollError::store("migration v2", e))?;
    Ok(())
}

/// Migration v3: monotonic finalize-attempt marker on runs.
///
/// A run found at rest with status 'posting' and attempt > 0 is the
/// signature of an interrupted posting that needs to be re-finalized.
fn migrate_v3(conn: &Connection) -> PayrollResult<()> {
    conn.execute_batch(
        "
        ALTER TABLE payroll_runs ADD COLUMN attempt INTEGER NOT NULL DEFAULT 0;

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| PayrollError::store("migration v3", e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a setting value, or None if unset.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings
         WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Upsert a setting value.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> PayrollResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| PayrollError::store("set_setting", e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Chunked batch writer
// ---------------------------------------------------------------------------

/// Groups bulk writes into independently committed transactions of at most
/// `MAX_BATCH_OPS` statements.
///
/// Callers execute statements on the shared connection and call [`bump`]
/// after each one; the writer commits and reopens a transaction whenever
/// the chunk fills. On failure, [`abandon`] rolls back only the current
/// chunk — earlier chunks stay committed.
///
/// [`bump`]: BatchWriter::bump
/// [`abandon`]: BatchWriter::abandon
pub(crate) struct BatchWriter<'c> {
    conn: &'c Connection,
    context: String,
    ops_in_chunk: usize,
    committed_chunks: usize,
    open: bool,
}

impl<'c> BatchWriter<'c> {
    pub fn begin(conn: &'c Connection, context: &str) -> PayrollResult<Self> {
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| PayrollError::store(format!("{context}: begin batch"), e))?;
        Ok(BatchWriter {
            conn,
            context: context.to_string(),
            ops_in_chunk: 0,
            committed_chunks: 0,
            open: true,
        })
    }

    /// Record one executed statement; commit-and-reopen if the chunk is full.
    pub fn bump(&mut self) -> PayrollResult<()> {
        self.ops_in_chunk += 1;
        if self.ops_in_chunk >= MAX_BATCH_OPS {
            self.conn
                .execute_batch("COMMIT")
                .map_err(|e| PayrollError::store(format!("{}: commit batch", self.context), e))?;
            self.committed_chunks += 1;
            self.ops_in_chunk = 0;
            self.conn
                .execute_batch("BEGIN IMMEDIATE")
                .map_err(|e| PayrollError::store(format!("{}: begin batch", self.context), e))?;
        }
        Ok(())
    }

    /// Commit the final chunk. Returns the number of committed chunks.
    pub fn finish(mut self) -> PayrollResult<usize> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| PayrollError::store(format!("{}: commit batch", self.context), e))?;
        self.committed_chunks += 1;
        self.open = false;
        Ok(self.committed_chunks)
    }

    /// Roll back the current (uncommitted) chunk after a failure.
    pub fn abandon(mut self) {
        let _ = self.conn.execute_batch("ROLLBACK");
        self.open = false;
        if self.committed_chunks > 0 {
            warn!(
                context = %self.context,
                committed_chunks = self.committed_chunks,
                "Batch write abandoned after partial commit"
            );
        }
    }
}

impl Drop for BatchWriter<'_> {
    fn drop(&mut self) {
        if self.open {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// In-memory database state for tests.
#[cfg(test)]
pub(crate) fn test_state() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("pragma setup");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
