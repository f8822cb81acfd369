use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub type SharedConnection = Arc<Mutex<Connection>>;

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

impl DatabaseContext {
    pub fn into_shared(self) -> (SharedConnection, PathBuf) {
        (Arc::new(Mutex::new(self.connection)), self.path)
    }
}

pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseContext> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(&db_path, flags)?;
    configure(&connection)?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "database context established"
    );
    Ok(DatabaseContext {
        connection,
        path: db_path,
    })
}

fn configure(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS owners (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            full_name TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            phone TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE TABLE IF NOT EXISTS companies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            inn TEXT NOT NULL UNIQUE,
            organization_type TEXT NOT NULL DEFAULT '',
            city TEXT NOT NULL DEFAULT '',
            address TEXT NOT NULL DEFAULT '',
            business_sphere TEXT NOT NULL DEFAULT '',
            description TEXT,
            created_at TEXT NOT NULL DEFAULT (DATETIME('now')),
            updated_at TEXT NOT NULL DEFAULT (DATETIME('now')),
            FOREIGN KEY (owner_id) REFERENCES owners(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS company_location (
            company_id INTEGER PRIMARY KEY,
            state TEXT NOT NULL DEFAULT 'unresolved'
                CHECK (state IN ('unresolved', 'pending', 'resolved', 'failed')),
            query_address TEXT,
            latitude REAL CHECK (latitude IS NULL OR (latitude BETWEEN -90 AND 90)),
            longitude REAL CHECK (longitude IS NULL OR (longitude BETWEEN -180 AND 180)),
            last_attempt_at TEXT,
            failure_reason TEXT,
            updated_at TEXT NOT NULL DEFAULT (DATETIME('now')),
            FOREIGN KEY (company_id) REFERENCES companies(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_companies_owner ON companies(owner_id);
        "#,
    )?;

    ensure_column(connection, "company_location", "failure_detail TEXT")?;
    backfill_locations(connection)?;
    Ok(())
}

fn backfill_locations(connection: &Connection) -> AppResult<()> {
    let inserted = connection.execute(
        "INSERT INTO company_location (company_id, state, updated_at)
        SELECT c.id, 'unresolved', ?1 FROM companies c
        WHERE NOT EXISTS (SELECT 1 FROM company_location l WHERE l.company_id = c.id)",
        [now_timestamp()],
    )?;
    if inserted > 0 {
        info!(
            target: "database_bootstrap",
            inserted,
            "backfilled missing company location rows"
        );
    }
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}
