//! SQLite Structured Store
//!
//! One connection behind a `tokio::sync::Mutex`, shared by the components
//! that keep structured records (daily content, the realtime mirror). Each
//! component owns its own tables; the store only owns the schema.
//!
//! Migrations are applied in order at open and tracked in
//! `schema_migrations`, so re-opening an existing database is a no-op.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::Result;

/// Ordered schema migrations: (version, description, sql)
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "daily content",
        "CREATE TABLE IF NOT EXISTS daily_content (
            kind TEXT NOT NULL,
            pairing_id TEXT NOT NULL,
            day TEXT NOT NULL,
            content_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            cached_at INTEGER NOT NULL,
            PRIMARY KEY (kind, pairing_id, day)
        );
        CREATE INDEX IF NOT EXISTS idx_daily_content_day ON daily_content(day);",
    ),
    (
        2,
        "shared mirror",
        "CREATE TABLE IF NOT EXISTS shared_mirror (
            pairing_id TEXT NOT NULL,
            id TEXT NOT NULL,
            owner_author_id TEXT NOT NULL,
            partner_ids TEXT NOT NULL,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (pairing_id, id)
        );",
    ),
];

/// Tables owned by cache components, cleared by [`SqliteStore::clear_all`]
const DATA_TABLES: &[&str] = &["daily_content", "shared_mirror"];

/// Shared SQLite connection with versioned migrations
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        info!(path = %path.display(), "Opened structured store");
        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn apply_migrations(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        for (version, description, sql) in MIGRATIONS {
            let applied: Option<i64> = conn
                .query_row(
                    "SELECT version FROM schema_migrations WHERE version = ?1",
                    params![version],
                    |row| row.get(0),
                )
                .optional()?;
            if applied.is_some() {
                continue;
            }

            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT INTO schema_migrations (version, description) VALUES (?1, ?2)",
                params![version, description],
            )?;
            debug!(version, description, "Applied migration");
        }
        Ok(())
    }

    /// Lock the connection
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Highest applied migration
    pub async fn schema_version(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let version = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    /// Cheap liveness query
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Row count of every data table
    pub async fn table_counts(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.conn.lock().await;
        let mut counts = Vec::with_capacity(DATA_TABLES.len());
        for table in DATA_TABLES {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            counts.push((table.to_string(), count.max(0) as u64));
        }
        Ok(counts)
    }

    /// Delete every row of every data table; the schema is kept
    pub async fn clear_all(&self) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut removed = 0u64;
        for table in DATA_TABLES {
            removed += tx.execute(&format!("DELETE FROM {}", table), [])? as u64;
        }
        tx.commit()?;
        Ok(removed)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}
