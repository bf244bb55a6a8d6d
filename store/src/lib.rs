//! SQLite persistence for Yijing.
//!
//! One [`Database`] owns a single connection behind a mutex. Ledger writes
//! open `BEGIN IMMEDIATE` transactions, which take SQLite's write lock up
//! front, so a read-check-decrement on an account cannot interleave with
//! another writer even across processes sharing the file.
//!
//! Timestamps are stored as RFC 3339 UTC strings.

mod accounts;
mod ledger;
mod readings;
mod sqlite_security;
mod texts;

pub use accounts::{Account, AccountPlan};
pub use readings::{
    NewReading, OfflineReading, OfflineUpload, ReadingDetail, ReadingSummary, make_summary,
};
pub use texts::{HexagramEntry, ImportReport, LineEntry, TextsFile};

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Store-level policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSettings {
    /// Subscriber allowance per month; the daily cap is a thirtieth of it.
    pub monthly_quota: u32,
    /// How long a subscriber's unpinned reading is kept.
    pub retention_days: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            monthly_quota: 1000,
            retention_days: 30,
        }
    }
}

pub struct Database {
    conn: Mutex<Connection>,
    settings: StoreSettings,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Database {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS users (
            id                 TEXT PRIMARY KEY,
            display_name       TEXT,
            plan               TEXT NOT NULL DEFAULT 'free',
            gold               INTEGER NOT NULL DEFAULT 0 CHECK (gold >= 0),
            silver             INTEGER NOT NULL DEFAULT 0 CHECK (silver >= 0),
            subscription_until TEXT,
            request_count      INTEGER NOT NULL DEFAULT 0,
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage_quotas (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            usage_date TEXT NOT NULL,
            used_count INTEGER NOT NULL DEFAULT 0,
            UNIQUE(user_id, usage_date)
        );

        CREATE TABLE IF NOT EXISTS hexagrams (
            id          INTEGER PRIMARY KEY,
            name        TEXT NOT NULL,
            binary_code TEXT NOT NULL UNIQUE,
            judgment    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS lines (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            hexagram_id  INTEGER NOT NULL REFERENCES hexagrams(id) ON DELETE CASCADE,
            position     TEXT NOT NULL,
            position_num INTEGER NOT NULL CHECK (position_num BETWEEN 1 AND 6),
            text         TEXT NOT NULL,
            UNIQUE(hexagram_id, position_num)
        );

        CREATE TABLE IF NOT EXISTS readings (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id        TEXT NOT NULL,
            question       TEXT NOT NULL,
            hexagram_code  TEXT NOT NULL,
            changing_lines TEXT NOT NULL DEFAULT '[]',
            content        TEXT NOT NULL,
            summary        TEXT NOT NULL DEFAULT '',
            derived_from   INTEGER REFERENCES readings(id) ON DELETE SET NULL,
            is_pinned      INTEGER NOT NULL DEFAULT 0,
            expires_at     TEXT,
            created_at     TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_readings_user_created
            ON readings(user_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_readings_expires
            ON readings(expires_at) WHERE is_pinned = 0;
    ";

    /// Open (or create) the database at `path` with owner-only permissions.
    pub fn open(path: impl AsRef<Path>, settings: StoreSettings) -> Result<Self> {
        let path = path.as_ref();
        sqlite_security::prepare_db_path(path)?;

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let db = Self::initialize(conn, settings)?;
        tracing::debug!(path = %path.display(), "Opened database");
        Ok(db)
    }

    /// Ephemeral database (for tests and dry runs).
    pub fn open_in_memory(settings: StoreSettings) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::initialize(conn, settings)
    }

    fn initialize(conn: Connection, settings: StoreSettings) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;",
        )
        .context("Failed to set pragmas")?;
        conn.execute_batch(Self::SCHEMA)
            .context("Failed to create schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            settings,
        })
    }

    #[must_use]
    pub fn settings(&self) -> StoreSettings {
        self.settings
    }

    /// A panic while holding the lock leaves no open transaction behind
    /// (rusqlite rolls back on drop), so a poisoned lock is still usable.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: {raw:?}"))
}

pub(crate) fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}
