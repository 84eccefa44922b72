//! Identity registry backed by SQLite.

use rollcall_core::{EnrollmentId, Identity};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    enrollment_id INTEGER NOT NULL UNIQUE,
    display_name  TEXT NOT NULL,
    registered_at TEXT NOT NULL
);";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("enrollment id {0} is already registered")]
    DuplicateIdentity(EnrollmentId),
    #[error("display name must not be empty")]
    InvalidName,
    #[error("registry database: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("registry I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Append-only mapping of enrollment id to display name.
///
/// Identities are never updated or removed; registering an id twice is
/// rejected rather than overwritten.
pub struct IdentityRegistry {
    conn: Mutex<Connection>,
}

impl IdentityRegistry {
    /// Open (creating if needed) the registry database at `path`.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        tracing::debug!(path = %path.display(), "identity registry opened");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RegistryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(
        &self,
        enrollment_id: EnrollmentId,
        display_name: &str,
    ) -> Result<(), RegistryError> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(RegistryError::InvalidName);
        }

        let registered_at = chrono::Local::now().to_rfc3339();
        let inserted = self.conn().execute(
            "INSERT INTO identities (enrollment_id, display_name, registered_at)
             VALUES (?1, ?2, ?3)",
            params![enrollment_id, display_name, registered_at],
        );

        match inserted {
            Ok(_) => {
                tracing::info!(enrollment_id, display_name, "identity registered");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(RegistryError::DuplicateIdentity(enrollment_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn lookup(&self, enrollment_id: EnrollmentId) -> Result<Option<String>, RegistryError> {
        let name = self
            .conn()
            .query_row(
                "SELECT display_name FROM identities WHERE enrollment_id = ?1",
                params![enrollment_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    /// Every registered identity, in registration order.
    pub fn all(&self) -> Result<Vec<Identity>, RegistryError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT enrollment_id, display_name FROM identities ORDER BY seq")?;
        let rows = stmt.query_map([], |row| {
            Ok(Identity { enrollment_id: row.get(0)?, display_name: row.get(1)? })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Snapshot of id → name, as used for the duration of one session.
    pub fn names(&self) -> Result<HashMap<EnrollmentId, String>, RegistryError> {
        Ok(self
            .all()?
            .into_iter()
            .map(|identity| (identity.enrollment_id, identity.display_name))
            .collect())
    }
}
