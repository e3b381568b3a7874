//! Blocking SQLite layer for tracked-repository records.
//!
//! One row per (owner, name). All mutations of existing rows go through
//! [`Db::update`], a check-and-set inside a transaction, so concurrent
//! operations for the same repository serialize on the row's current
//! contents. Async callers wrap these methods in `spawn_blocking` via
//! `store::RepoStore`.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Already tracking repo: {owner}/{name}, can't initialize")]
    AlreadyTracked { owner: String, name: String },
    #[error("no tracked repo: {owner}/{name}")]
    NotFound { owner: String, name: String },
    #[error("unrecognized lifecycle state: {0:?}")]
    InvalidState(String),
    #[error("store task failed: {0}")]
    Internal(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Lifecycle state of a tracked repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    /// Verifying the credential and repository with the provider.
    Validating,
    /// Webhook created; waiting for the provider's ping.
    HooksInitializing,
    /// Performing the bulk mirror.
    Initializing,
    /// Mirrored; waiting for webhook deliveries.
    Ready,
    /// Hit an unrecoverable error.
    Error,
}

impl RepoState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "Validating",
            Self::HooksInitializing => "Hooks Initializing",
            Self::Initializing => "Initializing",
            Self::Ready => "Ready",
            Self::Error => "Error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Validating" => Some(Self::Validating),
            "Hooks Initializing" => Some(Self::HooksInitializing),
            "Initializing" => Some(Self::Initializing),
            "Ready" => Some(Self::Ready),
            "Error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for RepoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked repository.
#[derive(Debug, Clone)]
pub struct RepoRecord {
    pub owner: String,
    pub name: String,
    /// Provider access credential supplied at registration.
    pub token: String,
    pub hook_id: Option<u64>,
    /// Hex-encoded shared secret the provider signs deliveries with.
    pub hook_secret: Option<String>,
    pub state: RepoState,
    pub error_cause: String,
}

impl RepoRecord {
    /// A freshly registered repository, about to be validated.
    pub fn new(owner: String, name: String, token: String) -> Self {
        Self {
            owner,
            name,
            token,
            hook_id: None,
            hook_secret: None,
            state: RepoState::Validating,
            error_cause: String::new(),
        }
    }
}

pub struct Db {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS repos (
    owner       TEXT NOT NULL,
    name        TEXT NOT NULL,
    token       TEXT NOT NULL,
    hook_id     INTEGER,
    hook_secret TEXT,
    state       TEXT NOT NULL,
    error_cause TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (owner, name)
)
";

impl Db {
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Register a repository. Fails if the (owner, name) pair is already
    /// tracked; the check and the insert share one transaction.
    pub fn insert_new(&self, record: &RepoRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM repos WHERE owner = ?1 AND name = ?2",
                params![record.owner, record.name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::AlreadyTracked {
                owner: record.owner.clone(),
                name: record.name.clone(),
            });
        }
        tx.execute(
            "INSERT INTO repos (owner, name, token, hook_id, hook_secret, state, error_cause)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.owner,
                record.name,
                record.token,
                record.hook_id.map(|id| id as i64),
                record.hook_secret,
                record.state.as_str(),
                record.error_cause,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, owner: &str, name: &str) -> Result<Option<RepoRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT owner, name, token, hook_id, hook_secret, state, error_cause
                 FROM repos WHERE owner = ?1 AND name = ?2",
                params![owner, name],
                row_to_record,
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some(record) => Ok(Some(record?)),
        }
    }

    pub fn list_all(&self) -> Result<Vec<RepoRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT owner, name, token, hook_id, hook_secret, state, error_cause
             FROM repos ORDER BY owner, name",
        )?;
        let rows = statement.query_map([], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            match row? {
                Ok(record) => records.push(record),
                // A row written by a newer or older build; leave it alone.
                Err(e) => error!("Skipping unrecognized repo record: {}", e),
            }
        }
        Ok(records)
    }

    /// Load the row, apply `mutate`, write it back — all in one
    /// transaction.
    pub fn update<F>(&self, owner: &str, name: &str, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut RepoRecord),
    {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let row = tx
            .query_row(
                "SELECT owner, name, token, hook_id, hook_secret, state, error_cause
                 FROM repos WHERE owner = ?1 AND name = ?2",
                params![owner, name],
                row_to_record,
            )
            .optional()?;
        let mut record = match row {
            None => {
                return Err(StoreError::NotFound {
                    owner: owner.to_string(),
                    name: name.to_string(),
                })
            }
            Some(record) => record?,
        };
        mutate(&mut record);
        tx.execute(
            "UPDATE repos
             SET token = ?3, hook_id = ?4, hook_secret = ?5, state = ?6, error_cause = ?7
             WHERE owner = ?1 AND name = ?2",
            params![
                owner,
                name,
                record.token,
                record.hook_id.map(|id| id as i64),
                record.hook_secret,
                record.state.as_str(),
                record.error_cause,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Returns whether a row was deleted.
    pub fn delete(&self, owner: &str, name: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM repos WHERE owner = ?1 AND name = ?2",
            params![owner, name],
        )?;
        Ok(deleted > 0)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<Result<RepoRecord, StoreError>> {
    let state_text: String = row.get(5)?;
    let state = match RepoState::parse(&state_text) {
        Some(state) => state,
        None => return Ok(Err(StoreError::InvalidState(state_text))),
    };
    Ok(Ok(RepoRecord {
        owner: row.get(0)?,
        name: row.get(1)?,
        token: row.get(2)?,
        hook_id: row.get::<_, Option<i64>>(3)?.map(|id| id as u64),
        hook_secret: row.get(4)?,
        state,
        error_cause: row.get(6)?,
    }))
}
