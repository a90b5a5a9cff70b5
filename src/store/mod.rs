//! Persistence layer.
//! Mission: own the SQLite connection lifecycle; one module per aggregate.
//!
//! The store holds a `db_path` string, not a pooled connection, and opens
//! a fresh `rusqlite::Connection` per call. SQLite's single-writer model
//! plus WAL mode makes this cheap enough and keeps every unit of work
//! transactionally isolated.

pub mod schema;

pub mod events;
pub mod import_jobs;
pub mod links;
pub mod listings;
pub mod matches;
pub mod notifications;
pub mod outbound;
pub mod preferences;
pub mod provider_requests;
pub mod releases;
pub mod rules;
pub mod snapshots;
pub mod users;

use rusqlite::Connection;

#[derive(Debug, Clone)]
pub struct Store {
    db_path: String,
}

impl Store {
    /// Open (creating if necessary) the database at `db_path` and run migrations.
    pub fn new(db_path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path)?;
        schema::init_db(&conn)?;
        Ok(Self {
            db_path: db_path.to_string(),
        })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = format!("file:watchwax_test_{n}?mode=memory&cache=shared");
        let conn = Connection::open(&path)?;
        schema::init_db(&conn)?;
        // Keep the shared in-memory db alive for the lifetime of the Store
        // by leaking one connection; rusqlite's shared-cache mode drops the
        // database once the last connection to it closes.
        std::mem::forget(conn);
        Ok(Self { db_path: path })
    }

    pub(crate) fn conn(&self) -> rusqlite::Result<Connection> {
        Connection::open(&self.db_path)
    }
}

pub(crate) fn opt_string(s: &Option<String>) -> Option<&str> {
    s.as_deref()
}
