pub mod blocks;
pub mod connections;
pub mod conversations;
pub mod error;
pub mod ledger;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod notifications;
pub mod users;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use tracing::info;

pub use error::{Result, StoreError};

/// Bounded retry for SQLITE_BUSY at the transaction boundary.
const BUSY_RETRIES: u32 = 3;
const BUSY_BACKOFF: Duration = Duration::from_millis(50);

/// The store. One mutex-guarded connection serializes every mutation, which
/// is the row-lock equivalent this schema needs: two concurrent debits for
/// the same user can never interleave between the balance read and the
/// ledger write.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, &path.display().to_string())
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> Result<Self> {
        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run(&conn)?;

        info!("Database opened at {}", label);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        f(&conn)
    }

    /// Run `f` inside a transaction, committing on success. Busy errors are
    /// retried a bounded number of times before surfacing; any other error
    /// rolls back.
    pub fn transaction<F, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&rusqlite::Transaction) -> Result<T>,
    {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        let mut attempts = 0u32;
        loop {
            let tx = conn.transaction()?;
            let outcome = match f(&tx) {
                Ok(value) => match tx.commit() {
                    Ok(()) => return Ok(value),
                    Err(e) => StoreError::Db(e),
                },
                Err(e) => e,
            };

            if outcome.is_busy() && attempts < BUSY_RETRIES {
                attempts += 1;
                std::thread::sleep(BUSY_BACKOFF);
                continue;
            }
            return Err(outcome);
        }
    }
}
