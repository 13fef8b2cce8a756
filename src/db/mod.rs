mod schema;
pub mod embeddings;
pub mod faces;
pub mod jobs;
pub mod photos;

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

pub use embeddings::{bytes_to_embedding, embedding_to_bytes, PersonEmbedding};
pub use faces::{BoundingBox, Face, FaceStatus, NewFace, Person};
pub use jobs::{Job, JobResultRow};
pub use photos::{Photo, PhotoStatus};
pub use schema::SCHEMA;

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// A handle on the store.
///
/// Each thread that touches the store opens its own handle; nothing is shared
/// between workers except the database file itself.
pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Ok(Self { conn })
    }

    /// Open and make sure the schema exists.
    pub fn open_initialized(path: &Path) -> Result<Self> {
        let db = Self::open(path)?;
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Run `f` inside an IMMEDIATE transaction.
    ///
    /// The write lock is taken up front, so two handles running this for the
    /// same rows are serialised. Any error rolls everything back.
    pub fn immediate<T, E>(&self, f: impl FnOnce(&Database) -> std::result::Result<T, E>) -> std::result::Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Database;
    use tempfile::TempDir;

    /// A database file in a fresh temp dir; the dir is removed when dropped.
    pub struct TestDb {
        pub dir: TempDir,
        pub db: Database,
    }

    impl TestDb {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let db = Database::open_initialized(&dir.path().join("test.db")).unwrap();
            Self { dir, db }
        }

        pub fn path(&self) -> std::path::PathBuf {
            self.dir.path().join("test.db")
        }

        /// A second, independent handle on the same file.
        pub fn reopen(&self) -> Database {
            Database::open(&self.path()).unwrap()
        }
    }
}
