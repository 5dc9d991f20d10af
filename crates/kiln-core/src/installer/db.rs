//! SQLite install database.
//!
//! Tracks one record per concrete spec hash plus the dependency edges
//! between recorded nodes. Every transaction runs under an exclusive
//! advisory lock on `<db_dir>/locks/db.lock`, acquired with a bounded wait.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use kiln_schema::{AbstractSpec, ConcreteSpec, DagHash, SpecRecord};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use thiserror::Error;

const LOCK_POLL: Duration = Duration::from_millis(50);
const DB_LOCK: &str = "db.lock";

/// Errors from the install database.
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite failure.
    #[error("install database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Creating the database directory or lock file failed.
    #[error("cannot access {}", path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Another process held the lock for too long.
    #[error("timed out after {waited:?} waiting for lock {}", path.display())]
    LockTimeout {
        /// Lock file.
        path: PathBuf,
        /// How long we waited.
        waited: Duration,
    },
    /// A stored record cannot be decoded.
    #[error("corrupt install record {hash}: {reason}")]
    Corrupt {
        /// Record key.
        hash: String,
        /// What failed.
        reason: String,
    },
}

/// Record state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstallState {
    /// Source is being fetched and staged.
    Staged,
    /// Every phase succeeded.
    Built,
    /// Prefix verified and metadata written.
    Installed,
    /// Terminal failure; the prefix was removed.
    Failed,
}

impl InstallState {
    /// Stored name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staged => "staged",
            Self::Built => "built",
            Self::Installed => "installed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staged" => Ok(Self::Staged),
            "built" => Ok(Self::Built),
            "installed" => Ok(Self::Installed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown state '{other}'")),
        }
    }
}

/// One recorded node.
#[derive(Debug, Clone)]
pub struct InstallRecord {
    /// Node hash.
    pub hash: DagHash,
    /// Package name.
    pub name: String,
    /// Version.
    pub version: String,
    /// Install prefix.
    pub prefix: PathBuf,
    /// Current state.
    pub state: InstallState,
    /// The full concrete spec.
    pub spec: Arc<ConcreteSpec>,
    /// Last transition, seconds since the epoch.
    pub updated_at: i64,
}

impl InstallRecord {
    /// Whether the record is installed and its prefix still exists.
    pub fn is_live(&self) -> bool {
        self.state == InstallState::Installed && self.prefix.is_dir()
    }
}

/// Exclusive advisory lock on a file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Lock `path`, polling until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`DbError::LockTimeout`] when the wait runs out, [`DbError::Io`] when
    /// the lock file cannot be opened.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, DbError> {
        let io_err = |source| DbError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;
        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(_) if start.elapsed() < timeout => std::thread::sleep(LOCK_POLL),
                Err(_) => {
                    return Err(DbError::LockTimeout {
                        path: path.to_path_buf(),
                        waited: start.elapsed(),
                    });
                }
            }
        }
    }

    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Handle on the install database. Cheap to clone; each call opens its own
/// connection under the lock.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
    lock_dir: PathBuf,
    lock_timeout: Duration,
}

impl Database {
    /// Database at `path` with locks under `lock_dir`.
    pub fn new(path: impl Into<PathBuf>, lock_dir: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_dir: lock_dir.into(),
            lock_timeout,
        }
    }

    /// Lock serializing builds of one node across processes.
    ///
    /// # Errors
    ///
    /// Same as [`FileLock::acquire`].
    pub fn lock_prefix(&self, hash: &DagHash) -> Result<FileLock, DbError> {
        FileLock::acquire(
            &self.lock_dir.join(format!("{}.lock", hash.prefix_component())),
            self.lock_timeout,
        )
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T, DbError>) -> Result<T, DbError> {
        let _lock = FileLock::acquire(&self.lock_dir.join(DB_LOCK), self.lock_timeout)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| DbError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS records (
                hash TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                prefix TEXT NOT NULL,
                state TEXT NOT NULL,
                spec TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS edges (
                parent TEXT NOT NULL REFERENCES records(hash) ON DELETE CASCADE,
                child TEXT NOT NULL,
                types TEXT NOT NULL,
                PRIMARY KEY (parent, child)
            );

            CREATE INDEX IF NOT EXISTS idx_edges_child ON edges(child);
            ",
        )?;
        f(&mut conn)
    }

    /// Create or update the record for `spec`.
    ///
    /// # Errors
    ///
    /// Lock or SQLite failures.
    pub fn set_state(&self, spec: &Arc<ConcreteSpec>, prefix: &Path, state: InstallState) -> Result<(), DbError> {
        let json = serde_json::to_string(&spec.to_record()).map_err(|e| DbError::Corrupt {
            hash: spec.hash().to_string(),
            reason: e.to_string(),
        })?;
        let now = chrono::Utc::now().timestamp();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO records (hash, name, version, prefix, state, spec, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(hash) DO UPDATE SET
                    prefix = excluded.prefix, state = excluded.state, updated_at = excluded.updated_at",
                params![
                    spec.hash().as_str(),
                    spec.name(),
                    spec.version().as_str(),
                    prefix.to_string_lossy(),
                    state.as_str(),
                    json,
                    now
                ],
            )?;
            for edge in spec.dependencies() {
                tx.execute(
                    "INSERT OR REPLACE INTO edges (parent, child, types) VALUES (?1, ?2, ?3)",
                    params![spec.hash().as_str(), edge.spec.hash().as_str(), edge.types.to_string()],
                )?;
            }
            tx.commit()?;
            Ok(())
        })?;
        tracing::debug!(spec = %spec.short_form(), %state, "recorded state");
        Ok(())
    }

    /// Record for `hash`.
    ///
    /// # Errors
    ///
    /// Lock, SQLite or decoding failures.
    pub fn get(&self, hash: &DagHash) -> Result<Option<InstallRecord>, DbError> {
        self.with_conn(|conn| record_in(conn, hash))
    }

    /// Every record, ordered by name then version.
    ///
    /// # Errors
    ///
    /// Lock, SQLite or decoding failures.
    pub fn all(&self) -> Result<Vec<InstallRecord>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT hash, name, version, prefix, state, spec, updated_at FROM records ORDER BY name, version",
            )?;
            let rows = stmt.query_map([], RawRecord::from_row)?;
            rows.map(|r| r.map_err(DbError::from).and_then(RawRecord::decode))
                .collect()
        })
    }

    /// Records whose spec satisfies `constraint`; `None` matches all.
    ///
    /// # Errors
    ///
    /// Same as [`Database::all`].
    pub fn query(&self, constraint: Option<&AbstractSpec>) -> Result<Vec<InstallRecord>, DbError> {
        let all = self.all()?;
        Ok(match constraint {
            None => all,
            Some(c) => all.into_iter().filter(|r| r.spec.satisfies(c)).collect(),
        })
    }

    /// Installed records that depend directly on `hash`.
    ///
    /// # Errors
    ///
    /// Lock, SQLite or decoding failures.
    pub fn installed_dependents(&self, hash: &DagHash) -> Result<Vec<InstallRecord>, DbError> {
        self.with_conn(|conn| dependents_in(conn, hash))
    }

    /// Delete the record for `hash` and its outgoing edges.
    ///
    /// # Errors
    ///
    /// Lock or SQLite failures.
    pub fn remove(&self, hash: &DagHash) -> Result<bool, DbError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM edges WHERE parent = ?1", params![hash.as_str()])?;
            let n = tx.execute("DELETE FROM records WHERE hash = ?1", params![hash.as_str()])?;
            tx.commit()?;
            Ok(n > 0)
        })
    }

    /// Check for installed dependents, run `delete_prefix` and drop the
    /// record, all in one transaction under the database lock.
    ///
    /// With `force` the dependents check is skipped. The record stays when
    /// `delete_prefix` fails.
    ///
    /// # Errors
    ///
    /// Lock, SQLite or decoding failures, or [`DbError::Io`] from
    /// `delete_prefix`.
    pub fn remove_checked(
        &self,
        hash: &DagHash,
        force: bool,
        delete_prefix: impl FnOnce(&Path) -> std::io::Result<()>,
    ) -> Result<Removal, DbError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(record) = record_in(&tx, hash)? else {
                return Ok(Removal::Missing);
            };
            if !force {
                let dependents = dependents_in(&tx, hash)?;
                if !dependents.is_empty() {
                    return Ok(Removal::Blocked(dependents));
                }
            }
            delete_prefix(&record.prefix).map_err(|source| DbError::Io {
                path: record.prefix.clone(),
                source,
            })?;
            tx.execute("DELETE FROM edges WHERE parent = ?1", params![hash.as_str()])?;
            tx.execute("DELETE FROM records WHERE hash = ?1", params![hash.as_str()])?;
            tx.commit()?;
            Ok(Removal::Removed(record))
        })
    }
}

/// Outcome of [`Database::remove_checked`].
#[derive(Debug)]
pub enum Removal {
    /// The prefix and record are gone; the former record.
    Removed(InstallRecord),
    /// Nothing recorded for the hash.
    Missing,
    /// Installed dependents still reference the node.
    Blocked(Vec<InstallRecord>),
}

fn record_in(conn: &Connection, hash: &DagHash) -> Result<Option<InstallRecord>, DbError> {
    conn.query_row(
        "SELECT hash, name, version, prefix, state, spec, updated_at FROM records WHERE hash = ?1",
        params![hash.as_str()],
        RawRecord::from_row,
    )
    .optional()?
    .map(RawRecord::decode)
    .transpose()
}

fn dependents_in(conn: &Connection, hash: &DagHash) -> Result<Vec<InstallRecord>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT r.hash, r.name, r.version, r.prefix, r.state, r.spec, r.updated_at
         FROM edges e JOIN records r ON r.hash = e.parent
         WHERE e.child = ?1 AND r.state = 'installed'
         ORDER BY r.name",
    )?;
    let rows = stmt.query_map(params![hash.as_str()], RawRecord::from_row)?;
    rows.map(|r| r.map_err(DbError::from).and_then(RawRecord::decode))
        .collect()
}

struct RawRecord {
    hash: String,
    name: String,
    version: String,
    prefix: String,
    state: String,
    spec: String,
    updated_at: i64,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            hash: row.get(0)?,
            name: row.get(1)?,
            version: row.get(2)?,
            prefix: row.get(3)?,
            state: row.get(4)?,
            spec: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn decode(self) -> Result<InstallRecord, DbError> {
        let corrupt = |reason: String| DbError::Corrupt {
            hash: self.hash.clone(),
            reason,
        };
        let hash = DagHash::parse(&self.hash).map_err(|e| corrupt(e.to_string()))?;
        let state = self.state.parse().map_err(corrupt)?;
        let record: SpecRecord = serde_json::from_str(&self.spec).map_err(|e| corrupt(e.to_string()))?;
        let spec = ConcreteSpec::from_record(&record).map_err(|e| corrupt(e.to_string()))?;
        if spec.hash() != &hash {
            return Err(corrupt(format!("stored spec hashes to {}", spec.hash())));
        }
        Ok(InstallRecord {
            hash,
            name: self.name,
            version: self.version,
            prefix: PathBuf::from(self.prefix),
            state,
            spec,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::installer::build_env::tests::node;
    use kiln_schema::{DepTypes, DependencyEdge};

    fn db(dir: &Path) -> Database {
        Database::new(dir.join("index.sqlite"), dir.join("locks"), Duration::from_millis(200))
    }

    #[test]
    fn transitions_and_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path());
        let zlib = ConcreteSpec::new(node("zlib", "1.3.1"), Vec::new()).unwrap();
        let libpng = ConcreteSpec::new(
            node("libpng", "1.6.43"),
            vec![DependencyEdge {
                spec: Arc::clone(&zlib),
                types: DepTypes::default(),
            }],
        )
        .unwrap();

        db.set_state(&zlib, Path::new("/p/zlib"), InstallState::Staged).unwrap();
        db.set_state(&zlib, Path::new("/p/zlib"), InstallState::Installed).unwrap();
        let rec = db.get(zlib.hash()).unwrap().unwrap();
        assert_eq!(rec.state, InstallState::Installed);
        assert_eq!(rec.spec.hash(), zlib.hash());

        db.set_state(&libpng, Path::new("/p/libpng"), InstallState::Built).unwrap();
        assert!(db.installed_dependents(zlib.hash()).unwrap().is_empty());
        db.set_state(&libpng, Path::new("/p/libpng"), InstallState::Installed).unwrap();
        let deps = db.installed_dependents(zlib.hash()).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].name, "libpng");

        let q = AbstractSpec::parse("zlib@1.3").unwrap();
        assert_eq!(db.query(Some(&q)).unwrap().len(), 1);
        assert_eq!(db.query(None).unwrap().len(), 2);

        assert!(db.remove(libpng.hash()).unwrap());
        assert!(db.installed_dependents(zlib.hash()).unwrap().is_empty());
        assert!(!db.remove(libpng.hash()).unwrap());
    }

    #[test]
    fn checked_removal_respects_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path());
        let zlib = ConcreteSpec::new(node("zlib", "1.3.1"), Vec::new()).unwrap();
        let libpng = ConcreteSpec::new(
            node("libpng", "1.6.43"),
            vec![DependencyEdge {
                spec: Arc::clone(&zlib),
                types: DepTypes::default(),
            }],
        )
        .unwrap();
        db.set_state(&zlib, Path::new("/p/zlib"), InstallState::Installed).unwrap();
        db.set_state(&libpng, Path::new("/p/libpng"), InstallState::Installed).unwrap();

        let mut deleted = Vec::new();
        let blocked = db
            .remove_checked(zlib.hash(), false, |p| {
                deleted.push(p.to_path_buf());
                Ok(())
            })
            .unwrap();
        assert!(matches!(blocked, Removal::Blocked(ref deps) if deps[0].name == "libpng"));
        assert!(deleted.is_empty());
        assert!(db.get(zlib.hash()).unwrap().is_some());

        let failed = db.remove_checked(zlib.hash(), true, |_| Err(std::io::Error::other("busy")));
        assert!(matches!(failed, Err(DbError::Io { .. })));
        assert!(db.get(zlib.hash()).unwrap().is_some());

        let removed = db.remove_checked(zlib.hash(), true, |_| Ok(())).unwrap();
        assert!(matches!(removed, Removal::Removed(ref r) if r.prefix == Path::new("/p/zlib")));
        assert!(matches!(db.remove_checked(zlib.hash(), true, |_| Ok(())).unwrap(), Removal::Missing));
    }

    #[test]
    fn held_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path());
        let spec = ConcreteSpec::new(node("zlib", "1.3.1"), Vec::new()).unwrap();
        let held = db.lock_prefix(spec.hash()).unwrap();

        let other = db.clone();
        let hash = spec.hash().clone();
        let err = std::thread::spawn(move || other.lock_prefix(&hash).unwrap_err())
            .join()
            .unwrap();
        assert!(matches!(err, DbError::LockTimeout { .. }));

        drop(held);
        db.lock_prefix(spec.hash()).unwrap();
    }
}
