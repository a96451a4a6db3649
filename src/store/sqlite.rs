//! SQLite-backed store: WAL-mode database shared by the daemon and the CLI.
//!
//! Spec and status are stored as JSON documents; the version column is the
//! optimistic-concurrency token and every status write is a compare-and-set
//! on it.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::core::errors::{LzrError, Result};
use crate::model::{Metadata, RestoreTest, RestoreTestStatus};
use crate::store::TestStore;

pub struct SqliteTestStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteTestStore {
    /// Open (or create) the database at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LzrError::io(parent, e))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn)?;
        apply_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check that WAL mode is active (for diagnostics).
    pub fn is_wal_mode(&self) -> bool {
        self.conn
            .lock()
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .map(|mode| mode.eq_ignore_ascii_case("wal"))
            .unwrap_or(false)
    }
}

// ──────────────────── row mapping ────────────────────

struct StoredRow {
    name: String,
    uid: String,
    version: i64,
    created_at: String,
    deletion_requested_at: Option<String>,
    spec: String,
    status: String,
}

const SELECT_COLUMNS: &str =
    "SELECT name, uid, version, created_at, deletion_requested_at, spec, status FROM restore_tests";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        name: row.get(0)?,
        uid: row.get(1)?,
        version: row.get(2)?,
        created_at: row.get(3)?,
        deletion_requested_at: row.get(4)?,
        spec: row.get(5)?,
        status: row.get(6)?,
    })
}

fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_stamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LzrError::Serialization {
            context: "store timestamp",
            details: format!("{raw:?}: {e}"),
        })
}

fn to_version(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or_default()
}

fn to_column(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|_| LzrError::Runtime {
        details: format!("resource version {version} out of range"),
    })
}

impl StoredRow {
    fn into_record(self) -> Result<RestoreTest> {
        Ok(RestoreTest {
            metadata: Metadata {
                name: self.name,
                uid: self.uid,
                resource_version: to_version(self.version),
                creation_timestamp: parse_stamp(&self.created_at)?,
                deletion_requested_at: self
                    .deletion_requested_at
                    .as_deref()
                    .map(parse_stamp)
                    .transpose()?,
            },
            spec: serde_json::from_str(&self.spec)?,
            status: serde_json::from_str(&self.status)?,
        })
    }
}

fn not_found(name: &str) -> LzrError {
    LzrError::NotFound {
        kind: "restore test",
        name: name.to_string(),
    }
}

fn fetch(conn: &Connection, name: &str) -> Result<Option<RestoreTest>> {
    let row = conn
        .prepare_cached(&format!("{SELECT_COLUMNS} WHERE name = ?1"))?
        .query_row(params![name], read_row)
        .optional()?;
    row.map(StoredRow::into_record).transpose()
}

// ──────────────────── TestStore ────────────────────

impl TestStore for SqliteTestStore {
    fn create(&self, mut test: RestoreTest) -> Result<RestoreTest> {
        test.metadata.resource_version = 1;
        let spec = serde_json::to_string(&test.spec)?;
        let status = serde_json::to_string(&test.status)?;
        let conn = self.conn.lock();
        let inserted = conn
            .prepare_cached(
                "INSERT OR IGNORE INTO restore_tests (
                name, uid, version, phase, created_at, deletion_requested_at, spec, status
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            )?
            .execute(params![
                test.metadata.name,
                test.metadata.uid,
                1_i64,
                test.status.phase.as_str(),
                stamp(test.metadata.creation_timestamp),
                test.metadata.deletion_requested_at.map(stamp),
                spec,
                status,
            ])?;
        if inserted == 0 {
            return Err(LzrError::AlreadyExists {
                kind: "restore test",
                name: test.metadata.name,
            });
        }
        Ok(test)
    }

    fn get(&self, name: &str) -> Result<RestoreTest> {
        fetch(&self.conn.lock(), name)?.ok_or_else(|| not_found(name))
    }

    fn list(&self) -> Result<Vec<RestoreTest>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!("{SELECT_COLUMNS} ORDER BY name ASC"))?;
        let rows = stmt
            .query_map([], read_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(StoredRow::into_record).collect()
    }

    fn update_status(&self, name: &str, expected_version: u64, status: &RestoreTestStatus) -> Result<u64> {
        let body = serde_json::to_string(status)?;
        let expected = to_column(expected_version)?;
        let conn = self.conn.lock();
        let changed = conn
            .prepare_cached(
                "UPDATE restore_tests SET status = ?1, phase = ?2, version = version + 1
                 WHERE name = ?3 AND version = ?4",
            )?
            .execute(params![body, status.phase.as_str(), name, expected])?;
        if changed == 1 {
            return Ok(expected_version + 1);
        }
        let found: Option<i64> = conn
            .query_row(
                "SELECT version FROM restore_tests WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        match found {
            None => Err(not_found(name)),
            Some(found) => Err(LzrError::Conflict {
                name: name.to_string(),
                expected: expected_version,
                found: to_version(found),
            }),
        }
    }

    fn request_deletion(&self, name: &str, at: DateTime<Utc>) -> Result<RestoreTest> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "UPDATE restore_tests SET deletion_requested_at = ?1, version = version + 1
             WHERE name = ?2 AND deletion_requested_at IS NULL",
        )?
        .execute(params![stamp(at), name])?;
        fetch(&conn, name)?.ok_or_else(|| not_found(name))
    }

    fn deleting(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT name FROM restore_tests WHERE deletion_requested_at IS NOT NULL ORDER BY name ASC",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn remove(&self, name: &str) -> Result<bool> {
        let deleted = self
            .conn
            .lock()
            .execute("DELETE FROM restore_tests WHERE name = ?1", params![name])?;
        Ok(deleted > 0)
    }
}

// ──────────────────── schema & pragmas ────────────────────

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        eprintln!("[LZR-STORE] WARNING: requested WAL mode but got '{mode}'");
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS restore_tests (
            name TEXT PRIMARY KEY,
            uid TEXT NOT NULL,
            version INTEGER NOT NULL,
            phase TEXT NOT NULL,
            created_at TEXT NOT NULL,
            deletion_requested_at TEXT,
            spec TEXT NOT NULL,
            status TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_restore_tests_phase ON restore_tests(phase);",
    )?;
    Ok(())
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Phase, RestoreTestSpec};

    fn temp_store() -> (tempfile::TempDir, SqliteTestStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteTestStore::open(&dir.path().join("store.db")).unwrap();
        (dir, store)
    }

    fn record(name: &str) -> RestoreTest {
        RestoreTest::new(name, RestoreTestSpec::for_backup("nightly-2025-12-31"), Utc::now())
    }

    #[test]
    fn schema_created_and_wal_active() {
        let (_dir, store) = temp_store();
        assert!(store.is_wal_mode());
    }

    #[test]
    fn create_get_list_round_trip() {
        let (_dir, store) = temp_store();
        let created = store.create(record("b")).unwrap();
        store.create(record("a")).unwrap();
        let fetched = store.get("b").unwrap();
        assert_eq!(fetched.metadata.uid, created.metadata.uid);
        assert_eq!(fetched.spec.backup_name, "nightly-2025-12-31");
        let names: Vec<String> = store.list().unwrap().into_iter().map(|t| t.metadata.name).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(store.create(record("a")).unwrap_err().code(), "LZR-2005");
    }

    #[test]
    fn status_write_is_compare_and_set() {
        let (_dir, store) = temp_store();
        store.create(record("a")).unwrap();
        let mut status = RestoreTestStatus::default();
        status
            .transition(Phase::RestoreRequested, "Validated", "", Utc::now())
            .unwrap();
        assert_eq!(store.update_status("a", 1, &status).unwrap(), 2);
        match store.update_status("a", 1, &status).unwrap_err() {
            LzrError::Conflict { expected, found, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(found, 2);
            }
            other => panic!("unexpected {other}"),
        }
        assert_eq!(store.get("a").unwrap().status.conditions.len(), 1);
        assert_eq!(store.update_status("missing", 1, &status).unwrap_err().code(), "LZR-2301");
    }

    #[test]
    fn deletion_request_is_sticky() {
        let (_dir, store) = temp_store();
        store.create(record("a")).unwrap();
        let first = store.request_deletion("a", Utc::now()).unwrap();
        let second = store.request_deletion("a", Utc::now()).unwrap();
        assert_eq!(first.metadata.resource_version, 2);
        assert_eq!(second.metadata.resource_version, 2);
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
    }

    #[test]
    fn deletion_requests_are_visible_to_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let daemon_side = SqliteTestStore::open(&path).unwrap();
        daemon_side.create(record("a")).unwrap();
        daemon_side.create(record("b")).unwrap();
        assert!(daemon_side.deleting().unwrap().is_empty());
        assert!(daemon_side.subscribe().is_none());

        let cli_side = SqliteTestStore::open(&path).unwrap();
        cli_side.request_deletion("b", Utc::now()).unwrap();
        assert_eq!(daemon_side.deleting().unwrap(), ["b"]);
    }

    #[test]
    fn reopen_sees_committed_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        SqliteTestStore::open(&path).unwrap().create(record("a")).unwrap();
        let reopened = SqliteTestStore::open(&path).unwrap();
        assert_eq!(reopened.get("a").unwrap().metadata.resource_version, 1);
    }
}
