//! # Manifest
//!
//! The transactional, per-set index mapping `(path, commit_time)` pairs to
//! blob references and metadata. The reference representation is a small
//! embedded relational store: a SQLite file (via `rusqlite`) with an index
//! on `(path, commit_time)`, loaded into a scratch file at backup start,
//! mutated during the run, and re-published through the backend's own
//! atomic `manifest_put` at commit.
//!
//! ## Two kinds of SHA
//!
//! A manifest entry's `sha` is always the **content identity** of the file
//! at that version — the plaintext SHA-256 used for change detection and
//! for cross-path deduplication. That is *not* the same thing as the
//! address of the bytes actually sitting in the blob store: a diff entry's
//! stored payload is a patch, addressed by the patch's own SHA-256, not the
//! target file's content SHA (a blob's address is always the SHA-256 of
//! its plaintext — for a diff blob, its plaintext *is* the patch bytes).
//! The `blobs` table is the bridge: keyed by content SHA, it records where
//! that content actually lives (`blob_addr`) and, if it's a diff, the
//! content SHA of the version the patch applies against (`parent_sha`).
//! Chain resolution walks `blobs` by SHA pointer, independent of any
//! path's `entries` history, since cross-path dedup means the same content
//! can be introduced by one path and diffed against by another.
//!
//! The manifest never overwrites history in place — every mutation is an
//! `INSERT` with a fresh, monotonically increasing `commit_time`; a
//! tombstone is an entry whose `sha` column is `NULL`.

use crate::backend::{self, BlobStore};
use crate::error::{EngineError, Result};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const SCHEMA_VERSION: i64 = 1;

/// One row of per-path history. `sha` is the file's content identity, not
/// a storage address.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub path: String,
    pub commit_time: i64,
    /// `None` encodes a tombstone.
    pub sha: Option<String>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
}

impl Entry {
    pub fn tombstone_template(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            commit_time: 0,
            sha: None,
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.sha.is_none()
    }
}

/// One row of the global, path-independent blob index: where a given
/// content SHA actually lives and, for diffs, what it's a patch against.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobRecord {
    pub sha: String,
    pub blob_addr: String,
    pub is_diff: bool,
    pub parent_sha: Option<String>,
    pub wrapped_key: Option<Vec<u8>>,
    pub iv: Option<Vec<u8>>,
}

/// An open manifest session: a live SQLite connection backed by a scratch
/// file, plus the monotonic clock used to stamp new entries.
pub struct Manifest {
    conn: Connection,
    db_path: PathBuf,
    last_commit_time: i64,
}

impl Manifest {
    /// Loads the latest published manifest for `store` (if any) into a
    /// fresh scratch file and opens it; absent any prior manifest, starts
    /// from an empty schema.
    pub fn open(store: &dyn BlobStore, scratch_dir: &Path) -> Result<Self> {
        fs::create_dir_all(scratch_dir)?;
        let db_path = scratch_dir.join("manifest.sqlite3");
        let _ = fs::remove_file(&db_path);

        if let Some(latest_name) = store.manifest_latest()? {
            let bytes = store.manifest_get(&latest_name)?;
            fs::write(&db_path, bytes)?;
        }

        let conn = Connection::open(&db_path)
            .map_err(|e| EngineError::Transport(format!("opening manifest db: {e}")))?;
        init_schema(&conn)?;

        let last_commit_time: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(commit_time), 0) FROM entries",
                [],
                |row| row.get(0),
            )
            .map_err(|e| EngineError::Corrupt(format!("reading manifest: {e}")))?;

        Ok(Self {
            conn,
            db_path,
            last_commit_time,
        })
    }

    /// The most recent entry ever recorded for `path`, regardless of when —
    /// what the Snapshotter uses to decide how a file has changed since the
    /// last pass, as opposed to [`Self::get_entry`]'s point-in-time query
    /// used by `list`/`restore`.
    pub fn latest_entry(&self, path: &str) -> Result<Option<Entry>> {
        self.get_entry(path, i64::MAX)
    }

    /// Latest entry for `path` with `commit_time <= at`, if any.
    pub fn get_entry(&self, path: &str, at: i64) -> Result<Option<Entry>> {
        self.conn
            .query_row(
                "SELECT path, commit_time, sha, mode, uid, gid, size, mtime
                 FROM entries WHERE path = ?1 AND commit_time <= ?2
                 ORDER BY commit_time DESC LIMIT 1",
                params![path, at],
                row_to_entry,
            )
            .optional()
            .map_err(|e| EngineError::Corrupt(format!("querying manifest: {e}")).into())
    }

    /// Appends `entry` with a fresh monotonically-increasing `commit_time`,
    /// returning the stamped entry.
    pub fn insert(&mut self, mut entry: Entry) -> Result<Entry> {
        entry.commit_time = self.next_commit_time();
        self.conn
            .execute(
                "INSERT INTO entries (path, commit_time, sha, mode, uid, gid, size, mtime)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.path,
                    entry.commit_time,
                    entry.sha,
                    entry.mode,
                    entry.uid,
                    entry.gid,
                    entry.size as i64,
                    entry.mtime,
                ],
            )
            .map_err(|e| EngineError::Corrupt(format!("writing manifest entry: {e}")))?;
        Ok(entry)
    }

    /// Inserts a tombstone for `path`.
    pub fn tombstone(&mut self, path: &str) -> Result<Entry> {
        self.insert(Entry::tombstone_template(path))
    }

    /// All distinct paths ever recorded, regardless of current state.
    pub fn all_paths(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT path FROM entries")
            .map_err(|e| EngineError::Corrupt(e.to_string()))?;
        let paths = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| EngineError::Corrupt(e.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Corrupt(e.to_string()))?;
        Ok(paths)
    }

    /// Full ordered history for a single path.
    pub fn history(&self, path: &str) -> Result<Vec<Entry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT path, commit_time, sha, mode, uid, gid, size, mtime
                 FROM entries WHERE path = ?1 ORDER BY commit_time ASC",
            )
            .map_err(|e| EngineError::Corrupt(e.to_string()))?;
        let rows = stmt
            .query_map(params![path], row_to_entry)
            .map_err(|e| EngineError::Corrupt(e.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Corrupt(e.to_string()))?;
        Ok(rows)
    }

    /// State-at-time filtered by path regex, used by both `list` and
    /// `restore`. Returns every matching path's latest
    /// entry at `at`, tombstones included — callers filter those out when
    /// they only want live paths.
    pub fn search(&self, pattern: &Regex, at: i64) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        for path in self.all_paths()? {
            if !pattern.is_match(&path) {
                continue;
            }
            if let Some(entry) = self.get_entry(&path, at)? {
                out.push(entry);
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    /// Looks up the global blob record for a content SHA, if this exact
    /// content has ever been stored before (by any path) — the basis for
    /// cross-path deduplication.
    pub fn get_blob(&self, sha: &str) -> Result<Option<BlobRecord>> {
        self.conn
            .query_row(
                "SELECT sha, blob_addr, is_diff, parent_sha, wrapped_key, iv
                 FROM blobs WHERE sha = ?1",
                params![sha],
                row_to_blob_record,
            )
            .optional()
            .map_err(|e| EngineError::Corrupt(format!("querying blobs: {e}")).into())
    }

    /// Records a new content SHA's storage location. A no-op if this SHA
    /// is already known (idempotent: identical content always resolves to
    /// the same record).
    pub fn put_blob(&mut self, record: &BlobRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO blobs (sha, blob_addr, is_diff, parent_sha, wrapped_key, iv)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.sha,
                    record.blob_addr,
                    record.is_diff,
                    record.parent_sha,
                    record.wrapped_key,
                    record.iv,
                ],
            )
            .map_err(|e| EngineError::Corrupt(format!("writing blob record: {e}")))?;
        Ok(())
    }

    /// Every known `(blob_addr -> wrapped_key, iv)` pair, used to seed the
    /// Backup Store's key cache so cross-run dedup also avoids
    /// re-encrypting.
    pub fn known_blob_wraps(&self) -> Result<HashMap<String, (Option<Vec<u8>>, Option<Vec<u8>>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT blob_addr, wrapped_key, iv FROM blobs")
            .map_err(|e| EngineError::Corrupt(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                ))
            })
            .map_err(|e| EngineError::Corrupt(e.to_string()))?;

        let mut map = HashMap::new();
        for row in rows {
            let (addr, wrapped_key, iv) = row.map_err(|e| EngineError::Corrupt(e.to_string()))?;
            map.insert(addr, (wrapped_key, iv));
        }
        Ok(map)
    }

    /// Publishes the current manifest state through `store` as a new
    /// timestamped version, then prunes older versions beyond
    /// `max_versions`. `max_versions == 0` retains everything.
    pub fn commit(&mut self, store: &dyn BlobStore, max_versions: usize) -> Result<()> {
        let bytes = fs::read(&self.db_path)?;
        let name = backend::manifest_name(now_unix_nanos());
        store.manifest_put(&name, &bytes)?;
        self.prune(store, max_versions)?;
        Ok(())
    }

    fn prune(&self, store: &dyn BlobStore, max_versions: usize) -> Result<()> {
        if max_versions == 0 {
            return Ok(());
        }
        let mut names = store.manifest_list()?;
        names.sort_by_key(|n| backend::manifest_name_instant(n).unwrap_or_default());
        while names.len() > max_versions {
            let oldest = names.remove(0);
            store.manifest_delete(&oldest)?;
        }
        Ok(())
    }

    fn next_commit_time(&mut self) -> i64 {
        let now = now_unix_nanos();
        let next = now.max(self.last_commit_time + 1);
        self.last_commit_time = next;
        next
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL,
            commit_time INTEGER NOT NULL,
            sha TEXT,
            mode INTEGER NOT NULL,
            uid INTEGER NOT NULL,
            gid INTEGER NOT NULL,
            size INTEGER NOT NULL,
            mtime INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entries_path_time ON entries(path, commit_time);

        CREATE TABLE IF NOT EXISTS blobs (
            sha TEXT PRIMARY KEY,
            blob_addr TEXT NOT NULL,
            is_diff INTEGER NOT NULL,
            parent_sha TEXT,
            wrapped_key BLOB,
            iv BLOB
        );

        CREATE TABLE IF NOT EXISTS manifest_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
    )
    .map_err(|e| EngineError::Corrupt(format!("initializing manifest schema: {e}")))?;

    conn.execute(
        "INSERT OR IGNORE INTO manifest_meta (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )
    .map_err(|e| EngineError::Corrupt(e.to_string()))?;

    Ok(())
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<Entry> {
    Ok(Entry {
        path: row.get(0)?,
        commit_time: row.get(1)?,
        sha: row.get(2)?,
        mode: row.get(3)?,
        uid: row.get(4)?,
        gid: row.get(5)?,
        size: row.get::<_, i64>(6)? as u64,
        mtime: row.get(7)?,
    })
}

fn row_to_blob_record(row: &rusqlite::Row) -> rusqlite::Result<BlobRecord> {
    Ok(BlobRecord {
        sha: row.get(0)?,
        blob_addr: row.get(1)?,
        is_diff: row.get(2)?,
        parent_sha: row.get(3)?,
        wrapped_key: row.get(4)?,
        iv: row.get(5)?,
    })
}

/// Current instant in Unix nanoseconds.
pub fn now_unix_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}
