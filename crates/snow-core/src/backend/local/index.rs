//! SQLite index for the local backend
//!
//! One database per site folder. Every document row carries a revision
//! token; updating a live row requires presenting the current token.
//! Deletes leave a tombstone row so a later save of the same path
//! continues the revision sequence.
//!
//! ## Tables
//!
//! - `schema_info` - Schema version and the scanned site root
//! - `documents` - Content entries and media assets

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use thiserror::Error;
use uuid::Uuid;

use crate::front_matter::sentinel_date;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Failed to open index at {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Index query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Document '{id}' has revision {actual}, but the update was based on {}", .expected.as_deref().unwrap_or("nothing"))]
    Conflict {
        id: String,
        expected: Option<String>,
        actual: String,
    },

    #[error("Failed to create directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type IndexResult<T> = Result<T, IndexError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Content,
    Asset,
}

impl RecordKind {
    fn as_str(self) -> &'static str {
        match self {
            RecordKind::Content => "content",
            RecordKind::Asset => "asset",
        }
    }
}

/// A row of the `documents` table
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub rev: Option<String>,
    pub kind: RecordKind,
    pub name: String,
    pub collection: Option<String>,
    pub date: DateTime<Utc>,
    /// Containing folder, relative to the site root
    pub path: String,
    /// Absolute path of the backing file
    pub file_path: PathBuf,
    pub raw: Option<String>,
    pub mime: Option<String>,
    pub public_url: Option<String>,
    pub preview_url: Option<String>,
}

const COLUMNS: &str = "id, rev, kind, name, collection, date, path, file_path, raw, mime, public_url, preview_url";

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            rev TEXT NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            collection TEXT,
            date INTEGER NOT NULL,
            path TEXT NOT NULL,
            file_path TEXT NOT NULL,
            raw TEXT,
            mime TEXT,
            public_url TEXT,
            preview_url TEXT
        );

        -- Listing a collection by name or by date
        CREATE INDEX IF NOT EXISTS idx_documents_name_collection ON documents(name, collection);
        CREATE INDEX IF NOT EXISTS idx_documents_date_collection ON documents(date, collection);

        -- Listing media
        CREATE INDEX IF NOT EXISTS idx_documents_kind ON documents(kind);

        -- Link rewriting lookups
        CREATE INDEX IF NOT EXISTS idx_documents_public_url ON documents(public_url);
        CREATE INDEX IF NOT EXISTS idx_documents_preview_url ON documents(preview_url);
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        params![SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Next revision token after `current`: `<generation>-<random>`
fn next_rev(current: Option<&str>) -> String {
    let generation = current
        .and_then(|rev| rev.split_once('-'))
        .and_then(|(n, _)| n.parse::<u64>().ok())
        .unwrap_or(0);
    format!("{}-{}", generation + 1, Uuid::new_v4().simple())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<Record> {
    let kind: String = row.get(2)?;
    let date_ms: i64 = row.get(5)?;
    let file_path: String = row.get(7)?;
    Ok(Record {
        id: row.get(0)?,
        rev: Some(row.get(1)?),
        kind: if kind == "asset" {
            RecordKind::Asset
        } else {
            RecordKind::Content
        },
        name: row.get(3)?,
        collection: row.get(4)?,
        date: DateTime::from_timestamp_millis(date_ms).unwrap_or_else(sentinel_date),
        path: row.get(6)?,
        file_path: PathBuf::from(file_path),
        raw: row.get(8)?,
        mime: row.get(9)?,
        public_url: row.get(10)?,
        preview_url: row.get(11)?,
    })
}

/// Current `(rev, deleted)` of a row
fn current_rev(tx: &Connection, id: &str) -> rusqlite::Result<Option<(String, bool)>> {
    tx.query_row(
        "SELECT rev, deleted FROM documents WHERE id = ?",
        params![id],
        |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
    )
    .optional()
}

/// Write one record inside a transaction, checking its revision
fn put_in(tx: &Transaction<'_>, record: &Record) -> IndexResult<String> {
    let current = current_rev(tx, &record.id)?;

    // A live row needs the matching revision; tombstones accept any
    if let Some((actual, false)) = &current {
        if record.rev.as_deref() != Some(actual.as_str()) {
            return Err(IndexError::Conflict {
                id: record.id.clone(),
                expected: record.rev.clone(),
                actual: actual.clone(),
            });
        }
    }

    let rev = next_rev(current.as_ref().map(|(rev, _)| rev.as_str()));
    tx.execute(
        r#"
        INSERT OR REPLACE INTO documents
            (id, rev, deleted, kind, name, collection, date, path, file_path, raw, mime, public_url, preview_url)
        VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            record.id,
            rev,
            record.kind.as_str(),
            record.name,
            record.collection,
            record.date.timestamp_millis(),
            record.path,
            record.file_path.to_string_lossy().into_owned(),
            record.raw,
            record.mime,
            record.public_url,
            record.preview_url,
        ],
    )?;

    Ok(rev)
}

/// The local backend's document index
pub struct Index {
    conn: Connection,
}

impl Index {
    /// Open or create the index database
    pub fn open(path: &Path) -> IndexResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| IndexError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path).map_err(|source| IndexError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory index (for testing)
    pub fn open_in_memory() -> IndexResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Site root recorded by the last directory scan
    pub fn root(&self) -> IndexResult<Option<PathBuf>> {
        let root: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM schema_info WHERE key = 'root'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(root.map(PathBuf::from))
    }

    pub fn set_root(&self, root: &Path) -> IndexResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('root', ?)",
            params![root.to_string_lossy().into_owned()],
        )?;
        Ok(())
    }

    /// Revision of a row, live or deleted
    pub fn revision(&self, id: &str) -> IndexResult<Option<String>> {
        Ok(current_rev(&self.conn, id)?.map(|(rev, _)| rev))
    }

    /// A live row
    pub fn get(&self, id: &str) -> IndexResult<Option<Record>> {
        let sql = format!("SELECT {COLUMNS} FROM documents WHERE id = ? AND deleted = 0");
        Ok(self
            .conn
            .query_row(&sql, params![id], row_to_record)
            .optional()?)
    }

    /// Insert or update one record. Returns the new revision.
    pub fn put(&mut self, record: &Record) -> IndexResult<String> {
        let tx = self.conn.transaction()?;
        let rev = put_in(&tx, record)?;
        tx.commit()?;
        Ok(rev)
    }

    /// Insert or update records in one transaction
    ///
    /// Any conflict rolls back the whole batch.
    pub fn put_batch(&mut self, records: &[Record]) -> IndexResult<Vec<String>> {
        let tx = self.conn.transaction()?;
        let mut revs = Vec::with_capacity(records.len());
        for record in records {
            revs.push(put_in(&tx, record)?);
        }
        tx.commit()?;
        Ok(revs)
    }

    /// Mark live rows deleted in one transaction. Returns how many changed.
    pub fn tombstone(&mut self, ids: &[&str]) -> IndexResult<usize> {
        let tx = self.conn.transaction()?;
        let mut changed = 0;
        for id in ids {
            if let Some((rev, false)) = current_rev(&tx, id)? {
                changed += tx.execute(
                    "UPDATE documents SET deleted = 1, rev = ?2 WHERE id = ?1",
                    params![id, next_rev(Some(&rev))],
                )?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Live entries of a collection, newest first
    pub fn list_content(&self, collection: &str) -> IndexResult<Vec<Record>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM documents \
             WHERE kind = 'content' AND collection = ? AND deleted = 0 \
             ORDER BY date DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![collection], row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Live media assets
    pub fn list_assets(&self) -> IndexResult<Vec<Record>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM documents WHERE kind = 'asset' AND deleted = 0 ORDER BY name"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Replace the session preview URL of an asset without a new revision
    pub fn set_preview(&self, id: &str, preview_url: &str) -> IndexResult<()> {
        self.conn.execute(
            "UPDATE documents SET preview_url = ?2 WHERE id = ?1",
            params![id, preview_url],
        )?;
        Ok(())
    }

    pub fn preview_for_public(&self, public_url: &str) -> IndexResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT preview_url FROM documents \
                 WHERE kind = 'asset' AND deleted = 0 AND public_url = ? LIMIT 1",
                params![public_url],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }

    pub fn public_for_preview(&self, preview_url: &str) -> IndexResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT public_url FROM documents \
                 WHERE kind = 'asset' AND deleted = 0 AND preview_url = ? LIMIT 1",
                params![preview_url],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }

    /// Live row counts as `(content, assets)`
    pub fn counts(&self) -> IndexResult<(usize, usize)> {
        let count = |kind: &str| -> IndexResult<usize> {
            let n: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM documents WHERE kind = ? AND deleted = 0",
                params![kind],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        };
        Ok((count("content")?, count("asset")?))
    }

    /// Revisions of existing rows among `ids`
    pub fn revisions(&self, ids: &[&str]) -> IndexResult<HashMap<String, String>> {
        let mut revs = HashMap::new();
        for id in ids {
            if let Some(rev) = self.revision(id)? {
                revs.insert(id.to_string(), rev);
            }
        }
        Ok(revs)
    }
}
