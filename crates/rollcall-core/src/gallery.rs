//! Identity gallery and its SQLite store.
//!
//! The gallery is loaded once per pipeline run and never mutated while the
//! pipeline runs; registration and deregistration replace the stored rows and
//! the next run picks them up.

use crate::types::{Embedding, GalleryEntry};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery store not found: {0}; enroll at least one identity first")]
    NotFound(PathBuf),
    #[error("gallery entry {identity_id} has a {actual}-dim embedding, expected {expected}")]
    DimensionMismatch {
        identity_id: String,
        expected: usize,
        actual: usize,
    },
    #[error("gallery entry {0:?} is invalid: {1}")]
    InvalidEntry(String, String),
    #[error("identity {identity_id} is already registered as {existing:?}, not {requested:?}")]
    NameConflict {
        identity_id: String,
        existing: String,
        requested: String,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Read-only set of registered face samples sharing one embedding dimension.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    /// Validate and wrap a list of entries.
    pub fn new(entries: Vec<GalleryEntry>) -> Result<Self, GalleryError> {
        let mut expected: Option<usize> = None;
        for entry in &entries {
            validate_entry(entry)?;
            let dim = entry.embedding.dim();
            match expected {
                None => expected = Some(dim),
                Some(exp) if exp != dim => {
                    return Err(GalleryError::DimensionMismatch {
                        identity_id: entry.identity_id.clone(),
                        expected: exp,
                        actual: dim,
                    })
                }
                Some(_) => {}
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Embedding dimension D, or `None` for an empty gallery.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dim())
    }

    /// Distinct identity ids, sorted.
    pub fn identities(&self) -> BTreeSet<&str> {
        self.entries.iter().map(|e| e.identity_id.as_str()).collect()
    }

    /// A new gallery without any sample of `identity_id`.
    pub fn without(&self, identity_id: &str) -> Gallery {
        Gallery {
            entries: self
                .entries
                .iter()
                .filter(|e| e.identity_id != identity_id)
                .cloned()
                .collect(),
        }
    }
}

fn validate_entry(entry: &GalleryEntry) -> Result<(), GalleryError> {
    if entry.identity_id.trim().is_empty() {
        return Err(GalleryError::InvalidEntry(
            entry.identity_id.clone(),
            "empty identity id".into(),
        ));
    }
    if entry.identity_id.chars().any(char::is_control)
        || entry.display_name.chars().any(char::is_control)
    {
        return Err(GalleryError::InvalidEntry(
            entry.identity_id.clone(),
            "control characters in identity id or display name".into(),
        ));
    }
    if entry.embedding.dim() == 0 {
        return Err(GalleryError::InvalidEntry(
            entry.identity_id.clone(),
            "empty embedding".into(),
        ));
    }
    if !entry.embedding.is_finite() {
        return Err(GalleryError::InvalidEntry(
            entry.identity_id.clone(),
            "embedding contains NaN or infinity".into(),
        ));
    }
    Ok(())
}

/// Identity ids are compared case-insensitively by storing them upper-cased.
pub fn normalize_identity_id(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// SQLite-backed persistence for gallery entries.
///
/// One row per face sample; an identity may have several samples.
pub struct GalleryStore {
    conn: Connection,
    path: PathBuf,
}

/// One stored identity with its sample count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySummary {
    pub identity_id: String,
    pub display_name: String,
    pub samples: usize,
}

impl GalleryStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, GalleryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn, path)
    }

    /// Open an existing store; missing files are a load failure, not an empty gallery.
    pub fn open_existing(path: &Path) -> Result<Self, GalleryError> {
        if !path.exists() {
            return Err(GalleryError::NotFound(path.to_path_buf()));
        }
        let conn = Connection::open(path)?;
        Self::init(conn, path)
    }

    fn init(conn: Connection, path: &Path) -> Result<Self, GalleryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS gallery (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                identity_id   TEXT NOT NULL,
                display_name  TEXT NOT NULL,
                dim           INTEGER NOT NULL,
                embedding     BLOB NOT NULL,
                created_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_gallery_identity ON gallery(identity_id);",
        )?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every sample as a validated [`Gallery`], in insertion order.
    pub fn load(&self) -> Result<Gallery, GalleryError> {
        let mut stmt = self.conn.prepare(
            "SELECT identity_id, display_name, dim, embedding FROM gallery ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let identity_id: String = row.get(0)?;
            let display_name: String = row.get(1)?;
            let dim: i64 = row.get(2)?;
            let blob: Vec<u8> = row.get(3)?;
            let values = decode_embedding(&blob);
            if values.len() as i64 != dim {
                return Err(GalleryError::InvalidEntry(
                    identity_id,
                    format!("stored dim {dim} but blob holds {} values", values.len()),
                ));
            }
            entries.push(GalleryEntry {
                identity_id,
                display_name,
                embedding: Embedding::new(values),
            });
        }
        Gallery::new(entries)
    }

    /// Append one face sample. The id is normalised; the dimension must agree
    /// with samples already stored.
    pub fn add(&self, entry: &GalleryEntry) -> Result<(), GalleryError> {
        let entry = GalleryEntry {
            identity_id: normalize_identity_id(&entry.identity_id),
            display_name: entry.display_name.trim().to_string(),
            embedding: entry.embedding.clone(),
        };
        validate_entry(&entry)?;

        let existing: Option<i64> = self
            .conn
            .query_row("SELECT dim FROM gallery LIMIT 1", [], |row| row.get(0))
            .optional()?;
        if let Some(dim) = existing {
            if dim as usize != entry.embedding.dim() {
                return Err(GalleryError::DimensionMismatch {
                    identity_id: entry.identity_id,
                    expected: dim as usize,
                    actual: entry.embedding.dim(),
                });
            }
        }

        let registered: Option<String> = self
            .conn
            .query_row(
                "SELECT display_name FROM gallery WHERE identity_id = ?1 LIMIT 1",
                params![entry.identity_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = registered.filter(|name| *name != entry.display_name) {
            return Err(GalleryError::NameConflict {
                identity_id: entry.identity_id,
                existing,
                requested: entry.display_name,
            });
        }

        self.conn.execute(
            "INSERT INTO gallery (identity_id, display_name, dim, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.identity_id,
                entry.display_name,
                entry.embedding.dim() as i64,
                encode_embedding(&entry.embedding.values),
                chrono::Local::now().to_rfc3339(),
            ],
        )?;
        tracing::info!(identity = %entry.identity_id, name = %entry.display_name, "gallery sample added");
        Ok(())
    }

    /// Delete every sample of an identity; returns how many rows went away.
    pub fn remove(&self, identity_id: &str) -> Result<usize, GalleryError> {
        let identity_id = normalize_identity_id(identity_id);
        let removed = self
            .conn
            .execute("DELETE FROM gallery WHERE identity_id = ?1", params![identity_id])?;
        tracing::info!(identity = %identity_id, removed, "gallery samples removed");
        Ok(removed)
    }

    /// Identities with sample counts, ordered by id.
    pub fn list(&self) -> Result<Vec<IdentitySummary>, GalleryError> {
        let mut stmt = self.conn.prepare(
            "SELECT identity_id, MIN(display_name), COUNT(*) FROM gallery
             GROUP BY identity_id ORDER BY identity_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(IdentitySummary {
                identity_id: row.get(0)?,
                display_name: row.get(1)?,
                samples: row.get::<_, i64>(2)? as usize,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(GalleryError::from)
    }
}

fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
