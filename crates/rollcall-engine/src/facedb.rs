//! Face database — persisted mapping from student id to descriptor.
//!
//! An explicit object with a scoped lifetime: constructed (or loaded) at
//! startup, passed by reference, persisted on demand. Never ambient global
//! state.

use rollcall_core::matcher::GalleryEntry;
use rollcall_core::FaceDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("face database I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("face database is corrupt: {0}")]
    Corrupt(String),
}

/// One enrolled student: denormalized display name plus descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEntry {
    pub name: String,
    pub descriptor: FaceDescriptor,
}

/// In-memory face database with whole-file JSON persistence.
///
/// Entries are ordered by student id so iteration and the persisted file
/// are deterministic. At most one descriptor per id: `put` overwrites.
#[derive(Debug, Default)]
pub struct FaceDatabase {
    entries: BTreeMap<String, FaceEntry>,
}

impl FaceDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the database wholesale from `path`.
    ///
    /// A missing file yields an empty database; a file that does not parse
    /// is `Corrupt` rather than silently empty.
    pub fn load(path: &Path) -> Result<Self, DbError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no face database file; starting empty");
            return Ok(Self::new());
        }
        let contents = std::fs::read_to_string(path)?;
        let entries: BTreeMap<String, FaceEntry> =
            serde_json::from_str(&contents).map_err(|e| DbError::Corrupt(e.to_string()))?;
        tracing::info!(path = %path.display(), students = entries.len(), "face database loaded");
        Ok(Self { entries })
    }

    /// Persist the whole database to `path`.
    ///
    /// Writes to a temp file and renames, so a failed write leaves the
    /// prior version intact and a concurrent reader never sees a partial
    /// file.
    pub fn persist(&self, path: &Path) -> Result<(), DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| DbError::Corrupt(e.to_string()))?;

        let temp = path.with_extension("tmp");
        let mut file = std::fs::File::create(&temp)?;
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        drop(file);
        std::fs::rename(&temp, path)?;

        tracing::debug!(path = %path.display(), students = self.entries.len(), "face database persisted");
        Ok(())
    }

    /// Insert or overwrite the entry for `id`. No merging.
    pub fn put(&mut self, id: impl Into<String>, name: impl Into<String>, descriptor: FaceDescriptor) {
        self.entries.insert(
            id.into(),
            FaceEntry {
                name: name.into(),
                descriptor,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<&FaceEntry> {
        self.entries.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<FaceEntry> {
        self.entries.remove(id)
    }

    /// All entries in ascending id order.
    pub fn all(&self) -> impl Iterator<Item = (&String, &FaceEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot the database as matcher gallery entries.
    pub fn gallery(&self) -> Vec<GalleryEntry> {
        self.entries
            .iter()
            .map(|(id, entry)| GalleryEntry {
                student_id: id.clone(),
                descriptor: entry.descriptor.clone(),
            })
            .collect()
    }
}
