//! Item persistence: one JSON record per accepted item, written into the
//! folder the item was sorted into.
//!
//! Files are only ever created, never rewritten, so the backup scan can read
//! the tree concurrently without seeing half-updated records.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analyze::CategoryResult;
use crate::content::{ContentItem, Fingerprint};
use crate::error::SortError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredItem {
    pub fingerprint: Fingerprint,
    pub stored_at: DateTime<Utc>,
    pub classification: CategoryResult,
    pub item: ContentItem,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ItemStore;

impl ItemStore {
    pub fn new() -> Self {
        Self
    }

    /// `<yyyymmdd-hhmmss>-<fp12>.json`
    pub fn file_name(fp: &Fingerprint, at: DateTime<Utc>) -> String {
        format!("{}-{}.json", at.format("%Y%m%d-%H%M%S"), fp.short())
    }

    /// Write the record under `folder` (which must exist). A record with the
    /// same name is left alone and its path returned.
    pub fn store_at(
        &self,
        folder: &Path,
        item: &ContentItem,
        result: &CategoryResult,
        fp: &Fingerprint,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, SortError> {
        let path = folder.join(Self::file_name(fp, now));
        let record = StoredItem {
            fingerprint: fp.clone(),
            stored_at: now,
            classification: result.clone(),
            item: item.clone(),
        };
        let fail = |source: io::Error| SortError::ItemWriteFailed {
            path: path.clone(),
            source,
        };

        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| fail(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let mut f = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!(target: "sorter", fingerprint = fp.short(), "item already stored");
                return Ok(path);
            }
            Err(e) => return Err(fail(e)),
        };
        f.write_all(&json).map_err(fail)?;
        Ok(path)
    }

    pub fn store(
        &self,
        folder: &Path,
        item: &ContentItem,
        result: &CategoryResult,
        fp: &Fingerprint,
    ) -> Result<PathBuf, SortError> {
        self.store_at(folder, item, result, fp, Utc::now())
    }
}
