//! Per-file change detection.
//!
//! The blake3 fingerprint is authoritative. Modification time and size are only
//! a pre-filter: when both match the stored record the file is not read at all.

use std::collections::HashMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::error::{IndexError, Result};
use crate::records::FileIndexRecord;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 20 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Unchanged,
    Changed,
    New,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileMeta {
    /// Nanoseconds since the Unix epoch; 0 when the platform reports none.
    pub mtime_ns: i64,
    pub size: u64,
}

/// Outcome of inspecting one file. When the file had to be read, its bytes and
/// fingerprint are carried along so the caller does not read it again.
#[derive(Debug, Clone)]
pub struct Inspection {
    pub status: ChangeStatus,
    pub meta: Option<FileMeta>,
    pub content: Option<Vec<u8>>,
    pub fingerprint: Option<String>,
}

impl Inspection {
    fn deleted() -> Self {
        Self {
            status: ChangeStatus::Deleted,
            meta: None,
            content: None,
            fingerprint: None,
        }
    }

    /// True when the stored record matched on fingerprint but its mtime or size
    /// was stale and should be refreshed.
    #[must_use]
    pub fn needs_meta_refresh(&self) -> bool {
        self.status == ChangeStatus::Unchanged && self.content.is_some()
    }
}

#[must_use]
pub fn fingerprint(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector {
    max_file_size: u64,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_SIZE)
    }
}

impl ChangeDetector {
    #[must_use]
    pub fn new(max_file_size: u64) -> Self {
        Self { max_file_size }
    }

    #[must_use]
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Decide whether `abs_path` needs re-parsing relative to `previous`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::FileTooLarge`] without reading the file when it
    /// exceeds the size limit, or an IO error if it cannot be read.
    pub async fn should_reindex(
        &self,
        abs_path: &Path,
        previous: Option<&FileIndexRecord>,
    ) -> Result<Inspection> {
        let metadata = match tokio::fs::metadata(abs_path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(Inspection::deleted()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Inspection::deleted());
            }
            Err(e) => return Err(e.into()),
        };
        let meta = FileMeta {
            mtime_ns: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)),
            size: metadata.len(),
        };

        if meta.size > self.max_file_size {
            return Err(IndexError::FileTooLarge {
                path: abs_path.display().to_string(),
                size: meta.size,
                limit: self.max_file_size,
            });
        }

        if let Some(prev) = previous
            && prev.mtime_ns == meta.mtime_ns
            && prev.size == meta.size
        {
            return Ok(Inspection {
                status: ChangeStatus::Unchanged,
                meta: Some(meta),
                content: None,
                fingerprint: Some(prev.fingerprint.clone()),
            });
        }

        let content = match tokio::fs::read(abs_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Inspection::deleted());
            }
            Err(e) => return Err(e.into()),
        };
        let hash = fingerprint(&content);
        let status = match previous {
            Some(prev) if prev.fingerprint == hash => ChangeStatus::Unchanged,
            Some(_) => ChangeStatus::Changed,
            None => ChangeStatus::New,
        };
        Ok(Inspection {
            status,
            meta: Some(meta),
            content: Some(content),
            fingerprint: Some(hash),
        })
    }
}

/// Match records of files that disappeared with newly seen files carrying the
/// same fingerprint. Each side is used at most once; result is sorted by new path.
#[must_use]
pub fn pair_renames(
    deleted: &[&FileIndexRecord],
    new_files: &[(String, String)],
) -> Vec<(String, String)> {
    let mut by_hash: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut sorted_deleted: Vec<&&FileIndexRecord> = deleted.iter().collect();
    sorted_deleted.sort_by(|a, b| b.file_path.cmp(&a.file_path));
    for record in sorted_deleted {
        by_hash
            .entry(record.fingerprint.as_str())
            .or_default()
            .push(record.file_path.as_str());
    }

    let mut sorted_new: Vec<&(String, String)> = new_files.iter().collect();
    sorted_new.sort();
    let mut pairs = Vec::new();
    for (new_path, hash) in sorted_new {
        if let Some(old) = by_hash.get_mut(hash.as_str()).and_then(Vec::pop) {
            pairs.push((old.to_owned(), new_path.clone()));
        }
    }
    pairs
}
