//! Error taxonomy for the sorting pipeline.
//!
//! Only `InvalidCategory` ever aborts a `sort` call. Backend failures and rate
//! limiting are recovered inside the engine, folder failures ride along on the
//! outcome, and backup failures never reach a classification caller at all.

use std::path::PathBuf;

use crate::analyze::ai_adapter::BackendError;

#[derive(Debug, thiserror::Error)]
pub enum SortError {
    /// A classifier produced a category that has no entry in the category map.
    #[error("category '{0}' is not present in the category map")]
    InvalidCategory(String),

    #[error("inference backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("inference backend timed out after {0} ms")]
    BackendTimeout(u64),

    #[error("inference budget exhausted for the current window")]
    RateLimited,

    #[error("failed to create folder {}: {source}", path.display())]
    FolderCreationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to store item under {}: {source}", path.display())]
    ItemWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backup sync failed: {0}")]
    BackupSyncFailed(String),
}

impl From<BackendError> for SortError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unavailable(msg) => SortError::BackendUnavailable(msg),
            BackendError::Timeout(ms) => SortError::BackendTimeout(ms),
        }
    }
}

impl SortError {
    /// Short machine-readable tag used in API payloads and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            SortError::InvalidCategory(_) => "invalid_category",
            SortError::BackendUnavailable(_) => "backend_unavailable",
            SortError::BackendTimeout(_) => "backend_timeout",
            SortError::RateLimited => "rate_limited",
            SortError::FolderCreationFailed { .. } => "folder_creation_failed",
            SortError::ItemWriteFailed { .. } => "item_write_failed",
            SortError::BackupSyncFailed(_) => "backup_sync_failed",
        }
    }
}
