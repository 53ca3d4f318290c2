//! Error types for usn-watcher
//!
//! One taxonomy for every volume, journal, and streaming operation.

use thiserror::Error;

/// Main error type for usn-watcher operations
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("access denied opening volume '{0}:' (administrator privileges required)")]
    PermissionDenied(char),

    #[error("no volume found for drive letter '{0}:'")]
    VolumeNotFound(char),

    #[error("volume '{0}:' is not an NTFS filesystem")]
    NotNtfs(char),

    #[error("USN journal is not active on volume '{0}:'")]
    JournalDisabled(char),

    #[error("journal wrapped past the stored cursor (stored {from}, first valid {to})")]
    Wrapped { from: i64, to: i64 },

    #[error("USN journal was recreated (journal id changed)")]
    JournalRecreated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Windows API error {code}: {context}")]
    Win32 { code: u32, context: String },

    #[error("invalid filter expression: {0}")]
    Filter(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Result type alias for usn-watcher operations
pub type Result<T> = std::result::Result<T, WatcherError>;

impl WatcherError {
    /// Create a Windows API error from a raw error code
    pub fn from_win32(code: u32, context: &str) -> Self {
        WatcherError::Win32 {
            code,
            context: context.to_string(),
        }
    }

    /// Errors the poll loop absorbs (with a gap or reset notice where one is
    /// due) before continuing with the next poll. Anything else ends the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WatcherError::Wrapped { .. }
                | WatcherError::JournalRecreated
                | WatcherError::Io(_)
                | WatcherError::Win32 { .. }
        )
    }
}
