//! Cursor persistence & recovery
//!
//! Durably stores (volume, journal id, next USN) so a restarted daemon can
//! resume where it stopped. All IO here is best-effort: losing the cursor
//! degrades to "start from the live tail with a gap notice", never to a
//! daemon failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Subfolder under the per-user application-data directory.
pub const APP_DIR_NAME: &str = "usn-watcher";

const CURSOR_FILE_NAME: &str = "cursor.json";

/// Per-user application-data directory for cursor and cache snapshots.
pub fn app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// The persisted cursor document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorRecord {
    pub volume: String,
    /// Journal id as `0x`-prefixed 16-digit lowercase hex.
    pub journal_id: String,
    pub next_usn: i64,
    pub saved_at: DateTime<Utc>,
}

impl CursorRecord {
    fn parse_journal_id(&self) -> Option<u64> {
        let hex = self.journal_id.strip_prefix("0x")?;
        u64::from_str_radix(hex, 16).ok()
    }
}

/// JSON snapshot store for the journal cursor.
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new() -> Self {
        Self {
            path: app_data_dir().join(CURSOR_FILE_NAME),
        }
    }

    /// Store rooted at an explicit file path.
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Persist the cursor, best-effort. The document is written to a temp
    /// file and renamed into place so a crash never leaves a torn snapshot.
    pub fn save(&self, volume: char, journal_id: u64, next_usn: i64) {
        let record = CursorRecord {
            volume: volume.to_string(),
            journal_id: format!("0x{:016x}", journal_id),
            next_usn,
            saved_at: Utc::now(),
        };

        if let Err(e) = self.write_record(&record) {
            tracing::warn!(error = %e, path = %self.path.display(), "cursor save failed");
        }
    }

    fn write_record(&self, record: &CursorRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(record)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }

    /// Load the stored cursor for a volume.
    ///
    /// Returns `None` when the file is missing, names another volume, or
    /// fails to parse.
    pub fn load(&self, volume: char) -> Option<(u64, i64)> {
        let raw = fs::read_to_string(&self.path).ok()?;
        let record: CursorRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, path = %self.path.display(), "cursor parse failed");
                return None;
            }
        };

        if !record.volume.eq_ignore_ascii_case(&volume.to_string()) {
            return None;
        }

        Some((record.parse_journal_id()?, record.next_usn))
    }
}

impl Default for CursorStore {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Startup recovery
// ============================================================================

/// What the orchestrator does with a loaded (or missing) cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupAction {
    /// No stored cursor: read from the live tail, no gap.
    FreshStart,
    /// The stored USN is still inside the journal: resume there.
    Resume { usn: i64 },
    /// The journal wrapped past the stored USN: emit a GAP notice, then read
    /// from `to` (the current first USN).
    Gap { from: i64, to: i64 },
    /// The journal was recreated since the cursor was stored: emit a
    /// CURSOR_RESET notice and fall back to the live tail.
    Reset,
}

/// Decide the startup case from the stored cursor and fresh journal metadata.
pub fn plan_startup(
    stored: Option<(u64, i64)>,
    journal_id: u64,
    first_usn: i64,
) -> StartupAction {
    match stored {
        None => StartupAction::FreshStart,
        Some((stored_id, _)) if stored_id != journal_id => StartupAction::Reset,
        Some((_, stored_usn)) if stored_usn >= first_usn => {
            StartupAction::Resume { usn: stored_usn }
        }
        Some((_, stored_usn)) => StartupAction::Gap {
            from: stored_usn,
            to: first_usn,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = CursorStore::with_path(dir.path().join("cursor.json"));

        store.save('C', 0xDEAD_BEEF, 4242);
        assert_eq!(store.load('C'), Some((0xDEAD_BEEF, 4242)));
    }

    #[test]
    fn load_rejects_other_volume() {
        let dir = tempdir().unwrap();
        let store = CursorStore::with_path(dir.path().join("cursor.json"));

        store.save('C', 1, 100);
        assert_eq!(store.load('D'), None);
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let store = CursorStore::with_path(dir.path().join("cursor.json"));
        assert_eq!(store.load('C'), None);
    }

    #[test]
    fn load_swallows_corrupt_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = CursorStore::with_path(path);
        assert_eq!(store.load('C'), None);
    }

    #[test]
    fn journal_id_is_hex_encoded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        let store = CursorStore::with_path(path.clone());

        store.save('C', 0xAB, 7);
        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["journalId"], "0x00000000000000ab");
        assert_eq!(value["nextUsn"], 7);
        assert_eq!(value["volume"], "C");
        assert!(value["savedAt"].is_string());
    }

    #[test]
    fn fresh_start_without_cursor() {
        assert_eq!(plan_startup(None, 1, 0), StartupAction::FreshStart);
    }

    #[test]
    fn resume_when_cursor_still_valid() {
        assert_eq!(
            plan_startup(Some((1, 600)), 1, 500),
            StartupAction::Resume { usn: 600 }
        );
        // Sitting exactly on the watermark still resumes
        assert_eq!(
            plan_startup(Some((1, 500)), 1, 500),
            StartupAction::Resume { usn: 500 }
        );
    }

    #[test]
    fn gap_when_journal_wrapped_past_cursor() {
        assert_eq!(
            plan_startup(Some((1, 100)), 1, 500),
            StartupAction::Gap { from: 100, to: 500 }
        );
    }

    #[test]
    fn reset_when_journal_recreated() {
        assert_eq!(plan_startup(Some((0xA, 100)), 0xB, 50), StartupAction::Reset);
    }
}
