//! Event stream formatting
//!
//! The serializer half of the emission path: one NDJSON line (or one table
//! row) per merged event, plus the GAP / CURSOR_RESET control lines that are
//! interleaved with events on the same stream.

use crate::event::ChangeEvent;
use chrono::SecondsFormat;

/// Stdout rendering for the event stream. Pipe subscribers always receive
/// JSON regardless of this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// One NDJSON line for an event (no trailing newline).
pub fn event_json(event: &ChangeEvent) -> String {
    // The manual Serialize impl cannot fail on this shape
    serde_json::to_string(event).unwrap_or_default()
}

/// One human-readable table row for an event.
pub fn event_table_row(event: &ChangeEvent) -> String {
    let time = event.timestamp.format("%H:%M:%S%.3f");
    let reasons = event.reason_tokens().join("+");
    let path = event.full_path.as_deref().unwrap_or(&event.file_name);
    let kind = if event.is_directory { "dir " } else { "file" };

    match (&event.old_path, &event.new_path) {
        (Some(old), Some(new)) => {
            format!("{}  {}  {:<28} {} -> {}", time, kind, reasons, old, new)
        }
        _ => format!("{}  {}  {:<28} {}", time, kind, reasons, path),
    }
}

/// GAP control line: the journal wrapped past the stored cursor.
pub fn gap_line(from: i64, to: i64) -> String {
    serde_json::json!({
        "type": "GAP",
        "reason": "journal_wrapped",
        "from": from,
        "to": to,
    })
    .to_string()
}

/// CURSOR_RESET control line: the journal was recreated.
pub fn cursor_reset_line() -> String {
    serde_json::json!({
        "type": "CURSOR_RESET",
        "reason": "journal_recreated",
    })
    .to_string()
}

/// Table rendering of a control line.
pub fn control_table_row(timestamp: chrono::DateTime<chrono::Utc>, line: &str) -> String {
    format!(
        "{}  --    {}",
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        line
    )
}
