//! Managed change events
//!
//! [`ChangeEvent`] is the owned, path-resolved form of a raw USN record. The
//! reader copies every decoded field out of the IOCTL buffer before yielding,
//! so events outlive the batch they were parsed from. Serialization follows
//! the NDJSON schema consumed by stdout and pipe subscribers: absent optional
//! fields are omitted, reference numbers are `0x`-prefixed 16-digit hex.

use crate::ntfs::structs::{
    decode_attributes, decode_reasons, filetime_to_datetime, usn_reason, UsnRecord,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{Serialize, SerializeStruct, Serializer};

/// A single filesystem change, as emitted on the event stream.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Journal cursor value; monotone per volume.
    pub usn: i64,
    /// Event time. Raw records carry the kernel FILETIME; merged events carry
    /// the flush time of their burst.
    pub timestamp: DateTime<Utc>,
    /// Full 64-bit file reference number.
    pub frn: u64,
    /// Full 64-bit parent reference number.
    pub parent_frn: u64,
    pub file_name: String,
    /// Absolute path, when the resolver knows or can synthesize it.
    pub full_path: Option<String>,
    /// Pre-rename path, populated on merged rename pairs.
    pub old_path: Option<String>,
    /// Post-rename path, populated on rename-new-name events.
    pub new_path: Option<String>,
    /// Raw reason bitmask; the token list is decoded from this on demand.
    pub reason_raw: u32,
    pub is_directory: bool,
    /// Raw Win32 file-attributes bitmask.
    pub attributes: u32,
}

impl ChangeEvent {
    /// Copy a parsed V2 record into an owned event.
    pub fn from_record(record: &UsnRecord) -> Self {
        Self {
            usn: record.usn,
            timestamp: filetime_to_datetime(record.timestamp),
            frn: record.file_reference_number,
            parent_frn: record.parent_file_reference_number,
            file_name: record.file_name.clone(),
            full_path: None,
            old_path: None,
            new_path: None,
            reason_raw: record.reason,
            is_directory: record.is_directory(),
            attributes: record.file_attributes,
        }
    }

    /// Decoded reason tokens, in bit order.
    pub fn reason_tokens(&self) -> Vec<&'static str> {
        decode_reasons(self.reason_raw)
    }

    pub fn is_close(&self) -> bool {
        self.reason_raw & usn_reason::CLOSE != 0
    }

    pub fn is_create(&self) -> bool {
        self.reason_raw & usn_reason::FILE_CREATE != 0
    }

    pub fn is_delete(&self) -> bool {
        self.reason_raw & usn_reason::FILE_DELETE != 0
    }

    pub fn is_rename_old(&self) -> bool {
        self.reason_raw & usn_reason::RENAME_OLD_NAME != 0
    }

    pub fn is_rename_new(&self) -> bool {
        self.reason_raw & usn_reason::RENAME_NEW_NAME != 0
    }

    pub fn is_rename(&self) -> bool {
        self.reason_raw & (usn_reason::RENAME_OLD_NAME | usn_reason::RENAME_NEW_NAME) != 0
    }

    pub fn is_data_change(&self) -> bool {
        self.reason_raw
            & (usn_reason::DATA_OVERWRITE
                | usn_reason::DATA_EXTEND
                | usn_reason::DATA_TRUNCATION)
            != 0
    }
}

impl Serialize for ChangeEvent {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let len = 9
            + usize::from(self.full_path.is_some())
            + usize::from(self.old_path.is_some())
            + usize::from(self.new_path.is_some());
        let mut state = serializer.serialize_struct("ChangeEvent", len)?;

        state.serialize_field("usn", &self.usn)?;
        state.serialize_field(
            "timestamp",
            &self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        )?;
        state.serialize_field("fileReferenceNumber", &format!("0x{:016x}", self.frn))?;
        state.serialize_field(
            "parentReferenceNumber",
            &format!("0x{:016x}", self.parent_frn),
        )?;
        state.serialize_field("fileName", &self.file_name)?;
        if let Some(ref path) = self.full_path {
            state.serialize_field("fullPath", path)?;
        }
        if let Some(ref path) = self.old_path {
            state.serialize_field("oldPath", path)?;
        }
        if let Some(ref path) = self.new_path {
            state.serialize_field("newPath", path)?;
        }
        state.serialize_field("reason", &self.reason_tokens())?;
        state.serialize_field("reasonRaw", &self.reason_raw)?;
        state.serialize_field("isDirectory", &self.is_directory)?;
        state.serialize_field("attributes", &decode_attributes(self.attributes))?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::structs::file_attributes;
    use chrono::TimeZone;

    pub(crate) fn sample_event(usn: i64, frn: u64, reason: u32) -> ChangeEvent {
        ChangeEvent {
            usn,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            frn,
            parent_frn: 0x10,
            file_name: "notes.txt".to_string(),
            full_path: None,
            old_path: None,
            new_path: None,
            reason_raw: reason,
            is_directory: false,
            attributes: file_attributes::ARCHIVE,
        }
    }

    #[test]
    fn predicates_match_reason_bits() {
        let ev = sample_event(1, 0x55, usn_reason::FILE_CREATE | usn_reason::CLOSE);
        assert!(ev.is_create());
        assert!(ev.is_close());
        assert!(!ev.is_delete());
        assert!(!ev.is_rename());

        let ev = sample_event(2, 0x55, usn_reason::DATA_EXTEND);
        assert!(ev.is_data_change());
    }

    #[test]
    fn serializes_hex_references_and_omits_absent_paths() {
        let ev = sample_event(7, 0x1234, usn_reason::CLOSE);
        let json = serde_json::to_string(&ev).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["usn"], 7);
        assert_eq!(value["fileReferenceNumber"], "0x0000000000001234");
        assert_eq!(value["parentReferenceNumber"], "0x0000000000000010");
        assert_eq!(value["reason"], serde_json::json!(["CLOSE"]));
        assert_eq!(value["reasonRaw"], 0x80000000u32 as u64);
        assert_eq!(value["attributes"], serde_json::json!(["ARCHIVE"]));
        assert!(value.get("fullPath").is_none());
        assert!(value.get("oldPath").is_none());
        assert!(value.get("newPath").is_none());
    }

    #[test]
    fn serializes_paths_when_present() {
        let mut ev = sample_event(9, 0x2222, usn_reason::RENAME_NEW_NAME);
        ev.full_path = Some(r"C:\temp\new.txt".to_string());
        ev.old_path = Some(r"C:\temp\old.txt".to_string());
        ev.new_path = Some(r"C:\temp\new.txt".to_string());

        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&ev).unwrap()).unwrap();
        assert_eq!(value["fullPath"], r"C:\temp\new.txt");
        assert_eq!(value["oldPath"], r"C:\temp\old.txt");
        assert_eq!(value["newPath"], r"C:\temp\new.txt");
    }

    #[test]
    fn timestamp_is_iso8601_utc() {
        let ev = sample_event(1, 1, usn_reason::CLOSE);
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&ev).unwrap()).unwrap();
        assert_eq!(value["timestamp"], "2024-03-01T12:00:00.000Z");
    }
}
