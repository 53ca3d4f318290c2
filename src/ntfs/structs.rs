//! NTFS on-disk structures and constants for the USN change journal

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

// ============================================================================
// USN Journal Metadata (from FSCTL_QUERY_USN_JOURNAL)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct UsnJournalData {
    pub usn_journal_id: u64,
    pub first_usn: i64,
    pub next_usn: i64,
    pub lowest_valid_usn: i64,
    pub max_usn: i64,
    pub maximum_size: u64,
    pub allocation_delta: u64,
}

impl UsnJournalData {
    /// Parse from the 0x38-byte output of FSCTL_QUERY_USN_JOURNAL
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 0x38 {
            return None;
        }

        let mut cursor = Cursor::new(data);

        Some(Self {
            usn_journal_id: cursor.read_u64::<LittleEndian>().ok()?,
            first_usn: cursor.read_i64::<LittleEndian>().ok()?,
            next_usn: cursor.read_i64::<LittleEndian>().ok()?,
            lowest_valid_usn: cursor.read_i64::<LittleEndian>().ok()?,
            max_usn: cursor.read_i64::<LittleEndian>().ok()?,
            maximum_size: cursor.read_u64::<LittleEndian>().ok()?,
            allocation_delta: cursor.read_u64::<LittleEndian>().ok()?,
        })
    }
}

// ============================================================================
// USN Record (V2)
// ============================================================================

/// Minimum size of a V2 USN record: the fixed prefix before the filename.
pub const USN_RECORD_V2_MIN_SIZE: usize = 60;

#[derive(Debug, Clone)]
pub struct UsnRecord {
    pub record_length: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub file_reference_number: u64,
    pub parent_file_reference_number: u64,
    pub usn: i64,
    pub timestamp: u64,
    pub reason: u32,
    pub source_info: u32,
    pub security_id: u32,
    pub file_attributes: u32,
    pub file_name_length: u16,
    pub file_name_offset: u16,
    pub file_name: String,
}

impl UsnRecord {
    /// Parse a V2 USN record from a slice starting at the record boundary.
    ///
    /// The slice must span the whole record (`record_length` bytes). Returns
    /// `None` for records of any other major version and for records whose
    /// filename fields point outside the record.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < USN_RECORD_V2_MIN_SIZE {
            return None;
        }

        let record_length = u32::from_le_bytes(data[0..4].try_into().ok()?);
        let major_version = u16::from_le_bytes(data[4..6].try_into().ok()?);
        let minor_version = u16::from_le_bytes(data[6..8].try_into().ok()?);

        if major_version != 2 {
            return None;
        }

        // V2 layout: fixed 60-byte prefix, then UTF-16LE filename
        let file_reference_number = u64::from_le_bytes(data[8..16].try_into().ok()?);
        let parent_file_reference_number = u64::from_le_bytes(data[16..24].try_into().ok()?);
        let usn = i64::from_le_bytes(data[24..32].try_into().ok()?);
        let timestamp = u64::from_le_bytes(data[32..40].try_into().ok()?);
        let reason = u32::from_le_bytes(data[40..44].try_into().ok()?);
        let source_info = u32::from_le_bytes(data[44..48].try_into().ok()?);
        let security_id = u32::from_le_bytes(data[48..52].try_into().ok()?);
        let file_attributes = u32::from_le_bytes(data[52..56].try_into().ok()?);
        let file_name_length = u16::from_le_bytes(data[56..58].try_into().ok()?);
        let file_name_offset = u16::from_le_bytes(data[58..60].try_into().ok()?);

        // Filename offset is relative to the record start, not the buffer
        let name_start = file_name_offset as usize;
        let name_end = name_start + file_name_length as usize;
        if name_end > data.len() || name_end > record_length as usize {
            return None;
        }

        let name_u16: Vec<u16> = data[name_start..name_end]
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
            .collect();
        let file_name = String::from_utf16_lossy(&name_u16);

        Some(Self {
            record_length,
            major_version,
            minor_version,
            file_reference_number,
            parent_file_reference_number,
            usn,
            timestamp,
            reason,
            source_info,
            security_id,
            file_attributes,
            file_name_length,
            file_name_offset,
            file_name,
        })
    }

    /// File record number (lower 48 bits of the FRN)
    pub fn file_record_number(&self) -> u64 {
        self.file_reference_number & 0x0000_FFFF_FFFF_FFFF
    }

    /// Parent record number (lower 48 bits)
    pub fn parent_record_number(&self) -> u64 {
        self.parent_file_reference_number & 0x0000_FFFF_FFFF_FFFF
    }

    pub fn is_directory(&self) -> bool {
        (self.file_attributes & file_attributes::DIRECTORY) != 0
    }
}

// ============================================================================
// USN Reason flags
// ============================================================================

pub mod usn_reason {
    pub const DATA_OVERWRITE: u32 = 0x00000001;
    pub const DATA_EXTEND: u32 = 0x00000002;
    pub const DATA_TRUNCATION: u32 = 0x00000004;
    pub const NAMED_DATA_OVERWRITE: u32 = 0x00000010;
    pub const NAMED_DATA_EXTEND: u32 = 0x00000020;
    pub const NAMED_DATA_TRUNCATION: u32 = 0x00000040;
    pub const FILE_CREATE: u32 = 0x00000100;
    pub const FILE_DELETE: u32 = 0x00000200;
    pub const EA_CHANGE: u32 = 0x00000400;
    pub const SECURITY_CHANGE: u32 = 0x00000800;
    pub const RENAME_OLD_NAME: u32 = 0x00001000;
    pub const RENAME_NEW_NAME: u32 = 0x00002000;
    pub const INDEXABLE_CHANGE: u32 = 0x00004000;
    pub const BASIC_INFO_CHANGE: u32 = 0x00008000;
    pub const HARD_LINK_CHANGE: u32 = 0x00010000;
    pub const COMPRESSION_CHANGE: u32 = 0x00020000;
    pub const ENCRYPTION_CHANGE: u32 = 0x00040000;
    pub const OBJECT_ID_CHANGE: u32 = 0x00080000;
    pub const REPARSE_POINT_CHANGE: u32 = 0x00100000;
    pub const STREAM_CHANGE: u32 = 0x00200000;
    pub const TRANSACTED_CHANGE: u32 = 0x00400000;
    pub const INTEGRITY_CHANGE: u32 = 0x00800000;
    pub const CLOSE: u32 = 0x80000000;
}

/// Stable uppercase token for each reason bit with a named meaning.
/// Unknown bits are ignored by [`decode_reasons`].
pub const REASON_TOKENS: &[(u32, &str)] = &[
    (usn_reason::DATA_OVERWRITE, "DATAOVERWRITE"),
    (usn_reason::DATA_EXTEND, "DATAEXTEND"),
    (usn_reason::DATA_TRUNCATION, "DATATRUNCATION"),
    (usn_reason::NAMED_DATA_OVERWRITE, "NAMEDDATAOVERWRITE"),
    (usn_reason::NAMED_DATA_EXTEND, "NAMEDDATAEXTEND"),
    (usn_reason::NAMED_DATA_TRUNCATION, "NAMEDDATATRUNCATION"),
    (usn_reason::FILE_CREATE, "FILECREATE"),
    (usn_reason::FILE_DELETE, "FILEDELETE"),
    (usn_reason::EA_CHANGE, "EACHANGE"),
    (usn_reason::SECURITY_CHANGE, "SECURITYCHANGE"),
    (usn_reason::RENAME_OLD_NAME, "RENAMEOLDNAME"),
    (usn_reason::RENAME_NEW_NAME, "RENAMENEWNAME"),
    (usn_reason::INDEXABLE_CHANGE, "INDEXABLECHANGE"),
    (usn_reason::BASIC_INFO_CHANGE, "BASICINFOCHANGE"),
    (usn_reason::HARD_LINK_CHANGE, "HARDLINKCHANGE"),
    (usn_reason::COMPRESSION_CHANGE, "COMPRESSIONCHANGE"),
    (usn_reason::ENCRYPTION_CHANGE, "ENCRYPTIONCHANGE"),
    (usn_reason::OBJECT_ID_CHANGE, "OBJECTIDCHANGE"),
    (usn_reason::REPARSE_POINT_CHANGE, "REPARSEPOINTCHANGE"),
    (usn_reason::STREAM_CHANGE, "STREAMCHANGE"),
    (usn_reason::TRANSACTED_CHANGE, "TRANSACTEDCHANGE"),
    (usn_reason::INTEGRITY_CHANGE, "INTEGRITYCHANGE"),
    (usn_reason::CLOSE, "CLOSE"),
];

/// Decode a reason bitmask into its list of uppercase tokens, in bit order.
pub fn decode_reasons(mask: u32) -> Vec<&'static str> {
    REASON_TOKENS
        .iter()
        .filter(|(bit, _)| mask & bit != 0)
        .map(|&(_, token)| token)
        .collect()
}

// ============================================================================
// File Attributes
// ============================================================================

pub mod file_attributes {
    pub const READONLY: u32 = 0x00000001;
    pub const HIDDEN: u32 = 0x00000002;
    pub const SYSTEM: u32 = 0x00000004;
    pub const DIRECTORY: u32 = 0x00000010;
    pub const ARCHIVE: u32 = 0x00000020;
    pub const DEVICE: u32 = 0x00000040;
    pub const NORMAL: u32 = 0x00000080;
    pub const TEMPORARY: u32 = 0x00000100;
    pub const SPARSE_FILE: u32 = 0x00000200;
    pub const REPARSE_POINT: u32 = 0x00000400;
    pub const COMPRESSED: u32 = 0x00000800;
    pub const OFFLINE: u32 = 0x00001000;
    pub const NOT_CONTENT_INDEXED: u32 = 0x00002000;
    pub const ENCRYPTED: u32 = 0x00004000;
}

const ATTRIBUTE_NAMES: &[(u32, &str)] = &[
    (file_attributes::READONLY, "READONLY"),
    (file_attributes::HIDDEN, "HIDDEN"),
    (file_attributes::SYSTEM, "SYSTEM"),
    (file_attributes::DIRECTORY, "DIRECTORY"),
    (file_attributes::ARCHIVE, "ARCHIVE"),
    (file_attributes::DEVICE, "DEVICE"),
    (file_attributes::NORMAL, "NORMAL"),
    (file_attributes::TEMPORARY, "TEMPORARY"),
    (file_attributes::SPARSE_FILE, "SPARSE_FILE"),
    (file_attributes::REPARSE_POINT, "REPARSE_POINT"),
    (file_attributes::COMPRESSED, "COMPRESSED"),
    (file_attributes::OFFLINE, "OFFLINE"),
    (file_attributes::NOT_CONTENT_INDEXED, "NOT_CONTENT_INDEXED"),
    (file_attributes::ENCRYPTED, "ENCRYPTED"),
];

/// Decode a file-attributes bitmask into attribute names, in bit order.
pub fn decode_attributes(mask: u32) -> Vec<&'static str> {
    ATTRIBUTE_NAMES
        .iter()
        .filter(|(bit, _)| mask & bit != 0)
        .map(|&(_, name)| name)
        .collect()
}

// ============================================================================
// FILETIME conversion utilities
// ============================================================================

/// Convert Windows FILETIME (100-nanosecond intervals since 1601) to Unix
/// seconds and subsecond nanoseconds.
pub fn filetime_to_unix(filetime: u64) -> (i64, u32) {
    // Difference between 1601 and 1970 in 100-nanosecond intervals
    const EPOCH_DIFF: u64 = 116_444_736_000_000_000;

    if filetime < EPOCH_DIFF {
        return (0, 0);
    }

    let since_epoch = filetime - EPOCH_DIFF;
    let secs = (since_epoch / 10_000_000) as i64;
    let nanos = ((since_epoch % 10_000_000) * 100) as u32;
    (secs, nanos)
}

/// Convert Windows FILETIME to a UTC datetime
pub fn filetime_to_datetime(filetime: u64) -> chrono::DateTime<chrono::Utc> {
    use chrono::{TimeZone, Utc};
    let (secs, nanos) = filetime_to_unix(filetime);
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap())
}

/// Build a well-formed V2 record. Test scaffolding shared with the journal
/// parser tests.
#[cfg(test)]
pub(crate) fn encode_v2_record(
    frn: u64,
    parent_frn: u64,
    usn: i64,
    reason: u32,
    attributes: u32,
    name: &str,
) -> Vec<u8> {
    let name_utf16: Vec<u16> = name.encode_utf16().collect();
    let name_bytes = name_utf16.len() * 2;
    let unpadded = USN_RECORD_V2_MIN_SIZE + name_bytes;
    let record_length = (unpadded + 7) & !7;

    let mut buf = vec![0u8; record_length];
    buf[0..4].copy_from_slice(&(record_length as u32).to_le_bytes());
    buf[4..6].copy_from_slice(&2u16.to_le_bytes());
    buf[8..16].copy_from_slice(&frn.to_le_bytes());
    buf[16..24].copy_from_slice(&parent_frn.to_le_bytes());
    buf[24..32].copy_from_slice(&usn.to_le_bytes());
    buf[32..40].copy_from_slice(&131_000_000_000_000_000u64.to_le_bytes());
    buf[40..44].copy_from_slice(&reason.to_le_bytes());
    buf[52..56].copy_from_slice(&attributes.to_le_bytes());
    buf[56..58].copy_from_slice(&(name_bytes as u16).to_le_bytes());
    buf[58..60].copy_from_slice(&(USN_RECORD_V2_MIN_SIZE as u16).to_le_bytes());
    for (i, unit) in name_utf16.iter().enumerate() {
        let at = USN_RECORD_V2_MIN_SIZE + i * 2;
        buf[at..at + 2].copy_from_slice(&unit.to_le_bytes());
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v2_record() {
        let raw = encode_v2_record(0x1234, 0x10, 42, usn_reason::FILE_CREATE, 0, "tmp.log");
        let record = UsnRecord::from_bytes(&raw).unwrap();

        assert_eq!(record.major_version, 2);
        assert_eq!(record.file_reference_number, 0x1234);
        assert_eq!(record.parent_file_reference_number, 0x10);
        assert_eq!(record.usn, 42);
        assert_eq!(record.reason, usn_reason::FILE_CREATE);
        assert_eq!(record.file_name, "tmp.log");
    }

    #[test]
    fn rejects_other_major_versions() {
        let mut raw = encode_v2_record(1, 5, 1, usn_reason::CLOSE, 0, "a");
        raw[4..6].copy_from_slice(&3u16.to_le_bytes());
        assert!(UsnRecord::from_bytes(&raw).is_none());
    }

    #[test]
    fn rejects_filename_outside_record() {
        let mut raw = encode_v2_record(1, 5, 1, usn_reason::CLOSE, 0, "name.txt");
        // Push the claimed filename length past the record end
        raw[56..58].copy_from_slice(&512u16.to_le_bytes());
        assert!(UsnRecord::from_bytes(&raw).is_none());
    }

    #[test]
    fn decodes_reason_tokens_in_bit_order() {
        let mask =
            usn_reason::DATA_OVERWRITE | usn_reason::DATA_TRUNCATION | usn_reason::CLOSE;
        assert_eq!(
            decode_reasons(mask),
            vec!["DATAOVERWRITE", "DATATRUNCATION", "CLOSE"]
        );
    }

    #[test]
    fn unknown_reason_bits_are_ignored() {
        assert!(decode_reasons(0x01000000).is_empty());
        assert_eq!(decode_reasons(0x01000000 | usn_reason::CLOSE), vec!["CLOSE"]);
    }

    #[test]
    fn filetime_epoch_conversion() {
        // 1601-01-01 maps to the Unix epoch floor
        assert_eq!(filetime_to_unix(0), (0, 0));
        // 1970-01-01 exactly
        assert_eq!(filetime_to_unix(116_444_736_000_000_000), (0, 0));
        // One second past the Unix epoch
        assert_eq!(filetime_to_unix(116_444_736_010_000_000), (1, 0));
    }

    #[test]
    fn decodes_attribute_names() {
        let mask = file_attributes::HIDDEN | file_attributes::DIRECTORY;
        assert_eq!(decode_attributes(mask), vec!["HIDDEN", "DIRECTORY"]);
    }
}
