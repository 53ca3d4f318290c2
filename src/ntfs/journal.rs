//! USN journal reader
//!
//! Wraps FSCTL_READ_USN_JOURNAL into a cursor-tracking reader that yields
//! owned [`ChangeEvent`]s. Buffer parsing is separated from the IOCTL layer
//! so the record walk is testable off-platform.

use crate::event::ChangeEvent;
use crate::ntfs::structs::{UsnRecord, USN_RECORD_V2_MIN_SIZE};

/// Output buffer size for journal reads and MFT enumeration.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of repositioning the cursor from a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPlacement {
    /// The stored USN is still inside the journal; reading resumes there.
    Resumed,
    /// The journal wrapped past the stored USN; the cursor now sits at
    /// `first_usn` and the caller should surface the gap.
    Wrapped { first_usn: i64 },
}

/// Split a raw journal output buffer into its next-USN header and the record
/// region. The first 8 bytes of every FSCTL_READ_USN_JOURNAL output are the
/// cursor for the following read.
pub fn split_batch(buffer: &[u8]) -> Option<(i64, &[u8])> {
    if buffer.len() < 8 {
        return None;
    }
    let next_usn = i64::from_le_bytes(buffer[0..8].try_into().ok()?);
    Some((next_usn, &buffer[8..]))
}

/// Lazy walk over the record region of one journal batch.
///
/// Yields owned events in strict USN order. Records with a major version
/// other than 2 are skipped by their declared length. A record whose length
/// field is shorter than the fixed prefix or longer than the remaining buffer
/// ends the walk: the parser never advances past a corrupt region.
pub struct BatchIter<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> BatchIter<'a> {
    /// `buffer` is the record region, i.e. the batch minus its 8-byte header.
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }
}

impl Iterator for BatchIter<'_> {
    type Item = ChangeEvent;

    fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            let remaining = self.buffer.len() - self.offset;
            if remaining < 4 {
                return None;
            }

            let record_length = u32::from_le_bytes(
                self.buffer[self.offset..self.offset + 4].try_into().ok()?,
            ) as usize;

            if record_length < USN_RECORD_V2_MIN_SIZE || record_length > remaining {
                tracing::warn!(
                    offset = self.offset,
                    record_length,
                    "corrupt record length, abandoning rest of batch"
                );
                self.offset = self.buffer.len();
                return None;
            }

            let record_slice = &self.buffer[self.offset..self.offset + record_length];
            let major_version =
                u16::from_le_bytes([record_slice[4], record_slice[5]]);
            self.offset += record_length;

            if major_version != 2 {
                continue;
            }

            match UsnRecord::from_bytes(record_slice) {
                Some(record) => return Some(ChangeEvent::from_record(&record)),
                None => {
                    tracing::warn!(
                        offset = self.offset - record_length,
                        "unparseable record, abandoning rest of batch"
                    );
                    self.offset = self.buffer.len();
                    return None;
                }
            }
        }
    }
}

#[cfg(windows)]
pub use reader::JournalReader;

#[cfg(windows)]
mod reader {
    use super::{split_batch, BatchIter, CursorPlacement, READ_BUFFER_SIZE};
    use crate::error::{Result, WatcherError};
    use crate::ntfs::structs::UsnJournalData;
    use crate::ntfs::volume::VolumeHandle;
    use crate::ntfs::winapi::{query_usn_journal, read_usn_journal, ERROR_JOURNAL_ENTRY_DELETED};
    use std::sync::Arc;

    /// Cursor-tracking reader over one volume's USN journal.
    pub struct JournalReader {
        volume: Arc<VolumeHandle>,
        journal: UsnJournalData,
        next_usn: i64,
        buffer: Vec<u8>,
    }

    impl JournalReader {
        pub fn new(volume: Arc<VolumeHandle>) -> Self {
            Self {
                volume,
                journal: UsnJournalData::default(),
                next_usn: 0,
                buffer: vec![0u8; READ_BUFFER_SIZE],
            }
        }

        /// Query journal metadata and start reading from the live tail.
        pub fn initialize(&mut self) -> Result<()> {
            self.journal = query_usn_journal(self.volume.handle(), self.volume.letter())?;
            self.next_usn = self.journal.next_usn;
            Ok(())
        }

        /// Re-query metadata and position the cursor at a stored USN.
        ///
        /// When the stored value has already been overwritten by journal
        /// wrap, the cursor is placed at `first_usn` instead and the caller
        /// is told to surface a gap.
        pub fn set_cursor(&mut self, stored_usn: i64) -> Result<CursorPlacement> {
            self.journal = query_usn_journal(self.volume.handle(), self.volume.letter())?;

            if stored_usn >= self.journal.first_usn {
                self.next_usn = stored_usn;
                Ok(CursorPlacement::Resumed)
            } else {
                self.next_usn = self.journal.first_usn;
                Ok(CursorPlacement::Wrapped {
                    first_usn: self.journal.first_usn,
                })
            }
        }

        /// Read one batch of records at the cursor.
        ///
        /// Advances the cursor to the next-USN header of the output buffer
        /// and returns a lazy iterator over the parsed records; the iterator
        /// is empty when no new records exist. A cursor overwritten by
        /// journal wrap repositions at the current `first_usn` and surfaces
        /// `Wrapped` so the orchestrator can emit a gap notice; if the
        /// re-query shows a different journal id the journal was recreated,
        /// and the reader repositions at the live tail and surfaces
        /// `JournalRecreated` instead.
        pub fn read_batch(&mut self, reason_mask: u32) -> Result<BatchIter<'_>> {
            let read = read_usn_journal(
                self.volume.handle(),
                self.journal.usn_journal_id,
                self.next_usn,
                reason_mask,
                &mut self.buffer,
            );

            let (next_usn, bytes_returned) = match read {
                Ok(ok) => ok,
                Err(WatcherError::Win32 { code: ERROR_JOURNAL_ENTRY_DELETED, .. }) => {
                    let from = self.next_usn;
                    let old_id = self.journal.usn_journal_id;
                    self.journal =
                        query_usn_journal(self.volume.handle(), self.volume.letter())?;
                    if self.journal.usn_journal_id != old_id {
                        self.next_usn = self.journal.next_usn;
                        return Err(WatcherError::JournalRecreated);
                    }
                    self.next_usn = self.journal.first_usn;
                    return Err(WatcherError::Wrapped {
                        from,
                        to: self.journal.first_usn,
                    });
                }
                Err(e) => return Err(e),
            };

            if bytes_returned <= 8 {
                return Ok(BatchIter::new(&[]));
            }

            self.next_usn = next_usn;
            let (_, records) = split_batch(&self.buffer[..bytes_returned])
                .expect("batch shorter than its own header");
            Ok(BatchIter::new(records))
        }

        /// Journal id recorded at the last metadata query.
        pub fn journal_id(&self) -> u64 {
            self.journal.usn_journal_id
        }

        /// Oldest USN still present in the journal (wrap watermark).
        pub fn first_usn(&self) -> i64 {
            self.journal.first_usn
        }

        /// Current read cursor.
        pub fn next_usn(&self) -> i64 {
            self.next_usn
        }

        /// Live tail recorded at the last metadata query.
        pub fn journal_tail(&self) -> i64 {
            self.journal.next_usn
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::structs::{encode_v2_record, usn_reason};

    fn batch(records: &[Vec<u8>]) -> Vec<u8> {
        records.iter().flatten().copied().collect()
    }

    #[test]
    fn walks_records_in_usn_order() {
        let buf = batch(&[
            encode_v2_record(0x1234, 0x10, 1, usn_reason::DATA_OVERWRITE, 0, "a.txt"),
            encode_v2_record(0x1234, 0x10, 2, usn_reason::DATA_TRUNCATION, 0, "a.txt"),
            encode_v2_record(0x1234, 0x10, 3, usn_reason::CLOSE, 0, "a.txt"),
        ]);

        let usns: Vec<i64> = BatchIter::new(&buf).map(|ev| ev.usn).collect();
        assert_eq!(usns, vec![1, 2, 3]);
    }

    #[test]
    fn record_walk_is_sound() {
        // Sum of aligned record lengths equals the region size
        let records = [
            encode_v2_record(1, 5, 10, usn_reason::FILE_CREATE, 0, "x"),
            encode_v2_record(2, 5, 11, usn_reason::FILE_DELETE, 0, "yy.log"),
            encode_v2_record(3, 5, 12, usn_reason::CLOSE, 0, "zzz"),
        ];
        let buf = batch(&records);
        let total: usize = records
            .iter()
            .map(|r| u32::from_le_bytes(r[0..4].try_into().unwrap()) as usize)
            .sum();
        assert_eq!(total, buf.len());
        assert_eq!(BatchIter::new(&buf).count(), 3);
    }

    #[test]
    fn empty_region_yields_nothing() {
        assert_eq!(BatchIter::new(&[]).count(), 0);
    }

    #[test]
    fn stops_at_corrupt_record_length() {
        let good = encode_v2_record(1, 5, 10, usn_reason::CLOSE, 0, "ok.txt");
        let mut bad = encode_v2_record(2, 5, 11, usn_reason::CLOSE, 0, "bad.txt");
        // Claim a length larger than the remaining buffer
        bad[0..4].copy_from_slice(&4096u32.to_le_bytes());
        let tail = encode_v2_record(3, 5, 12, usn_reason::CLOSE, 0, "never.txt");

        let buf = batch(&[good, bad, tail]);
        let usns: Vec<i64> = BatchIter::new(&buf).map(|ev| ev.usn).collect();
        // The corrupt record and everything after it are abandoned
        assert_eq!(usns, vec![10]);
    }

    #[test]
    fn stops_at_undersized_record_length() {
        let mut bad = encode_v2_record(2, 5, 11, usn_reason::CLOSE, 0, "bad.txt");
        bad[0..4].copy_from_slice(&32u32.to_le_bytes());
        assert_eq!(BatchIter::new(&bad).count(), 0);
    }

    #[test]
    fn skips_non_v2_records_by_length() {
        let mut v3 = encode_v2_record(1, 5, 10, usn_reason::CLOSE, 0, "v3.txt");
        v3[4..6].copy_from_slice(&3u16.to_le_bytes());
        let v2 = encode_v2_record(2, 5, 11, usn_reason::CLOSE, 0, "v2.txt");

        let buf = batch(&[v3, v2]);
        let names: Vec<String> = BatchIter::new(&buf).map(|ev| ev.file_name).collect();
        assert_eq!(names, vec!["v2.txt"]);
    }

    #[test]
    fn split_batch_reads_next_usn_header() {
        let mut buf = 500i64.to_le_bytes().to_vec();
        buf.extend_from_slice(&encode_v2_record(1, 5, 499, usn_reason::CLOSE, 0, "t"));

        let (next_usn, records) = split_batch(&buf).unwrap();
        assert_eq!(next_usn, 500);
        assert_eq!(BatchIter::new(records).count(), 1);
    }

    #[test]
    fn split_batch_rejects_short_buffers() {
        assert!(split_batch(&[0u8; 7]).is_none());
    }
}
