//! FRN → absolute path resolution
//!
//! USN records carry a filename and parent link, never a path. The resolver
//! keeps a volume-wide map from file reference number to absolute path,
//! bootstrapped by an MFT enumeration and kept current by observing
//! create/rename/delete events. A snapshot of the map is cached on disk so
//! restarts skip the full scan when the cache is fresh.

use crate::event::ChangeEvent;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

/// MFT record number of the volume root directory.
const ROOT_FRN: u64 = 5;

/// Mask selecting the record number out of a full FRN.
const FRN_RECORD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Parent-chain walk bound; defeats cycles from corruption and the root's
/// self-reference.
const MAX_PARENT_HOPS: usize = 1024;

/// Cache snapshots older than this are ignored.
const CACHE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Longest path accepted when decoding a cache snapshot.
const CACHE_MAX_PATH_LEN: u32 = 64 * 1024;

fn is_root(frn: u64) -> bool {
    frn & FRN_RECORD_MASK == ROOT_FRN
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('\\') {
        format!("{}{}", parent, name)
    } else {
        format!("{}\\{}", parent, name)
    }
}

/// One record out of the MFT enumeration: a name and its parent link.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub file_name: String,
    pub parent_frn: u64,
}

/// Walk an entry's parent chain through the staging map.
///
/// Emits an absolute path only when the chain terminates at the root or at
/// FRN 0 within the hop bound; entries with a missing intermediate parent or
/// a cycle are dropped rather than given a wrong path.
fn build_path(root: &str, frn: u64, staging: &HashMap<u64, ScanEntry>) -> Option<String> {
    let mut components: Vec<&str> = Vec::new();
    let mut current = frn;

    for _ in 0..MAX_PARENT_HOPS {
        if current == 0 || is_root(current) {
            let mut path = root.to_string();
            for component in components.iter().rev() {
                path = join_path(&path, component);
            }
            return Some(path);
        }
        let entry = staging.get(&current)?;
        components.push(&entry.file_name);
        current = entry.parent_frn;
    }

    None
}

struct ResolverState {
    paths: HashMap<u64, String>,
    pending_renames: HashMap<u64, String>,
}

/// Volume-wide FRN → absolute path map with rename tracking.
///
/// The map and the pending-rename table share one mutex; every critical
/// section is a short map mutation, so `populate` can run on a background
/// worker while the main loop resolves live events.
pub struct PathResolver {
    volume: char,
    root: String,
    cache_path: PathBuf,
    state: Mutex<ResolverState>,
}

impl PathResolver {
    pub fn new(volume: char) -> Self {
        let cache_path = crate::cursor::app_data_dir().join(format!("cache-{}.bin", volume));
        Self::with_cache_path(volume, cache_path)
    }

    /// Resolver with an explicit cache location.
    pub fn with_cache_path(volume: char, cache_path: PathBuf) -> Self {
        Self {
            volume,
            root: format!("{}:\\", volume),
            cache_path,
            state: Mutex::new(ResolverState {
                paths: HashMap::new(),
                pending_renames: HashMap::new(),
            }),
        }
    }

    pub fn volume(&self) -> char {
        self.volume
    }

    /// Number of mapped FRNs.
    pub fn map_len(&self) -> usize {
        self.state.lock().paths.len()
    }

    /// Current mapping for an FRN, if any.
    pub fn path_of(&self, frn: u64) -> Option<String> {
        self.state.lock().paths.get(&frn).cloned()
    }

    /// Seed a mapping directly (root directories, test fixtures).
    pub fn insert_path(&self, frn: u64, path: impl Into<String>) {
        self.state.lock().paths.insert(frn, path.into());
    }

    /// Fill `event.full_path` from the map.
    ///
    /// On a map miss with a known parent, synthesizes `parent\name`, writes
    /// the synthesized mapping back for future lookups, and still reports
    /// success. Reports failure when neither the FRN nor its parent is known;
    /// the event is emitted without a path in that case.
    pub fn resolve(&self, event: &mut ChangeEvent) -> bool {
        let mut state = self.state.lock();

        if let Some(path) = state.paths.get(&event.frn) {
            event.full_path = Some(path.clone());
            return true;
        }

        if let Some(parent_path) = Self::parent_path(&state, &self.root, event.parent_frn) {
            let synthesized = join_path(&parent_path, &event.file_name);
            state.paths.insert(event.frn, synthesized.clone());
            event.full_path = Some(synthesized);
            return true;
        }

        false
    }

    fn parent_path(state: &ResolverState, root: &str, parent_frn: u64) -> Option<String> {
        if is_root(parent_frn) {
            return Some(root.to_string());
        }
        state.paths.get(&parent_frn).cloned()
    }

    /// Keep the map in sync with a live event.
    ///
    /// Deletes evict the FRN; rename-old-name records the prior path into
    /// the pending-rename table; rename-new-name computes the new path,
    /// consumes the pending old path into `event.old_path`, and replaces the
    /// mapping; creates insert `parent\name` when the parent is known.
    pub fn update(&self, event: &mut ChangeEvent) {
        let mut state = self.state.lock();

        if event.is_delete() {
            state.paths.remove(&event.frn);
            state.pending_renames.remove(&event.frn);
            return;
        }

        if event.is_rename_old() {
            let prior = state
                .paths
                .get(&event.frn)
                .cloned()
                .or_else(|| {
                    Self::parent_path(&state, &self.root, event.parent_frn)
                        .map(|parent| join_path(&parent, &event.file_name))
                });
            if let Some(prior) = prior {
                state.pending_renames.insert(event.frn, prior);
            }
            return;
        }

        if event.is_rename_new() {
            let new_path = match Self::parent_path(&state, &self.root, event.parent_frn) {
                Some(parent) => join_path(&parent, &event.file_name),
                None => event.file_name.clone(),
            };
            if let Some(old_path) = state.pending_renames.remove(&event.frn) {
                event.old_path = Some(old_path);
            }
            event.full_path = Some(new_path.clone());
            event.new_path = Some(new_path.clone());
            state.paths.insert(event.frn, new_path);
            return;
        }

        if event.is_create() {
            if let Some(parent) = Self::parent_path(&state, &self.root, event.parent_frn) {
                let path = join_path(&parent, &event.file_name);
                state.paths.insert(event.frn, path.clone());
                event.full_path = Some(path);
            }
        }
    }

    /// Merge a completed MFT scan into the live map.
    ///
    /// Paths are built outside the lock; the merge itself takes the lock in
    /// short batches. Entries observed live during the scan win over the
    /// scan's result, since they are newer. Returns the number of entries
    /// merged in.
    pub fn merge_scan(&self, staging: &HashMap<u64, ScanEntry>) -> usize {
        let mut built: Vec<(u64, String)> = Vec::with_capacity(staging.len());
        for &frn in staging.keys() {
            if let Some(path) = build_path(&self.root, frn, staging) {
                built.push((frn, path));
            }
        }

        let mut inserted = 0;
        for chunk in built.chunks(4096) {
            let mut state = self.state.lock();
            for (frn, path) in chunk {
                if !state.paths.contains_key(frn) {
                    state.paths.insert(*frn, path.clone());
                    inserted += 1;
                }
            }
        }
        inserted
    }

    // ------------------------------------------------------------------
    // Cache snapshot
    // ------------------------------------------------------------------

    /// Load a previously persisted snapshot if present and younger than 24
    /// hours. Corrupt files are deleted. Returns whether a snapshot loaded.
    pub fn try_load_cache(&self) -> bool {
        let meta = match fs::metadata(&self.cache_path) {
            Ok(meta) => meta,
            Err(_) => return false,
        };

        let fresh = meta
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .map(|age| age < CACHE_MAX_AGE)
            .unwrap_or(false);
        if !fresh {
            return false;
        }

        match self.read_cache_file() {
            Ok(snapshot) => {
                let count = snapshot.len();
                let mut state = self.state.lock();
                for (frn, path) in snapshot {
                    state.paths.entry(frn).or_insert(path);
                }
                tracing::debug!(entries = count, "loaded FRN cache snapshot");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %self.cache_path.display(), "corrupt FRN cache, deleting");
                let _ = fs::remove_file(&self.cache_path);
                false
            }
        }
    }

    /// Write the current map to the snapshot location, best-effort.
    pub fn save_cache(&self) {
        let snapshot: Vec<(u64, String)> = {
            let state = self.state.lock();
            state
                .paths
                .iter()
                .map(|(frn, path)| (*frn, path.clone()))
                .collect()
        };

        if let Err(e) = self.write_cache_file(&snapshot) {
            tracing::warn!(error = %e, path = %self.cache_path.display(), "FRN cache save failed");
        }
    }

    fn read_cache_file(&self) -> std::io::Result<Vec<(u64, String)>> {
        use std::io::{Error, ErrorKind};

        let mut reader = BufReader::new(fs::File::open(&self.cache_path)?);
        let count = reader.read_u32::<LittleEndian>()?;
        let mut entries = Vec::with_capacity(count.min(1 << 20) as usize);

        for _ in 0..count {
            let frn = reader.read_u64::<LittleEndian>()?;
            let len = reader.read_u32::<LittleEndian>()?;
            if len > CACHE_MAX_PATH_LEN {
                return Err(Error::new(ErrorKind::InvalidData, "oversized path entry"));
            }
            let mut raw = vec![0u8; len as usize];
            reader.read_exact(&mut raw)?;
            let path = String::from_utf8(raw)
                .map_err(|_| Error::new(ErrorKind::InvalidData, "non-UTF-8 path entry"))?;
            entries.push((frn, path));
        }

        Ok(entries)
    }

    fn write_cache_file(&self, snapshot: &[(u64, String)]) -> std::io::Result<()> {
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.cache_path.with_extension("bin.tmp");
        {
            let mut writer = BufWriter::new(fs::File::create(&tmp)?);
            writer.write_u32::<LittleEndian>(snapshot.len() as u32)?;
            for (frn, path) in snapshot {
                writer.write_u64::<LittleEndian>(*frn)?;
                writer.write_u32::<LittleEndian>(path.len() as u32)?;
                writer.write_all(path.as_bytes())?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, &self.cache_path)
    }
}

// ============================================================================
// MFT enumeration (populate)
// ============================================================================

#[cfg(windows)]
impl PathResolver {
    /// Full MFT enumeration via FSCTL_ENUM_USN_DATA.
    ///
    /// Reads every live file and directory record into a local staging map,
    /// then merges the built paths into the live map under short lock holds;
    /// concurrent `resolve`/`update` calls keep running throughout.
    /// Per-entry decode problems are skipped and the scan continues.
    /// `progress` is invoked with the running record count after each batch.
    pub fn populate(
        &self,
        cancel: &std::sync::atomic::AtomicBool,
        mut progress: impl FnMut(u64),
    ) -> crate::error::Result<u64> {
        use crate::error::WatcherError;
        use crate::ntfs::journal::{split_batch, BatchIter, READ_BUFFER_SIZE};
        use crate::ntfs::volume::VolumeHandle;
        use crate::ntfs::winapi::{enum_usn_data, query_usn_journal};
        use std::sync::atomic::Ordering;

        let volume = VolumeHandle::open(self.volume)?;
        let journal = query_usn_journal(volume.handle(), self.volume)?;
        let high_usn = journal.next_usn;

        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut staging: HashMap<u64, ScanEntry> = HashMap::new();
        let mut start_frn: u64 = 0;

        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(WatcherError::Cancelled);
            }

            let (next_frn, bytes_returned) =
                enum_usn_data(volume.handle(), start_frn, high_usn, &mut buffer)?;
            if bytes_returned <= 8 {
                break;
            }

            if let Some((_, records)) = split_batch(&buffer[..bytes_returned]) {
                for event in BatchIter::new(records) {
                    staging.insert(
                        event.frn,
                        ScanEntry {
                            file_name: event.file_name,
                            parent_frn: event.parent_frn,
                        },
                    );
                }
            }
            progress(staging.len() as u64);

            if next_frn == 0 || next_frn == start_frn {
                break;
            }
            start_frn = next_frn;
        }

        let merged = self.merge_scan(&staging);
        tracing::info!(
            scanned = staging.len(),
            merged,
            "MFT enumeration complete"
        );
        Ok(merged as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::structs::usn_reason;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    const ROOT: u64 = 0x0005_0000_0000_0005;

    fn event(frn: u64, parent_frn: u64, reason: u32, name: &str) -> ChangeEvent {
        ChangeEvent {
            usn: 1,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            frn,
            parent_frn,
            file_name: name.to_string(),
            full_path: None,
            old_path: None,
            new_path: None,
            reason_raw: reason,
            is_directory: false,
            attributes: 0,
        }
    }

    fn resolver() -> PathResolver {
        PathResolver::with_cache_path('C', PathBuf::from("unused-cache.bin"))
    }

    #[test]
    fn resolves_mapped_frn() {
        let resolver = resolver();
        resolver.insert_path(0x55, r"C:\data\report.txt");

        let mut ev = event(0x55, 0x10, usn_reason::DATA_EXTEND, "report.txt");
        assert!(resolver.resolve(&mut ev));
        assert_eq!(ev.full_path.as_deref(), Some(r"C:\data\report.txt"));
    }

    #[test]
    fn synthesizes_from_parent_and_writes_back() {
        let resolver = resolver();
        resolver.insert_path(0x10, r"C:\logs");

        let mut ev = event(0x55, 0x10, usn_reason::DATA_EXTEND, "app.log");
        assert!(resolver.resolve(&mut ev));
        assert_eq!(ev.full_path.as_deref(), Some(r"C:\logs\app.log"));
        // The synthesis is inserted back to accelerate future lookups
        assert_eq!(resolver.path_of(0x55).as_deref(), Some(r"C:\logs\app.log"));
    }

    #[test]
    fn unresolved_parent_leaves_event_and_map_untouched() {
        let resolver = resolver();

        let mut ev = event(0x55, 0x56, usn_reason::DATA_EXTEND, "ghost.txt");
        assert!(!resolver.resolve(&mut ev));
        assert!(ev.full_path.is_none());
        assert_eq!(resolver.map_len(), 0);
    }

    #[test]
    fn root_parent_synthesizes_under_drive_root() {
        let resolver = resolver();

        let mut ev = event(0x77, ROOT, usn_reason::FILE_CREATE, "pagefile.sys");
        assert!(resolver.resolve(&mut ev));
        assert_eq!(ev.full_path.as_deref(), Some(r"C:\pagefile.sys"));
    }

    #[test]
    fn rename_round_trip_updates_map_and_event() {
        let resolver = resolver();
        resolver.insert_path(0x10, r"C:\temp");
        resolver.insert_path(0x2222, r"C:\temp\old.txt");

        let mut old_ev = event(0x2222, 0x10, usn_reason::RENAME_OLD_NAME, "old.txt");
        resolver.update(&mut old_ev);

        let mut new_ev = event(0x2222, 0x10, usn_reason::RENAME_NEW_NAME, "new.txt");
        resolver.update(&mut new_ev);

        assert_eq!(new_ev.old_path.as_deref(), Some(r"C:\temp\old.txt"));
        assert_eq!(new_ev.new_path.as_deref(), Some(r"C:\temp\new.txt"));
        assert_eq!(new_ev.full_path.as_deref(), Some(r"C:\temp\new.txt"));
        assert_eq!(resolver.path_of(0x2222).as_deref(), Some(r"C:\temp\new.txt"));
    }

    #[test]
    fn rename_old_name_synthesizes_prior_path_when_unmapped() {
        let resolver = resolver();
        resolver.insert_path(0x10, r"C:\temp");

        let mut old_ev = event(0x2222, 0x10, usn_reason::RENAME_OLD_NAME, "old.txt");
        resolver.update(&mut old_ev);
        let mut new_ev = event(0x2222, 0x10, usn_reason::RENAME_NEW_NAME, "new.txt");
        resolver.update(&mut new_ev);

        assert_eq!(new_ev.old_path.as_deref(), Some(r"C:\temp\old.txt"));
    }

    #[test]
    fn rename_new_name_without_parent_falls_back_to_filename() {
        let resolver = resolver();

        let mut new_ev = event(0x2222, 0x99, usn_reason::RENAME_NEW_NAME, "new.txt");
        resolver.update(&mut new_ev);

        assert_eq!(new_ev.new_path.as_deref(), Some("new.txt"));
        assert_eq!(resolver.path_of(0x2222).as_deref(), Some("new.txt"));
    }

    #[test]
    fn create_then_delete_evicts_mapping() {
        let resolver = resolver();
        resolver.insert_path(0x10, r"C:\logs");

        let mut create = event(0x88, 0x10, usn_reason::FILE_CREATE, "tmp.log");
        resolver.update(&mut create);
        assert_eq!(create.full_path.as_deref(), Some(r"C:\logs\tmp.log"));
        assert_eq!(resolver.path_of(0x88).as_deref(), Some(r"C:\logs\tmp.log"));

        let mut delete = event(0x88, 0x10, usn_reason::FILE_DELETE, "tmp.log");
        resolver.update(&mut delete);
        assert_eq!(resolver.path_of(0x88), None);
    }

    #[test]
    fn merge_scan_builds_nested_paths() {
        let resolver = resolver();

        let mut staging = HashMap::new();
        staging.insert(
            0x20,
            ScanEntry { file_name: "temp".to_string(), parent_frn: ROOT },
        );
        staging.insert(
            0x21,
            ScanEntry { file_name: "cache".to_string(), parent_frn: 0x20 },
        );
        staging.insert(
            0x22,
            ScanEntry { file_name: "page.bin".to_string(), parent_frn: 0x21 },
        );

        assert_eq!(resolver.merge_scan(&staging), 3);
        assert_eq!(
            resolver.path_of(0x22).as_deref(),
            Some(r"C:\temp\cache\page.bin")
        );
    }

    #[test]
    fn merge_scan_drops_cycles_and_orphans() {
        let resolver = resolver();

        let mut staging = HashMap::new();
        // a <-> b cycle
        staging.insert(
            0x30,
            ScanEntry { file_name: "a".to_string(), parent_frn: 0x31 },
        );
        staging.insert(
            0x31,
            ScanEntry { file_name: "b".to_string(), parent_frn: 0x30 },
        );
        // parent missing from the scan entirely
        staging.insert(
            0x32,
            ScanEntry { file_name: "orphan.txt".to_string(), parent_frn: 0x99 },
        );

        assert_eq!(resolver.merge_scan(&staging), 0);
        assert_eq!(resolver.map_len(), 0);
    }

    #[test]
    fn merge_scan_keeps_live_entries() {
        let resolver = resolver();
        resolver.insert_path(0x40, r"C:\renamed-live.txt");

        let mut staging = HashMap::new();
        staging.insert(
            0x40,
            ScanEntry { file_name: "stale.txt".to_string(), parent_frn: ROOT },
        );

        assert_eq!(resolver.merge_scan(&staging), 0);
        assert_eq!(resolver.path_of(0x40).as_deref(), Some(r"C:\renamed-live.txt"));
    }

    #[test]
    fn cache_round_trips() {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("cache-C.bin");

        let resolver = PathResolver::with_cache_path('C', cache.clone());
        resolver.insert_path(0x55, r"C:\data\report.txt");
        resolver.insert_path(0x56, r"C:\data");
        resolver.save_cache();

        let restored = PathResolver::with_cache_path('C', cache);
        assert!(restored.try_load_cache());
        assert_eq!(restored.map_len(), 2);
        assert_eq!(
            restored.path_of(0x55).as_deref(),
            Some(r"C:\data\report.txt")
        );
    }

    #[test]
    fn corrupt_cache_is_deleted() {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("cache-C.bin");
        // Claims 1000 entries, provides none
        std::fs::write(&cache, 1000u32.to_le_bytes()).unwrap();

        let resolver = PathResolver::with_cache_path('C', cache.clone());
        assert!(!resolver.try_load_cache());
        assert!(!cache.exists());
    }

    #[test]
    fn missing_cache_is_a_miss() {
        let dir = tempdir().unwrap();
        let resolver = PathResolver::with_cache_path('C', dir.path().join("nope.bin"));
        assert!(!resolver.try_load_cache());
    }
}
