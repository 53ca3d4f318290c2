//! Debouncing coalescer
//!
//! A single logical file operation fans out into several journal records (an
//! editor save emits DATAOVERWRITE, often DATATRUNCATION, BASICINFOCHANGE,
//! then CLOSE). The coalescer merges every record for one FRN that arrives
//! within a quiet window into exactly one event, flushed by a background
//! worker once the burst goes quiet.

use crate::event::ChangeEvent;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default quiet window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

/// Smallest accepted quiet window.
pub const MIN_DEBOUNCE: Duration = Duration::from_millis(10);

/// Largest slice the flush worker sleeps in one go, so shutdown joins fast.
const FLUSH_SLEEP_SLICE: Duration = Duration::from_millis(50);

struct PendingSlot {
    event: ChangeEvent,
    last_seen: Instant,
    arrival: u64,
}

struct Inner {
    pending: DashMap<u64, PendingSlot>,
    window: Duration,
    running: AtomicBool,
    arrivals: AtomicU64,
    sink: Box<dyn Fn(ChangeEvent) + Send + Sync>,
}

impl Inner {
    /// Emit with the flush time, not the first-observed time: the merged
    /// event marks the completion of its burst.
    fn emit(&self, mut event: ChangeEvent) {
        event.timestamp = Utc::now();
        (self.sink)(event);
    }

    fn flush_expired(&self) {
        let now = Instant::now();
        let mut expired: Vec<(u64, u64)> = self
            .pending
            .iter()
            .filter(|slot| now.duration_since(slot.last_seen) >= self.window)
            .map(|slot| (slot.arrival, *slot.key()))
            .collect();
        expired.sort_unstable();

        for (_, frn) in expired {
            if let Some((_, slot)) = self.pending.remove(&frn) {
                self.emit(slot.event);
            }
        }
    }

    fn flush_all(&self) {
        let mut all: Vec<(u64, u64)> = self
            .pending
            .iter()
            .map(|slot| (slot.arrival, *slot.key()))
            .collect();
        all.sort_unstable();

        for (_, frn) in all {
            if let Some((_, slot)) = self.pending.remove(&frn) {
                self.emit(slot.event);
            }
        }
    }
}

/// Merge an incoming record into the pending event for the same FRN.
///
/// Greatest USN and latest timestamp win; reason and attribute masks are
/// unioned; name and full path track the most recent non-empty value; the
/// first old path and the latest new path are kept; the directory flag is
/// sticky.
fn merge_into(target: &mut ChangeEvent, incoming: ChangeEvent) {
    target.usn = target.usn.max(incoming.usn);
    target.timestamp = target.timestamp.max(incoming.timestamp);
    target.reason_raw |= incoming.reason_raw;
    target.attributes |= incoming.attributes;
    target.is_directory |= incoming.is_directory;
    target.parent_frn = incoming.parent_frn;

    if !incoming.file_name.is_empty() {
        target.file_name = incoming.file_name;
    }
    if incoming.full_path.is_some() {
        target.full_path = incoming.full_path;
    }
    if target.old_path.is_none() {
        target.old_path = incoming.old_path;
    }
    if incoming.new_path.is_some() {
        target.new_path = incoming.new_path;
    }
}

/// Per-FRN merge buffer with time-based flush.
pub struct Coalescer {
    inner: Arc<Inner>,
    flush_thread: Option<JoinHandle<()>>,
}

impl Coalescer {
    /// Create a coalescer with the given quiet window (clamped to
    /// [`MIN_DEBOUNCE`]) and start its flush worker. Flushed events are
    /// handed to `sink` on the worker thread.
    pub fn new<F>(window: Duration, sink: F) -> Self
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let inner = Arc::new(Inner {
            pending: DashMap::new(),
            window: window.max(MIN_DEBOUNCE),
            running: AtomicBool::new(true),
            arrivals: AtomicU64::new(0),
            sink: Box::new(sink),
        });

        let worker = Arc::clone(&inner);
        let flush_thread = thread::spawn(move || {
            while worker.running.load(Ordering::Relaxed) {
                let mut slept = Duration::ZERO;
                while slept < worker.window && worker.running.load(Ordering::Relaxed) {
                    let slice = FLUSH_SLEEP_SLICE.min(worker.window - slept);
                    thread::sleep(slice);
                    slept += slice;
                }
                if !worker.running.load(Ordering::Relaxed) {
                    break;
                }
                worker.flush_expired();
            }
        });

        Self {
            inner,
            flush_thread: Some(flush_thread),
        }
    }

    /// Merge an event into the pending slot for its FRN, creating the slot
    /// on first sight.
    pub fn add(&self, event: ChangeEvent) {
        use dashmap::mapref::entry::Entry;

        match self.inner.pending.entry(event.frn) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                merge_into(&mut slot.event, event);
                slot.last_seen = Instant::now();
            }
            Entry::Vacant(vacant) => {
                let arrival = self.inner.arrivals.fetch_add(1, Ordering::Relaxed);
                vacant.insert(PendingSlot {
                    event,
                    last_seen: Instant::now(),
                    arrival,
                });
            }
        }
    }

    /// Drain every pending slot unconditionally. Used at shutdown so a burst
    /// still inside its quiet window is not lost.
    pub fn flush_all(&self) {
        self.inner.flush_all();
    }

    /// Number of FRNs currently buffered.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }
}

impl Drop for Coalescer {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.flush_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::structs::usn_reason;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    fn event(usn: i64, frn: u64, reason: u32, name: &str) -> ChangeEvent {
        ChangeEvent {
            usn,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            frn,
            parent_frn: 0x10,
            file_name: name.to_string(),
            full_path: None,
            old_path: None,
            new_path: None,
            reason_raw: reason,
            is_directory: false,
            attributes: 0,
        }
    }

    fn collecting() -> (Arc<Mutex<Vec<ChangeEvent>>>, impl Fn(ChangeEvent) + Send + Sync) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink_target = Arc::clone(&collected);
        (collected, move |ev| sink_target.lock().push(ev))
    }

    #[test]
    fn editor_save_burst_merges_to_one_event() {
        let (collected, sink) = collecting();
        let coalescer = Coalescer::new(Duration::from_millis(20), sink);

        coalescer.add(event(1, 0x1234, usn_reason::DATA_OVERWRITE, "a.txt"));
        coalescer.add(event(2, 0x1234, usn_reason::DATA_TRUNCATION, "a.txt"));
        coalescer.add(event(3, 0x1234, usn_reason::CLOSE, "a.txt"));
        coalescer.flush_all();

        let events = collected.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].usn, 3);
        assert_eq!(events[0].reason_raw, 0x8000_0005);
        assert_eq!(
            events[0].reason_tokens(),
            vec!["DATAOVERWRITE", "DATATRUNCATION", "CLOSE"]
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let (collected, sink) = collecting();
        let coalescer = Coalescer::new(Duration::from_millis(20), sink);

        let ev = event(5, 0x77, usn_reason::DATA_EXTEND | usn_reason::CLOSE, "b.txt");
        coalescer.add(ev.clone());
        coalescer.add(ev);
        coalescer.flush_all();

        let events = collected.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason_raw, usn_reason::DATA_EXTEND | usn_reason::CLOSE);
        assert_eq!(events[0].reason_tokens(), vec!["DATAEXTEND", "CLOSE"]);
    }

    #[test]
    fn background_flush_fires_after_quiet_window() {
        let (collected, sink) = collecting();
        let coalescer = Coalescer::new(Duration::from_millis(20), sink);

        coalescer.add(event(1, 0x42, usn_reason::CLOSE, "c.txt"));
        assert_eq!(coalescer.pending_len(), 1);

        // Two windows plus a worker wake is comfortably enough
        thread::sleep(Duration::from_millis(200));
        assert_eq!(coalescer.pending_len(), 0);
        assert_eq!(collected.lock().len(), 1);
    }

    #[test]
    fn emitted_timestamp_is_flush_time() {
        let (collected, sink) = collecting();
        let coalescer = Coalescer::new(Duration::from_millis(20), sink);

        let stale = event(1, 0x9, usn_reason::CLOSE, "d.txt");
        let original = stale.timestamp;
        coalescer.add(stale);
        coalescer.flush_all();

        assert!(collected.lock()[0].timestamp > original);
    }

    #[test]
    fn rename_paths_keep_first_old_and_latest_new() {
        let (collected, sink) = collecting();
        let coalescer = Coalescer::new(Duration::from_millis(20), sink);

        let mut first = event(1, 0x2222, usn_reason::RENAME_OLD_NAME, "old.txt");
        first.old_path = Some(r"C:\temp\old.txt".to_string());
        let mut second = event(2, 0x2222, usn_reason::RENAME_NEW_NAME, "new.txt");
        second.old_path = Some(r"C:\temp\wrong.txt".to_string());
        second.new_path = Some(r"C:\temp\new.txt".to_string());
        second.full_path = Some(r"C:\temp\new.txt".to_string());

        coalescer.add(first);
        coalescer.add(second);
        coalescer.flush_all();

        let events = collected.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_path.as_deref(), Some(r"C:\temp\old.txt"));
        assert_eq!(events[0].new_path.as_deref(), Some(r"C:\temp\new.txt"));
        assert_eq!(events[0].file_name, "new.txt");
    }

    #[test]
    fn directory_flag_is_sticky() {
        let (collected, sink) = collecting();
        let coalescer = Coalescer::new(Duration::from_millis(20), sink);

        let mut dir = event(1, 0x31, usn_reason::FILE_CREATE, "logs");
        dir.is_directory = true;
        coalescer.add(dir);
        coalescer.add(event(2, 0x31, usn_reason::CLOSE, "logs"));
        coalescer.flush_all();

        assert!(collected.lock()[0].is_directory);
    }

    #[test]
    fn distinct_frns_flush_in_arrival_order() {
        let (collected, sink) = collecting();
        let coalescer = Coalescer::new(Duration::from_millis(20), sink);

        coalescer.add(event(7, 0xB, usn_reason::CLOSE, "late.txt"));
        coalescer.add(event(3, 0xA, usn_reason::CLOSE, "early.txt"));
        coalescer.flush_all();

        let events = collected.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].frn, 0xB);
        assert_eq!(events[1].frn, 0xA);
    }

    #[test]
    fn window_is_clamped_to_floor() {
        let (_, sink) = collecting();
        let coalescer = Coalescer::new(Duration::from_millis(1), sink);
        assert_eq!(coalescer.inner.window, MIN_DEBOUNCE);
    }
}
