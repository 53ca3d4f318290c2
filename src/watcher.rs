//! Daemon orchestrator
//!
//! Wires the journal reader, path resolver, coalescer, cursor store, and
//! pipe broadcaster into the streaming loop: read a batch, update and resolve
//! paths, hand events to the coalescer, emit merged events, persist the
//! cursor periodically, and drain everything on cancellation.

use crate::coalescer::{Coalescer, DEFAULT_DEBOUNCE};
use crate::cursor::{plan_startup, CursorStore, StartupAction};
use crate::error::{Result, WatcherError};
use crate::event::ChangeEvent;
use crate::filter::FilterExpr;
use crate::ntfs::journal::{CursorPlacement, JournalReader};
use crate::ntfs::volume::VolumeHandle;
use crate::output::{self, OutputFormat};
use crate::pipe::PipeBroadcaster;
use crate::resolver::PathResolver;
use chrono::Utc;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Default pause between journal polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How often the cursor is persisted while streaming.
const CURSOR_SAVE_INTERVAL: Duration = Duration::from_secs(30);

/// Largest uninterrupted sleep, so cancellation is observed promptly.
const CANCEL_POLL_SLICE: Duration = Duration::from_millis(50);

/// Ask the kernel for every reason bit; filtering happens downstream.
const READ_REASON_MASK: u32 = 0xFFFF_FFFF;

/// Runtime configuration for one watch.
pub struct WatcherConfig {
    pub volume: char,
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub format: OutputFormat,
    /// Run the background MFT scan to bootstrap the path map.
    pub populate: bool,
    /// Serve `\\.\pipe\usn-watcher-<LETTER>`.
    pub pipe: bool,
    pub filter: Option<FilterExpr>,
    /// Log events dropped by the filter at debug level.
    pub log_filtered: bool,
}

impl WatcherConfig {
    pub fn new(volume: char) -> Self {
        Self {
            volume: volume.to_ascii_uppercase(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
            format: OutputFormat::default(),
            populate: true,
            pipe: false,
            filter: None,
            log_filtered: false,
        }
    }
}

/// Terminal half of the pipeline: filter, serialize, write stdout, fan out.
struct Emitter {
    format: OutputFormat,
    filter: Option<FilterExpr>,
    log_filtered: bool,
    broadcaster: Option<PipeBroadcaster>,
    emitted: AtomicU64,
}

impl Emitter {
    fn emit_event(&self, event: ChangeEvent) {
        if let Some(ref filter) = self.filter {
            if !filter.matches(&event) {
                if self.log_filtered {
                    tracing::debug!(usn = event.usn, file = %event.file_name, "event dropped by filter");
                }
                return;
            }
        }

        let json = output::event_json(&event);
        match self.format {
            OutputFormat::Json => self.write_stdout(&json),
            OutputFormat::Table => self.write_stdout(&output::event_table_row(&event)),
        }
        if let Some(ref broadcaster) = self.broadcaster {
            broadcaster.broadcast(&json);
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Control messages are NDJSON on both channels regardless of format;
    /// table mode wraps the line in a timestamped row.
    fn emit_control(&self, json_line: &str) {
        match self.format {
            OutputFormat::Json => self.write_stdout(json_line),
            OutputFormat::Table => {
                self.write_stdout(&output::control_table_row(Utc::now(), json_line))
            }
        }
        if let Some(ref broadcaster) = self.broadcaster {
            broadcaster.broadcast(json_line);
        }
    }

    fn write_stdout(&self, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }
}

/// The streaming daemon for one volume.
pub struct Watcher {
    config: WatcherConfig,
    cancel: Arc<AtomicBool>,
}

impl Watcher {
    pub fn new(config: WatcherConfig) -> Self {
        Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared cancellation flag; setting it drains and stops the run.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Open the volume, recover the cursor, and stream until cancelled.
    pub fn run(&self) -> Result<()> {
        let letter = self.config.volume;
        let volume = Arc::new(VolumeHandle::open(letter)?);

        let resolver = Arc::new(PathResolver::new(letter));
        let cache_loaded = resolver.try_load_cache();
        if cache_loaded {
            tracing::info!(entries = resolver.map_len(), "FRN cache loaded");
        }

        // The MFT scan runs on its own worker against its own handle; events
        // streamed before it completes simply have no full path yet.
        let populate_handle = if self.config.populate {
            let scan_resolver = Arc::clone(&resolver);
            let cancel = Arc::clone(&self.cancel);
            Some(thread::spawn(move || {
                let started = Instant::now();
                match scan_resolver.populate(&cancel, |count| {
                    if count % 250_000 == 0 {
                        tracing::debug!(records = count, "MFT scan progress");
                    }
                }) {
                    Ok(merged) => {
                        tracing::info!(
                            merged,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "path map populated"
                        );
                    }
                    Err(WatcherError::Cancelled) => {}
                    Err(e) => tracing::warn!(error = %e, "MFT scan failed, paths resolve lazily"),
                }
            }))
        } else {
            None
        };

        let mut reader = JournalReader::new(Arc::clone(&volume));
        reader.initialize()?;

        let emitter = Arc::new(Emitter {
            format: self.config.format,
            filter: self.config.filter.clone(),
            log_filtered: self.config.log_filtered,
            broadcaster: self.config.pipe.then(|| PipeBroadcaster::start(letter)),
            emitted: AtomicU64::new(0),
        });

        let cursor_store = CursorStore::new();
        let stored = cursor_store.load(letter);
        match plan_startup(stored, reader.journal_id(), reader.first_usn()) {
            StartupAction::FreshStart => {
                tracing::info!(usn = reader.next_usn(), "no stored cursor, starting from live tail");
            }
            StartupAction::Resume { usn } => {
                match reader.set_cursor(usn)? {
                    CursorPlacement::Resumed => {
                        tracing::info!(usn, "resuming from stored cursor");
                    }
                    // The journal moved between the two metadata queries
                    CursorPlacement::Wrapped { first_usn } => {
                        emitter.emit_control(&output::gap_line(usn, first_usn));
                    }
                }
            }
            StartupAction::Gap { from, to } => {
                let to = match reader.set_cursor(from)? {
                    CursorPlacement::Wrapped { first_usn } => first_usn,
                    CursorPlacement::Resumed => to,
                };
                tracing::warn!(from, to, "journal wrapped past stored cursor");
                emitter.emit_control(&output::gap_line(from, to));
            }
            StartupAction::Reset => {
                tracing::warn!("journal recreated, falling back to live tail");
                emitter.emit_control(&output::cursor_reset_line());
            }
        }

        let coalescer = {
            let sink = Arc::clone(&emitter);
            Coalescer::new(self.config.debounce, move |event| sink.emit_event(event))
        };

        let mut batches: u64 = 0;
        let mut records: u64 = 0;
        let mut last_save = Instant::now();
        let mut fatal: Option<WatcherError> = None;

        while !self.cancel.load(Ordering::Relaxed) && fatal.is_none() {
            match reader.read_batch(READ_REASON_MASK) {
                Ok(batch) => {
                    let mut batch_records: u64 = 0;
                    for mut event in batch {
                        batch_records += 1;

                        // Creates and renames update the map first so the
                        // emitted path reflects the new name; deletes evict
                        // after resolution so the final event keeps its path.
                        if event.is_create() || event.is_rename() {
                            resolver.update(&mut event);
                        }
                        resolver.resolve(&mut event);
                        if event.is_delete() {
                            resolver.update(&mut event);
                        }

                        coalescer.add(event);
                    }
                    if batch_records > 0 {
                        batches += 1;
                        records += batch_records;
                    }
                }
                Err(WatcherError::Wrapped { from, to }) => {
                    tracing::warn!(from, to, "journal wrapped while streaming");
                    emitter.emit_control(&output::gap_line(from, to));
                }
                Err(WatcherError::JournalRecreated) => {
                    tracing::warn!("journal recreated while streaming, resetting to live tail");
                    emitter.emit_control(&output::cursor_reset_line());
                }
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(error = %e, "journal read failed, retrying next poll");
                }
                Err(e) => {
                    tracing::error!(error = %e, "journal read failed, stopping");
                    fatal = Some(e);
                }
            }

            if last_save.elapsed() >= CURSOR_SAVE_INTERVAL {
                cursor_store.save(letter, reader.journal_id(), reader.next_usn());
                last_save = Instant::now();
            }

            self.sleep_poll();
        }

        tracing::info!("stopping, draining pending events");
        coalescer.flush_all();
        drop(coalescer);

        cursor_store.save(letter, reader.journal_id(), reader.next_usn());
        resolver.save_cache();

        if let Some(handle) = populate_handle {
            let _ = handle.join();
        }

        tracing::info!(
            batches,
            records,
            events = emitter.emitted.load(Ordering::Relaxed),
            "run complete"
        );
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn sleep_poll(&self) {
        let mut slept = Duration::ZERO;
        while slept < self.config.poll_interval && !self.cancel.load(Ordering::Relaxed) {
            let slice = CANCEL_POLL_SLICE.min(self.config.poll_interval - slept);
            thread::sleep(slice);
            slept += slice;
        }
    }
}
