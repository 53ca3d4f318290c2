//! usn-watcher - NTFS change streaming daemon
//!
//! Reads the kernel-maintained USN change journal of an NTFS volume and
//! turns the raw record stream into path-resolved, debounced events,
//! broadcast as newline-delimited JSON over stdout and named-pipe
//! subscribers.
//!
//! # Pipeline
//!
//! - **Journal reader**: raw FSCTL reads, record parsing, cursor tracking,
//!   wrap detection
//! - **Path resolver**: volume-wide FRN → absolute-path map, bootstrapped by
//!   an MFT enumeration and kept current from the event stream
//! - **Debouncing coalescer**: one merged event per FRN per quiet window
//! - **Cursor store**: durable resume point so restarts neither lose nor
//!   duplicate events while the journal has not wrapped
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(windows)]
//! # fn main() -> usn_watcher::Result<()> {
//! use usn_watcher::{Watcher, WatcherConfig};
//!
//! let watcher = Watcher::new(WatcherConfig::new('C'));
//! let cancel = watcher.cancel_flag();
//! ctrlc::set_handler(move || cancel.store(true, std::sync::atomic::Ordering::Relaxed))
//!     .expect("ctrl-c handler");
//! watcher.run()
//! # }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```

pub mod coalescer;
pub mod cursor;
pub mod error;
pub mod event;
pub mod filter;
pub mod ntfs;
pub mod output;
pub mod pipe;
pub mod resolver;

#[cfg(windows)]
pub mod watcher;

// Re-export main types
pub use coalescer::Coalescer;
pub use cursor::{plan_startup, CursorStore, StartupAction};
pub use error::{Result, WatcherError};
pub use event::ChangeEvent;
pub use filter::FilterExpr;
pub use output::OutputFormat;
pub use resolver::PathResolver;

#[cfg(windows)]
pub use pipe::PipeBroadcaster;
#[cfg(windows)]
pub use watcher::{Watcher, WatcherConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
