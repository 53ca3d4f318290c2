//! NTFS volume layer
//!
//! Raw volume access, the USN journal IOCTLs, and the binary record formats
//! they exchange. Record parsing is platform-neutral; everything that issues
//! a Win32 call is gated on `cfg(windows)`.

pub mod journal;
pub mod structs;

#[cfg(windows)]
pub mod volume;
#[cfg(windows)]
pub mod winapi;

pub use journal::{split_batch, BatchIter, CursorPlacement};
pub use structs::{decode_attributes, decode_reasons, UsnJournalData, UsnRecord};

#[cfg(windows)]
pub use journal::JournalReader;
#[cfg(windows)]
pub use volume::VolumeHandle;
#[cfg(windows)]
pub use winapi::SafeHandle;
