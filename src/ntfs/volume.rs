//! Scoped volume handle
//!
//! Acquisition of the raw read handle every journal IOCTL runs against. The
//! underlying OS handle is closed exactly once when the value drops, on every
//! exit path.

use crate::error::{Result, WatcherError};
use crate::ntfs::winapi::{is_ntfs_volume, open_volume, SafeHandle};

/// An open raw read handle to a single NTFS volume.
pub struct VolumeHandle {
    letter: char,
    handle: SafeHandle,
}

impl VolumeHandle {
    /// Open the volume behind a drive letter.
    ///
    /// Fails with `PermissionDenied` without administrative rights,
    /// `VolumeNotFound` when the letter names no volume, and `NotNtfs` when
    /// the volume carries another filesystem.
    pub fn open(drive_letter: char) -> Result<Self> {
        let letter = drive_letter.to_ascii_uppercase();
        if !letter.is_ascii_uppercase() {
            return Err(WatcherError::VolumeNotFound(drive_letter));
        }

        if !is_ntfs_volume(letter)? {
            return Err(WatcherError::NotNtfs(letter));
        }

        let handle = open_volume(letter)?;
        Ok(Self { letter, handle })
    }

    pub fn letter(&self) -> char {
        self.letter
    }

    pub fn handle(&self) -> &SafeHandle {
        &self.handle
    }
}
