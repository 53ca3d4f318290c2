//! Windows API bindings for NTFS volume and named-pipe operations
//!
//! Safe wrappers around the Win32 calls the daemon needs: raw volume access,
//! the USN journal IOCTLs, and the local named-pipe server surface.

use crate::error::{Result, WatcherError};
use crate::ntfs::structs::UsnJournalData;
use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::ptr;

// ============================================================================
// IOCTL Control Codes (from winioctl.h)
// ============================================================================

pub const FSCTL_ENUM_USN_DATA: u32 = 0x000900B3;
pub const FSCTL_READ_USN_JOURNAL: u32 = 0x000900BB;
pub const FSCTL_QUERY_USN_JOURNAL: u32 = 0x000900F4;

// File access for CreateFile
pub const GENERIC_READ: u32 = 0x80000000;
pub const FILE_SHARE_READ: u32 = 0x00000001;
pub const FILE_SHARE_WRITE: u32 = 0x00000002;

// Named pipe creation
pub const PIPE_ACCESS_OUTBOUND: u32 = 0x00000002;
pub const PIPE_TYPE_BYTE: u32 = 0x00000000;
pub const PIPE_WAIT: u32 = 0x00000000;
pub const PIPE_UNLIMITED_INSTANCES: u32 = 255;

// Win32 error codes the journal loop branches on
pub const ERROR_INVALID_FUNCTION: u32 = 1;
pub const ERROR_FILE_NOT_FOUND: u32 = 2;
pub const ERROR_PATH_NOT_FOUND: u32 = 3;
pub const ERROR_ACCESS_DENIED: u32 = 5;
pub const ERROR_HANDLE_EOF: u32 = 38;
pub const ERROR_PIPE_CONNECTED: u32 = 535;
pub const ERROR_JOURNAL_DELETE_IN_PROGRESS: u32 = 1178;
pub const ERROR_JOURNAL_NOT_ACTIVE: u32 = 1179;
pub const ERROR_JOURNAL_ENTRY_DELETED: u32 = 1181;

pub const INVALID_HANDLE_VALUE: isize = -1;

// ============================================================================
// Safe Handle Wrapper
// ============================================================================

/// RAII wrapper for a Windows HANDLE; closed exactly once on drop.
pub struct SafeHandle {
    handle: isize,
}

// HANDLEs are process-wide tokens; the kernel serializes operations on them.
unsafe impl Send for SafeHandle {}
unsafe impl Sync for SafeHandle {}

impl SafeHandle {
    /// Create from raw handle
    pub fn new(handle: isize) -> Option<Self> {
        if handle == INVALID_HANDLE_VALUE || handle == 0 {
            None
        } else {
            Some(Self { handle })
        }
    }

    /// Get raw handle value
    pub fn as_raw(&self) -> isize {
        self.handle
    }

    fn win32(&self) -> windows::Win32::Foundation::HANDLE {
        windows::Win32::Foundation::HANDLE(self.handle as *mut std::ffi::c_void)
    }
}

impl Drop for SafeHandle {
    fn drop(&mut self) {
        if self.handle != INVALID_HANDLE_VALUE && self.handle != 0 {
            unsafe {
                let _ = windows::Win32::Foundation::CloseHandle(self.win32());
            }
        }
    }
}

fn to_wide(path: &str) -> Vec<u16> {
    OsStr::new(path)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

/// Extract the Win32 error code from a windows-rs error (HRESULT_FROM_WIN32).
fn win32_code(error: &windows::core::Error) -> u32 {
    (error.code().0 as u32) & 0xFFFF
}

// ============================================================================
// Volume Operations
// ============================================================================

/// Open a volume for raw read access (`\\.\C:`).
///
/// Maps the interesting open failures onto the error taxonomy: access denied
/// means the caller is not elevated, not-found means the letter names no
/// volume.
pub fn open_volume(drive_letter: char) -> Result<SafeHandle> {
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::{
        CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_MODE, OPEN_EXISTING,
    };

    let path = format!("\\\\.\\{}:", drive_letter);
    let wide_path = to_wide(&path);

    let handle = unsafe {
        CreateFileW(
            PCWSTR::from_raw(wide_path.as_ptr()),
            GENERIC_READ,
            FILE_SHARE_MODE(FILE_SHARE_READ | FILE_SHARE_WRITE),
            None,
            OPEN_EXISTING,
            FILE_FLAGS_AND_ATTRIBUTES(0),
            HANDLE::default(),
        )
    };

    match handle {
        Ok(h) => SafeHandle::new(h.0 as isize)
            .ok_or_else(|| WatcherError::VolumeNotFound(drive_letter)),
        Err(e) => match win32_code(&e) {
            ERROR_ACCESS_DENIED => Err(WatcherError::PermissionDenied(drive_letter)),
            ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND => {
                Err(WatcherError::VolumeNotFound(drive_letter))
            }
            code => Err(WatcherError::from_win32(
                code,
                &format!("CreateFileW({})", path),
            )),
        },
    }
}

/// Check whether the volume behind a drive letter is formatted NTFS.
pub fn is_ntfs_volume(drive_letter: char) -> Result<bool> {
    use windows::core::PCWSTR;
    use windows::Win32::Storage::FileSystem::GetVolumeInformationW;

    let root = format!("{}:\\", drive_letter);
    let wide_root = to_wide(&root);
    let mut fs_name = [0u16; 64];

    let result = unsafe {
        GetVolumeInformationW(
            PCWSTR::from_raw(wide_root.as_ptr()),
            None,
            None,
            None,
            None,
            Some(&mut fs_name),
        )
    };

    match result {
        Ok(()) => {
            let len = fs_name.iter().position(|&c| c == 0).unwrap_or(fs_name.len());
            Ok(String::from_utf16_lossy(&fs_name[..len]) == "NTFS")
        }
        Err(e) => match win32_code(&e) {
            ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND => {
                Err(WatcherError::VolumeNotFound(drive_letter))
            }
            code => Err(WatcherError::from_win32(
                code,
                &format!("GetVolumeInformationW({})", root),
            )),
        },
    }
}

// ============================================================================
// IOCTL Operations
// ============================================================================

/// Send a DeviceIoControl request
pub fn device_io_control(
    handle: &SafeHandle,
    control_code: u32,
    in_buffer: Option<&[u8]>,
    out_buffer: &mut [u8],
) -> Result<u32> {
    use windows::Win32::System::IO::DeviceIoControl;

    let mut bytes_returned: u32 = 0;

    let (in_ptr, in_size) = match in_buffer {
        Some(buf) => (buf.as_ptr() as *const std::ffi::c_void, buf.len() as u32),
        None => (ptr::null(), 0),
    };

    let result = unsafe {
        DeviceIoControl(
            handle.win32(),
            control_code,
            Some(in_ptr),
            in_size,
            Some(out_buffer.as_mut_ptr() as *mut std::ffi::c_void),
            out_buffer.len() as u32,
            Some(&mut bytes_returned),
            None,
        )
    };

    match result {
        Ok(()) => Ok(bytes_returned),
        Err(e) => Err(WatcherError::from_win32(
            win32_code(&e),
            &format!("DeviceIoControl(0x{:08X})", control_code),
        )),
    }
}

/// Query USN journal metadata; `JournalDisabled` when the journal is off.
pub fn query_usn_journal(handle: &SafeHandle, drive_letter: char) -> Result<UsnJournalData> {
    let mut buffer = [0u8; 0x38];

    match device_io_control(handle, FSCTL_QUERY_USN_JOURNAL, None, &mut buffer) {
        Ok(_) => UsnJournalData::from_bytes(&buffer).ok_or_else(|| {
            WatcherError::from_win32(0, "FSCTL_QUERY_USN_JOURNAL returned a short buffer")
        }),
        Err(WatcherError::Win32 { code, .. })
            if code == ERROR_JOURNAL_NOT_ACTIVE || code == ERROR_JOURNAL_DELETE_IN_PROGRESS =>
        {
            Err(WatcherError::JournalDisabled(drive_letter))
        }
        Err(e) => Err(e),
    }
}

// ============================================================================
// USN Journal Reading
// ============================================================================

/// Input structure for FSCTL_READ_USN_JOURNAL
#[repr(C, packed)]
pub struct ReadUsnJournalData {
    pub start_usn: i64,
    pub reason_mask: u32,
    pub return_only_on_close: u32,
    pub timeout: u64,
    pub bytes_to_wait_for: u64,
    pub usn_journal_id: u64,
}

/// Non-blocking journal read from `start_usn`.
///
/// Returns `(next_usn, bytes_returned)`; `bytes_returned <= 8` means no new
/// records. `ERROR_JOURNAL_ENTRY_DELETED` propagates for the reader's wrap
/// handling.
pub fn read_usn_journal(
    handle: &SafeHandle,
    journal_id: u64,
    start_usn: i64,
    reason_mask: u32,
    buffer: &mut [u8],
) -> Result<(i64, usize)> {
    let input = ReadUsnJournalData {
        start_usn,
        reason_mask,
        return_only_on_close: 0,
        timeout: 0,
        bytes_to_wait_for: 0,
        usn_journal_id: journal_id,
    };

    let input_bytes = unsafe {
        std::slice::from_raw_parts(
            &input as *const ReadUsnJournalData as *const u8,
            std::mem::size_of::<ReadUsnJournalData>(),
        )
    };

    match device_io_control(handle, FSCTL_READ_USN_JOURNAL, Some(input_bytes), buffer) {
        Ok(bytes_returned) if bytes_returned >= 8 => {
            let next_usn = i64::from_le_bytes(buffer[0..8].try_into().unwrap());
            Ok((next_usn, bytes_returned as usize))
        }
        Ok(_) => Ok((start_usn, 0)),
        // EOF means the cursor is at the live tail already
        Err(WatcherError::Win32 { code: ERROR_HANDLE_EOF, .. }) => Ok((start_usn, 0)),
        Err(e) => Err(e),
    }
}

// ============================================================================
// MFT Enumeration via USN
// ============================================================================

/// Input structure for FSCTL_ENUM_USN_DATA (V1, Windows 8+)
#[repr(C, packed)]
pub struct MftEnumDataV1 {
    pub start_file_reference_number: u64,
    pub low_usn: i64,
    pub high_usn: i64,
    pub min_major_version: u16,
    pub max_major_version: u16,
}

/// Enumerate one batch of MFT records as V2 USN records.
///
/// Returns `(next_frn, bytes_returned)`; `(0, 0)` once enumeration is done.
pub fn enum_usn_data(
    handle: &SafeHandle,
    start_frn: u64,
    high_usn: i64,
    buffer: &mut [u8],
) -> Result<(u64, usize)> {
    let input = MftEnumDataV1 {
        start_file_reference_number: start_frn,
        low_usn: 0,
        high_usn,
        min_major_version: 2,
        max_major_version: 2,
    };

    let input_bytes = unsafe {
        std::slice::from_raw_parts(
            &input as *const MftEnumDataV1 as *const u8,
            std::mem::size_of::<MftEnumDataV1>(),
        )
    };

    match device_io_control(handle, FSCTL_ENUM_USN_DATA, Some(input_bytes), buffer) {
        Ok(bytes_returned) if bytes_returned >= 8 => {
            let next_frn = u64::from_le_bytes(buffer[0..8].try_into().unwrap());
            Ok((next_frn, bytes_returned as usize))
        }
        Ok(_) => Ok((0, 0)),
        Err(WatcherError::Win32 { code: ERROR_HANDLE_EOF, .. }) => Ok((0, 0)),
        Err(e) => Err(e),
    }
}

// ============================================================================
// Named Pipe Server
// ============================================================================

/// Create one outbound byte-mode instance of the local pipe.
pub fn create_pipe_instance(pipe_name: &str) -> Result<SafeHandle> {
    use windows::core::PCWSTR;
    use windows::Win32::Storage::FileSystem::FILE_FLAGS_AND_ATTRIBUTES;
    use windows::Win32::System::Pipes::{CreateNamedPipeW, NAMED_PIPE_MODE};

    let wide_name = to_wide(pipe_name);

    let handle = unsafe {
        CreateNamedPipeW(
            PCWSTR::from_raw(wide_name.as_ptr()),
            FILE_FLAGS_AND_ATTRIBUTES(PIPE_ACCESS_OUTBOUND),
            NAMED_PIPE_MODE(PIPE_TYPE_BYTE | PIPE_WAIT),
            PIPE_UNLIMITED_INSTANCES,
            64 * 1024,
            0,
            0,
            None,
        )
    };

    SafeHandle::new(handle.0 as isize).ok_or_else(|| {
        let code = unsafe { windows::Win32::Foundation::GetLastError().0 };
        WatcherError::from_win32(code, &format!("CreateNamedPipeW({})", pipe_name))
    })
}

/// Block until a client connects to this pipe instance.
pub fn connect_pipe(handle: &SafeHandle) -> Result<()> {
    use windows::Win32::System::Pipes::ConnectNamedPipe;

    let result = unsafe { ConnectNamedPipe(handle.win32(), None) };
    match result {
        Ok(()) => Ok(()),
        // The client raced us and is already attached
        Err(e) if win32_code(&e) == ERROR_PIPE_CONNECTED => Ok(()),
        Err(e) => Err(WatcherError::from_win32(win32_code(&e), "ConnectNamedPipe")),
    }
}

/// Write a full buffer to a connected pipe instance.
pub fn write_pipe(handle: &SafeHandle, data: &[u8]) -> Result<()> {
    use windows::Win32::Storage::FileSystem::WriteFile;

    let mut written: u32 = 0;
    let result = unsafe { WriteFile(handle.win32(), Some(data), Some(&mut written), None) };

    match result {
        Ok(()) if written as usize == data.len() => Ok(()),
        Ok(()) => Err(WatcherError::from_win32(0, "short pipe write")),
        Err(e) => Err(WatcherError::from_win32(win32_code(&e), "WriteFile(pipe)")),
    }
}

/// Disconnect the client side of a pipe instance.
pub fn disconnect_pipe(handle: &SafeHandle) {
    use windows::Win32::System::Pipes::DisconnectNamedPipe;
    unsafe {
        let _ = DisconnectNamedPipe(handle.win32());
    }
}

/// Open the client side of a local pipe. Used at shutdown to release an
/// acceptor blocked in [`connect_pipe`].
pub fn open_pipe_client(pipe_name: &str) -> Result<SafeHandle> {
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::{
        CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_MODE, OPEN_EXISTING,
    };

    let wide_name = to_wide(pipe_name);

    let handle = unsafe {
        CreateFileW(
            PCWSTR::from_raw(wide_name.as_ptr()),
            GENERIC_READ,
            FILE_SHARE_MODE(0),
            None,
            OPEN_EXISTING,
            FILE_FLAGS_AND_ATTRIBUTES(0),
            HANDLE::default(),
        )
    };

    match handle {
        Ok(h) => SafeHandle::new(h.0 as isize)
            .ok_or_else(|| WatcherError::from_win32(0, "pipe client open")),
        Err(e) => Err(WatcherError::from_win32(
            win32_code(&e),
            &format!("CreateFileW({})", pipe_name),
        )),
    }
}
