//! Raw NTFS volume handles and USN journal control codes.

use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, E_ACCESSDENIED, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_BACKUP_SEMANTICS, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::Ioctl::{FSCTL_CREATE_USN_JOURNAL, FSCTL_QUERY_USN_JOURNAL};
use windows::Win32::System::IO::DeviceIoControl;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct VolumeHandle {
    handle: HANDLE,
}

// SAFETY: NTFS volume handles are plain kernel objects and are safe to
// use from any thread.
unsafe impl Send for VolumeHandle {}

impl Drop for VolumeHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

impl VolumeHandle {
    pub fn raw(&self) -> HANDLE {
        self.handle
    }
}

#[derive(Debug, Clone)]
pub struct UsnJournalData {
    pub journal_id: u64,
    pub first_usn: i64,
    pub next_usn: i64,
    pub max_usn: i64,
}

const GENERIC_READ: u32 = 0x8000_0000;

/// Open `\\.\<drive>:` with backup semantics. Requires administrator or
/// backup privileges; failure to open is how MFT availability is probed.
pub fn open_volume(drive_letter: char) -> Result<VolumeHandle> {
    let path: Vec<u16> = format!("\\\\.\\{drive_letter}:")
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();

    let handle = unsafe {
        CreateFileW(
            PCWSTR(path.as_ptr()),
            GENERIC_READ,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            None,
            OPEN_EXISTING,
            FILE_FLAG_BACKUP_SEMANTICS,
            None,
        )
    }
    .map_err(|e| {
        if e.code() == E_ACCESSDENIED {
            Error::PermissionDenied(format!("volume {drive_letter}: requires admin rights"))
        } else {
            Error::VolumeIo(format!("open volume {drive_letter}: {e}"))
        }
    })?;

    Ok(VolumeHandle { handle })
}

/// USN_JOURNAL_DATA_V0: journal id, first/next/lowest-valid/max USN,
/// maximum size, allocation delta; 56 bytes total.
pub fn query_usn_journal(vol: &VolumeHandle) -> Result<UsnJournalData> {
    let mut buffer = [0u8; 56];
    let mut bytes_returned: u32 = 0;

    unsafe {
        DeviceIoControl(
            vol.raw(),
            FSCTL_QUERY_USN_JOURNAL,
            None,
            0,
            Some(buffer.as_mut_ptr() as *mut _),
            buffer.len() as u32,
            Some(&mut bytes_returned),
            None,
        )
    }
    .map_err(|e| Error::VolumeIo(format!("FSCTL_QUERY_USN_JOURNAL: {e}")))?;

    if (bytes_returned as usize) < 56 {
        return Err(Error::VolumeIo(format!(
            "FSCTL_QUERY_USN_JOURNAL returned {bytes_returned} bytes, expected 56"
        )));
    }

    Ok(UsnJournalData {
        journal_id: u64::from_le_bytes(buffer[0..8].try_into().expect("8 bytes")),
        first_usn: i64::from_le_bytes(buffer[8..16].try_into().expect("8 bytes")),
        next_usn: i64::from_le_bytes(buffer[16..24].try_into().expect("8 bytes")),
        max_usn: i64::from_le_bytes(buffer[32..40].try_into().expect("8 bytes")),
    })
}

/// CREATE_USN_JOURNAL_DATA { MaximumSize, AllocationDelta }
#[repr(C)]
struct CreateUsnJournalData {
    maximum_size: u64,
    allocation_delta: u64,
}

const JOURNAL_MAX_SIZE: u64 = 32 * 1024 * 1024;
const JOURNAL_ALLOCATION_DELTA: u64 = 8 * 1024 * 1024;

/// Create the USN journal on a volume that has none.
pub fn create_usn_journal(vol: &VolumeHandle) -> Result<()> {
    let data = CreateUsnJournalData {
        maximum_size: JOURNAL_MAX_SIZE,
        allocation_delta: JOURNAL_ALLOCATION_DELTA,
    };
    let mut bytes_returned: u32 = 0;

    unsafe {
        DeviceIoControl(
            vol.raw(),
            FSCTL_CREATE_USN_JOURNAL,
            Some(&data as *const _ as *const _),
            std::mem::size_of::<CreateUsnJournalData>() as u32,
            None,
            0,
            Some(&mut bytes_returned),
            None,
        )
    }
    .map_err(|e| Error::VolumeIo(format!("FSCTL_CREATE_USN_JOURNAL: {e}")))?;
    Ok(())
}
