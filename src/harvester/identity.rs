// SPDX-License-Identifier: Apache-2.0

//! Platform-independent file identity based on inode (Unix) or file index (Windows).
//!
//! Identity survives renames, so it is what ties a rotated file back to the
//! state recorded under its old path.

use std::fs::{File, Metadata};
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// Device and inode on Unix, volume serial number and file index on Windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    /// Used for loading persisted state.
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    #[cfg(unix)]
    fn from_metadata(metadata: &Metadata, _file: Option<&File>) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        Ok(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    #[cfg(windows)]
    fn from_metadata(_metadata: &Metadata, file: Option<&File>) -> io::Result<Self> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            BY_HANDLE_FILE_INFORMATION, GetFileInformationByHandle,
        };

        let Some(file) = file else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "file index requires an open handle",
            ));
        };

        let handle = file.as_raw_handle() as HANDLE;
        let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };

        let result = unsafe { GetFileInformationByHandle(handle, &mut info) };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }

        let file_index = ((info.nFileIndexHigh as u64) << 32) | (info.nFileIndexLow as u64);

        Ok(Self {
            dev: info.dwVolumeSerialNumber as u64,
            ino: file_index,
        })
    }

    /// Device ID (Unix) or volume serial number (Windows).
    pub fn dev(&self) -> u64 {
        self.dev
    }

    /// Inode number (Unix) or file index (Windows).
    pub fn ino(&self) -> u64 {
        self.ino
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

/// The subset of stat information the pipeline works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub id: FileId,
    pub size: u64,
    pub modified: SystemTime,
    pub is_dir: bool,
}

impl FileStat {
    /// Stat a path, following symlinks.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if metadata.is_dir() {
            return Ok(Self::build(FileId::default(), &metadata));
        }

        #[cfg(unix)]
        let id = FileId::from_metadata(&metadata, None)?;
        #[cfg(windows)]
        let id = {
            let file = open_shared(path)?;
            FileId::from_metadata(&metadata, Some(&file))?
        };

        Ok(Self::build(id, &metadata))
    }

    /// Stat an open handle.
    pub fn from_file(file: &File) -> io::Result<Self> {
        let metadata = file.metadata()?;
        let id = FileId::from_metadata(&metadata, Some(file))?;
        Ok(Self::build(id, &metadata))
    }

    fn build(id: FileId, metadata: &Metadata) -> Self {
        Self {
            id,
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            is_dir: metadata.is_dir(),
        }
    }

    pub fn same_file(&self, other: &FileStat) -> bool {
        self.id == other.id
    }

    /// Time since the last modification, zero if the clock went backwards.
    pub fn age(&self) -> std::time::Duration {
        SystemTime::now()
            .duration_since(self.modified)
            .unwrap_or_default()
    }
}

/// Opens a file for reading without blocking external rotation. On Windows the
/// handle allows concurrent delete and rename.
pub fn open_shared(path: impl AsRef<Path>) -> io::Result<File> {
    let mut options = std::fs::OpenOptions::new();
    options.read(true);

    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        use windows_sys::Win32::Storage::FileSystem::{
            FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE,
        };
        options.share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE);
    }

    options.open(path)
}
