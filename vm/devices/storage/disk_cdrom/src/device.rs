// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The backing device of a virtual CD-ROM and the block I/O served from it.

use crate::drive::DeviceKind;
use crate::drive::DriveControl;
use crate::probe;
use crate::probe::MediaState;
use crate::probe::IO_SECTOR_SIZE;
use std::fs;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// A failed block request.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("no medium")]
    NoMedium,
    #[error("request for {count} sectors at sector {sector} is out of range or exceeds the buffer")]
    InvalidRequest { sector: u64, count: u32 },
    #[error("short transfer, {actual} of {expected} bytes")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("backing device i/o error")]
    Io(#[source] io::Error),
}

impl IoError {
    /// Returns the negative errno reported in the request's completion.
    pub fn errno(&self) -> i32 {
        match self {
            IoError::NoMedium => -libc::ENOMEDIUM,
            IoError::InvalidRequest { .. } => -libc::EINVAL,
            IoError::ShortTransfer { .. } => -libc::EIO,
            IoError::Io(err) => -err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

#[derive(Debug)]
struct DeviceHandle {
    file: fs::File,
    /// `None` if the target could not be classified.
    kind: Option<DeviceKind>,
}

/// The backing target of one backend instance.
///
/// At most one descriptor is open at a time. A block descriptor stays open
/// while the drive is empty so tray and door commands still reach it, but
/// block I/O is refused until media is present.
pub struct Device {
    drive: Arc<dyn DriveControl>,
    path: PathBuf,
    read_only: bool,
    handle: Option<DeviceHandle>,
    media: MediaState,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("handle", &self.handle)
            .field("media", &self.media)
            .finish()
    }
}

impl Device {
    /// Creates a closed device for `path`.
    pub fn new(drive: Arc<dyn DriveControl>, path: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            drive,
            path: path.into(),
            read_only,
            handle: None,
            media: MediaState::default(),
        }
    }

    /// The backing path currently in use.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn media(&self) -> &MediaState {
        &self.media
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Returns the open descriptor and its kind.
    pub fn handle(&self) -> Option<(&fs::File, Option<DeviceKind>)> {
        self.handle.as_ref().map(|h| (&h.file, h.kind))
    }

    pub fn drive(&self) -> &dyn DriveControl {
        self.drive.as_ref()
    }

    /// Opens the backing path if it is not already open, then probes it.
    pub fn open(&mut self) -> io::Result<()> {
        if self.handle.is_none() {
            let file = self.drive.open(&self.path, self.read_only).map_err(|err| {
                tracing::warn!(
                    path = %self.path.display(),
                    error = &err as &dyn std::error::Error,
                    "failed to open backing target"
                );
                err
            })?;
            tracing::info!(path = %self.path.display(), read_only = self.read_only, "opened backing target");
            self.handle = Some(DeviceHandle { file, kind: None });
        }
        self.refresh();
        Ok(())
    }

    /// Re-probes the open descriptor, if any.
    pub fn refresh(&mut self) {
        let Some(handle) = &mut self.handle else {
            return;
        };
        let probe = probe::probe(self.drive.as_ref(), &handle.file);
        handle.kind = probe.kind;
        self.media = MediaState {
            changed: self.media.changed,
            ..probe.media
        };
    }

    /// Closes the descriptor, if any, and resets the geometry.
    ///
    /// The changed flag survives.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::info!(path = %self.path.display(), "closing backing target");
            drop(handle);
        }
        self.media = MediaState {
            changed: self.media.changed,
            ..MediaState::default()
        };
    }

    /// Switches to a new backing path and reports a media change.
    pub fn reconfigure(&mut self, path: impl Into<PathBuf>) {
        self.close();
        self.path = path.into();
        tracing::info!(path = %self.path.display(), "backing path changed");
        // A failed open leaves the device without media.
        let _ = self.open();
        self.media.changed = true;
    }

    pub fn set_changed(&mut self) {
        self.media.changed = true;
    }

    /// Returns the changed flag and clears it.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.media.changed)
    }

    /// Returns the major and minor numbers of the backing path, or `(0, 0)`
    /// if it is not a device node or cannot be inspected.
    pub fn device_number(&self) -> (u64, u64) {
        match fs_err::metadata(&self.path) {
            Ok(metadata) => {
                let rdev = metadata.rdev();
                (nix::sys::stat::major(rdev), nix::sys::stat::minor(rdev))
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to read backing device number"
                );
                (0, 0)
            }
        }
    }

    /// Reads `count` 512-byte sectors at `sector` into the front of `buf`.
    pub fn read(&mut self, sector: u64, count: u32, buf: &mut [u8]) -> Result<(), IoError> {
        let (mut file, offset, len) = self.transfer(sector, count, buf.len())?;
        tracing::trace!(sector, count, "read");
        file.seek(SeekFrom::Start(offset)).map_err(IoError::Io)?;
        let actual = file.read(&mut buf[..len]).map_err(IoError::Io)?;
        if actual != len {
            return Err(IoError::ShortTransfer {
                expected: len,
                actual,
            });
        }
        Ok(())
    }

    /// Writes `count` 512-byte sectors at `sector` from the front of `buf`.
    pub fn write(&mut self, sector: u64, count: u32, buf: &[u8]) -> Result<(), IoError> {
        let (mut file, offset, len) = self.transfer(sector, count, buf.len())?;
        tracing::trace!(sector, count, "write");
        file.seek(SeekFrom::Start(offset)).map_err(IoError::Io)?;
        let actual = file.write(&buf[..len]).map_err(IoError::Io)?;
        if actual != len {
            return Err(IoError::ShortTransfer {
                expected: len,
                actual,
            });
        }
        Ok(())
    }

    /// Validates a block request, returning the descriptor, byte offset and
    /// byte length to transfer.
    fn transfer(
        &self,
        sector: u64,
        count: u32,
        buf_len: usize,
    ) -> Result<(&fs::File, u64, usize), IoError> {
        let handle = match &self.handle {
            Some(handle) if self.media.present => handle,
            _ => return Err(IoError::NoMedium),
        };
        let invalid = || IoError::InvalidRequest { sector, count };
        let offset = sector.checked_mul(IO_SECTOR_SIZE).ok_or_else(invalid)?;
        let len = usize::try_from(count as u64 * IO_SECTOR_SIZE).map_err(|_| invalid())?;
        if len > buf_len {
            return Err(invalid());
        }
        Ok((&handle.file, offset, len))
    }
}
