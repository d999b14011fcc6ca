// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A scriptable [`DriveControl`] for tests.

use crate::drive::DataDirection;
use crate::drive::DeviceKind;
use crate::drive::DriveControl;
use crate::drive::DriveStatus;
use crate::drive::PacketCommand;
use crate::drive::PACKET_SIZE;
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// A call made through the fake drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveCall {
    Open,
    Kind,
    DriveStatus,
    SectorCount,
    SectorSize,
    LockDoor(bool),
    Eject,
    CloseTray,
    SendPacket([u8; PACKET_SIZE]),
}

impl DriveCall {
    /// Returns true for calls that act on an open descriptor.
    pub fn touches_descriptor(&self) -> bool {
        !matches!(self, DriveCall::Open)
    }
}

#[derive(Debug)]
pub struct FakeState {
    /// `None` makes classification fail.
    pub kind: Option<DeviceKind>,
    pub status: DriveStatus,
    /// `None` makes the size query fail.
    pub sector_count: Option<u64>,
    /// `None` makes the sector size query fail.
    pub sector_size: Option<u32>,
    pub fail_open: bool,
    /// Makes lock, eject, tray and packet commands fail with this errno.
    pub fail_commands: Option<i32>,
    /// Byte written over a read packet's data buffer.
    pub read_fill: u8,
    pub calls: Vec<DriveCall>,
}

/// Opens real files but answers every ioctl from [`FakeState`].
#[derive(Debug, Clone)]
pub struct FakeDrive(Arc<Mutex<FakeState>>);

impl FakeDrive {
    fn new(kind: DeviceKind, status: DriveStatus) -> Self {
        Self(Arc::new(Mutex::new(FakeState {
            kind: Some(kind),
            status,
            sector_count: Some(0),
            sector_size: None,
            fail_open: false,
            fail_commands: None,
            read_fill: 0xa5,
            calls: Vec::new(),
        })))
    }

    /// A plain image file.
    pub fn file() -> Self {
        Self::new(DeviceKind::File, DriveStatus::NO_INFO)
    }

    /// A drive with a disc of `sectors` 512-byte sectors loaded.
    pub fn disc(sectors: u64, sector_size: Option<u32>) -> Self {
        let drive = Self::new(DeviceKind::Block, DriveStatus::DISC_OK);
        drive.with(|state| {
            state.sector_count = Some(sectors);
            state.sector_size = sector_size;
        });
        drive
    }

    /// A drive with its tray open.
    pub fn empty_tray() -> Self {
        Self::new(DeviceKind::Block, DriveStatus::TRAY_OPEN)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.0.lock())
    }

    pub fn calls(&self) -> Vec<DriveCall> {
        self.0.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.0.lock().calls.clear();
    }

    /// Returns true if anything other than an open went through the drive.
    pub fn touched_descriptor(&self) -> bool {
        self.0.lock().calls.iter().any(DriveCall::touches_descriptor)
    }

    pub fn open_path(&self, path: &Path) -> fs::File {
        self.open(path, false).unwrap()
    }

    fn record(&self, call: DriveCall) -> parking_lot::MutexGuard<'_, FakeState> {
        let mut state = self.0.lock();
        state.calls.push(call);
        state
    }

    fn command_result(state: &FakeState) -> io::Result<()> {
        match state.fail_commands {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }
}

fn unsupported() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOTTY)
}

impl DriveControl for FakeDrive {
    fn open(&self, path: &Path, read_only: bool) -> io::Result<fs::File> {
        let state = self.record(DriveCall::Open);
        if state.fail_open {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        fs::OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
    }

    fn kind(&self, _file: &fs::File) -> io::Result<DeviceKind> {
        self.record(DriveCall::Kind).kind.ok_or_else(unsupported)
    }

    fn drive_status(&self, _file: &fs::File) -> io::Result<DriveStatus> {
        Ok(self.record(DriveCall::DriveStatus).status)
    }

    fn sector_count(&self, _file: &fs::File) -> io::Result<u64> {
        self.record(DriveCall::SectorCount)
            .sector_count
            .ok_or_else(unsupported)
    }

    fn sector_size(&self, _file: &fs::File) -> io::Result<u32> {
        self.record(DriveCall::SectorSize)
            .sector_size
            .ok_or_else(unsupported)
    }

    fn lock_door(&self, _file: &fs::File, lock: bool) -> io::Result<()> {
        Self::command_result(&self.record(DriveCall::LockDoor(lock)))
    }

    fn eject(&self, _file: &fs::File) -> io::Result<()> {
        Self::command_result(&self.record(DriveCall::Eject))
    }

    fn close_tray(&self, _file: &fs::File) -> io::Result<()> {
        Self::command_result(&self.record(DriveCall::CloseTray))
    }

    fn send_packet(&self, _file: &fs::File, command: &mut PacketCommand) -> io::Result<()> {
        let state = self.record(DriveCall::SendPacket(command.cmd));
        if let Some(sense) = &mut command.sense {
            // Fixed format sense, no sense key.
            sense[0] = 0x70;
            sense[7] = 10;
        }
        if command.data_direction == DataDirection::READ {
            if let Some(buffer) = &mut command.buffer {
                buffer.fill(state.read_fill);
            }
        }
        command.stat = if state.fail_commands.is_some() { 2 } else { 0 };
        Self::command_result(&state)
    }
}
