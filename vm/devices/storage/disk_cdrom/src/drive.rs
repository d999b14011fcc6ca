// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The control surface of a backing optical drive.

use open_enum::open_enum;
use std::fs;
use std::io;
use std::path::Path;

/// Size of the sense buffer returned by the drive for a packet command.
pub const SENSE_BUFFER_SIZE: usize = 64;

/// Number of command bytes in a packet command.
pub const PACKET_SIZE: usize = 12;

/// How the backing target is accessed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    /// A block device node, normally a physical optical drive.
    Block,
    /// A plain image file.
    File,
}

open_enum! {
    /// The result of a drive status query.
    pub enum DriveStatus: i32 {
        NO_INFO = 0,
        NO_DISC = 1,
        TRAY_OPEN = 2,
        DRIVE_NOT_READY = 3,
        DISC_OK = 4,
    }
}

open_enum! {
    /// Transfer direction of a packet command's data buffer.
    pub enum DataDirection: u8 {
        UNKNOWN = 0,
        WRITE = 1,
        READ = 2,
        NONE = 3,
    }
}

/// A SCSI generic command forwarded to the drive.
///
/// The data buffer, if any, is owned by the command for the duration of one
/// relay call.
#[derive(Debug, Clone)]
pub struct PacketCommand {
    pub cmd: [u8; PACKET_SIZE],
    pub data_direction: DataDirection,
    pub quiet: bool,
    pub timeout: i32,
    /// Status byte reported by the drive.
    pub stat: i32,
    pub sense: Option<[u8; SENSE_BUFFER_SIZE]>,
    pub buffer: Option<Vec<u8>>,
}

/// Host operations on the backing target.
///
/// Every operation besides [`DriveControl::open`] acts on a descriptor that
/// was returned by `open`.
pub trait DriveControl: Send + Sync {
    /// Opens `path` non-blocking, read-only or read-write.
    fn open(&self, path: &Path, read_only: bool) -> io::Result<fs::File>;

    /// Classifies an open descriptor.
    fn kind(&self, file: &fs::File) -> io::Result<DeviceKind>;

    /// Queries whether the drive has a disc loaded.
    fn drive_status(&self, file: &fs::File) -> io::Result<DriveStatus>;

    /// Queries the device size in 512-byte sectors.
    fn sector_count(&self, file: &fs::File) -> io::Result<u64>;

    /// Queries the native logical sector size.
    fn sector_size(&self, file: &fs::File) -> io::Result<u32>;

    /// Locks or unlocks the drive door.
    fn lock_door(&self, file: &fs::File, lock: bool) -> io::Result<()>;

    /// Ejects the tray.
    fn eject(&self, file: &fs::File) -> io::Result<()>;

    /// Closes the tray.
    fn close_tray(&self, file: &fs::File) -> io::Result<()>;

    /// Sends a generic packet command, updating the sense data and data
    /// buffer in place.
    fn send_packet(&self, file: &fs::File, command: &mut PacketCommand) -> io::Result<()>;
}
