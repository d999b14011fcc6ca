// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Linux IOCTLs for optical drives and block devices.

// UNSAFETY: Calling ioctls on owned descriptors.
#![expect(unsafe_code)]

use crate::drive::DeviceKind;
use crate::drive::DriveControl;
use crate::drive::DriveStatus;
use crate::drive::PacketCommand;
use crate::drive::PACKET_SIZE;
use nix::ioctl_none_bad;
use nix::ioctl_read_bad;
use nix::ioctl_readwrite_bad;
use nix::ioctl_write_int_bad;
use nix::request_code_none;
use std::fs;
use std::io;
use std::os::unix::prelude::*;
use std::path::Path;

// Linux block device IOCTLs.
const BLK_IOC_MAGIC: u8 = 0x12;
// #define BLKGETSIZE _IO(0x12,96)
ioctl_read_bad!(
    blk_get_size_ioctl,
    request_code_none!(BLK_IOC_MAGIC, 96),
    libc::c_ulong
);
// #define BLKSSZGET _IO(0x12,104)
ioctl_read_bad!(
    blk_get_sector_size_ioctl,
    request_code_none!(BLK_IOC_MAGIC, 104),
    libc::c_int
);

// Linux cdrom IOCTLs, from cdrom.h.
ioctl_none_bad!(cdrom_eject_ioctl, 0x5309);
ioctl_none_bad!(cdrom_close_tray_ioctl, 0x5319);
ioctl_write_int_bad!(cdrom_drive_status_ioctl, 0x5326);
ioctl_write_int_bad!(cdrom_lockdoor_ioctl, 0x5329);
ioctl_readwrite_bad!(cdrom_send_packet_ioctl, 0x5393, CdromGenericCommand);

/// Selects the current slot of a changer.
const CDSL_CURRENT: libc::c_int = libc::c_int::MAX;

/// `struct cdrom_generic_command`.
#[repr(C)]
pub struct CdromGenericCommand {
    cmd: [u8; PACKET_SIZE],
    buffer: *mut u8,
    buflen: libc::c_uint,
    stat: libc::c_int,
    sense: *mut u8,
    data_direction: u8,
    quiet: libc::c_int,
    timeout: libc::c_int,
    reserved: *mut libc::c_void,
}

/// Drives the backing target with real ioctls.
#[derive(Debug, Default)]
pub struct HostDrive;

impl DriveControl for HostDrive {
    fn open(&self, path: &Path, read_only: bool) -> io::Result<fs::File> {
        tracing::debug!(?path, read_only, "open backing target");
        fs::OpenOptions::new()
            .read(true)
            .write(!read_only)
            .custom_flags(libc::O_NONBLOCK | libc::O_LARGEFILE)
            .open(path)
    }

    fn kind(&self, file: &fs::File) -> io::Result<DeviceKind> {
        let metadata = file.metadata()?;
        Ok(if metadata.file_type().is_block_device() {
            DeviceKind::Block
        } else {
            DeviceKind::File
        })
    }

    fn drive_status(&self, file: &fs::File) -> io::Result<DriveStatus> {
        // SAFETY: The FD is owned by the corresponding File, and this IOCTL is legal to call on any valid FD representing a CDROM.
        //         More documentation on this specific ioctl can be found in cdrom.h.
        let status = unsafe { cdrom_drive_status_ioctl(file.as_raw_fd(), CDSL_CURRENT)? };
        Ok(DriveStatus(status))
    }

    fn sector_count(&self, file: &fs::File) -> io::Result<u64> {
        let mut sectors: libc::c_ulong = 0;
        // SAFETY: The FD is owned by the corresponding File, and this IOCTL is legal to call on any valid FD.
        //         More documentation on this specific ioctl can be found in fs.h.
        unsafe { blk_get_size_ioctl(file.as_raw_fd(), &mut sectors)? };
        tracing::debug!(sectors, "sector_count");
        Ok(sectors as u64)
    }

    fn sector_size(&self, file: &fs::File) -> io::Result<u32> {
        let mut sector_size: libc::c_int = 0;
        // SAFETY: The FD is owned by the corresponding File, and this IOCTL is legal to call on any valid FD.
        //         More documentation on this specific ioctl can be found in fs.h.
        unsafe { blk_get_sector_size_ioctl(file.as_raw_fd(), &mut sector_size)? };
        Ok(sector_size as u32)
    }

    fn lock_door(&self, file: &fs::File, lock: bool) -> io::Result<()> {
        // SAFETY: The FD is owned by the corresponding File, and this IOCTL is legal to call on any valid FD representing a CDROM.
        //         More documentation on this specific ioctl can be found in cdrom.h.
        unsafe { cdrom_lockdoor_ioctl(file.as_raw_fd(), lock as libc::c_int)? };
        Ok(())
    }

    fn eject(&self, file: &fs::File) -> io::Result<()> {
        // SAFETY: The FD is owned by the corresponding File, and this IOCTL is legal to call on any valid FD representing a CDROM.
        //         More documentation on this specific ioctl can be found in cdrom.h.
        unsafe { cdrom_eject_ioctl(file.as_raw_fd())? };
        Ok(())
    }

    fn close_tray(&self, file: &fs::File) -> io::Result<()> {
        // SAFETY: The FD is owned by the corresponding File, and this IOCTL is legal to call on any valid FD representing a CDROM.
        //         More documentation on this specific ioctl can be found in cdrom.h.
        unsafe { cdrom_close_tray_ioctl(file.as_raw_fd())? };
        Ok(())
    }

    fn send_packet(&self, file: &fs::File, command: &mut PacketCommand) -> io::Result<()> {
        let (buffer, buflen) = match &mut command.buffer {
            Some(buffer) => (buffer.as_mut_ptr(), buffer.len() as libc::c_uint),
            None => (std::ptr::null_mut(), 0),
        };
        let sense = match &mut command.sense {
            Some(sense) => sense.as_mut_ptr(),
            None => std::ptr::null_mut(),
        };
        let mut cgc = CdromGenericCommand {
            cmd: command.cmd,
            buffer,
            buflen,
            stat: command.stat,
            sense,
            data_direction: command.data_direction.0,
            quiet: command.quiet as libc::c_int,
            timeout: command.timeout,
            reserved: std::ptr::null_mut(),
        };

        // SAFETY: The FD is owned by the corresponding File. The data and
        // sense pointers refer to buffers owned by `command` that outlive the
        // call, and `buflen` is the length of the data buffer.
        let r = unsafe { cdrom_send_packet_ioctl(file.as_raw_fd(), &mut cgc) };
        command.stat = cgc.stat;
        r?;
        Ok(())
    }
}
