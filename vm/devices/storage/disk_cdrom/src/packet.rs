// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Relays packet requests from the frontend to the backing drive.

use crate::cdb;
use crate::cdb::MediaRemovalFlags;
use crate::cdb::StartStopFlags;
use crate::cdb::TrayAction;
use crate::device::Device;
use crate::drive::DataDirection;
use crate::drive::DeviceKind;
use crate::drive::PacketCommand;
use crate::drive::SENSE_BUFFER_SIZE;
use crate::probe::DEFAULT_SECTOR_SIZE;
use crate::protocol;
use crate::protocol::CapabilityBody;
use crate::protocol::DecodeError;
use crate::protocol::GenericCommand;
use crate::protocol::MediaChangedBody;
use crate::protocol::OpenBody;
use crate::protocol::PacketKind;
use crate::protocol::Request;
use crate::watch::MEDIA_PRESENT_TOKEN;
use crate::watch::PARAMS_TOKEN;
use std::io;
use thiserror::Error;
use xenstore::Store;

#[derive(Debug, Error)]
enum RelayError {
    #[error("malformed packet request")]
    Decode(#[from] DecodeError),
    #[error("unknown packet request kind {0:?}")]
    UnknownKind(PacketKind),
    #[error("no backing device is open")]
    NoDevice,
    #[error("backing target is not a drive")]
    NotDrive,
    #[error("failed to allocate a {0} byte packet buffer")]
    OutOfMemory(usize),
    #[error("drive command failed")]
    Drive(#[source] io::Error),
}

impl RelayError {
    fn errno(&self) -> i32 {
        match self {
            RelayError::Decode(_) | RelayError::UnknownKind(_) => -libc::EINVAL,
            RelayError::NoDevice => -libc::ENODEV,
            RelayError::NotDrive => -libc::ENOTTY,
            RelayError::OutOfMemory(_) => -libc::ENOMEM,
            RelayError::Drive(err) => -err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Handles the packet request in `msg`, writing the reply in place.
///
/// Returns the completion status: 0 whenever a reply was written, even a
/// failure reply, and `-EINVAL` if `msg` is too short to carry one.
pub fn relay<S: Store + ?Sized>(
    device: Option<&mut Device>,
    store: Option<&mut S>,
    msg: &mut [u8],
) -> i32 {
    if let Err(err) = protocol::read_header(msg) {
        tracing::warn!(
            error = &err as &dyn std::error::Error,
            "dropping packet request"
        );
        return -libc::EINVAL;
    }

    let result = protocol::decode(msg)
        .map_err(RelayError::from)
        .and_then(|request| dispatch(device, store, msg, request));

    let (ret, err) = match result {
        Ok(()) => (0, 0),
        Err(err) => {
            tracing::debug!(
                error = &err as &dyn std::error::Error,
                "packet request failed"
            );
            (-1, err.errno())
        }
    };
    match protocol::set_status(msg, ret, err) {
        Ok(()) => 0,
        Err(_) => -libc::EINVAL,
    }
}

fn dispatch<S: Store + ?Sized>(
    device: Option<&mut Device>,
    store: Option<&mut S>,
    msg: &mut [u8],
    request: Request,
) -> Result<(), RelayError> {
    match request {
        Request::Capability => {
            protocol::body_mut::<CapabilityBody>(msg)?.supported = 1;
        }
        Request::Packet { offset, command } => {
            let device = device.ok_or(RelayError::NoDevice)?;
            send_command(device, msg, offset, command)?;
        }
        Request::OpenNotify { target } => open_notify(device, store, msg, target)?,
        Request::MediaChanged => {
            let changed = device.is_some_and(|device| device.take_changed());
            protocol::body_mut::<MediaChangedBody>(msg)?.media_changed = changed as u8;
        }
        Request::Unknown(kind) => return Err(RelayError::UnknownKind(kind)),
    }
    Ok(())
}

fn send_command(
    device: &Device,
    msg: &mut [u8],
    offset: usize,
    command: GenericCommand,
) -> Result<(), RelayError> {
    let (file, kind) = device.handle().ok_or(RelayError::NoDevice)?;
    if kind != Some(DeviceKind::Block) {
        return Err(RelayError::NotDrive);
    }
    let drive = device.drive();

    match command.cmd[0] {
        cdb::SCSI_MEDIUM_REMOVAL => {
            let flags = MediaRemovalFlags::from(command.cmd[4]);
            tracing::debug!(lock = flags.prevent(), "medium removal");
            drive
                .lock_door(file, flags.prevent())
                .map_err(RelayError::Drive)
        }
        cdb::SCSI_START_STOP_UNIT => {
            let action = StartStopFlags::from(command.cmd[4]).tray_action();
            tracing::debug!(?action, "start stop unit");
            match action {
                TrayAction::Eject => drive.eject(file),
                TrayAction::Close => drive.close_tray(file),
                TrayAction::None => Ok(()),
            }
            .map_err(RelayError::Drive)
        }
        _ => {
            let data = protocol::region(
                msg.len(),
                command.buffer_offset.get(),
                command.buflen.get() as usize,
            )?;
            let sense =
                protocol::region(msg.len(), command.sense_offset.get(), SENSE_BUFFER_SIZE)?;

            let buffer = match &data {
                Some(range) => {
                    let mut buffer = Vec::new();
                    buffer
                        .try_reserve_exact(range.len())
                        .map_err(|_| RelayError::OutOfMemory(range.len()))?;
                    buffer.extend_from_slice(&msg[range.clone()]);
                    Some(buffer)
                }
                None => None,
            };
            let mut packet = PacketCommand {
                cmd: command.cmd,
                data_direction: DataDirection(command.data_direction),
                quiet: command.quiet.get() != 0,
                timeout: command.timeout.get(),
                stat: command.stat.get(),
                sense: sense.as_ref().map(|_| [0; SENSE_BUFFER_SIZE]),
                buffer,
            };

            tracing::trace!(opcode = packet.cmd[0], "packet passthrough");
            let result = drive.send_packet(file, &mut packet);

            // Sense data and the data buffer are returned even on failure.
            if let (Some(range), Some(sense)) = (sense, &packet.sense) {
                msg[range].copy_from_slice(sense);
            }
            if let (Some(range), Some(buffer)) = (data, &packet.buffer) {
                msg[range].copy_from_slice(buffer);
            }
            protocol::view_mut::<GenericCommand>(msg, offset)?.stat = packet.stat.into();
            result.map_err(RelayError::Drive)
        }
    }
}

fn open_notify<S: Store + ?Sized>(
    mut device: Option<&mut Device>,
    store: Option<&mut S>,
    msg: &mut [u8],
    target: Option<String>,
) -> Result<(), RelayError> {
    if let Some(node) = target {
        match (store, device.as_deref()) {
            (Some(store), Some(device)) => register(device, store, &node),
            _ => tracing::warn!(%node, "backend not open, skipping watch registration"),
        }
    }

    let body = protocol::body_mut::<OpenBody>(msg)?;
    match device.as_deref_mut() {
        Some(device) if device.is_open() => {
            device.refresh();
            let media = device.media();
            body.media_present = media.present as u8;
            if media.present {
                body.sectors = media.sector_count.into();
                body.sector_size = media.sector_size.into();
            } else {
                body.sectors = 0.into();
                body.sector_size = DEFAULT_SECTOR_SIZE.into();
            }
        }
        _ => {
            body.media_present = 0;
            body.sectors = 0.into();
            body.sector_size = DEFAULT_SECTOR_SIZE.into();
        }
    }
    Ok(())
}

/// Publishes the device under `node` and watches for media and path
/// changes, unless that already happened.
fn register<S: Store + ?Sized>(device: &Device, store: &mut S, node: &str) {
    let media_present = format!("{node}/media-present");
    if store.read(&media_present).is_ok() {
        tracing::debug!(node, "watches already registered");
        return;
    }

    let (major, minor) = device.device_number();
    let present = if device.media().present { "1" } else { "0" };
    let steps = [
        ("media-present", store.write(&media_present, present)),
        (
            "media-present watch",
            store.watch(&media_present, MEDIA_PRESENT_TOKEN),
        ),
        (
            "params watch",
            store.watch(&format!("{node}/params"), PARAMS_TOKEN),
        ),
        (
            "physical-device",
            store.write(
                &format!("{node}/physical-device"),
                &format!("{major:x}:{minor:x}"),
            ),
        ),
    ];

    let mut failed = false;
    for (step, result) in steps {
        if let Err(err) = result {
            failed = true;
            tracing::warn!(
                node,
                step,
                error = &err as &dyn std::error::Error,
                "failed to register backend"
            );
        }
    }
    if !failed {
        tracing::info!(node, major, minor, "registered media watches");
    }
}
