// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire format of packet requests.
//!
//! A packet request is a single buffer: a [`MessageHeader`] followed by a
//! body whose layout depends on the message kind. Replies are written back
//! into the same buffer. All fields are little endian and the layout has no
//! padding or alignment requirements. Offsets inside a message are relative
//! to its first byte, with 0 meaning absent.

use open_enum::open_enum;
use std::ops::Range;
use thiserror::Error;
use zerocopy::little_endian::I32;
use zerocopy::little_endian::U16;
use zerocopy::little_endian::U32;
use zerocopy::little_endian::U64;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const PROTOCOL_VERSION: u16 = 1;

open_enum! {
    /// Discriminant of a packet request.
    pub enum PacketKind: u32 {
        CAPABILITY = 0x6301,
        OPEN = 0x6302,
        MEDIA_CHANGED = 0x6303,
        PACKET = 0x6304,
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MessageHeader {
    pub kind: U32,
    pub version: U16,
    /// 0 on success, -1 on failure.
    pub ret: i8,
    pub reserved: u8,
    /// Negative errno when `ret` is -1.
    pub err: I32,
}

pub const HEADER_SIZE: usize = size_of::<MessageHeader>();

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CapabilityBody {
    pub supported: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct OpenBody {
    /// Offset of a NUL-terminated store node path to register.
    pub payload_offset: U32,
    pub media_present: u8,
    pub reserved: [u8; 3],
    pub sector_size: U32,
    pub reserved2: [u8; 4],
    pub sectors: U64,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MediaChangedBody {
    pub media_changed: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PacketBody {
    /// Offset of the [`GenericCommand`].
    pub payload_offset: U32,
}

/// A SCSI generic command as carried on the wire.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GenericCommand {
    pub cmd: [u8; 12],
    pub buffer_offset: U32,
    pub buflen: U32,
    pub stat: I32,
    pub sense_offset: U32,
    pub data_direction: u8,
    pub reserved: [u8; 3],
    pub quiet: I32,
    pub timeout: I32,
}

const _: () = assert!(HEADER_SIZE == 12);
const _: () = assert!(size_of::<OpenBody>() == 24);
const _: () = assert!(size_of::<GenericCommand>() == 40);

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message of {0} bytes is truncated")]
    Truncated(usize),
    #[error("unsupported protocol version {0}")]
    Version(u16),
    #[error("region at offset {offset} of {len} bytes is outside the message")]
    Region { offset: usize, len: usize },
    #[error("target path is not a terminated utf-8 string")]
    BadPath,
}

/// A decoded packet request.
#[derive(Debug)]
pub enum Request {
    Capability,
    OpenNotify {
        target: Option<String>,
    },
    MediaChanged,
    Packet {
        /// Where the command lives, for writing back its status.
        offset: usize,
        command: GenericCommand,
    },
    Unknown(PacketKind),
}

pub fn read_header(msg: &[u8]) -> Result<MessageHeader, DecodeError> {
    MessageHeader::read_from_prefix(msg)
        .map(|(header, _)| header)
        .map_err(|_| DecodeError::Truncated(msg.len()))
}

/// Decodes the request in `msg`.
///
/// Every region a reply will be written to is checked to fit the message.
pub fn decode(msg: &[u8]) -> Result<Request, DecodeError> {
    let header = read_header(msg)?;
    if header.version.get() != PROTOCOL_VERSION {
        return Err(DecodeError::Version(header.version.get()));
    }
    let request = match PacketKind(header.kind.get()) {
        PacketKind::CAPABILITY => {
            read_at::<CapabilityBody>(msg, HEADER_SIZE)?;
            Request::Capability
        }
        PacketKind::OPEN => {
            let body = read_at::<OpenBody>(msg, HEADER_SIZE)?;
            let target = match body.payload_offset.get() {
                0 => None,
                offset => Some(read_str(msg, offset as usize)?),
            };
            Request::OpenNotify { target }
        }
        PacketKind::MEDIA_CHANGED => {
            read_at::<MediaChangedBody>(msg, HEADER_SIZE)?;
            Request::MediaChanged
        }
        PacketKind::PACKET => {
            let body = read_at::<PacketBody>(msg, HEADER_SIZE)?;
            let offset = body.payload_offset.get() as usize;
            if offset == 0 {
                return Err(DecodeError::Region {
                    offset,
                    len: size_of::<GenericCommand>(),
                });
            }
            let command = read_at::<GenericCommand>(msg, offset)?;
            Request::Packet { offset, command }
        }
        kind => Request::Unknown(kind),
    };
    Ok(request)
}

/// Returns the byte range of an optional region, checking that it fits.
pub fn region(
    msg_len: usize,
    offset: u32,
    len: usize,
) -> Result<Option<Range<usize>>, DecodeError> {
    if offset == 0 {
        return Ok(None);
    }
    let offset = offset as usize;
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= msg_len)
        .ok_or(DecodeError::Region { offset, len })?;
    Ok(Some(offset..end))
}

fn read_at<T: FromBytes>(msg: &[u8], offset: usize) -> Result<T, DecodeError> {
    msg.get(offset..)
        .and_then(|rest| T::read_from_prefix(rest).ok())
        .map(|(value, _)| value)
        .ok_or(DecodeError::Region {
            offset,
            len: size_of::<T>(),
        })
}

fn read_str(msg: &[u8], offset: usize) -> Result<String, DecodeError> {
    let rest = msg.get(offset..).ok_or(DecodeError::Region { offset, len: 1 })?;
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::BadPath)?;
    std::str::from_utf8(&rest[..end])
        .map(str::to_owned)
        .map_err(|_| DecodeError::BadPath)
}

/// Returns a mutable view of a structure at `offset` in `msg`.
pub fn view_mut<T: FromBytes + IntoBytes + KnownLayout>(
    msg: &mut [u8],
    offset: usize,
) -> Result<&mut T, DecodeError> {
    let len = msg.len();
    msg.get_mut(offset..)
        .and_then(|rest| T::mut_from_prefix(rest).ok())
        .map(|(value, _)| value)
        .ok_or(DecodeError::Truncated(len))
}

/// Returns a mutable view of the body of `msg`.
pub fn body_mut<T: FromBytes + IntoBytes + KnownLayout>(
    msg: &mut [u8],
) -> Result<&mut T, DecodeError> {
    view_mut(msg, HEADER_SIZE)
}

/// Sets the reply status in the header of `msg`.
pub fn set_status(msg: &mut [u8], ret: i8, err: i32) -> Result<(), DecodeError> {
    let header = view_mut::<MessageHeader>(msg, 0)?;
    header.ret = ret;
    header.err = err.into();
    Ok(())
}
