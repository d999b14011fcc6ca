// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implements a blocking listener for Linux kobject uevents.
//!
//! These are used to notice removable media being inserted or ejected, and
//! other asynchronous block device state changes.

#![cfg(target_os = "linux")]
// UNSAFETY: Initializing a netlink socket address.
#![expect(unsafe_code)]

use socket2::SockAddr;
use socket2::Socket;
use std::collections::BTreeMap;
use std::io;
use std::io::Read;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use thiserror::Error;

/// An error from [`UeventSocket::bind`].
#[derive(Debug, Error)]
#[error("failed to create uevent socket")]
pub struct BindError(#[source] io::Error);

/// A netlink socket subscribed to kernel uevents.
pub struct UeventSocket {
    socket: Socket,
    buf: Box<[u8; 8192]>,
}

impl UeventSocket {
    /// Opens a new netlink socket and joins the kernel uevent group.
    pub fn bind() -> Result<Self, BindError> {
        let socket = bind_socket().map_err(BindError)?;
        Ok(Self {
            socket,
            buf: Box::new([0; 8192]),
        })
    }

    /// Blocks until the next uevent arrives and returns it.
    ///
    /// The uevent socket is an unreliable source and can overflow during an
    /// event flood. When that happens a synthetic event with `RESCAN=true`
    /// is returned, and the caller must rescan for whatever condition it is
    /// waiting on.
    pub fn next_event(&mut self) -> io::Result<Uevent> {
        match (&self.socket).read(&mut self.buf[..]) {
            Ok(n) => {
                let text = std::str::from_utf8(&self.buf[..n])
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                parse_uevent(text)
            }
            Err(err) if err.raw_os_error() == Some(libc::ENOBUFS) => {
                tracing::info!(error = &err as &dyn std::error::Error, "uevent overflow");
                Ok(Uevent::rescan())
            }
            Err(err) => Err(err),
        }
    }
}

impl AsFd for UeventSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

fn bind_socket() -> io::Result<Socket> {
    let socket = Socket::new(
        libc::PF_NETLINK.into(),
        socket2::Type::DGRAM,
        Some(libc::NETLINK_KOBJECT_UEVENT.into()),
    )?;

    // SAFETY: sockaddr_nl is plain old data and all zeroes is a valid value.
    let mut address: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    address.nl_family = libc::AF_NETLINK as _;
    address.nl_groups = 1;

    // SAFETY: the storage is initialized with a sockaddr_nl and the length
    // matches it.
    let ((), sockaddr) = unsafe {
        SockAddr::try_init(|storage, len| {
            storage.cast::<libc::sockaddr_nl>().write(address);
            len.write(size_of::<libc::sockaddr_nl>() as libc::socklen_t);
            Ok(())
        })?
    };

    socket.bind(&sockaddr)?;
    Ok(socket)
}

/// A device event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    header: String,
    properties: BTreeMap<String, String>,
}

impl Uevent {
    fn rescan() -> Self {
        Self {
            header: "rescan".into(),
            properties: [("RESCAN".into(), "true".into())].into(),
        }
    }

    /// Gets the header, `<action>@<devpath>`.
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Gets a property by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Returns true if this is a synthetic rescan event.
    pub fn is_rescan(&self) -> bool {
        self.get("RESCAN") == Some("true")
    }

    /// Returns the block device major/minor numbers, if the event is for a
    /// block device.
    pub fn block_device(&self) -> Option<(u32, u32)> {
        if self.get("SUBSYSTEM") != Some("block") {
            return None;
        }
        let major = self.get("MAJOR")?.parse().ok()?;
        let minor = self.get("MINOR")?.parse().ok()?;
        Some((major, minor))
    }
}

/// Parses a kernel uevent datagram: a header line followed by `KEY=value`
/// lines, all NUL separated.
pub fn parse_uevent(buf: &str) -> io::Result<Uevent> {
    let mut lines = buf.split('\0');
    let header = lines
        .next()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing event header"))?;
    let properties: BTreeMap<_, _> = lines
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
    tracing::debug!(header, ?properties, "uevent");
    Ok(Uevent {
        header: header.to_owned(),
        properties,
    })
}
