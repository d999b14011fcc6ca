// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Blocking connection to xenstored over its unix socket.

use crate::protocol;
use crate::protocol::MessageHeader;
use crate::protocol::MessageType;
use crate::Error;
use crate::Store;
use crate::WatchEvent;
use std::collections::VecDeque;
use std::io::Read;
use std::io::Write;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

const SOCKET_PATHS: &[&str] = &["/run/xenstored/socket", "/var/run/xenstored/socket"];

/// Returns the xenstored socket path, honoring `XENSTORED_PATH`.
fn socket_path() -> PathBuf {
    if let Some(path) = std::env::var_os("XENSTORED_PATH") {
        return path.into();
    }
    SOCKET_PATHS
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .unwrap_or(Path::new(SOCKET_PATHS[0]))
        .to_path_buf()
}

/// A connection to xenstored.
///
/// Watches are tied to the connection and are dropped by the daemon when
/// the connection closes.
#[derive(Debug)]
pub struct XsConnection {
    socket: UnixStream,
    next_req_id: u32,
    pending: VecDeque<WatchEvent>,
}

impl XsConnection {
    /// Connects to the local xenstored.
    pub fn connect() -> Result<Self, Error> {
        Self::connect_path(&socket_path())
    }

    /// Connects to xenstored listening at `path`.
    pub fn connect_path(path: &Path) -> Result<Self, Error> {
        tracing::debug!(path = %path.display(), "connecting to xenstored");
        Ok(Self::from_stream(UnixStream::connect(path)?))
    }

    /// Wraps an already connected stream.
    pub fn from_stream(socket: UnixStream) -> Self {
        Self {
            socket,
            next_req_id: 1,
            pending: VecDeque::new(),
        }
    }

    fn request(
        &mut self,
        msg_type: MessageType,
        path: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        if payload.len() > protocol::PAYLOAD_MAX {
            return Err(Error::PayloadTooLarge(payload.len()));
        }
        let req_id = self.next_req_id;
        self.next_req_id = self.next_req_id.wrapping_add(1);

        let header = MessageHeader {
            msg_type,
            req_id,
            tx_id: 0,
            len: payload.len() as u32,
        };
        tracing::trace!(?msg_type, req_id, path, "xenstore request");
        self.socket.write_all(header.as_bytes())?;
        self.socket.write_all(payload)?;

        loop {
            let (header, body) = self.recv()?;
            if header.msg_type == MessageType::WATCH_EVENT {
                self.queue_watch_event(&body)?;
                continue;
            }
            if header.req_id != req_id {
                tracing::warn!(
                    req_id,
                    reply_id = header.req_id,
                    "dropping unexpected xenstore reply"
                );
                continue;
            }
            if header.msg_type == MessageType::ERROR {
                let errno = protocol::parse_error(&body);
                return Err(if errno == "ENOENT" {
                    Error::NotFound(path.to_owned())
                } else {
                    Error::Daemon(errno)
                });
            }
            if header.msg_type != msg_type {
                return Err(Error::Protocol("reply type does not match request"));
            }
            break Ok(body);
        }
    }

    fn recv(&mut self) -> Result<(MessageHeader, Vec<u8>), Error> {
        let mut header = MessageHeader::new_zeroed();
        self.socket.read_exact(header.as_mut_bytes())?;
        let len = header.len as usize;
        if len > protocol::PAYLOAD_MAX {
            return Err(Error::Protocol("oversized payload"));
        }
        let mut body = vec![0; len];
        self.socket.read_exact(&mut body)?;
        Ok((header, body))
    }

    fn queue_watch_event(&mut self, body: &[u8]) -> Result<(), Error> {
        let (path, token) =
            protocol::parse_watch_event(body).ok_or(Error::Protocol("bad watch event"))?;
        self.pending.push_back(WatchEvent { path, token });
        Ok(())
    }
}

impl Store for XsConnection {
    fn read(&mut self, path: &str) -> Result<String, Error> {
        let body = self.request(
            MessageType::READ,
            path,
            &protocol::build_payload(&[path], true),
        )?;
        String::from_utf8(body).map_err(|_| Error::Protocol("value is not utf-8"))
    }

    fn write(&mut self, path: &str, value: &str) -> Result<(), Error> {
        self.request(
            MessageType::WRITE,
            path,
            &protocol::build_payload(&[path, value], false),
        )?;
        Ok(())
    }

    fn directory(&mut self, path: &str) -> Result<Vec<String>, Error> {
        let body = self.request(
            MessageType::DIRECTORY,
            path,
            &protocol::build_payload(&[path], true),
        )?;
        protocol::split_strings(&body)
            .map(|name| {
                std::str::from_utf8(name)
                    .map(str::to_owned)
                    .map_err(|_| Error::Protocol("directory entry is not utf-8"))
            })
            .collect()
    }

    fn watch(&mut self, path: &str, token: &str) -> Result<(), Error> {
        self.request(
            MessageType::WATCH,
            path,
            &protocol::build_payload(&[path, token], true),
        )?;
        Ok(())
    }

    fn unwatch(&mut self, path: &str, token: &str) -> Result<(), Error> {
        self.request(
            MessageType::UNWATCH,
            path,
            &protocol::build_payload(&[path, token], true),
        )?;
        Ok(())
    }

    fn read_watch(&mut self) -> Result<WatchEvent, Error> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }
        loop {
            let (header, body) = self.recv()?;
            if header.msg_type == MessageType::WATCH_EVENT {
                self.queue_watch_event(&body)?;
                if let Some(event) = self.pending.pop_front() {
                    break Ok(event);
                }
            } else {
                tracing::warn!(
                    msg_type = ?header.msg_type,
                    req_id = header.req_id,
                    "dropping unsolicited xenstore message"
                );
            }
        }
    }

    fn has_pending_watch(&self) -> bool {
        !self.pending.is_empty()
    }

    fn notification_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.socket.as_fd())
    }
}
