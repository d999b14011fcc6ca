// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A blocking client for the Xen configuration store.
//!
//! [`Store`] is the interface backends use to read and write keys and to
//! subscribe to changes. [`XsConnection`] talks to xenstored over its unix
//! socket; [`MemoryStore`] keeps everything in process and is used by tests
//! and tools that run without a hypervisor.

#![forbid(unsafe_code)]

mod connection;
mod memory;
mod protocol;

pub use connection::XsConnection;
pub use memory::MemoryStore;

use std::os::fd::BorrowedFd;
use thiserror::Error;

/// A configuration store error.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection to the store failed.
    #[error("store connection i/o error")]
    Io(#[from] std::io::Error),
    /// The requested key does not exist.
    #[error("no such key: {0}")]
    NotFound(String),
    /// The store daemon rejected the request.
    #[error("store daemon returned {0}")]
    Daemon(String),
    /// The daemon sent something that could not be parsed.
    #[error("malformed store message: {0}")]
    Protocol(&'static str),
    /// The request does not fit in a single store message.
    #[error("payload of {0} bytes exceeds the store message limit")]
    PayloadTooLarge(usize),
}

/// A fired watch, as returned by [`Store::read_watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// The path that changed. This is the watched path or one of its
    /// children.
    pub path: String,
    /// The token the watch was registered with.
    pub token: String,
}

/// A connection to a hierarchical key/value store with watches.
pub trait Store: Send {
    /// Reads the value at `path`.
    fn read(&mut self, path: &str) -> Result<String, Error>;

    /// Writes `value` at `path`, creating it if necessary.
    fn write(&mut self, path: &str, value: &str) -> Result<(), Error>;

    /// Lists the children of `path`.
    fn directory(&mut self, path: &str) -> Result<Vec<String>, Error>;

    /// Subscribes to changes of `path` and its children.
    ///
    /// Events for the watch are tagged with `token`.
    fn watch(&mut self, path: &str, token: &str) -> Result<(), Error>;

    /// Removes a watch previously registered with [`Store::watch`].
    fn unwatch(&mut self, path: &str, token: &str) -> Result<(), Error>;

    /// Returns exactly one fired watch, blocking until one is available.
    fn read_watch(&mut self) -> Result<WatchEvent, Error>;

    /// Returns true if a fired watch has already been received and can be
    /// returned by [`Store::read_watch`] without blocking.
    fn has_pending_watch(&self) -> bool;

    /// Returns a file descriptor that becomes readable when watch events
    /// arrive, if the store has one.
    fn notification_fd(&self) -> Option<BorrowedFd<'_>>;
}

impl<T: Store + ?Sized> Store for Box<T> {
    fn read(&mut self, path: &str) -> Result<String, Error> {
        (**self).read(path)
    }

    fn write(&mut self, path: &str, value: &str) -> Result<(), Error> {
        (**self).write(path, value)
    }

    fn directory(&mut self, path: &str) -> Result<Vec<String>, Error> {
        (**self).directory(path)
    }

    fn watch(&mut self, path: &str, token: &str) -> Result<(), Error> {
        (**self).watch(path, token)
    }

    fn unwatch(&mut self, path: &str, token: &str) -> Result<(), Error> {
        (**self).unwatch(path, token)
    }

    fn read_watch(&mut self) -> Result<WatchEvent, Error> {
        (**self).read_watch()
    }

    fn has_pending_watch(&self) -> bool {
        (**self).has_pending_watch()
    }

    fn notification_fd(&self) -> Option<BorrowedFd<'_>> {
        (**self).notification_fd()
    }
}

/// Returns true if a watch on `watched` fires for a change to `changed`.
fn watch_matches(watched: &str, changed: &str) -> bool {
    changed
        .strip_prefix(watched)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/') || watched.ends_with('/'))
}
