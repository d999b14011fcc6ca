// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Defines the [`TapDisk`] trait, the callback contract between a blktap
//! host harness and the disk drivers it multiplexes.
//!
//! The harness owns the event loop. It calls into a driver synchronously,
//! one entry point at a time, and every queued request is finished by the
//! driver invoking the request's completion callback with a [`Completion`].
//! Specific drivers should be in their own crates.

#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use std::os::fd::BorrowedFd;
use thiserror::Error;

/// Flags passed to [`TapDisk::open`].
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct TdFlags {
    /// Open the backing target read-only.
    pub read_only: bool,
    #[bits(31)]
    pub reserved: u32,
}

/// The result of a queued request, passed to the request's callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Zero on success, or a negative errno value.
    pub status: i32,
    /// The first sector of the request.
    pub sector: u64,
    /// The number of sectors in the request.
    pub count: u32,
    /// The caller's request identifier.
    pub id: u64,
}

impl Completion {
    /// Returns true if the request succeeded.
    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// A request completion callback.
///
/// The callback captures whatever context the caller needs. Its return
/// value is passed back to the caller of the queue function unchanged.
pub type Callback<'a> = dyn FnMut(Completion) -> i32 + 'a;

/// Identifies the parent image of a chained disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskId {
    /// The parent image name.
    pub name: String,
    /// The parent driver type.
    pub driver: String,
}

/// An error from the parent chaining entry points.
#[derive(Debug, Error)]
pub enum ParentError {
    /// The disk is a leaf and has no parent.
    #[error("disk has no parent")]
    NoParent,
    /// The driver does not support chaining.
    #[error("disk chaining is not supported")]
    Unsupported,
}

impl ParentError {
    /// Returns the status code reported to the harness.
    pub fn status(&self) -> i32 {
        match self {
            ParentError::NoParent => TD_NO_PARENT,
            ParentError::Unsupported => -libc::EINVAL,
        }
    }
}

/// Status returned to the harness when a disk has no parent.
pub const TD_NO_PARENT: i32 = 1;

/// A disk driver hosted by the blktap harness.
///
/// Every `queue_*` call must invoke `callback` exactly once before it
/// returns. There is no deferred completion.
pub trait TapDisk {
    /// The error returned by [`TapDisk::open`].
    type OpenError: 'static + std::error::Error + Send + Sync;

    /// Returns the driver type name.
    ///
    /// This is used for diagnostic purposes.
    fn disk_type(&self) -> &'static str;

    /// Opens the disk at `name`.
    fn open(&mut self, name: &str, flags: TdFlags) -> Result<(), Self::OpenError>;

    /// Reads `count` sectors starting at `sector` into `buf`.
    fn queue_read(
        &mut self,
        sector: u64,
        count: u32,
        buf: &mut [u8],
        callback: &mut Callback<'_>,
        id: u64,
    ) -> i32;

    /// Writes `count` sectors starting at `sector` from `buf`.
    fn queue_write(
        &mut self,
        sector: u64,
        count: u32,
        buf: &[u8],
        callback: &mut Callback<'_>,
        id: u64,
    ) -> i32;

    /// Processes a packet request. The reply is written back into `buf`.
    fn queue_packet(
        &mut self,
        sector: u64,
        count: u32,
        buf: &mut [u8],
        callback: &mut Callback<'_>,
        id: u64,
    ) -> i32;

    /// Submits queued requests to the backing store.
    fn submit(&mut self) -> i32 {
        0
    }

    /// Closes the disk and releases every resource it owns.
    fn close(&mut self) -> i32;

    /// Returns the file descriptor the harness should poll on the driver's
    /// behalf, if any.
    fn notification_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    /// Called by the harness when the notification source `sid` is ready.
    fn do_callbacks(&mut self, sid: usize) -> i32;

    /// Returns the parent of a chained disk.
    fn get_parent_id(&self) -> Result<DiskId, ParentError>;

    /// Checks whether the disk identified by `parent` is a valid parent of
    /// this disk.
    fn validate_parent(&self, parent: &DiskId, flags: TdFlags) -> Result<(), ParentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_read_only_bit() {
        let flags = TdFlags::from(1);
        assert!(flags.read_only());
        assert!(!TdFlags::new().read_only());
        assert_eq!(u32::from(TdFlags::new().with_read_only(true)), 1);
    }

    #[test]
    fn parent_error_status() {
        assert_eq!(ParentError::NoParent.status(), TD_NO_PARENT);
        assert_eq!(ParentError::Unsupported.status(), -libc::EINVAL);
    }
}
