// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A blktap disk driver that exposes a host optical drive, or an image
//! file, as a guest virtual CD-ROM.
//!
//! Block reads and writes are served synchronously from the backing target.
//! Packet requests carry SCSI commands for the drive and a few driver
//! specific queries, see [`protocol`]. Media insertion, removal and backing
//! path changes are signalled through the configuration store: the frontend
//! asks the driver to publish its device under a store node, after which the
//! driver watches `<node>/media-present` and `<node>/params`.

#![cfg(target_os = "linux")]

mod cdb;
mod device;
pub mod drive;
mod ioctl;
mod packet;
pub mod probe;
pub mod protocol;
mod watch;

#[cfg(test)]
mod test_helpers;

pub use device::Device;
pub use device::IoError;
pub use ioctl::HostDrive;
pub use watch::MEDIA_PRESENT_TOKEN;
pub use watch::PARAMS_TOKEN;

use drive::DriveControl;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use tapdisk::Callback;
use tapdisk::Completion;
use tapdisk::DiskId;
use tapdisk::ParentError;
use tapdisk::TapDisk;
use tapdisk::TdFlags;
use thiserror::Error;
use xenstore::Store;
use xenstore::XsConnection;

/// The driver type name reported to the harness.
pub const DISK_TYPE: &str = "tapdisk_cdrom";

/// An error opening a [`CdromDisk`].
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("disk is already open")]
    AlreadyOpen,
    #[error("failed to connect to the configuration store")]
    Store(#[source] xenstore::Error),
}

type Connector = Box<dyn FnMut() -> Result<Box<dyn Store>, xenstore::Error> + Send>;

/// A virtual CD-ROM backend.
pub struct CdromDisk {
    drive: Arc<dyn DriveControl>,
    connect: Connector,
    device: Option<Device>,
    store: Option<Box<dyn Store>>,
}

impl std::fmt::Debug for CdromDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdromDisk")
            .field("device", &self.device)
            .field("connected", &self.store.is_some())
            .finish()
    }
}

impl Default for CdromDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl CdromDisk {
    /// Creates a backend for a host drive, using the local xenstored.
    pub fn new() -> Self {
        Self::with_parts(Arc::new(HostDrive), || {
            Ok(Box::new(XsConnection::connect()?) as Box<dyn Store>)
        })
    }

    /// Creates a backend with a specific drive implementation and store
    /// connector. The connector is called once per open.
    pub fn with_parts(
        drive: Arc<dyn DriveControl>,
        connect: impl FnMut() -> Result<Box<dyn Store>, xenstore::Error> + Send + 'static,
    ) -> Self {
        Self {
            drive,
            connect: Box::new(connect),
            device: None,
            store: None,
        }
    }

    /// The backing device, once opened.
    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// Returns true if a store notification has already been received, so
    /// [`TapDisk::do_callbacks`] should be called without waiting on
    /// [`TapDisk::notification_fd`].
    pub fn has_pending_notification(&self) -> bool {
        self.store
            .as_ref()
            .is_some_and(|store| store.has_pending_watch())
    }

    fn complete(
        callback: &mut Callback<'_>,
        result: Result<(), IoError>,
        sector: u64,
        count: u32,
        id: u64,
    ) -> i32 {
        let status = match result {
            Ok(()) => 0,
            Err(err) => {
                tracing::debug!(
                    sector,
                    count,
                    error = &err as &dyn std::error::Error,
                    "request failed"
                );
                err.errno()
            }
        };
        callback(Completion {
            status,
            sector,
            count,
            id,
        })
    }
}

impl TapDisk for CdromDisk {
    type OpenError = OpenError;

    fn disk_type(&self) -> &'static str {
        DISK_TYPE
    }

    fn open(&mut self, name: &str, flags: TdFlags) -> Result<(), OpenError> {
        if self.device.is_some() {
            return Err(OpenError::AlreadyOpen);
        }
        let store = (self.connect)().map_err(OpenError::Store)?;

        // A target that cannot be opened comes up without media. The
        // frontend can supply a working path later through the store.
        let mut device = Device::new(self.drive.clone(), name, flags.read_only());
        let _ = device.open();
        tracing::info!(
            name,
            read_only = flags.read_only(),
            media = device.media().present,
            "cdrom opened"
        );

        self.device = Some(device);
        self.store = Some(store);
        Ok(())
    }

    fn queue_read(
        &mut self,
        sector: u64,
        count: u32,
        buf: &mut [u8],
        callback: &mut Callback<'_>,
        id: u64,
    ) -> i32 {
        let result = match &mut self.device {
            Some(device) => device.read(sector, count, buf),
            None => Err(IoError::NoMedium),
        };
        Self::complete(callback, result, sector, count, id)
    }

    fn queue_write(
        &mut self,
        sector: u64,
        count: u32,
        buf: &[u8],
        callback: &mut Callback<'_>,
        id: u64,
    ) -> i32 {
        let result = match &mut self.device {
            Some(device) => device.write(sector, count, buf),
            None => Err(IoError::NoMedium),
        };
        Self::complete(callback, result, sector, count, id)
    }

    fn queue_packet(
        &mut self,
        sector: u64,
        count: u32,
        buf: &mut [u8],
        callback: &mut Callback<'_>,
        id: u64,
    ) -> i32 {
        let status = packet::relay(self.device.as_mut(), self.store.as_mut(), buf);
        callback(Completion {
            status,
            sector,
            count,
            id,
        })
    }

    fn close(&mut self) -> i32 {
        if let Some(mut device) = self.device.take() {
            device.close();
        }
        // Dropping the connection drops its watches.
        self.store = None;
        0
    }

    fn notification_fd(&self) -> Option<BorrowedFd<'_>> {
        self.store.as_ref()?.notification_fd()
    }

    fn do_callbacks(&mut self, _sid: usize) -> i32 {
        if let (Some(device), Some(store)) = (&mut self.device, &mut self.store) {
            watch::handle_watch(device, store);
        }
        0
    }

    fn get_parent_id(&self) -> Result<DiskId, ParentError> {
        Err(ParentError::NoParent)
    }

    fn validate_parent(&self, _parent: &DiskId, _flags: TdFlags) -> Result<(), ParentError> {
        Err(ParentError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests::message;
    use crate::protocol::tests::status;
    use crate::protocol::OpenBody;
    use crate::protocol::PacketKind;
    use crate::protocol::HEADER_SIZE;
    use crate::test_helpers::FakeDrive;
    use std::io::Write;
    use test_log::test;
    use xenstore::MemoryStore;
    use zerocopy::FromBytes;

    const NODE: &str = "/local/domain/0/backend/vbd/3/5632";

    fn disk(drive: &FakeDrive, store: &MemoryStore) -> CdromDisk {
        let store = store.clone();
        CdromDisk::with_parts(Arc::new(drive.clone()), move || {
            Ok(Box::new(store.clone()) as Box<dyn Store>)
        })
    }

    fn backing(sectors: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..sectors * 512).map(|i| (i / 512) as u8).collect();
        file.write_all(&data).unwrap();
        file
    }

    fn read(disk: &mut CdromDisk, sector: u64, count: u32) -> (Completion, Vec<u8>) {
        let mut buf = vec![0; count as usize * 512];
        let mut done = None;
        let r = disk.queue_read(
            sector,
            count,
            &mut buf,
            &mut |c: Completion| {
                done = Some(c);
                7
            },
            42,
        );
        assert_eq!(r, 7);
        (done.unwrap(), buf)
    }

    fn packet(disk: &mut CdromDisk, msg: &mut [u8]) -> Completion {
        let mut done = None;
        disk.queue_packet(
            0,
            0,
            msg,
            &mut |c: Completion| {
                done = Some(c);
                0
            },
            1,
        );
        done.unwrap()
    }

    #[test]
    fn read_completes_through_callback() {
        let file = backing(4);
        let mut disk = disk(&FakeDrive::file(), &MemoryStore::new());
        disk.open(file.path().to_str().unwrap(), TdFlags::new().with_read_only(true))
            .unwrap();
        assert_eq!(disk.disk_type(), "tapdisk_cdrom");

        let (done, buf) = read(&mut disk, 2, 1);
        assert_eq!(
            done,
            Completion {
                status: 0,
                sector: 2,
                count: 1,
                id: 42
            }
        );
        assert!(buf.iter().all(|&b| b == 2));
    }

    #[test]
    fn unopened_disk_reports_no_medium() {
        let drive = FakeDrive::file();
        let mut disk = disk(&drive, &MemoryStore::new());
        let (done, _) = read(&mut disk, 0, 1);
        assert_eq!(done.status, -libc::ENOMEDIUM);

        let mut written = None;
        disk.queue_write(
            0,
            1,
            &[0; 512],
            &mut |c: Completion| {
                written = Some(c);
                0
            },
            9,
        );
        assert_eq!(written.unwrap().status, -libc::ENOMEDIUM);
        assert!(drive.calls().is_empty());
    }

    #[test]
    fn open_without_target_has_no_media() {
        let drive = FakeDrive::file();
        drive.with(|state| state.fail_open = true);
        let mut disk = disk(&drive, &MemoryStore::new());
        disk.open("/nonexistent", TdFlags::new()).unwrap();
        assert!(!disk.device().unwrap().media().present);
        let (done, _) = read(&mut disk, 0, 1);
        assert_eq!(done.status, -libc::ENOMEDIUM);
    }

    #[test]
    fn open_twice() {
        let file = backing(1);
        let mut disk = disk(&FakeDrive::file(), &MemoryStore::new());
        disk.open(file.path().to_str().unwrap(), TdFlags::new()).unwrap();
        assert!(matches!(
            disk.open(file.path().to_str().unwrap(), TdFlags::new()),
            Err(OpenError::AlreadyOpen)
        ));
    }

    #[test]
    fn store_connection_failure() {
        let mut disk = CdromDisk::with_parts(Arc::new(FakeDrive::file()), || {
            Err(xenstore::Error::NotFound("socket".into()))
        });
        assert!(matches!(
            disk.open("/dev/sr0", TdFlags::new()),
            Err(OpenError::Store(_))
        ));
        assert!(disk.device().is_none());
    }

    #[test]
    fn close_twice() {
        let file = backing(1);
        let mut disk = disk(&FakeDrive::file(), &MemoryStore::new());
        disk.open(file.path().to_str().unwrap(), TdFlags::new()).unwrap();
        assert_eq!(disk.close(), 0);
        assert_eq!(disk.close(), 0);
        assert!(disk.device().is_none());
        let (done, _) = read(&mut disk, 0, 1);
        assert_eq!(done.status, -libc::ENOMEDIUM);
    }

    #[test]
    fn no_parent() {
        let disk = disk(&FakeDrive::file(), &MemoryStore::new());
        assert_eq!(
            disk.get_parent_id().unwrap_err().status(),
            tapdisk::TD_NO_PARENT
        );
        let parent = DiskId {
            name: "base.iso".into(),
            driver: "aio".into(),
        };
        assert!(matches!(
            disk.validate_parent(&parent, TdFlags::new()),
            Err(ParentError::Unsupported)
        ));
    }

    #[test]
    fn media_change_round_trip() {
        let file = backing(4);
        let drive = FakeDrive::file();
        let store = MemoryStore::new();
        let mut driver = store.clone();
        let mut disk = disk(&drive, &store);
        disk.open(file.path().to_str().unwrap(), TdFlags::new()).unwrap();

        // The frontend asks the backend to publish itself.
        let mut msg = message(PacketKind::OPEN, 64);
        msg.extend_from_slice(NODE.as_bytes());
        msg.push(0);
        msg[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&64u32.to_le_bytes());
        assert_eq!(packet(&mut disk, &mut msg).status, 0);
        assert_eq!(status(&msg), (0, 0));
        let reply = OpenBody::read_from_prefix(&msg[HEADER_SIZE..]).unwrap().0;
        assert_eq!(reply.media_present, 1);
        assert_eq!(reply.sectors.get(), 4);

        // Drain the events fired by registration.
        while disk.store.as_ref().unwrap().has_pending_watch() {
            assert_eq!(disk.do_callbacks(0), 0);
        }
        let mut msg = message(PacketKind::MEDIA_CHANGED, 16);
        packet(&mut disk, &mut msg);

        driver
            .write(&format!("{NODE}/media-present"), "0")
            .unwrap();
        disk.do_callbacks(0);
        let (done, _) = read(&mut disk, 0, 1);
        assert_eq!(done.status, -libc::ENOMEDIUM);

        driver
            .write(&format!("{NODE}/media-present"), "1")
            .unwrap();
        disk.do_callbacks(0);
        let (done, _) = read(&mut disk, 0, 1);
        assert_eq!(done.status, 0);

        for expected in [1, 0] {
            let mut msg = message(PacketKind::MEDIA_CHANGED, 16);
            assert_eq!(packet(&mut disk, &mut msg).status, 0);
            assert_eq!(msg[HEADER_SIZE], expected);
        }
    }
}
