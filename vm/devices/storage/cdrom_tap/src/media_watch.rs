// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Publishes host media changes to the backends that use the changed drive.
//!
//! Backends publish `<node>/physical-device` when a frontend registers
//! them. When a drive's media changes, every registered backend of that
//! drive gets its `<node>/media-present` rewritten, which fires the watch
//! the backend placed on it.

use anyhow::Context as _;
use disk_cdrom::drive::DriveControl;
use disk_cdrom::drive::DriveStatus;
use disk_cdrom::HostDrive;
use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use uevent::Uevent;
use uevent::UeventSocket;
use xenstore::Store;

pub const DEFAULT_BACKEND_ROOT: &str = "/local/domain/0/backend";

/// Backend device classes that may carry a CD-ROM.
const DEVICE_TYPES: &[&str] = &["vbd", "tap"];

type MediaProbe = Box<dyn FnMut(&Path) -> io::Result<bool>>;

/// Parses a `"<major-hex>:<minor-hex>"` device number.
fn parse_device_number(s: &str) -> Option<(u32, u32)> {
    let (major, minor) = s.trim().split_once(':')?;
    Some((
        u32::from_str_radix(major, 16).ok()?,
        u32::from_str_radix(minor, 16).ok()?,
    ))
}

/// Returns true if the drive at `path` has a disc loaded.
fn host_media_present(path: &Path) -> io::Result<bool> {
    let drive = HostDrive;
    let file = drive.open(path, true)?;
    Ok(drive.drive_status(&file)? == DriveStatus::DISC_OK)
}

pub struct MediaWatcher<S> {
    store: S,
    backend_root: String,
    probe: MediaProbe,
}

impl<S: Store> MediaWatcher<S> {
    pub fn new(store: S, backend_root: impl Into<String>) -> Self {
        Self::with_probe(store, backend_root, host_media_present)
    }

    pub fn with_probe(
        store: S,
        backend_root: impl Into<String>,
        probe: impl FnMut(&Path) -> io::Result<bool> + 'static,
    ) -> Self {
        Self {
            store,
            backend_root: backend_root.into(),
            probe: Box::new(probe),
        }
    }

    /// Applies one uevent.
    pub fn handle_event(&mut self, event: &Uevent) {
        if event.is_rescan() {
            self.rescan();
            return;
        }
        let Some((major, minor)) = event.block_device() else {
            return;
        };
        if event.get("DEVTYPE") != Some("disk") {
            return;
        }

        let media_event = event.get("DISK_MEDIA_CHANGE") == Some("1")
            || event.get("DISK_EJECT_REQUEST") == Some("1");
        let present = match event.get("ACTION") {
            Some("remove") => false,
            Some("add") => self.query(major, minor, event.get("DEVNAME")),
            Some("change") if media_event => self.query(major, minor, event.get("DEVNAME")),
            _ => return,
        };
        self.publish(major, minor, present);
    }

    /// Re-queries every drive in use by a registered backend.
    pub fn rescan(&mut self) {
        let drives: BTreeSet<_> = self
            .backends()
            .iter()
            .filter_map(|node| self.store.read(&format!("{node}/physical-device")).ok())
            .filter_map(|s| parse_device_number(&s))
            .collect();
        tracing::debug!(count = drives.len(), "rescanning drives");
        for (major, minor) in drives {
            let present = self.query(major, minor, None);
            self.publish(major, minor, present);
        }
    }

    fn query(&mut self, major: u32, minor: u32, devname: Option<&str>) -> bool {
        let path = match devname {
            Some(name) => Path::new("/dev").join(name),
            None => PathBuf::from(format!("/dev/block/{major}:{minor}")),
        };
        match (self.probe)(&path) {
            Ok(present) => present,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = &err as &dyn std::error::Error,
                    "failed to query drive, assuming no media"
                );
                false
            }
        }
    }

    /// Writes the media state of drive `major:minor` to every registered
    /// backend using it. Returns the number of backends updated.
    pub fn publish(&mut self, major: u32, minor: u32, present: bool) -> usize {
        let mut updated = 0;
        for node in self.backends() {
            match self.publish_one(&node, major, minor, present) {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(err) => tracing::warn!(
                    %node,
                    error = &err as &dyn std::error::Error,
                    "failed to update backend"
                ),
            }
        }
        tracing::info!(major, minor, present, updated, "media state published");
        updated
    }

    fn publish_one(
        &mut self,
        node: &str,
        major: u32,
        minor: u32,
        present: bool,
    ) -> Result<bool, xenstore::Error> {
        let physical = match self.store.read(&format!("{node}/physical-device")) {
            Ok(value) => value,
            Err(xenstore::Error::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        if parse_device_number(&physical) != Some((major, minor)) {
            return Ok(false);
        }
        // Only backends that registered their watches get updates.
        let key = format!("{node}/media-present");
        match self.store.read(&key) {
            Ok(_) => {}
            Err(xenstore::Error::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        }
        self.store.write(&key, if present { "1" } else { "0" })?;
        Ok(true)
    }

    /// Lists `<root>/<type>/<domid>/<devid>` for every backend.
    fn backends(&mut self) -> Vec<String> {
        let mut nodes = Vec::new();
        for ty in DEVICE_TYPES {
            let type_path = format!("{}/{ty}", self.backend_root);
            let Ok(domains) = self.store.directory(&type_path) else {
                continue;
            };
            for domain in domains {
                let domain_path = format!("{type_path}/{domain}");
                match self.store.directory(&domain_path) {
                    Ok(devices) => {
                        nodes.extend(devices.iter().map(|dev| format!("{domain_path}/{dev}")));
                    }
                    Err(err) => tracing::debug!(
                        path = %domain_path,
                        error = &err as &dyn std::error::Error,
                        "skipping domain"
                    ),
                }
            }
        }
        nodes
    }
}

/// Runs the media watcher until the uevent socket fails.
pub fn run(store: impl Store, backend_root: String) -> anyhow::Result<()> {
    let mut socket = UeventSocket::bind().context("failed to listen for uevents")?;
    let mut watcher = MediaWatcher::new(store, backend_root);
    watcher.rescan();
    loop {
        let event = socket.next_event().context("failed to read uevent")?;
        watcher.handle_event(&event);
    }
}
