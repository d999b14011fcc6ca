// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reacts to fired configuration store watches.

use crate::device::Device;
use xenstore::Store;

/// Token of the watch on `<node>/media-present`.
pub const MEDIA_PRESENT_TOKEN: &str = "media-present";
/// Token of the watch on `<node>/params`.
pub const PARAMS_TOKEN: &str = "params";

/// Reads exactly one fired watch from `store` and applies it to `device`.
///
/// Store failures drop the event.
pub fn handle_watch<S: Store + ?Sized>(device: &mut Device, store: &mut S) {
    let event = match store.read_watch() {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to read watch event"
            );
            return;
        }
    };
    let value = match store.read(&event.path) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(
                path = %event.path,
                error = &err as &dyn std::error::Error,
                "dropping watch event"
            );
            return;
        }
    };

    match event.token.as_str() {
        MEDIA_PRESENT_TOKEN => {
            if value == "0" {
                tracing::info!(path = %device.path().display(), "media removed");
                device.close();
            } else {
                tracing::info!(path = %device.path().display(), "media inserted");
                // A failed open is logged and leaves the device without media.
                let _ = device.open();
                device.set_changed();
            }
        }
        PARAMS_TOKEN => match value.split_once(':') {
            Some((_, path)) => device.reconfigure(path),
            None => tracing::debug!(%value, "ignoring params without a type prefix"),
        },
        token => tracing::debug!(token, path = %event.path, "ignoring unknown watch"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::DriveControl;
    use crate::test_helpers::FakeDrive;
    use std::io::Write;
    use std::sync::Arc;
    use test_log::test;
    use xenstore::MemoryStore;

    const NODE: &str = "/local/domain/0/backend/vbd/1/768";

    fn backing(sectors: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0; sectors * 512]).unwrap();
        file
    }

    /// Returns a backend store with both watches registered and their
    /// initial events drained, and a second handle for driving it.
    fn stores() -> (MemoryStore, MemoryStore) {
        let mut backend = MemoryStore::new();
        let driver = backend.clone();
        backend
            .watch(&format!("{NODE}/media-present"), MEDIA_PRESENT_TOKEN)
            .unwrap();
        backend
            .watch(&format!("{NODE}/params"), PARAMS_TOKEN)
            .unwrap();
        while backend.has_pending_watch() {
            backend.read_watch().unwrap();
        }
        (backend, driver)
    }

    fn device(drive: &FakeDrive, path: &std::path::Path) -> Device {
        Device::new(Arc::new(drive.clone()) as Arc<dyn DriveControl>, path, true)
    }

    #[test]
    fn media_removed_and_inserted() {
        let file = backing(4);
        let drive = FakeDrive::file();
        let mut dev = device(&drive, file.path());
        dev.open().unwrap();
        let (mut backend, mut driver) = stores();

        driver
            .write(&format!("{NODE}/media-present"), "0")
            .unwrap();
        handle_watch(&mut dev, &mut backend);
        assert!(!dev.is_open());
        assert!(!dev.media().present);
        assert!(!dev.media().changed);

        driver
            .write(&format!("{NODE}/media-present"), "1")
            .unwrap();
        handle_watch(&mut dev, &mut backend);
        assert!(dev.is_open());
        assert!(dev.media().present);
        assert_eq!(dev.media().sector_count, 4);
        assert!(dev.take_changed());
    }

    #[test]
    fn params_switches_backing_path() {
        let old = backing(2);
        let new = backing(6);
        let drive = FakeDrive::file();
        let mut dev = device(&drive, old.path());
        dev.open().unwrap();
        let (mut backend, mut driver) = stores();

        let params = format!("ignored:{}", new.path().display());
        driver.write(&format!("{NODE}/params"), &params).unwrap();
        handle_watch(&mut dev, &mut backend);
        assert_eq!(dev.path(), new.path());
        assert_eq!(dev.media().sector_count, 6);
        assert!(dev.take_changed());
    }

    #[test]
    fn params_keeps_everything_after_first_separator() {
        let drive = FakeDrive::file();
        drive.with(|state| state.fail_open = true);
        let mut dev = device(&drive, std::path::Path::new("/dev/sr0"));
        let (mut backend, mut driver) = stores();

        driver
            .write(&format!("{NODE}/params"), "phy:/new/path:with-colon")
            .unwrap();
        handle_watch(&mut dev, &mut backend);
        assert_eq!(dev.path(), std::path::Path::new("/new/path:with-colon"));
        assert!(!dev.is_open());
        assert!(dev.take_changed());
    }

    #[test]
    fn params_without_separator_is_ignored() {
        let file = backing(2);
        let drive = FakeDrive::file();
        let mut dev = device(&drive, file.path());
        dev.open().unwrap();
        let (mut backend, mut driver) = stores();

        driver.write(&format!("{NODE}/params"), "/new/path").unwrap();
        handle_watch(&mut dev, &mut backend);
        assert_eq!(dev.path(), file.path());
        assert!(dev.is_open());
        assert!(!dev.media().changed);
    }

    #[test]
    fn read_failure_is_swallowed() {
        let file = backing(2);
        let drive = FakeDrive::file();
        let mut dev = device(&drive, file.path());
        dev.open().unwrap();
        let (mut backend, mut driver) = stores();

        driver
            .write(&format!("{NODE}/media-present"), "0")
            .unwrap();
        backend.set_fail_reads(true);
        handle_watch(&mut dev, &mut backend);
        assert!(dev.is_open());
        assert!(!backend.has_pending_watch());
    }

    #[test]
    fn handles_exactly_one_event() {
        let file = backing(2);
        let drive = FakeDrive::file();
        let mut dev = device(&drive, file.path());
        dev.open().unwrap();
        let (mut backend, mut driver) = stores();

        driver
            .write(&format!("{NODE}/media-present"), "0")
            .unwrap();
        driver
            .write(&format!("{NODE}/media-present"), "1")
            .unwrap();
        // The handler sees the current value, and leaves the second event
        // for the next notification.
        handle_watch(&mut dev, &mut backend);
        assert!(dev.is_open());
        assert!(dev.take_changed());
        assert!(backend.has_pending_watch());
    }

    #[test]
    fn no_pending_event() {
        let drive = FakeDrive::file();
        let mut dev = device(&drive, std::path::Path::new("/unused"));
        let mut backend = MemoryStore::new();
        handle_watch(&mut dev, &mut backend);
        assert!(drive.calls().is_empty());
    }
}
