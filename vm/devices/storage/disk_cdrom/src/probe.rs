// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Media presence and geometry of a backing target.

use crate::drive::DeviceKind;
use crate::drive::DriveControl;
use crate::drive::DriveStatus;
use std::fs;

/// Block I/O is always done in units of this many bytes, whatever the
/// native sector size of the target.
pub const IO_SECTOR_SIZE: u64 = 512;

/// Sector size reported for optical media when the drive does not say.
pub const DEFAULT_SECTOR_SIZE: u32 = 2048;

/// Sector count reported for a drive whose disc cannot be sized: a
/// placeholder for the largest disc the guest might see.
pub const ASSUMED_DISC_SECTORS: u64 = 2_000_000_000;

/// Media state of a backend.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MediaState {
    pub present: bool,
    /// Sticky until read through the media changed query.
    pub changed: bool,
    /// Size in 512-byte sectors.
    pub sector_count: u64,
    pub sector_size: u32,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            present: false,
            changed: false,
            sector_count: 0,
            sector_size: DEFAULT_SECTOR_SIZE,
        }
    }
}

/// The outcome of probing an open descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Probe {
    /// `None` if the target could not be classified.
    pub kind: Option<DeviceKind>,
    pub media: MediaState,
}

/// Classifies `file` and measures the media behind it.
///
/// Probing never fails. Anything that cannot be determined is left at the
/// [`MediaState`] defaults, which report no media.
pub fn probe(drive: &dyn DriveControl, file: &fs::File) -> Probe {
    let mut media = MediaState::default();
    let kind = match drive.kind(file) {
        Ok(kind) => kind,
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to classify backing target"
            );
            return Probe { kind: None, media };
        }
    };

    match kind {
        DeviceKind::File => match file.metadata() {
            Ok(metadata) => {
                media.present = true;
                media.sector_size = IO_SECTOR_SIZE as u32;
                media.sector_count = metadata.len() / IO_SECTOR_SIZE;
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to size backing file"
                );
            }
        },
        DeviceKind::Block => probe_drive(drive, file, &mut media),
    }

    tracing::debug!(?kind, ?media, "probed backing target");
    Probe {
        kind: Some(kind),
        media,
    }
}

fn probe_drive(drive: &dyn DriveControl, file: &fs::File, media: &mut MediaState) {
    let status = drive.drive_status(file).unwrap_or_else(|err| {
        tracing::debug!(
            error = &err as &dyn std::error::Error,
            "drive status query failed"
        );
        DriveStatus::NO_INFO
    });

    if status != DriveStatus::DISC_OK {
        tracing::debug!(?status, "no disc in drive");
        media.sector_count = ASSUMED_DISC_SECTORS;
        return;
    }

    media.present = true;
    media.sector_count = match drive.sector_count(file) {
        Ok(count) => count,
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to size disc, assuming a full disc"
            );
            ASSUMED_DISC_SECTORS
        }
    };
    media.sector_size = match drive.sector_size(file) {
        Ok(size) if size != 0 => size,
        _ => DEFAULT_SECTOR_SIZE,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::DriveCall;
    use crate::test_helpers::FakeDrive;
    use std::io::Write;
    use test_log::test;

    fn open(drive: &FakeDrive, file: &tempfile::NamedTempFile) -> fs::File {
        drive.open_path(file.path())
    }

    #[test]
    fn plain_file_geometry() {
        let drive = FakeDrive::file();
        let mut backing = tempfile::NamedTempFile::new().unwrap();
        backing.write_all(&[0; 512 * 3 + 100]).unwrap();
        let file = open(&drive, &backing);

        let probe = probe(&drive, &file);
        assert_eq!(probe.kind, Some(DeviceKind::File));
        assert_eq!(
            probe.media,
            MediaState {
                present: true,
                changed: false,
                sector_count: 3,
                sector_size: 512,
            }
        );
    }

    #[test]
    fn drive_with_native_sector_size() {
        let drive = FakeDrive::disc(1_000, Some(4096));
        let backing = tempfile::NamedTempFile::new().unwrap();
        let file = open(&drive, &backing);

        let probe = probe(&drive, &file);
        assert_eq!(probe.kind, Some(DeviceKind::Block));
        assert!(probe.media.present);
        assert_eq!(probe.media.sector_count, 1_000);
        assert_eq!(probe.media.sector_size, 4096);
    }

    #[test]
    fn drive_sector_size_fallback() {
        for reported in [None, Some(0), Some(2048)] {
            let drive = FakeDrive::disc(64, reported);
            let backing = tempfile::NamedTempFile::new().unwrap();
            let file = open(&drive, &backing);
            assert_eq!(probe(&drive, &file).media.sector_size, 2048);
        }
    }

    #[test]
    fn drive_size_query_failure() {
        let drive = FakeDrive::disc(64, None);
        drive.with(|state| state.sector_count = None);
        let backing = tempfile::NamedTempFile::new().unwrap();
        let file = open(&drive, &backing);

        let media = probe(&drive, &file).media;
        assert!(media.present);
        assert_eq!(media.sector_count, ASSUMED_DISC_SECTORS);
    }

    #[test]
    fn empty_drive() {
        let drive = FakeDrive::empty_tray();
        let backing = tempfile::NamedTempFile::new().unwrap();
        let file = open(&drive, &backing);

        let media = probe(&drive, &file).media;
        assert!(!media.present);
        assert_eq!(media.sector_count, ASSUMED_DISC_SECTORS);
        assert_eq!(media.sector_size, DEFAULT_SECTOR_SIZE);
        assert!(!drive.calls().contains(&DriveCall::SectorCount));
    }

    #[test]
    fn unclassifiable_target() {
        let drive = FakeDrive::file();
        drive.with(|state| state.kind = None);
        let backing = tempfile::NamedTempFile::new().unwrap();
        let file = open(&drive, &backing);

        let probe = probe(&drive, &file);
        assert_eq!(probe.kind, None);
        assert_eq!(probe.media, MediaState::default());
    }
}
