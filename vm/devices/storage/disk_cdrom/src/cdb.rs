// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The few SCSI command descriptor blocks the relay interprets itself.

use bitfield_struct::bitfield;

pub const SCSI_MEDIUM_REMOVAL: u8 = 0x1E;
pub const SCSI_START_STOP_UNIT: u8 = 0x1B;

/// Byte 4 of START STOP UNIT.
#[bitfield(u8)]
pub struct StartStopFlags {
    pub start: bool,
    pub load_eject: bool,
    #[bits(6)]
    pub reserved: u8,
}

/// Byte 4 of PREVENT ALLOW MEDIUM REMOVAL.
#[bitfield(u8)]
pub struct MediaRemovalFlags {
    pub prevent: bool,
    pub persistent: bool,
    #[bits(6)]
    pub reserved: u8,
}

/// What a START STOP UNIT command asks of the tray.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrayAction {
    Eject,
    Close,
    None,
}

impl StartStopFlags {
    pub fn tray_action(&self) -> TrayAction {
        match (self.load_eject(), self.start()) {
            (true, false) => TrayAction::Eject,
            (true, true) => TrayAction::Close,
            (false, _) => TrayAction::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_stop_byte4() {
        assert_eq!(StartStopFlags::from(0b01).tray_action(), TrayAction::None);
        assert_eq!(StartStopFlags::from(0b10).tray_action(), TrayAction::Eject);
        assert_eq!(StartStopFlags::from(0b11).tray_action(), TrayAction::Close);
        assert_eq!(StartStopFlags::from(0b00).tray_action(), TrayAction::None);
        // Power condition bits are not ours to interpret.
        assert_eq!(StartStopFlags::from(0x12).tray_action(), TrayAction::Eject);
    }

    #[test]
    fn removal_prevent_bit() {
        assert!(MediaRemovalFlags::from(0x01).prevent());
        assert!(!MediaRemovalFlags::from(0x02).prevent());
    }
}
