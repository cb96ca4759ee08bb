//! Gecko OTA GATT profile: fixed identifiers, control words and the
//! timing contract of the bootloader protocol.

pub mod session;

use std::time::Duration;
use uuid::Uuid;

/// Gecko OTA service.
pub const OTA_SERVICE_UUID: Uuid = Uuid::from_u128(0x1d14d6ee_fd63_4fa1_bfa4_8f47b42119f0);
/// OTA Control characteristic (1 byte, writeable).
pub const OTA_CONTROL_UUID: Uuid = Uuid::from_u128(0xf7bf3564_fb6d_4e53_88a4_5e37e0326063);
/// OTA Data characteristic (variable length, write-without-response).
pub const OTA_DATA_UUID: Uuid = Uuid::from_u128(0x984227f3_34fc_4045_a5d0_2c581f81a153);
/// Gecko bootloader version; readable only once the bootloader is running.
pub const BOOTLOADER_VERSION_UUID: Uuid = Uuid::from_u128(0x25f05c0a_e917_46e9_b2a5_aa2be1245afe);

/// Arm the bootloader, or request a reboot into DFU when written from
/// application mode.
pub const CTL_START: u8 = 0x00;
/// End of upload.
pub const CTL_DONE: u8 = 0x03;
/// Ask the target to drop the connection.
pub const CTL_CLOSE: u8 = 0x04;

/// ATT MTU requested on every connect.
pub const REQUESTED_MTU: u16 = 245;

/// ATT header overhead subtracted from the negotiated MTU per data write.
const ATT_OVERHEAD: u16 = 8;

/// Payload size of each OTA Data write for a negotiated MTU.
pub fn block_size(mtu: u16) -> usize {
    mtu.saturating_sub(ATT_OVERHEAD).max(1) as usize
}

/// Protocol pacing. The defaults are part of the protocol contract: some
/// peripherals need the settling time and will corrupt the session
/// without it. Tests inject shorter values.
#[derive(Clone, Copy, Debug)]
pub struct SessionTiming {
    /// Pause after each control write and before each connect attempt.
    pub settle: Duration,
    /// Window granted to the peripheral to reboot between modes.
    pub reboot_delay: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(1),
            reboot_delay: Duration::from_millis(2500),
        }
    }
}
