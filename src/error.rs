use thiserror::Error;

use crate::ble::BleError;

/// Stable numeric codes surfaced to callers alongside the typed variants.
pub mod code {
    pub const INDEX_UNAVAILABLE: i32 = -1000;
    pub const INDEX_MALFORMED: i32 = -1001;
    pub const DEVICE_UNKNOWN: i32 = -1002;
    pub const LATEST_UNKNOWN: i32 = -1100;
    pub const BUNDLE_UNAVAILABLE: i32 = -2000;
    pub const UNKNOWN_ERROR: i32 = -9999;
}

/// Failure of an update run, classified per subsystem.
///
/// Resolver and download failures carry their own kinds; anything the
/// protocol engine or a transport surfaces that has no dedicated band
/// collapses into `Unknown`.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Transport failure or non-2xx status retrieving the firmware index.
    #[error("firmware index unavailable: {reason}")]
    IndexUnavailable { reason: String },

    /// Index body is not JSON or does not match the expected shape.
    #[error("firmware index malformed: {reason}")]
    IndexMalformed { reason: String },

    /// Model token absent from the index.
    #[error("model '{model}' not present in firmware index")]
    DeviceUnknown { model: String },

    /// No `latest` entry and more than one version key to choose from.
    #[error("cannot determine latest firmware version for model '{model}'")]
    LatestUnknown { model: String },

    /// Transport failure or non-200 status downloading one artifact.
    #[error("firmware bundle unavailable: {reason}")]
    BundleUnavailable { reason: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("update failed: {0}")]
    Unknown(String),
}

impl UpdateError {
    /// The stable numeric code for this failure (see [`code`]).
    pub fn code(&self) -> i32 {
        match self {
            UpdateError::IndexUnavailable { .. } => code::INDEX_UNAVAILABLE,
            UpdateError::IndexMalformed { .. } => code::INDEX_MALFORMED,
            UpdateError::DeviceUnknown { .. } => code::DEVICE_UNKNOWN,
            UpdateError::LatestUnknown { .. } => code::LATEST_UNKNOWN,
            UpdateError::BundleUnavailable { .. } => code::BUNDLE_UNAVAILABLE,
            UpdateError::Protocol(_) | UpdateError::Unknown(_) => code::UNKNOWN_ERROR,
        }
    }
}

/// Failure inside the per-image bootloader state machine.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Connect, discovery or MTU negotiation failed.
    #[error("connection to peripheral failed: {0}")]
    ConnectFailed(#[source] BleError),

    /// The reboot-into-DFU control write was rejected.
    #[error("could not reboot peripheral into DFU mode: {0}")]
    RebootFailed(#[source] BleError),

    /// A control or data write failed mid-upload.
    #[error("data write failed after {written} of {total} bytes: {source}")]
    WriteFailed {
        written: usize,
        total: usize,
        #[source]
        source: BleError,
    },

    /// Upload finished without covering the whole image.
    #[error("short upload: wrote {written} of {total} bytes")]
    ShortWrite { written: usize, total: usize },

    /// The session-wide cancellation flag was observed.
    #[error("update cancelled")]
    Cancelled,
}
