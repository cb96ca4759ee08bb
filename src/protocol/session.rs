use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::ble::{BleError, BleTransport};
use crate::error::ProtocolError;

use super::{
    block_size, SessionTiming, BOOTLOADER_VERSION_UUID, CTL_CLOSE, CTL_DONE, CTL_START,
    OTA_CONTROL_UUID, OTA_DATA_UUID, OTA_SERVICE_UUID, REQUESTED_MTU,
};

/// Position of the session in the bootloader protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    ConfirmDfu,
    RebootingToDfu,
    Reconnecting,
    Ready,
    Uploading,
    Finalising,
    Done,
}

/// Drives one firmware image through the Gecko OTA bootloader.
///
/// Exactly one session exists per peripheral at a time; the session
/// assumes exclusive ownership of the link. Ordering among GATT
/// operations is load-bearing: every write is issued only after the
/// previous one completed, even on the write-without-response path.
pub struct OtaSession {
    ble: Arc<dyn BleTransport>,
    timing: SessionTiming,
    cancel: CancellationToken,
    state: SessionState,
    block_size: usize,
}

impl OtaSession {
    pub fn new(
        ble: Arc<dyn BleTransport>,
        timing: SessionTiming,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ble,
            timing,
            cancel,
            state: SessionState::Idle,
            block_size: 1,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply one image end to end and return the number of bytes written.
    ///
    /// With `skip_reboot` the peripheral is assumed to already run the
    /// bootloader; the session confirms that by reading the bootloader
    /// version and only falls back to the reboot path when the read
    /// fails. The image counts as applied when bytes written equal the
    /// image length; the termination handshake is best-effort.
    #[instrument(skip(self, image, on_progress), fields(bytes = image.len(), skip_reboot))]
    pub async fn flash(
        &mut self,
        image: &[u8],
        skip_reboot: bool,
        on_progress: &mut dyn FnMut(f64),
    ) -> Result<usize, ProtocolError> {
        self.checkpoint()?;
        self.attach_initial().await?;

        if skip_reboot {
            self.state = SessionState::ConfirmDfu;
            match self.read_bootloader_version().await {
                Ok(version) => {
                    debug!(version = ?version, "peripheral already in DFU mode");
                    self.state = SessionState::Ready;
                }
                Err(e) => {
                    // Not in DFU after all; reattempt via the reboot path.
                    warn!(error = %e, "bootloader version unreadable, rebooting into DFU");
                    self.reboot_into_dfu().await?;
                }
            }
        } else {
            self.reboot_into_dfu().await?;
        }

        self.checkpoint()?;
        let written = self.upload(image, on_progress).await?;
        if written != image.len() {
            return Err(ProtocolError::ShortWrite {
                written,
                total: image.len(),
            });
        }

        self.finalise().await;
        self.state = SessionState::Done;
        info!(written, "image applied");
        Ok(written)
    }

    /// First attach of the session: Connecting -> Connected.
    async fn attach_initial(&mut self) -> Result<(), ProtocolError> {
        self.state = SessionState::Connecting;
        self.attach().await.map_err(ProtocolError::ConnectFailed)?;
        self.state = SessionState::Connected;
        Ok(())
    }

    /// The full (re)connect cycle: drop whatever the transport thinks it
    /// has, let the link settle, connect with the MTU hint, rediscover,
    /// and read back the negotiated MTU.
    async fn attach(&mut self) -> Result<(), BleError> {
        if let Err(e) = self.ble.cancel_connection().await {
            trace!(error = %e, "pre-connect cancel");
        }
        sleep(self.timing.settle).await;

        self.ble.connect(REQUESTED_MTU).await?;
        self.ble.discover_services().await?;
        let mtu = self.ble.request_mtu(REQUESTED_MTU).await?;
        self.block_size = block_size(mtu);
        debug!(mtu, block = self.block_size, "link negotiated");
        Ok(())
    }

    /// RebootingToDfu -> Reconnecting -> Ready.
    async fn reboot_into_dfu(&mut self) -> Result<(), ProtocolError> {
        self.state = SessionState::RebootingToDfu;
        info!("requesting reboot into DFU mode");

        self.control_write(CTL_START)
            .await
            .map_err(ProtocolError::RebootFailed)?;
        if let Err(e) = self.ble.cancel_connection().await {
            trace!(error = %e, "post-reboot-request cancel");
        }
        sleep(self.timing.reboot_delay).await;
        self.checkpoint()?;

        // DFU mode exposes a different GATT database; rediscovery is not
        // optional here.
        self.state = SessionState::Reconnecting;
        self.attach().await.map_err(ProtocolError::ConnectFailed)?;
        let version = self
            .read_bootloader_version()
            .await
            .map_err(ProtocolError::ConnectFailed)?;
        debug!(version = ?version, "DFU mode confirmed");

        self.state = SessionState::Ready;
        Ok(())
    }

    /// Ready -> Uploading: arm the bootloader, then stream the image in
    /// block-sized writes, strictly in order.
    async fn upload(
        &mut self,
        image: &[u8],
        on_progress: &mut dyn FnMut(f64),
    ) -> Result<usize, ProtocolError> {
        self.state = SessionState::Uploading;
        let total = image.len();

        self.control_write(CTL_START)
            .await
            .map_err(|e| ProtocolError::WriteFailed {
                written: 0,
                total,
                source: e,
            })?;

        info!(total, block = self.block_size, "streaming image");
        let mut written = 0usize;
        for chunk in image.chunks(self.block_size) {
            self.checkpoint()?;
            self.ble
                .write_without_response(OTA_SERVICE_UUID, OTA_DATA_UUID, chunk)
                .await
                .map_err(|e| ProtocolError::WriteFailed {
                    written,
                    total,
                    source: e,
                })?;
            written += chunk.len();
            trace!(written, total, "block written");
            on_progress(written as f64 / total as f64);
        }

        Ok(written)
    }

    /// Termination handshake. Some peripherals do not close reliably, so
    /// every step is best-effort and the connection is cancelled anyway.
    async fn finalise(&mut self) {
        self.state = SessionState::Finalising;
        sleep(self.timing.settle).await;

        if let Err(e) = self
            .ble
            .write_with_response(OTA_SERVICE_UUID, OTA_CONTROL_UUID, &[CTL_DONE])
            .await
        {
            warn!(error = %e, "end-of-upload write failed");
        }
        sleep(self.timing.settle).await;

        if let Err(e) = self
            .ble
            .write_without_response(OTA_SERVICE_UUID, OTA_CONTROL_UUID, &[CTL_CLOSE])
            .await
        {
            warn!(error = %e, "close request failed");
        }

        // The target is expected to initiate the disconnect on CTL_CLOSE.
        if let Err(e) = self.ble.cancel_connection().await {
            debug!(error = %e, "post-upload disconnect");
        }
    }

    async fn read_bootloader_version(&self) -> Result<Vec<u8>, BleError> {
        self.ble
            .read_characteristic(OTA_SERVICE_UUID, BOOTLOADER_VERSION_UUID)
            .await
    }

    /// Control write with response, followed by the courtesy settling
    /// delay the protocol requires.
    async fn control_write(&self, word: u8) -> Result<(), BleError> {
        self.ble
            .write_with_response(OTA_SERVICE_UUID, OTA_CONTROL_UUID, &[word])
            .await?;
        sleep(self.timing.settle).await;
        Ok(())
    }

    /// Cooperative cancellation point.
    fn checkpoint(&self) -> Result<(), ProtocolError> {
        if self.cancel.is_cancelled() {
            Err(ProtocolError::Cancelled)
        } else {
            Ok(())
        }
    }
}
