use reqwest::Client;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::artifact::{ArtifactStore, DownloadedArtifact};
use crate::ble::BleTransport;
use crate::error::{ProtocolError, UpdateError};
use crate::index::resolver::IndexResolver;
use crate::protocol::session::OtaSession;
use crate::protocol::SessionTiming;

/// Terminal disposition of an update run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Success,
    Failure,
    NoUpdate,
}

impl UpdateOutcome {
    /// Numeric surface kept stable for callers: 1 success, 0 failure,
    /// -1 no update required.
    pub fn as_code(self) -> i32 {
        match self {
            UpdateOutcome::Success => 1,
            UpdateOutcome::Failure => 0,
            UpdateOutcome::NoUpdate => -1,
        }
    }
}

/// Which end of the plan is flashed first.
///
/// The deployed fleet applies the plan back to front (the application
/// image before its apploader prerequisite), so that is the default;
/// flip to `PlanOrder` only for devices verified to expect the
/// prerequisite first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ApplyOrder {
    PlanOrder,
    #[default]
    ReversePlanOrder,
}

/// Inputs of one update run.
#[derive(Clone, Debug)]
pub struct UpdateParams {
    pub client: String,
    pub model: String,
    pub channel: String,
    pub base_url: String,
    /// Version currently installed on the device, if known.
    pub current_version: Option<String>,
    /// The device is already running the bootloader; skip the initial
    /// reboot-into-DFU round trip.
    pub is_in_ota: bool,
    pub apply_order: ApplyOrder,
    /// Check each artifact against the MD5 advertised by the index.
    pub verify_md5: bool,
}

impl UpdateParams {
    pub fn new(
        client: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: client.into(),
            model: model.into(),
            channel: crate::DEFAULT_CHANNEL.to_string(),
            base_url: base_url.into(),
            current_version: None,
            is_in_ota: false,
            apply_order: ApplyOrder::default(),
            verify_md5: false,
        }
    }
}

type ProgressFn = dyn Fn(f64) + Send + Sync;
type StatusFn = dyn Fn(&str) + Send + Sync;

/// Caller-supplied observers. Progress ratios are monotonic within one
/// image and restart at zero for each image; status strings are opaque.
#[derive(Default)]
pub struct UpdateHooks {
    progress: Option<Box<ProgressFn>>,
    status: Option<Box<StatusFn>>,
}

impl UpdateHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn on_status(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.status = Some(Box::new(f));
        self
    }

    fn progress(&self, ratio: f64) {
        if let Some(f) = &self.progress {
            f(ratio.clamp(0.0, 1.0));
        }
    }

    fn status(&self, message: &str) {
        if let Some(f) = &self.status {
            f(message);
        }
    }
}

/// Top-level driver: resolve, download, flash every image of the plan,
/// classify the outcome.
pub struct Orchestrator {
    resolver: IndexResolver,
    store: ArtifactStore,
    ble: Arc<dyn BleTransport>,
    params: UpdateParams,
    timing: SessionTiming,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(http: Client, ble: Arc<dyn BleTransport>, params: UpdateParams) -> Self {
        let resolver = IndexResolver::new(http.clone(), params.base_url.clone());
        Self {
            resolver,
            store: ArtifactStore::new(http),
            ble,
            params,
            timing: SessionTiming::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Override the protocol pacing. The defaults are the protocol
    /// contract; tests inject shorter values.
    pub fn with_timing(mut self, timing: SessionTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Token observed at every cooperative point of the run. Cancelling
    /// it abandons the session cleanly and yields `Failure`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the update to completion.
    ///
    /// Resolver and download failures terminate the run with their
    /// corresponding error kind. Protocol failures never surface as
    /// errors: each image is retried exactly once after a full reconnect
    /// cycle, and a second failure classifies the run as `Failure`.
    ///
    /// # Errors
    ///
    /// Only the kinds of [`UpdateError`] that carry index/bundle bands;
    /// see `UpdateError::code`.
    #[instrument(skip(self, hooks), fields(model = %self.params.model, channel = %self.params.channel))]
    pub async fn run(&self, hooks: &UpdateHooks) -> Result<UpdateOutcome, UpdateError> {
        hooks.status("resolving firmware index");
        let plan = self
            .resolver
            .resolve(
                &self.params.client,
                &self.params.model,
                &self.params.channel,
                self.params.current_version.as_deref(),
            )
            .await?;

        if plan.is_empty() {
            info!("no update required");
            hooks.status("already up to date");
            hooks.progress(1.0);
            return Ok(UpdateOutcome::NoUpdate);
        }

        // Materialise every artifact before touching the peripheral.
        let mut artifacts = Vec::with_capacity(plan.len());
        for image in plan.images() {
            hooks.status(&format!("downloading {} {}", image.name, image.version));
            artifacts.push(self.store.download(image, self.params.verify_md5).await?);
        }

        let order: Vec<usize> = match self.params.apply_order {
            ApplyOrder::PlanOrder => (0..artifacts.len()).collect(),
            ApplyOrder::ReversePlanOrder => (0..artifacts.len()).rev().collect(),
        };

        let mut skip_reboot = self.params.is_in_ota;
        for (applied, index) in order.into_iter().enumerate() {
            let artifact = &artifacts[index];

            if applied > 0 {
                // The device re-enters DFU on its own between parts of a
                // multi-part update; grant it the reboot window.
                hooks.status("waiting for device reboot");
                sleep(self.timing.reboot_delay).await;
                skip_reboot = true;
            }

            hooks.status(&format!(
                "flashing {} {}",
                artifact.info().name,
                artifact.info().version
            ));
            if let Err(e) = self.flash_with_retry(artifact, skip_reboot, hooks).await {
                error!(error = %e, image = %artifact.info().version, "image failed after retry");
                hooks.status(&format!("update failed: {e}"));
                return Ok(UpdateOutcome::Failure);
            }
        }

        hooks.status("update complete");
        Ok(UpdateOutcome::Success)
    }

    /// Flash one image, retrying exactly once after a full reconnect
    /// cycle.
    async fn flash_with_retry(
        &self,
        artifact: &DownloadedArtifact,
        skip_reboot: bool,
        hooks: &UpdateHooks,
    ) -> Result<(), UpdateError> {
        // Local storage going away mid-session is not worth a retry.
        let image = artifact.read_image().await?;

        // Drop any half-open link before the first attempt.
        if let Err(e) = self.ble.cancel_connection().await {
            debug!(error = %e, "pre-flash cancel");
        }

        let first = self.flash_once(&image, skip_reboot, hooks).await;
        let Err(first_error) = first else {
            return Ok(());
        };
        if matches!(first_error, ProtocolError::Cancelled) {
            return Err(first_error.into());
        }

        warn!(error = %first_error, "image attempt failed, retrying once");
        hooks.status("retrying image");
        if let Err(e) = self.ble.cancel_connection().await {
            debug!(error = %e, "pre-retry cancel");
        }
        sleep(self.timing.reboot_delay).await;

        self.flash_once(&image, skip_reboot, hooks)
            .await
            .map_err(UpdateError::from)
    }

    async fn flash_once(
        &self,
        image: &[u8],
        skip_reboot: bool,
        hooks: &UpdateHooks,
    ) -> Result<(), ProtocolError> {
        let mut session = OtaSession::new(Arc::clone(&self.ble), self.timing, self.cancel.clone());
        session
            .flash(image, skip_reboot, &mut |ratio| hooks.progress(ratio))
            .await?;
        Ok(())
    }
}
