use reqwest::header::CACHE_CONTROL;
use reqwest::Client;
use tracing::{debug, info, instrument};

use crate::error::UpdateError;
use crate::index::models::{FirmwareIndex, UpdatePlan};

/// Locates and interprets the remote firmware index.
///
/// The index lives at `{base_url}/{client}/{channel}/index.json` and maps
/// device model tokens to ordered firmware artifacts.
#[derive(Clone)]
pub struct IndexResolver {
    http: Client,
    base_url: String,
}

impl IndexResolver {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        // Avoid double slashes when callers configure a trailing one
        let base_url = base_url.trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    /// Resolve the update plan for one device.
    ///
    /// Returns an empty plan when `current_version` already equals the
    /// selected latest version. When the target declares an `apploader`
    /// prerequisite, the plan carries the prerequisite first.
    ///
    /// # Errors
    ///
    /// * `IndexUnavailable` - transport failure or non-2xx status.
    /// * `IndexMalformed` - body is not JSON of the expected shape, or
    ///   `latest`/`apploader` names a missing version key.
    /// * `DeviceUnknown` - `model` absent from the index.
    /// * `LatestUnknown` - no `latest` entry and more than one version.
    #[instrument(skip(self), fields(client = %client, model = %model, channel = %channel))]
    pub async fn resolve(
        &self,
        client: &str,
        model: &str,
        channel: &str,
        current_version: Option<&str>,
    ) -> Result<UpdatePlan, UpdateError> {
        let url = format!("{}/{}/{}/index.json", self.base_url, client, channel);
        debug!(%url, "fetching firmware index");

        // The index changes frequently; never accept a cached copy.
        let response = self
            .http
            .get(&url)
            .header(CACHE_CONTROL, "no-store")
            .send()
            .await
            .map_err(|e| UpdateError::IndexUnavailable {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::IndexUnavailable {
                reason: format!("unexpected status {status} from {url}"),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| UpdateError::IndexUnavailable {
                reason: e.to_string(),
            })?;

        let index: FirmwareIndex =
            serde_json::from_slice(&body).map_err(|e| UpdateError::IndexMalformed {
                reason: e.to_string(),
            })?;

        let device = index.get(model).ok_or_else(|| UpdateError::DeviceUnknown {
            model: model.to_string(),
        })?;

        let latest = device
            .latest_key()
            .ok_or_else(|| UpdateError::LatestUnknown {
                model: model.to_string(),
            })?;

        if current_version == Some(latest) {
            info!(version = %latest, "device already on latest firmware");
            return Ok(UpdatePlan::default());
        }

        let target = device
            .materialise(latest)
            .ok_or_else(|| UpdateError::IndexMalformed {
                reason: format!("latest '{latest}' names a missing version key"),
            })?;

        let mut images = Vec::with_capacity(2);
        if let Some(prerequisite) = target.apploader.as_deref() {
            let apploader =
                device
                    .materialise(prerequisite)
                    .ok_or_else(|| UpdateError::IndexMalformed {
                        reason: format!("apploader '{prerequisite}' names a missing version key"),
                    })?;
            debug!(apploader = %prerequisite, "target requires apploader prerequisite");
            images.push(apploader);
        }
        images.push(target);

        info!(images = images.len(), version = %latest, "update plan resolved");
        Ok(UpdatePlan::new(images))
    }
}
