pub mod artifact;
pub mod ble;
pub mod error;
pub mod index;
pub mod orchestrator;
pub mod protocol;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::artifact::ArtifactStore;
use crate::ble::BleTransport;
use crate::error::UpdateError;
use crate::index::models::FirmwareInfo;
use crate::index::resolver::IndexResolver;
use crate::orchestrator::{Orchestrator, UpdateHooks, UpdateOutcome, UpdateParams};

/// Release track consulted when none is given.
pub const DEFAULT_CHANNEL: &str = "prod";
/// Index origin consulted when none is configured.
pub const DEFAULT_BASE_URL: &str = "https://firmware.geckota.dev";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Customer identifier segment of the index layout.
    #[clap(long, env)]
    pub client: String,
    /// Device model token to look up in the index.
    #[clap(long, env)]
    pub model: String,
    #[clap(long, env, default_value = DEFAULT_CHANNEL)]
    pub channel: String,
    #[clap(long, env, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,
    /// Version currently installed on the device, if known.
    #[clap(long, env)]
    pub current_version: Option<String>,
    #[clap(long, env, default_value = "info")]
    log_level: LevelFilter,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve the update plan and print it as JSON.
    Plan,
    /// Download the planned artifacts and print their local paths.
    Fetch {
        /// Check each artifact against the MD5 advertised by the index.
        #[clap(long)]
        verify_md5: bool,
    },
}

/// Runs the `geckota` CLI with the provided configuration.
///
/// Initializes logging, resolves the update plan for the requested
/// device, and either prints it or downloads the artifacts. Flashing
/// requires an injected BLE transport and goes through [`start_dfu`].
///
/// # Errors
///
/// Returns an error when the index cannot be resolved or an artifact
/// cannot be downloaded.
pub async fn run(cli: Cli) -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(cli.log_level)
        .with(fmt::layer())
        .init();

    let http = http_client()?;
    let resolver = IndexResolver::new(http.clone(), cli.base_url);
    let plan = resolver
        .resolve(
            &cli.client,
            &cli.model,
            &cli.channel,
            cli.current_version.as_deref(),
        )
        .await?;

    match cli.command {
        Command::Plan => {
            println!("{}", serde_json::to_string_pretty(plan.images())?);
        }
        Command::Fetch { verify_md5 } => {
            if plan.is_empty() {
                info!("device already on latest firmware, nothing to fetch");
                return Ok(());
            }
            let store = ArtifactStore::new(http);
            for image in plan.images() {
                let artifact = store.download(image, verify_md5).await?;
                let len = artifact.len();
                let path = artifact.into_path()?;
                println!("{}\t{}\t{}", image.version, len, path.display());
            }
        }
    }

    Ok(())
}

/// Resolve the newest applicable firmware for a device, returning the
/// artifacts in application order (apploader prerequisite first).
///
/// An empty list means the device is already on the latest version.
///
/// # Errors
///
/// See [`IndexResolver::resolve`].
pub async fn get_latest_fw_info(
    client_name: &str,
    model: &str,
    current_version: Option<&str>,
    channel: Option<&str>,
    base_url: Option<&str>,
) -> Result<Vec<FirmwareInfo>, UpdateError> {
    let http = http_client().map_err(|e| UpdateError::Unknown(e.to_string()))?;
    let resolver = IndexResolver::new(http, base_url.unwrap_or(DEFAULT_BASE_URL));
    let plan = resolver
        .resolve(
            client_name,
            model,
            channel.unwrap_or(DEFAULT_CHANNEL),
            current_version,
        )
        .await?;
    Ok(plan.into_images())
}

/// Download one firmware artifact to local storage and return its path.
///
/// The file is detached from the session; cleanup is the caller's
/// responsibility.
///
/// # Errors
///
/// `BundleUnavailable` on transport failure or non-200 status.
pub async fn download_fw(info: &FirmwareInfo) -> Result<PathBuf, UpdateError> {
    let http = http_client().map_err(|e| UpdateError::Unknown(e.to_string()))?;
    let store = ArtifactStore::new(http);
    store.download(info, false).await?.into_path()
}

/// Run a full update session against one peripheral.
///
/// `ble` must already be bound to the peripheral named by
/// `peripheral_id`; the engine assumes exclusive ownership of the link
/// for the duration of the session.
///
/// # Errors
///
/// Resolver and download failures only; protocol failures classify the
/// outcome as `Failure` instead of erroring (see [`Orchestrator::run`]).
pub async fn start_dfu(
    peripheral_id: &str,
    ble: Arc<dyn BleTransport>,
    params: UpdateParams,
    hooks: UpdateHooks,
) -> Result<UpdateOutcome, UpdateError> {
    info!(peripheral = %peripheral_id, model = %params.model, "starting DFU session");
    let http = http_client().map_err(|e| UpdateError::Unknown(e.to_string()))?;
    Orchestrator::new(http, ble, params).run(&hooks).await
}

fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("geckota/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build()
        .context("building HTTP client failed")
}
