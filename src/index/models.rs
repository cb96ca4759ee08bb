use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One downloadable artifact as advertised by the index, keyed by version.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct FirmwareEntry {
    pub name: String,
    pub url: String,
    pub md5: String,
    /// Version key of a prerequisite artifact within the same model entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apploader: Option<String>,
}

/// Per-model section of the index: the distinguished `latest` pointer plus
/// one entry per version key.
#[derive(Clone, Debug, Deserialize)]
pub struct DeviceFirmware {
    #[serde(default)]
    pub latest: Option<String>,
    #[serde(flatten)]
    pub versions: HashMap<String, FirmwareEntry>,
}

impl DeviceFirmware {
    /// The version key an update should target.
    ///
    /// The index historically omits `latest` for single-version entries;
    /// that exact case is tolerated and nothing more. Version strings are
    /// opaque and never ordered.
    pub fn latest_key(&self) -> Option<&str> {
        if let Some(latest) = self.latest.as_deref() {
            return Some(latest);
        }
        if self.versions.len() == 1 {
            return self.versions.keys().next().map(String::as_str);
        }
        None
    }

    /// Materialise the entry filed under `version`, stamping the version
    /// key into the result.
    pub fn materialise(&self, version: &str) -> Option<FirmwareInfo> {
        self.versions.get(version).map(|entry| FirmwareInfo {
            name: entry.name.clone(),
            version: version.to_string(),
            url: entry.url.clone(),
            md5: entry.md5.clone(),
            apploader: entry.apploader.clone(),
        })
    }
}

/// Top level of `index.json`: model token to firmware listing.
pub type FirmwareIndex = HashMap<String, DeviceFirmware>;

/// A fully resolved artifact reference.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub name: String,
    /// Opaque version string, compared by equality only.
    pub version: String,
    pub url: String,
    pub md5: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apploader: Option<String>,
}

/// Ordered artifacts for one update; a prerequisite always precedes the
/// artifact that declares it. Immutable once produced.
#[derive(Clone, Debug, Default)]
pub struct UpdatePlan {
    images: Vec<FirmwareInfo>,
}

impl UpdatePlan {
    pub(crate) fn new(images: Vec<FirmwareInfo>) -> Self {
        Self { images }
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn images(&self) -> &[FirmwareInfo] {
        &self.images
    }

    pub fn into_images(self) -> Vec<FirmwareInfo> {
        self.images
    }
}
