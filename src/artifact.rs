use bytes::Bytes;
use md5::{Digest, Md5};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use crate::error::UpdateError;
use crate::index::models::FirmwareInfo;

/// Downloads index artifacts into the host's temporary area.
///
/// Each download gets a fresh `.gbl` path; nothing is deduplicated by URL.
#[derive(Clone)]
pub struct ArtifactStore {
    http: Client,
}

/// One artifact materialised on local storage.
///
/// The backing temp file is removed when this value is dropped, so the
/// path stays valid for the lifetime of the update session and no longer.
#[derive(Debug)]
pub struct DownloadedArtifact {
    info: FirmwareInfo,
    path: PathBuf,
    len: u64,
    file: NamedTempFile,
}

impl DownloadedArtifact {
    pub fn info(&self) -> &FirmwareInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte length as observed from a filesystem stat after the write.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the whole image back into memory for upload.
    pub async fn read_image(&self) -> Result<Bytes, UpdateError> {
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|e| UpdateError::Unknown(format!("read {}: {e}", self.path.display())))?;
        Ok(Bytes::from(data))
    }

    /// Detach the file from the session so it survives on disk, returning
    /// its path. Cleanup becomes the caller's responsibility.
    pub fn into_path(self) -> Result<PathBuf, UpdateError> {
        let path = self.path;
        self.file
            .keep()
            .map_err(|e| UpdateError::Unknown(format!("persist {}: {e}", path.display())))?;
        Ok(path)
    }
}

impl ArtifactStore {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// Download one artifact, streaming the body to a fresh `.gbl` file.
    ///
    /// With `verify_md5` set, the digest is computed while streaming and
    /// compared against the value advertised by the index.
    ///
    /// # Errors
    ///
    /// `BundleUnavailable` on transport failure, non-200 status or digest
    /// mismatch; `Unknown` on local filesystem failures.
    #[instrument(skip(self, info), fields(name = %info.name, version = %info.version))]
    pub async fn download(
        &self,
        info: &FirmwareInfo,
        verify_md5: bool,
    ) -> Result<DownloadedArtifact, UpdateError> {
        debug!(url = %info.url, "downloading artifact");

        let mut response =
            self.http
                .get(&info.url)
                .send()
                .await
                .map_err(|e| UpdateError::BundleUnavailable {
                    reason: e.to_string(),
                })?;

        if response.status() != StatusCode::OK {
            return Err(UpdateError::BundleUnavailable {
                reason: format!("unexpected status {} from {}", response.status(), info.url),
            });
        }

        let tmp = tempfile::Builder::new()
            .prefix("fw-")
            .suffix(".gbl")
            .tempfile()
            .map_err(|e| UpdateError::Unknown(format!("create temp file: {e}")))?;

        let mut file = tokio::fs::File::create(tmp.path())
            .await
            .map_err(|e| UpdateError::Unknown(format!("open {}: {e}", tmp.path().display())))?;

        let mut hasher = verify_md5.then(Md5::new);
        while let Some(chunk) =
            response
                .chunk()
                .await
                .map_err(|e| UpdateError::BundleUnavailable {
                    reason: e.to_string(),
                })?
        {
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| UpdateError::Unknown(format!("write artifact: {e}")))?;
        }

        file.sync_all()
            .await
            .map_err(|e| UpdateError::Unknown(format!("sync artifact: {e}")))?;
        drop(file);

        if let Some(hasher) = hasher {
            let digest = hex::encode(hasher.finalize());
            if !digest.eq_ignore_ascii_case(&info.md5) {
                return Err(UpdateError::BundleUnavailable {
                    reason: format!(
                        "md5 mismatch for {}: index advertises {}, downloaded {digest}",
                        info.url, info.md5
                    ),
                });
            }
            debug!(%digest, "artifact digest verified");
        }

        let len = tokio::fs::metadata(tmp.path())
            .await
            .map_err(|e| UpdateError::Unknown(format!("stat {}: {e}", tmp.path().display())))?
            .len();

        info!(bytes = len, path = %tmp.path().display(), "artifact downloaded");

        Ok(DownloadedArtifact {
            info: info.clone(),
            path: tmp.path().to_path_buf(),
            len,
            file: tmp,
        })
    }
}
