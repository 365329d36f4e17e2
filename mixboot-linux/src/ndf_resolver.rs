//! Network definition resolver: local cache first, otherwise a verified remote download.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use mixboot_core::ndf::{self, Certificate, NdfError};
use tracing::info;

use crate::state::DefinitionSource;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

pub struct NdfResolver {
    local_path: PathBuf,
    cert_path: PathBuf,
    url: String,
    client: reqwest::Client,
}

impl NdfResolver {
    pub fn new(local_path: &Path, cert_path: &Path, url: &str) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(ResolveError::Download)?;
        Ok(Self {
            local_path: local_path.to_path_buf(),
            cert_path: cert_path.to_path_buf(),
            url: url.to_string(),
            client,
        })
    }

    /// Cached bytes are returned as-is; a download is returned only after its signature verifies.
    pub async fn resolve(&self) -> Result<Vec<u8>, ResolveError> {
        if let Some(bytes) = read_cache(&self.local_path) {
            info!(path = %self.local_path.display(), "using cached network definition");
            return Ok(bytes);
        }

        let cert_text =
            fs::read_to_string(&self.cert_path).map_err(|source| ResolveError::Certificate {
                path: self.cert_path.clone(),
                source,
            })?;
        let cert = Certificate::parse(&cert_text)?;

        info!(url = %self.url, "downloading network definition");
        let envelope = self.download().await?;
        let definition = ndf::verify_signed(&envelope, &cert)?;
        info!(len = definition.len(), "network definition verified");
        Ok(definition)
    }

    async fn download(&self) -> Result<Vec<u8>, ResolveError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl DefinitionSource for NdfResolver {
    async fn resolve(&self) -> Result<Vec<u8>, ResolveError> {
        NdfResolver::resolve(self).await
    }
}

/// Cache hit only for a readable, non-empty file.
fn read_cache(path: &Path) -> Option<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) if !bytes.is_empty() => Some(bytes),
        Ok(_) => {
            info!(path = %path.display(), "network definition cache is empty");
            None
        }
        Err(e) => {
            info!(path = %path.display(), error = %e, "network definition cache does not exist");
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("failed to read certificate {path}: {source}")]
    Certificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("network definition verification: {0}")]
    Verify(#[from] NdfError),
    #[error("failed to download network definition: {0}")]
    Download(#[from] reqwest::Error),
}
