//! Cloud storage backends behind one upload / check / fetch / delete contract.
//!
//! Adapter errors never cross [`upload`] or [`test_connection`]; callers get
//! an outcome value with a success flag instead.

pub mod dropbox;
pub mod s3;

use crate::config::{CloudProvider, CloudProviderConfig, CloudSettings};
use crate::errors::{AppError, CloudError, ErrorReport};
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use url::Url;

pub use dropbox::DropboxStorage;
pub use s3::S3Storage;

/// Prefix every uploaded object lives under.
pub const OBJECT_PREFIX: &str = "backups";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl UploadOutcome {
    pub fn uploaded(url: &Url) -> Self {
        Self {
            success: true,
            url: Some(url.to_string()),
            error: None,
        }
    }

    pub fn failed(err: impl Into<AppError>) -> Self {
        Self {
            success: false,
            url: None,
            error: Some(err.into().report()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

/// One configured backend.
#[async_trait]
pub trait CloudStorage: Send + Sync {
    fn provider(&self) -> CloudProvider;

    /// Stores `local` under `backups/<filename>` and returns its location URI.
    async fn upload(&self, local: &Path, filename: &str) -> Result<Url, CloudError>;

    /// Checks credentials and target without creating anything.
    async fn test_connection(&self) -> Result<String, CloudError>;

    /// Writes the artifact at `remote` to `dest`, returning the byte count.
    async fn download(&self, remote: &Url, dest: &Path) -> Result<u64, CloudError>;

    async fn delete(&self, remote: &Url) -> Result<(), CloudError>;
}

fn require(field: &str, value: &str, provider: CloudProvider) -> Result<(), CloudError> {
    if value.trim().is_empty() {
        return Err(CloudError::Configuration(format!(
            "{provider} credentials are missing '{field}'"
        )));
    }
    Ok(())
}

/// Validates provider selection against the credential shape and builds the
/// matching backend. No network I/O happens here.
pub fn connect(settings: &CloudSettings) -> Result<Box<dyn CloudStorage>, CloudError> {
    let provider = settings.provider;
    if provider == CloudProvider::None {
        return Err(CloudError::Configuration(
            "cloud storage is enabled but no provider is selected".into(),
        ));
    }
    let credentials = settings.credentials.as_ref().ok_or_else(|| {
        CloudError::Configuration(format!("no credentials configured for {provider}"))
    })?;
    if credentials.provider() != provider {
        return Err(CloudError::Configuration(format!(
            "cloud provider is {provider} but the configured credentials are for {}",
            credentials.provider()
        )));
    }

    match credentials {
        CloudProviderConfig::S3 {
            bucket,
            region,
            access_key_id,
            secret_access_key,
        } => {
            require("bucket", bucket, provider)?;
            require("region", region, provider)?;
            require("access_key_id", access_key_id, provider)?;
            require("secret_access_key", secret_access_key, provider)?;
            Ok(Box::new(S3Storage::aws(
                bucket,
                region,
                access_key_id,
                secret_access_key,
            )))
        }
        CloudProviderConfig::R2 {
            account_id,
            access_key_id,
            secret_access_key,
            bucket,
        } => {
            require("account_id", account_id, provider)?;
            require("access_key_id", access_key_id, provider)?;
            require("secret_access_key", secret_access_key, provider)?;
            Ok(Box::new(S3Storage::r2(
                account_id,
                bucket.as_deref(),
                access_key_id,
                secret_access_key,
            )))
        }
        CloudProviderConfig::Dropbox { access_token } => {
            require("access_token", access_token, provider)?;
            Ok(Box::new(DropboxStorage::new(access_token)))
        }
    }
}

pub async fn upload(settings: &CloudSettings, local: &Path, filename: &str) -> UploadOutcome {
    let storage = match connect(settings) {
        Ok(storage) => storage,
        Err(e) => {
            warn!(error = %e, "☁️ Cloud upload skipped: configuration rejected");
            return UploadOutcome::failed(e);
        }
    };
    if let Err(e) = tokio::fs::metadata(local).await {
        return UploadOutcome::failed(CloudError::LocalFile(format!(
            "cannot read {}: {e}",
            local.display()
        )));
    }

    info!(provider = %storage.provider(), file = %local.display(), "☁️ Uploading backup");
    match storage.upload(local, filename).await {
        Ok(url) => {
            info!(%url, "✅ Upload complete");
            UploadOutcome::uploaded(&url)
        }
        Err(e) => {
            warn!(error = %e, "❌ Upload failed");
            UploadOutcome::failed(e)
        }
    }
}

pub async fn test_connection(settings: &CloudSettings) -> ConnectionOutcome {
    let result = match connect(settings) {
        Ok(storage) => storage.test_connection().await,
        Err(e) => Err(e),
    };
    match result {
        Ok(message) => ConnectionOutcome {
            success: true,
            message: Some(message),
            error: None,
        },
        Err(e) => ConnectionOutcome {
            success: false,
            message: Some(e.to_string()),
            error: Some(AppError::from(e).report()),
        },
    }
}

/// Brings a remote artifact to `dest`. `s3://`, `r2://` and `dropbox://`
/// locations need matching credentials; `http(s)://` is a plain GET.
pub async fn fetch(
    credentials: Option<&CloudProviderConfig>,
    remote: &Url,
    dest: &Path,
) -> Result<u64, CloudError> {
    if matches!(remote.scheme(), "http" | "https") {
        return fetch_http(remote, dest).await;
    }
    storage_for(credentials, remote)?.download(remote, dest).await
}

/// Removes a remote artifact. Plain `http(s)://` locations cannot be deleted.
pub async fn delete(credentials: Option<&CloudProviderConfig>, remote: &Url) -> Result<(), CloudError> {
    let storage = storage_for(credentials, remote)?;
    storage.delete(remote).await?;
    info!(%remote, "🗑️ Deleted remote backup");
    Ok(())
}

/// Builds the backend that owns `remote` from credentials of the same provider.
fn storage_for(
    credentials: Option<&CloudProviderConfig>,
    remote: &Url,
) -> Result<Box<dyn CloudStorage>, CloudError> {
    let wanted = match remote.scheme() {
        "s3" => CloudProvider::S3,
        "r2" => CloudProvider::R2,
        "dropbox" => CloudProvider::Dropbox,
        other => {
            return Err(CloudError::Configuration(format!(
                "unsupported backup location scheme '{other}'"
            )));
        }
    };
    let credentials = credentials
        .filter(|c| c.provider() == wanted)
        .ok_or_else(|| {
            CloudError::Configuration(format!(
                "backup is stored in {wanted} but no {wanted} credentials are configured"
            ))
        })?;
    connect(&CloudSettings {
        provider: wanted,
        credentials: Some(credentials.clone()),
    })
}

async fn fetch_http(remote: &Url, dest: &Path) -> Result<u64, CloudError> {
    let mut response = reqwest::get(remote.clone())
        .await
        .map_err(|e| CloudError::Transport(format!("GET {remote}: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(CloudError::Provider(format!("GET {remote} returned {status}")));
    }
    let mut file = create_file(dest).await?;
    let mut written = 0u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| CloudError::Transport(format!("reading {remote}: {e}")))?
    {
        write_chunk(&mut file, dest, &chunk).await?;
        written += chunk.len() as u64;
    }
    flush(&mut file, dest).await?;
    Ok(written)
}

pub(crate) async fn create_file(dest: &Path) -> Result<tokio::fs::File, CloudError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            CloudError::LocalFile(format!("cannot create {}: {e}", parent.display()))
        })?;
    }
    tokio::fs::File::create(dest)
        .await
        .map_err(|e| CloudError::LocalFile(format!("cannot create {}: {e}", dest.display())))
}

pub(crate) async fn write_chunk(
    file: &mut tokio::fs::File,
    dest: &Path,
    chunk: &[u8],
) -> Result<(), CloudError> {
    file.write_all(chunk)
        .await
        .map_err(|e| CloudError::LocalFile(format!("cannot write {}: {e}", dest.display())))
}

pub(crate) async fn flush(file: &mut tokio::fs::File, dest: &Path) -> Result<(), CloudError> {
    file.flush()
        .await
        .map_err(|e| CloudError::LocalFile(format!("cannot write {}: {e}", dest.display())))
}

/// Injection seam for the orchestrator and restore engine.
#[async_trait]
pub trait CloudGateway: Send + Sync {
    async fn upload(&self, settings: &CloudSettings, local: &Path, filename: &str) -> UploadOutcome;

    async fn test_connection(&self, settings: &CloudSettings) -> ConnectionOutcome;

    async fn fetch(
        &self,
        credentials: Option<&CloudProviderConfig>,
        remote: &Url,
        dest: &Path,
    ) -> Result<u64, CloudError>;

    async fn delete(
        &self,
        credentials: Option<&CloudProviderConfig>,
        remote: &Url,
    ) -> Result<(), CloudError>;
}

/// Talks to the real providers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderGateway;

#[async_trait]
impl CloudGateway for ProviderGateway {
    async fn upload(&self, settings: &CloudSettings, local: &Path, filename: &str) -> UploadOutcome {
        upload(settings, local, filename).await
    }

    async fn test_connection(&self, settings: &CloudSettings) -> ConnectionOutcome {
        test_connection(settings).await
    }

    async fn fetch(
        &self,
        credentials: Option<&CloudProviderConfig>,
        remote: &Url,
        dest: &Path,
    ) -> Result<u64, CloudError> {
        fetch(credentials, remote, dest).await
    }

    async fn delete(
        &self,
        credentials: Option<&CloudProviderConfig>,
        remote: &Url,
    ) -> Result<(), CloudError> {
        delete(credentials, remote).await
    }
}
