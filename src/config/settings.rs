use crate::errors::ConfigError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupFrequency {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    #[default]
    None,
    S3,
    R2,
    Dropbox,
}

impl CloudProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            CloudProvider::None => "none",
            CloudProvider::S3 => "s3",
            CloudProvider::R2 => "r2",
            CloudProvider::Dropbox => "dropbox",
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider credentials. Exactly one shape per provider; fields are defaulted
/// so that an incomplete shape is reported by the cloud adapter as a
/// configuration error instead of making the whole settings record unreadable.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum CloudProviderConfig {
    S3 {
        #[serde(default)]
        bucket: String,
        #[serde(default)]
        region: String,
        #[serde(default)]
        access_key_id: String,
        #[serde(default)]
        secret_access_key: String,
    },
    R2 {
        #[serde(default)]
        account_id: String,
        #[serde(default)]
        access_key_id: String,
        #[serde(default)]
        secret_access_key: String,
        #[serde(default)]
        bucket: Option<String>,
    },
    Dropbox {
        #[serde(default)]
        access_token: String,
    },
}

impl CloudProviderConfig {
    pub fn provider(&self) -> CloudProvider {
        match self {
            CloudProviderConfig::S3 { .. } => CloudProvider::S3,
            CloudProviderConfig::R2 { .. } => CloudProvider::R2,
            CloudProviderConfig::Dropbox { .. } => CloudProvider::Dropbox,
        }
    }
}

impl fmt::Debug for CloudProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudProviderConfig::S3 { bucket, region, .. } => f
                .debug_struct("S3")
                .field("bucket", bucket)
                .field("region", region)
                .finish_non_exhaustive(),
            CloudProviderConfig::R2 {
                account_id, bucket, ..
            } => f
                .debug_struct("R2")
                .field("account_id", account_id)
                .field("bucket", bucket)
                .finish_non_exhaustive(),
            CloudProviderConfig::Dropbox { .. } => f.debug_struct("Dropbox").finish_non_exhaustive(),
        }
    }
}

/// Which backend to use and with which credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudSettings {
    pub provider: CloudProvider,
    pub credentials: Option<CloudProviderConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub automatic_backups: bool,
    pub backup_frequency: BackupFrequency,
    pub backup_retention: u32,
    pub cloud_storage_enabled: bool,
    pub cloud_provider: CloudProvider,
    pub cloud: Option<CloudProviderConfig>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            automatic_backups: false,
            backup_frequency: BackupFrequency::Daily,
            backup_retention: 7,
            cloud_storage_enabled: false,
            cloud_provider: CloudProvider::None,
            cloud: None,
        }
    }
}

impl BackupSettings {
    /// `Some` only when cloud storage is switched on. Credentials are not
    /// validated here.
    pub fn cloud_settings(&self) -> Option<CloudSettings> {
        self.cloud_storage_enabled.then(|| CloudSettings {
            provider: self.cloud_provider,
            credentials: self.cloud.clone(),
        })
    }
}

/// Source of [`BackupSettings`]. Settings are owned elsewhere; this core only
/// reads them, and re-reads them whenever it needs a fresh view.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn load(&self) -> Result<BackupSettings, ConfigError>;
}

/// Reads the `backup_settings` object from a JSON file on every call.
#[derive(Debug, Clone)]
pub struct JsonSettingsProvider {
    path: PathBuf,
}

impl JsonSettingsProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SettingsProvider for JsonSettingsProvider {
    async fn load(&self) -> Result<BackupSettings, ConfigError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ConfigError::Invalid(format!(
                "failed to read settings file {}: {e}",
                self.path.display()
            ))
        })?;
        parse_backup_settings(&content)
    }
}

fn parse_backup_settings(content: &str) -> Result<BackupSettings, ConfigError> {
    let mut root: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| ConfigError::Invalid(format!("settings file is not valid JSON: {e}")))?;
    let section = root
        .get_mut("backup_settings")
        .map(serde_json::Value::take)
        .ok_or_else(|| ConfigError::Missing("backup_settings".into()))?;
    serde_json::from_value(section)
        .map_err(|e| ConfigError::Invalid(format!("backup_settings: {e}")))
}
