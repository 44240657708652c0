// collection-backup/src/config/mod.rs
pub mod settings;

pub use settings::{
    BackupFrequency, BackupSettings, CloudProvider, CloudProviderConfig, CloudSettings,
    JsonSettingsProvider, SettingsProvider,
};

use crate::errors::ConfigError;
use crate::scheduler::SchedulerOptions;
use crate::utils::connection::ConnectionParams;
use crate::utils::process::{DEFAULT_MAX_OUTPUT_BYTES, ProcessLimits};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_BACKUP_DIR: &str = "./backups";
const DEFAULT_ITEM_TABLE: &str = "items";
const DEFAULT_DUMP_TIMEOUT_SECS: u64 = 600;
const DEFAULT_RESTORE_TIMEOUT_SECS: u64 = 1800;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonSchedulerOptions {
    pub check_interval_secs: Option<u64>,
    pub skip_log_interval_secs: Option<u64>,
    pub log_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database_url: Option<String>,
    pub backup_dir: Option<PathBuf>,
    pub pg_dump_path: Option<PathBuf>,
    pub psql_path: Option<PathBuf>,
    pub dump_timeout_secs: Option<u64>,
    pub restore_timeout_secs: Option<u64>,
    pub max_process_output_bytes: Option<usize>,
    pub item_table: Option<String>,
    pub keep_local_after_upload: Option<bool>,
    pub enforce_retention: Option<bool>,
    pub scheduler: Option<JsonSchedulerOptions>,
    /// Parsed on demand by [`JsonSettingsProvider`], so edits are picked up
    /// without a restart.
    pub backup_settings: Option<serde_json::Value>,
}

/// How the PostgreSQL client tools are located and bounded.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub pg_dump_path: Option<PathBuf>,
    pub psql_path: Option<PathBuf>,
    pub dump_limits: ProcessLimits,
    pub restore_limits: ProcessLimits,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub backup_dir: PathBuf,
    pub tools: ToolConfig,
    pub item_table: String,
    pub keep_local_after_upload: bool,
    pub enforce_retention: bool,
    pub scheduler: SchedulerOptions,
    /// File the backup settings are read from (the config file itself).
    pub settings_path: PathBuf,
}

impl AppConfig {
    /// Loads `config_path`; `DATABASE_URL` from the environment (or `.env`)
    /// overrides `database_url` in the file.
    pub fn load_from_json(config_path: &Path) -> Result<Self, ConfigError> {
        let config_content = fs::read_to_string(config_path).map_err(|e| {
            ConfigError::Invalid(format!(
                "failed to read config file at {}: {e}",
                config_path.display()
            ))
        })?;
        let raw: RawJsonConfig = serde_json::from_str(&config_content).map_err(|e| {
            ConfigError::Invalid(format!(
                "failed to parse JSON from config file at {}: {e}",
                config_path.display()
            ))
        })?;

        if raw.backup_settings.is_none() {
            tracing::warn!(
                "⚠️ No backup_settings section in {}; automatic backups and cloud uploads stay disabled until one is added.",
                config_path.display()
            );
        }

        let env_database_url = std::env::var("DATABASE_URL").ok();
        Self::from_raw(raw, env_database_url, config_path.to_path_buf())
    }

    pub fn from_raw(
        raw: RawJsonConfig,
        env_database_url: Option<String>,
        settings_path: PathBuf,
    ) -> Result<Self, ConfigError> {
        let database_url = env_database_url
            .filter(|s| !s.trim().is_empty())
            .or(raw.database_url.filter(|s| !s.trim().is_empty()))
            .ok_or_else(|| {
                ConfigError::Missing(
                    "database_url (set DATABASE_URL or database_url in config.json)".into(),
                )
            })?;
        // Fail fast on an unusable URL; the dump engine re-parses per run.
        ConnectionParams::parse(&database_url)?;

        let backup_dir = raw
            .backup_dir
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_DIR));

        let item_table = raw
            .item_table
            .unwrap_or_else(|| DEFAULT_ITEM_TABLE.to_string());
        if item_table.is_empty()
            || item_table.starts_with(|c: char| c.is_ascii_digit())
            || item_table.contains(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        {
            return Err(ConfigError::Invalid(format!(
                "item_table '{item_table}' is not a plain table identifier"
            )));
        }

        let max_output = raw
            .max_process_output_bytes
            .unwrap_or(DEFAULT_MAX_OUTPUT_BYTES);
        if max_output == 0 {
            return Err(ConfigError::Invalid(
                "max_process_output_bytes must be greater than zero".into(),
            ));
        }
        let limits = |secs: Option<u64>, default: u64| -> Result<ProcessLimits, ConfigError> {
            let secs = secs.unwrap_or(default);
            if secs == 0 {
                return Err(ConfigError::Invalid("process timeouts must be at least one second".into()));
            }
            Ok(ProcessLimits {
                timeout: Duration::from_secs(secs),
                max_output_bytes: max_output,
            })
        };

        let tools = ToolConfig {
            pg_dump_path: raw.pg_dump_path,
            psql_path: raw.psql_path,
            dump_limits: limits(raw.dump_timeout_secs, DEFAULT_DUMP_TIMEOUT_SECS)?,
            restore_limits: limits(raw.restore_timeout_secs, DEFAULT_RESTORE_TIMEOUT_SECS)?,
        };

        let scheduler = scheduler_options(raw.scheduler.unwrap_or_default())?;

        Ok(AppConfig {
            database_url,
            backup_dir,
            tools,
            item_table,
            keep_local_after_upload: raw.keep_local_after_upload.unwrap_or(true),
            enforce_retention: raw.enforce_retention.unwrap_or(false),
            scheduler,
            settings_path,
        })
    }
}

fn scheduler_options(raw: JsonSchedulerOptions) -> Result<SchedulerOptions, ConfigError> {
    let defaults = SchedulerOptions::default();
    let options = SchedulerOptions {
        check_interval: raw
            .check_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.check_interval),
        skip_log_interval: raw
            .skip_log_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.skip_log_interval),
        log_capacity: raw.log_capacity.unwrap_or(defaults.log_capacity),
    };
    if options.check_interval.is_zero() {
        return Err(ConfigError::Invalid(
            "scheduler.check_interval_secs must be greater than zero".into(),
        ));
    }
    if options.log_capacity == 0 {
        return Err(ConfigError::Invalid(
            "scheduler.log_capacity must be greater than zero".into(),
        ));
    }
    Ok(options)
}
