#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The fixed application configuration schema, loaded from a single YAML
//! file (§6's configuration surface plus the ambient stack's logging and
//! service-address keys).

use std::{fs::File, io::BufReader, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use validator::Validate;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The config file could not be opened or parsed as YAML.
    #[error("invalid configuration file `{file}` - {message}")]
    InvalidConfig {
        /// The path to the config file.
        file: String,
        /// The error message.
        message: String,
    },

    /// The configuration parsed but failed field-level validation.
    #[error("configuration file `{file}` failed validation - {message}")]
    Invalid {
        /// The path to the config file.
        file: String,
        /// The validation failure message.
        message: String,
    },
}

/// How unknown `schema_version` values are handled by the ingest boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaValidationMode {
    /// Unknown versions are rejected with a 400.
    Strict,
    /// Unknown versions are accepted and tagged for observability.
    Lenient,
}

/// The complete application configuration, loaded from one YAML file given
/// as the first CLI argument.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    /// Address the ingest HTTP server binds to, e.g. `0.0.0.0:8080`.
    pub ingest_bind_addr: String,

    /// Accepted bearer credentials for the ingest boundary.
    #[validate(length(min = 1, message = "at least one auth token must be configured"))]
    pub auth_tokens: Vec<String>,

    /// Connection string for the dedup/aggregate store (C1+C2).
    pub store_url: String,

    /// Connection string for the queue broker (C3).
    pub queue_url: String,

    /// `tracing_subscriber::EnvFilter` directive string.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Window length, seconds. Default 60.
    #[serde(default = "default_window_size_secs")]
    #[validate(range(min = 1))]
    pub window_size_secs: u64,

    /// Grace period after window end before the first flush, seconds. Default 10.
    #[serde(default = "default_flush_delay_secs")]
    pub flush_delay_secs: u64,

    /// Tolerance for late-event classification, seconds. Default 120.
    #[serde(default = "default_late_tolerance_secs")]
    pub late_tolerance_secs: u64,

    /// Maximum unacknowledged queue deliveries outstanding at once. Default 100.
    #[serde(default = "default_max_in_flight")]
    #[validate(range(min = 1))]
    pub max_in_flight: usize,

    /// Broker-side ack wait, seconds. Default 30.
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,

    /// Maximum delivery attempts before dead-lettering. Default 5.
    #[serde(default = "default_max_deliver")]
    #[validate(range(min = 1))]
    pub max_deliver: i64,

    /// Sustained ingest requests/sec allowed per `client_id`.
    #[serde(default = "default_rate_limit_per_client")]
    pub rate_limit_per_client: f64,

    /// Token-bucket burst capacity per `client_id`.
    #[serde(default = "default_rate_burst_per_client")]
    pub rate_burst_per_client: u32,

    /// Unknown schema version policy. Default strict.
    #[serde(default = "default_schema_validation_mode")]
    pub schema_validation_mode: SchemaValidationMode,

    /// Schema versions accepted without a lenient-mode tag. Empty means
    /// every version is treated as known.
    #[serde(default)]
    pub known_schema_versions: Vec<String>,

    /// Sample count above which percentile computation downsamples. Default 10000.
    #[serde(default = "default_percentile_sample_cap")]
    #[validate(range(min = 1))]
    pub percentile_sample_cap: usize,

    /// `events_seen` retention, days. Default 7.
    #[serde(default = "default_dedup_retention_days")]
    pub dedup_retention_days: u64,

    /// `agg_1m` retention, days. Default 90.
    #[serde(default = "default_aggregate_retention_days")]
    pub aggregate_retention_days: u64,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_window_size_secs() -> u64 {
    60
}

fn default_flush_delay_secs() -> u64 {
    10
}

fn default_late_tolerance_secs() -> u64 {
    120
}

fn default_max_in_flight() -> usize {
    100
}

fn default_ack_wait_secs() -> u64 {
    30
}

fn default_max_deliver() -> i64 {
    5
}

fn default_rate_limit_per_client() -> f64 {
    50.0
}

fn default_rate_burst_per_client() -> u32 {
    100
}

fn default_schema_validation_mode() -> SchemaValidationMode {
    SchemaValidationMode::Strict
}

fn default_percentile_sample_cap() -> usize {
    10_000
}

fn default_dedup_retention_days() -> u64 {
    7
}

fn default_aggregate_retention_days() -> u64 {
    90
}

impl AppConfig {
    /// Loads and validates configuration from a YAML file at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file_name = path.as_ref().display().to_string();
        debug!(file = %file_name, "loading configuration");

        let file = File::open(&path).map_err(|err| Error::InvalidConfig {
            file: file_name.clone(),
            message: err.to_string(),
        })?;
        let reader = BufReader::new(file);
        let config: AppConfig = serde_yaml::from_reader(reader).map_err(|err| Error::InvalidConfig {
            file: file_name.clone(),
            message: err.to_string(),
        })?;

        config.validate().map_err(|err| Error::Invalid {
            file: file_name.clone(),
            message: err.to_string(),
        })?;

        debug!(file = %file_name, "configuration loaded");
        Ok(config)
    }
}
