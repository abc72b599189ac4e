use std::env;
use std::path::{Path, PathBuf};

use log::info;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Duration;
use url::Url;

use crate::upload::StreamKeys;

/// Home-relative configuration file.
pub const CONFIG_FILENAME: &str = "configscalegateway.json";
/// The collector refuses more than one post per this many seconds.
pub const MIN_UPLOAD_SECS: u64 = 9;
const DEFAULT_UPLOAD_URL: &str = "https://data.sparkfun.com";
const DEFAULT_STEP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Missing or blank {0}")]
    Missing(&'static str),
    #[error("Out-of-range {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Settings as found in the file and environment, before validation.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
    pub ble_local_name: Option<String>,
    pub public_key: Option<String>,
    pub private_key: Option<String>,
    pub upload_secs: Option<u64>,
    pub upload_url: Option<String>,
    pub ca_cert_path: Option<PathBuf>,
    pub step_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ble_local_name: String,
    pub keys: StreamKeys,
    pub upload_interval: Duration,
    pub upload_url: Url,
    pub ca_cert_path: Option<PathBuf>,
    pub step_timeout: Duration,
}

impl GatewayConfig {
    /// Load configuration from the JSON file and the environment
    ///
    /// The file is `$SCALE_GATEWAY_CONFIG`, or `~/configscalegateway.json`
    /// when that is unset. A missing default file is fine as long as the
    /// environment (or `.env`) supplies every required value. Environment
    /// variables override the file.
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();

        let raw = match env::var("SCALE_GATEWAY_CONFIG") {
            Ok(path) => RawConfig::from_file(Path::new(&path))?,
            Err(_) => match dirs::home_dir().map(|home| home.join(CONFIG_FILENAME)) {
                Some(path) if path.exists() => RawConfig::from_file(&path)?,
                Some(path) => {
                    info!("No {} found, using environment only", path.display());
                    RawConfig::default()
                }
                None => RawConfig::default(),
            },
        };

        let config = raw.with_env(|key| env::var(key).ok())?.validate()?;
        config.log_summary();
        Ok(config)
    }

    fn log_summary(&self) {
        info!("Application Properties");
        info!("  LocalName: {}", self.ble_local_name);
        info!("  publicKey: {}", self.keys.public_key);
        info!("  privateKey: <elided>");
        info!("  uploadSecs: {}", self.upload_interval.as_secs());
        info!("  uploadUrl: {}", self.upload_url);
        if let Some(path) = &self.ca_cert_path {
            info!("  caCertPath: {}", path.display());
        }
        info!("  stepTimeoutSecs: {}", self.step_timeout.as_secs());
    }
}

impl RawConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    /// Override fields with any environment variables `lookup` finds.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("BLE_LOCAL_NAME") {
            self.ble_local_name = Some(value);
        }
        if let Some(value) = lookup("PUBLIC_KEY") {
            self.public_key = Some(value);
        }
        if let Some(value) = lookup("PRIVATE_KEY") {
            self.private_key = Some(value);
        }
        if let Some(value) = lookup("UPLOAD_SECS") {
            self.upload_secs = Some(parse_secs("uploadSecs", &value)?);
        }
        if let Some(value) = lookup("UPLOAD_URL") {
            self.upload_url = Some(value);
        }
        if let Some(value) = lookup("UPLOAD_CA_CERT") {
            self.ca_cert_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("BLE_STEP_TIMEOUT_SECS") {
            self.step_timeout_secs = Some(parse_secs("stepTimeoutSecs", &value)?);
        }
        Ok(self)
    }

    pub fn validate(self) -> Result<GatewayConfig, ConfigError> {
        let ble_local_name = required(self.ble_local_name, "bleLocalName")?;
        let public_key = required(self.public_key, "publicKey")?;
        let private_key = required(self.private_key, "privateKey")?;

        let upload_secs = self.upload_secs.ok_or(ConfigError::Missing("uploadSecs"))?;
        if upload_secs < MIN_UPLOAD_SECS {
            return Err(ConfigError::Invalid {
                key: "uploadSecs",
                reason: format!("{} is below the minimum of {}", upload_secs, MIN_UPLOAD_SECS),
            });
        }

        let upload_url = self.upload_url.as_deref().unwrap_or(DEFAULT_UPLOAD_URL);
        let upload_url = Url::parse(upload_url).map_err(|e| ConfigError::Invalid {
            key: "uploadUrl",
            reason: e.to_string(),
        })?;
        if upload_url.cannot_be_a_base() {
            return Err(ConfigError::Invalid {
                key: "uploadUrl",
                reason: format!("{} cannot carry a path", upload_url),
            });
        }

        let step_timeout_secs = self.step_timeout_secs.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS);
        if step_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "stepTimeoutSecs",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(GatewayConfig {
            ble_local_name,
            keys: StreamKeys {
                public_key,
                private_key,
            },
            upload_interval: Duration::from_secs(upload_secs),
            upload_url,
            ca_cert_path: self.ca_cert_path,
            step_timeout: Duration::from_secs(step_timeout_secs),
        })
    }
}

fn required(value: Option<String>, key: &'static str) -> Result<String, ConfigError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn parse_secs(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        reason: format!("'{}' is not a whole number of seconds", value),
    })
}
