use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use chatlink_core::DEFAULT_RECEIPT_BUFFER;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::connection::LinkSettings;
use crate::presence::PresenceSettings;
use crate::store::StoreSettings;

/// Config files are a handful of fields; anything bigger is not ours.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("parse failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("write failed for {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub server_url: String,
    pub api_base_url: String,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub connect_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub outbound_queue_limit: Option<usize>,
    pub rest_timeout_ms: u64,
    pub page_size: usize,
    pub receipt_buffer_limit: usize,
    pub typing_ttl_ms: u64,
    pub online_ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/ws".to_owned(),
            api_base_url: "http://127.0.0.1:8080/api/v1".to_owned(),
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            connect_timeout_ms: 12_000,
            keepalive_interval_ms: 30_000,
            outbound_queue_limit: None,
            rest_timeout_ms: 10_000,
            page_size: 20,
            receipt_buffer_limit: DEFAULT_RECEIPT_BUFFER,
            typing_ttl_ms: 5_000,
            online_ttl_ms: 120_000,
            sweep_interval_ms: 500,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("server_url", &self.server_url, &["ws", "wss", "http", "https"])?;
        check_url("api_base_url", &self.api_base_url, &["http", "https"])?;

        let positive = [
            ("reconnect_base_delay_ms", self.reconnect_base_delay_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("keepalive_interval_ms", self.keepalive_interval_ms),
            ("rest_timeout_ms", self.rest_timeout_ms),
            ("typing_ttl_ms", self.typing_ttl_ms),
            ("online_ttl_ms", self.online_ttl_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(invalid(
                "reconnect_max_delay_ms",
                "must not be below reconnect_base_delay_ms",
            ));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(invalid("max_reconnect_attempts", "must be at least 1"));
        }
        if self.page_size == 0 {
            return Err(invalid("page_size", "must be at least 1"));
        }
        if self.outbound_queue_limit == Some(0) {
            return Err(invalid(
                "outbound_queue_limit",
                "must be at least 1 (omit it for no limit)",
            ));
        }
        Ok(())
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            server_url: self.server_url.clone(),
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            queue_limit: self.outbound_queue_limit,
        }
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            page_size: self.page_size,
            rest_timeout: self.rest_timeout(),
            receipt_buffer_limit: self.receipt_buffer_limit,
        }
    }

    pub fn presence_settings(&self) -> PresenceSettings {
        PresenceSettings {
            typing_ttl: Duration::from_millis(self.typing_ttl_ms),
            online_ttl: Duration::from_millis(self.online_ttl_ms),
        }
    }

    pub fn rest_timeout(&self) -> Duration {
        Duration::from_millis(self.rest_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn check_url(field: &'static str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|err| invalid(field, err.to_string()))?;
    if !schemes.contains(&url.scheme()) {
        return Err(invalid(
            field,
            format!("scheme {:?} not one of {schemes:?}", url.scheme()),
        ));
    }
    Ok(())
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

pub fn parse_config_json(data: &str) -> Result<SessionConfig, ConfigError> {
    let config: SessionConfig = serde_json::from_str(data)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config_from_path(path: &Path) -> Result<SessionConfig, ConfigError> {
    let meta = fs::metadata(path).map_err(ConfigError::Metadata)?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigError::TooLarge {
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(ConfigError::Read)?;
    parse_config_json(&data)
}

/// Writes through a sibling temp file so a crash never leaves a torn config.
pub fn save_config_to_path(path: &Path, config: &SessionConfig) -> Result<(), ConfigError> {
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(config)?;
    fs::write(&tmp, payload.as_bytes()).map_err(|source| ConfigError::Write {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}
