use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::info;

use crate::errors::{CameraError, Result};
use crate::models::Credentials;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Consecutive failed polls before a camera is reported offline
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Bound applied to every call into the ONVIF adapter (e.g. "5s", "750ms")
    #[serde(default = "default_call_timeout", with = "duration_str")]
    pub call_timeout: Duration,
    #[serde(default = "default_poll_interval", with = "duration_str")]
    pub poll_interval: Duration,
    /// Background discovery + auto-registration runs only when this is set
    #[serde(default, with = "opt_duration_str")]
    pub discovery_interval: Option<Duration>,
    /// How long a WS-Discovery probe collects responses
    #[serde(default = "default_probe_timeout", with = "duration_str")]
    pub probe_timeout: Duration,
    #[serde(default = "default_max_concurrent_polls")]
    pub max_concurrent_polls: usize,
    /// Media profile token used for stream URIs; first profile when unset
    #[serde(default)]
    pub default_profile: Option<String>,
    /// Tried in order during registration
    #[serde(default = "default_credentials")]
    pub credentials: Vec<Credentials>,
    /// SQLite file for the camera table; in-memory store when unset
    #[serde(default)]
    pub database_path: Option<String>,
}

fn default_failure_threshold() -> u32 { 3 }
fn default_call_timeout() -> Duration { Duration::from_secs(5) }
fn default_poll_interval() -> Duration { Duration::from_secs(30) }
fn default_probe_timeout() -> Duration { Duration::from_secs(3) }
fn default_max_concurrent_polls() -> usize { 16 }

fn default_credentials() -> Vec<Credentials> {
    vec![
        Credentials::new("admin", "admin"),
        Credentials::new("admin", ""),
    ]
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            call_timeout: default_call_timeout(),
            poll_interval: default_poll_interval(),
            discovery_interval: None,
            probe_timeout: default_probe_timeout(),
            max_concurrent_polls: default_max_concurrent_polls(),
            default_profile: None,
            credentials: default_credentials(),
            database_path: None,
        }
    }
}

impl ManagerConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ManagerConfig = if path.ends_with(".json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        config.validate()?;

        info!(
            "Loaded camera manager config from {} ({} default credentials, failure threshold {})",
            path,
            config.credentials.len(),
            config.failure_threshold
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold < 1 {
            return Err(CameraError::config("failure_threshold must be at least 1"));
        }
        if self.max_concurrent_polls < 1 {
            return Err(CameraError::config("max_concurrent_polls must be at least 1"));
        }
        if self.call_timeout.is_zero() {
            return Err(CameraError::config("call_timeout must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(CameraError::config("poll_interval must be greater than zero"));
        }
        if matches!(self.discovery_interval, Some(d) if d.is_zero()) {
            return Err(CameraError::config("discovery_interval must be greater than zero"));
        }
        Ok(())
    }
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod opt_duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
