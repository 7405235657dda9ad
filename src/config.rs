//! Device configuration kept on the FAT data partition.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use log::{info, warn};
use serde::Deserialize;

use crate::bot::IngestSettings;
use crate::firmware::UpdateSettings;
use crate::line_store::{LineRecord, LineStore, Lines};

pub const STORAGE_ROOT: &str = "/filesystem";
pub const STORAGE_PARTITION: &str = "storage";

pub const FIRMWARE_TITLE: &str = env!("CARGO_PKG_NAME");
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEVICE_CONFIG_FILE: &str = "device.json";
const WIFI_FILE: &str = "wifi.txt";
const MQTT_FILE: &str = "mqtt.txt";
const BOT_FILE: &str = "tele.txt";
const SLEEP_FILE: &str = "sleep.txt";
const FIRMWARE_FILE: &str = "firmware.txt";
const CA_CERT_FILES: [&str; 3] = ["ca_root.pem", "ca-root.pem", "cacert.pem"];

/// Optional overrides read from `device.json`. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub mqtt_broker_url: String,
    pub firmware_api_base: String,
    pub bot_api_base: String,
    pub long_poll_timeout_s: u64,
    pub request_timeout_s: u64,
    pub download_timeout_s: u64,
    pub retry_delay_s: u64,
    pub max_preflight_attempts: u32,
    pub strict_checksum: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mqtt_broker_url: "mqtt://demo.thingsboard.io".to_string(),
            firmware_api_base: "https://demo.thingsboard.io".to_string(),
            bot_api_base: "https://api.telegram.org".to_string(),
            long_poll_timeout_s: 20,
            request_timeout_s: 10,
            download_timeout_s: 30,
            retry_delay_s: 60,
            max_preflight_attempts: 10,
            strict_checksum: false,
        }
    }
}

impl DeviceConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("Invalid device configuration")
    }

    pub fn update_settings(&self) -> UpdateSettings {
        UpdateSettings {
            request_timeout: Duration::from_secs(self.request_timeout_s),
            download_timeout: Duration::from_secs(self.download_timeout_s),
            retry_delay: Duration::from_secs(self.retry_delay_s),
            max_preflight_attempts: self.max_preflight_attempts.max(1),
            strict_checksum: self.strict_checksum,
        }
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            long_poll_timeout_s: self.long_poll_timeout_s,
            ..IngestSettings::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl LineRecord for WifiCredentials {
    const LINES: usize = 2;

    fn from_lines(lines: &Lines) -> Option<Self> {
        Some(Self {
            ssid: lines.get(0)?.to_string(),
            password: lines.get(1).unwrap_or_default().to_string(),
        })
    }

    fn to_lines(&self) -> Vec<String> {
        vec![self.ssid.clone(), self.password.clone()]
    }
}

/// Device access token for the cloud: MQTT username and firmware API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken(pub String);

impl LineRecord for AccessToken {
    const LINES: usize = 1;

    fn from_lines(lines: &Lines) -> Option<Self> {
        lines.get(0).map(|token| Self(token.to_string()))
    }

    fn to_lines(&self) -> Vec<String> {
        vec![self.0.clone()]
    }
}

/// Layout of the data partition.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn wifi(&self) -> LineStore {
        LineStore::new(self.root.join(WIFI_FILE))
    }

    pub fn mqtt(&self) -> LineStore {
        LineStore::new(self.root.join(MQTT_FILE))
    }

    pub fn bot(&self) -> LineStore {
        LineStore::new(self.root.join(BOT_FILE))
    }

    pub fn sleep(&self) -> LineStore {
        LineStore::new(self.root.join(SLEEP_FILE))
    }

    pub fn firmware(&self) -> LineStore {
        LineStore::new(self.root.join(FIRMWARE_FILE))
    }

    /// First CA bundle found on the partition, if any.
    pub fn ca_certificate(&self) -> Option<PathBuf> {
        CA_CERT_FILES
            .iter()
            .map(|name| self.root.join(name))
            .find(|path| path.is_file())
    }

    /// Loads `device.json`, falling back to defaults when it is absent.
    pub fn device_config(&self) -> anyhow::Result<DeviceConfig> {
        let path = self.root.join(DEVICE_CONFIG_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => {
                let config = DeviceConfig::from_json(&text)
                    .with_context(|| format!("Failed to parse {}", path.display()))?;
                info!("Loaded device configuration from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No {} found, using defaults", path.display());
                Ok(DeviceConfig::default())
            }
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let config =
            DeviceConfig::from_json(r#"{"retry_delay_s": 5, "strict_checksum": true}"#).unwrap();
        assert_eq!(config.retry_delay_s, 5);
        assert!(config.strict_checksum);
        assert_eq!(config.long_poll_timeout_s, 20);
        assert_eq!(config.bot_api_base, "https://api.telegram.org");
    }

    #[test]
    fn wrong_typed_field_is_an_error() {
        assert!(DeviceConfig::from_json(r#"{"retry_delay_s": "soon"}"#).is_err());
    }

    #[test]
    fn missing_device_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        assert_eq!(storage.device_config().unwrap(), DeviceConfig::default());
    }

    #[test]
    fn first_present_ca_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        assert_eq!(storage.ca_certificate(), None);

        fs::write(dir.path().join("cacert.pem"), "pem").unwrap();
        fs::write(dir.path().join("ca-root.pem"), "pem").unwrap();
        assert_eq!(
            storage.ca_certificate(),
            Some(dir.path().join("ca-root.pem"))
        );
    }

    #[test]
    fn wifi_password_line_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        fs::write(dir.path().join("wifi.txt"), "home-ap\n").unwrap();
        let wifi: WifiCredentials = storage.wifi().load().unwrap().unwrap();
        assert_eq!(wifi.ssid, "home-ap");
        assert_eq!(wifi.password, "");
    }
}
