use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::digest::ChecksumAlgorithm;

pub const FW_TITLE_ATTR: &str = "fw_title";
pub const FW_VERSION_ATTR: &str = "fw_version";
pub const FW_SIZE_ATTR: &str = "fw_size";
pub const FW_CHECKSUM_ATTR: &str = "fw_checksum";
pub const FW_CHECKSUM_ALG_ATTR: &str = "fw_checksum_algorithm";
pub const FW_URL_ATTR: &str = "fw_url";

/// Shared attribute keys describing an available image.
pub const FIRMWARE_KEYS: [&str; 6] = [
    FW_TITLE_ATTR,
    FW_VERSION_ATTR,
    FW_SIZE_ATTR,
    FW_CHECKSUM_ATTR,
    FW_CHECKSUM_ALG_ATTR,
    FW_URL_ATTR,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Direct { url: String },
    /// Fetched from the firmware API by title and version.
    Lookup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub title: String,
    pub version: String,
    pub size: u64,
    pub checksum: String,
    pub algorithm: ChecksumAlgorithm,
    pub delivery: Delivery,
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("malformed attributes: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("missing firmware attributes: {}", .0.join(", "))]
    Incomplete(Vec<&'static str>),
    #[error("inconsistent firmware attributes: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Deserialize)]
struct FirmwareAttributes {
    fw_title: Option<String>,
    fw_version: Option<String>,
    fw_size: Option<u64>,
    fw_checksum: Option<String>,
    fw_checksum_algorithm: Option<String>,
    fw_url: Option<String>,
}

fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Picks the object holding the firmware keys: `data`, then `shared`, then
/// the top level.
fn firmware_object(root: &Value) -> Option<&Value> {
    let holds_firmware = |value: &&Value| {
        value
            .as_object()
            .is_some_and(|map| FIRMWARE_KEYS.iter().any(|key| map.contains_key(*key)))
    };
    [root.get("data"), root.get("shared"), Some(root)]
        .into_iter()
        .flatten()
        .find(|value| holds_firmware(value))
}

impl UpdateRequest {
    /// Decodes a shared-attribute push.
    ///
    /// `Ok(None)` when the push does not mention firmware at all.
    pub fn from_attributes(payload: &str) -> Result<Option<Self>, AdmissionError> {
        let root: Value = serde_json::from_str(payload)?;
        let Some(object) = firmware_object(&root) else {
            return Ok(None);
        };
        let attrs = FirmwareAttributes::deserialize(object)?;

        let title = present(attrs.fw_title);
        let version = present(attrs.fw_version);
        let checksum = present(attrs.fw_checksum);
        let algorithm = present(attrs.fw_checksum_algorithm);

        let mut missing = Vec::new();
        if title.is_none() {
            missing.push(FW_TITLE_ATTR);
        }
        if version.is_none() {
            missing.push(FW_VERSION_ATTR);
        }
        if attrs.fw_size.is_none() {
            missing.push(FW_SIZE_ATTR);
        }
        if checksum.is_none() {
            missing.push(FW_CHECKSUM_ATTR);
        }
        if algorithm.is_none() {
            missing.push(FW_CHECKSUM_ALG_ATTR);
        }
        let (Some(title), Some(version), Some(size), Some(checksum), Some(algorithm)) =
            (title, version, attrs.fw_size, checksum, algorithm)
        else {
            return Err(AdmissionError::Incomplete(missing));
        };

        if size == 0 {
            return Err(AdmissionError::Inconsistent(format!(
                "{} must be positive",
                FW_SIZE_ATTR
            )));
        }
        let algorithm = ChecksumAlgorithm::parse(&algorithm);
        if !algorithm.accepts(&checksum) {
            return Err(AdmissionError::Inconsistent(format!(
                "{} '{}' is not a {} digest",
                FW_CHECKSUM_ATTR, checksum, algorithm
            )));
        }
        let delivery = match present(attrs.fw_url) {
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                Delivery::Direct { url }
            }
            Some(url) => {
                return Err(AdmissionError::Inconsistent(format!(
                    "{} '{}' is not an http(s) URL",
                    FW_URL_ATTR, url
                )))
            }
            None => Delivery::Lookup,
        };

        Ok(Some(Self {
            title,
            version,
            size,
            checksum,
            algorithm,
            delivery,
        }))
    }
}
