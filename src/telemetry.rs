use log::{error, info};
use serde_json::{json, Value};

pub const TELEMETRY_TOPIC: &str = "v1/devices/me/telemetry";
pub const ATTRIBUTES_TOPIC: &str = "v1/devices/me/attributes";
pub const ATTRIBUTES_REQUEST_TOPIC: &str = "v1/devices/me/attributes/request/";
pub const ATTRIBUTES_RESPONSE_TOPIC: &str = "v1/devices/me/attributes/response/";

pub const FW_STATE_ATTR: &str = "fw_state";
pub const FW_ERROR_ATTR: &str = "fw_error";
pub const CURRENT_FW_TITLE_ATTR: &str = "current_fw_title";
pub const CURRENT_FW_VERSION_ATTR: &str = "current_fw_version";

/// Publishing side of the cloud connection.
pub trait Telemetry: Send + Sync {
    fn publish_telemetry(&self, payload: &str) -> anyhow::Result<()>;

    fn publish_attributes(&self, payload: &str) -> anyhow::Result<()>;

    /// Asks the cloud to send back the named shared attributes.
    fn request_attributes(&self, shared_keys: &[&str]) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwState {
    Downloading,
    Downloaded,
    Verified,
    Updated,
    Failed,
}

impl FwState {
    pub fn as_str(self) -> &'static str {
        match self {
            FwState::Downloading => "DOWNLOADING",
            FwState::Downloaded => "DOWNLOADED",
            FwState::Verified => "VERIFIED",
            FwState::Updated => "UPDATED",
            FwState::Failed => "FAILED",
        }
    }
}

pub fn state_payload(state: FwState) -> Value {
    json!({ FW_STATE_ATTR: state.as_str() })
}

pub fn failure_payload(tag: &str) -> Value {
    json!({
        FW_STATE_ATTR: FwState::Failed.as_str(),
        FW_ERROR_ATTR: tag
    })
}

pub fn identity_payload(title: &str, version: &str) -> Value {
    json!({
        CURRENT_FW_TITLE_ATTR: title,
        CURRENT_FW_VERSION_ATTR: version
    })
}

/// Fire-and-forget telemetry publish. Failures are logged and dropped.
pub fn send(telemetry: &dyn Telemetry, payload: &Value) {
    let payload = payload.to_string();
    match telemetry.publish_telemetry(&payload) {
        Ok(()) => info!("Sent OTA telemetry: {}", payload),
        Err(e) => error!("Failed to send OTA telemetry: {:?}", e),
    }
}

pub fn send_attributes(telemetry: &dyn Telemetry, payload: &Value) {
    let payload = payload.to_string();
    match telemetry.publish_attributes(&payload) {
        Ok(()) => info!("Sent attributes: {}", payload),
        Err(e) => error!("Failed to send attributes: {:?}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_payload_carries_tag() {
        assert_eq!(
            failure_payload("checksum_mismatch"),
            json!({"fw_state": "FAILED", "fw_error": "checksum_mismatch"})
        );
    }

    #[test]
    fn identity_payload_names_running_firmware() {
        assert_eq!(
            identity_payload("sensor-node", "1.2.0").to_string(),
            r#"{"current_fw_title":"sensor-node","current_fw_version":"1.2.0"}"#
        );
    }
}
