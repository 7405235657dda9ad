use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde_json::json;
use thiserror::Error;

use super::digest::checksum_matches;
use super::record::FirmwareRecord;
use super::request::{Delivery, UpdateRequest, FIRMWARE_KEYS};
use super::retry::{PendingRetry, RetrySlot};
use crate::line_store::LineStore;
use crate::platform::{ImageSlot, Power};
use crate::telemetry::{
    self, failure_payload, identity_payload, state_payload, FwState, Telemetry,
    CURRENT_FW_TITLE_ATTR, CURRENT_FW_VERSION_ATTR, FW_STATE_ATTR,
};
use crate::transport::{percent_encode, Request, Transport, TransportError};

const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSettings {
    pub request_timeout: Duration,
    pub download_timeout: Duration,
    /// Fixed delay between failed preflights.
    pub retry_delay: Duration,
    /// Preflights made for one request before it is reported failed.
    pub max_preflight_attempts: u32,
    /// Refuse images whose checksum algorithm is not supported.
    pub strict_checksum: bool,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            download_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(60),
            max_preflight_attempts: 10,
            strict_checksum: false,
        }
    }
}

/// Resolves where an image is downloaded from.
#[derive(Debug, Clone)]
pub struct FirmwareLocator {
    api_base: String,
    access_token: Option<String>,
}

impl FirmwareLocator {
    pub fn new(api_base: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            api_base: api_base.into(),
            access_token,
        }
    }

    /// `None` for a lookup request when no access token is configured.
    pub fn resolve(&self, request: &UpdateRequest) -> Option<String> {
        match &request.delivery {
            Delivery::Direct { url } => Some(url.clone()),
            Delivery::Lookup => {
                let token = self.access_token.as_deref()?;
                Some(format!(
                    "{}/api/v1/{}/firmware?title={}&version={}",
                    self.api_base.trim_end_matches('/'),
                    percent_encode(token),
                    percent_encode(&request.title),
                    percent_encode(&request.version)
                ))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Preflighting,
    Downloading,
    Verifying,
    Applying,
    /// Boot slot switched, restart pending.
    Committed,
    Failed,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("download returned no data")]
    EmptyDownload,
    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },
    #[error("apply failed: {0}")]
    Apply(String),
    #[error("server answered HTTP {0}")]
    Status(u16),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl UpdateError {
    /// Coarse tag reported as `fw_error`.
    pub fn tag(&self) -> &'static str {
        match self {
            UpdateError::EmptyDownload => "empty_download",
            UpdateError::ChecksumMismatch { .. } => "checksum_mismatch",
            UpdateError::Apply(_) => "apply_failed",
            UpdateError::Status(_) | UpdateError::Transport(_) => "transport_error",
        }
    }
}

fn apply_error(e: anyhow::Error) -> UpdateError {
    UpdateError::Apply(format!("{:#}", e))
}

#[derive(Debug)]
pub enum Outcome {
    /// The push did not describe firmware.
    Ignored,
    Rejected(String),
    AlreadyCurrent,
    Deferred { attempt: u32, retry_at: Instant },
    Failed(UpdateError),
    /// Image installed, the device is restarting.
    Restarting,
    NothingDue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareStatus {
    pub record: FirmwareRecord,
    pub state: UpdateState,
    pub pending_version: Option<String>,
    pub pending_attempts: u32,
    pub last_error: Option<&'static str>,
}

pub struct UpdateController<T, S, P> {
    transport: T,
    slot: S,
    power: P,
    telemetry: Arc<dyn Telemetry>,
    store: LineStore,
    locator: FirmwareLocator,
    settings: UpdateSettings,
    record: FirmwareRecord,
    state: UpdateState,
    pending: RetrySlot,
    last_error: Option<&'static str>,
}

impl<T: Transport, S: ImageSlot, P: Power> UpdateController<T, S, P> {
    pub fn new(
        transport: T,
        slot: S,
        power: P,
        telemetry: Arc<dyn Telemetry>,
        store: LineStore,
        locator: FirmwareLocator,
        settings: UpdateSettings,
    ) -> Self {
        let record = match store.load::<FirmwareRecord>() {
            Ok(Some(record)) => record,
            Ok(None) => FirmwareRecord::builtin(),
            Err(e) => {
                error!("Failed to read {}: {}", store.path().display(), e);
                FirmwareRecord::builtin()
            }
        };
        info!(
            "Current firmware: {} {} (confirmed: {})",
            record.title, record.version, record.confirmed
        );
        Self {
            transport,
            slot,
            power,
            telemetry,
            store,
            locator,
            settings,
            record,
            state: UpdateState::Idle,
            pending: RetrySlot::default(),
            last_error: None,
        }
    }

    pub fn record(&self) -> &FirmwareRecord {
        &self.record
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn pending(&self) -> Option<&PendingRetry> {
        self.pending.peek()
    }

    pub fn next_retry_deadline(&self) -> Option<Instant> {
        self.pending.deadline()
    }

    pub fn status(&self) -> FirmwareStatus {
        FirmwareStatus {
            record: self.record.clone(),
            state: self.state,
            pending_version: self.pending.peek().map(|p| p.request.version.clone()),
            pending_attempts: self.pending.peek().map_or(0, |p| p.attempt_count),
            last_error: self.last_error,
        }
    }

    /// Announces the running image on its first boot after an update.
    ///
    /// The record is only trusted while the bootloader still reports the
    /// running image as pending verification. Otherwise the update never
    /// came up and the record falls back to the built-in identity.
    ///
    /// Returns `false` when nothing was confirmed.
    pub fn confirm_boot(&mut self) -> bool {
        if self.record.confirmed {
            debug!("Firmware {} already confirmed", self.record.version);
            return false;
        }
        match self.slot.running_pending_verify() {
            Ok(true) => {}
            Ok(false) => {
                self.revert_record();
                return false;
            }
            Err(e) => {
                error!("Failed to read running image state: {:?}", e);
                self.revert_record();
                return false;
            }
        }
        info!(
            "First boot of {} {}, confirming update",
            self.record.title, self.record.version
        );
        if let Err(e) = self.slot.mark_running_valid() {
            error!("Failed to mark running image valid: {:?}", e);
        }
        telemetry::send_attributes(
            &*self.telemetry,
            &identity_payload(&self.record.title, &self.record.version),
        );
        telemetry::send(
            &*self.telemetry,
            &json!({
                FW_STATE_ATTR: FwState::Updated.as_str(),
                CURRENT_FW_TITLE_ATTR: &self.record.title,
                CURRENT_FW_VERSION_ATTR: &self.record.version
            }),
        );
        self.record.confirmed = true;
        if let Err(e) = self.store.save(&self.record) {
            error!("Failed to persist firmware confirmation: {}", e);
        }
        true
    }

    /// The recorded update is not what is running: report the rollback and
    /// go back to the identity compiled into this image.
    fn revert_record(&mut self) {
        let builtin = FirmwareRecord::builtin();
        warn!(
            "Firmware {} {} is not running (rolled back), now {} {}",
            self.record.title, self.record.version, builtin.title, builtin.version
        );
        self.record = builtin;
        if let Err(e) = self.store.save(&self.record) {
            error!("Failed to persist firmware record: {}", e);
        }
        self.last_error = Some("apply_failed");
        telemetry::send_attributes(
            &*self.telemetry,
            &identity_payload(&self.record.title, &self.record.version),
        );
        telemetry::send(&*self.telemetry, &failure_payload("apply_failed"));
    }

    /// Asks the cloud for the current firmware attributes.
    pub fn request_attributes(&self) {
        match self.telemetry.request_attributes(&FIRMWARE_KEYS) {
            Ok(()) => info!("Requested firmware info"),
            Err(e) => error!("Failed to request firmware info: {:?}", e),
        }
    }

    pub fn handle_attributes(&mut self, payload: &str, now: Instant) -> Outcome {
        match UpdateRequest::from_attributes(payload) {
            Ok(Some(request)) => self.submit(request, now),
            Ok(None) => {
                debug!("Attributes carry no firmware fields");
                Outcome::Ignored
            }
            Err(e) => {
                warn!("Dropping firmware attributes: {}", e);
                Outcome::Rejected(e.to_string())
            }
        }
    }

    pub fn submit(&mut self, request: UpdateRequest, now: Instant) -> Outcome {
        info!(
            "Comparing fw_title: '{}' vs '{}', fw_version: '{}' vs '{}'",
            request.title, self.record.title, request.version, self.record.version
        );
        if request.version == self.record.version {
            info!("No new firmware detected: version {} is installed", request.version);
            if let Some(stale) = self.pending.clear() {
                info!("Dropped pending update to {}", stale.request.version);
            }
            return Outcome::AlreadyCurrent;
        }
        if self.settings.strict_checksum && !request.algorithm.is_recognized() {
            warn!(
                "Refusing firmware {}: checksum algorithm '{}' is not supported",
                request.version, request.algorithm
            );
            return Outcome::Rejected(format!("unsupported checksum algorithm {}", request.algorithm));
        }
        if self.locator.resolve(&request).is_none() {
            warn!(
                "Refusing firmware {}: no access token for the firmware API",
                request.version
            );
            return Outcome::Rejected("no access token for firmware lookup".to_string());
        }
        if let Some(previous) = self.pending.clear() {
            info!(
                "Replacing pending update to {} with {}",
                previous.request.version, request.version
            );
        }
        self.attempt(request, 1, now)
    }

    /// Runs the pending retry if its deadline has passed.
    pub fn retry_due(&mut self, now: Instant) -> Outcome {
        let Some(retry) = self.pending.take_due(now) else {
            return Outcome::NothingDue;
        };
        info!(
            "Retrying update to {} (attempt {})",
            retry.request.version,
            retry.attempt_count + 1
        );
        self.attempt(retry.request, retry.attempt_count + 1, now)
    }

    fn attempt(&mut self, request: UpdateRequest, attempt_count: u32, now: Instant) -> Outcome {
        let Some(url) = self.locator.resolve(&request) else {
            return Outcome::Rejected("no access token for firmware lookup".to_string());
        };
        self.state = UpdateState::Preflighting;
        if let Err(e) = self.preflight(&url) {
            self.state = UpdateState::Idle;
            if attempt_count >= self.settings.max_preflight_attempts {
                warn!(
                    "Preflight for {} failed {} times, giving up",
                    request.version, attempt_count
                );
                return self.fail(e);
            }
            let retry_at = now + self.settings.retry_delay;
            warn!(
                "Preflight for {} failed ({}), retrying in {:?}",
                request.version, e, self.settings.retry_delay
            );
            self.pending.store(PendingRetry {
                request,
                attempt_count,
                next_attempt: retry_at,
            });
            return Outcome::Deferred {
                attempt: attempt_count,
                retry_at,
            };
        }
        match self.install(&request, &url) {
            Ok(()) => Outcome::Restarting,
            Err(e) => self.fail(e),
        }
    }

    fn preflight(&mut self, url: &str) -> Result<(), UpdateError> {
        let status = self
            .transport
            .open(&Request::head(url, self.settings.request_timeout))?
            .status;
        // 405: the server does not implement HEAD but the endpoint exists.
        if (200..300).contains(&status) || status == 405 {
            Ok(())
        } else {
            Err(UpdateError::Status(status))
        }
    }

    fn install(&mut self, request: &UpdateRequest, url: &str) -> Result<(), UpdateError> {
        self.state = UpdateState::Downloading;
        info!(
            "New firmware available: {} {}, starting download ({} bytes)",
            request.title, request.version, request.size
        );
        telemetry::send(&*self.telemetry, &state_payload(FwState::Downloading));

        let mut response = self
            .transport
            .open(&Request::get(url, self.settings.download_timeout))?;
        if !response.is_success() {
            return Err(UpdateError::Status(response.status));
        }
        let mut writer = self.slot.begin(Some(request.size)).map_err(apply_error)?;
        let mut hasher = request.algorithm.hasher();
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut received: u64 = 0;
        loop {
            let n = match response.body.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::from(e).into()),
            };
            writer.write(&chunk[..n]).map_err(apply_error)?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk[..n]);
            }
            received += n as u64;
        }
        drop(response);

        info!("Downloaded {} of {} bytes", received, request.size);
        if received == 0 {
            return Err(UpdateError::EmptyDownload);
        }
        if received != request.size {
            warn!(
                "Downloaded size {} differs from announced {}",
                received, request.size
            );
        }
        telemetry::send(&*self.telemetry, &state_payload(FwState::Downloaded));

        self.state = UpdateState::Verifying;
        match hasher {
            Some(hasher) => {
                let computed = hasher.finalize_hex();
                info!(
                    "Computed checksum: {}, Expected checksum: {}",
                    computed, request.checksum
                );
                if !checksum_matches(&request.algorithm, &request.checksum, &computed) {
                    return Err(UpdateError::ChecksumMismatch {
                        expected: request.checksum.clone(),
                        computed,
                    });
                }
                telemetry::send(&*self.telemetry, &state_payload(FwState::Verified));
            }
            None => warn!(
                "Checksum algorithm '{}' is not supported, installing {} unverified",
                request.algorithm, request.version
            ),
        }

        self.state = UpdateState::Applying;
        writer.finalize().map_err(apply_error)?;
        writer.activate().map_err(apply_error)?;

        self.record = FirmwareRecord::installed(&request.title, &request.version);
        if let Err(e) = self.store.save(&self.record) {
            error!("Failed to persist firmware record: {}", e);
        }
        self.state = UpdateState::Committed;
        self.last_error = None;
        telemetry::send(
            &*self.telemetry,
            &json!({
                FW_STATE_ATTR: FwState::Updated.as_str(),
                CURRENT_FW_TITLE_ATTR: &request.title,
                CURRENT_FW_VERSION_ATTR: &request.version
            }),
        );
        info!("Firmware update successful, restarting...");
        self.power.restart();
        Ok(())
    }

    fn fail(&mut self, error: UpdateError) -> Outcome {
        self.state = UpdateState::Failed;
        error!("Firmware update failed: {}", error);
        telemetry::send(&*self.telemetry, &failure_payload(error.tag()));
        self.last_error = Some(error.tag());
        self.state = UpdateState::Idle;
        Outcome::Failed(error)
    }
}
