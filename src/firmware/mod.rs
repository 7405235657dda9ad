//! Over-the-air firmware updates driven by cloud shared attributes.
//!
//! A push is admitted, gated on the installed version, probed with a cheap
//! preflight and then streamed into the inactive boot slot while a digest is
//! folded over it. Only a verified and activated image is recorded, after
//! which the device restarts. A failed preflight parks the request in a
//! single retry slot.

mod controller;
mod digest;
mod record;
mod request;
mod retry;
mod task;

pub use controller::{
    FirmwareLocator, FirmwareStatus, Outcome, UpdateController, UpdateError, UpdateSettings,
    UpdateState,
};
pub use digest::{checksum_matches, ChecksumAlgorithm, Hasher};
pub use record::FirmwareRecord;
pub use request::{AdmissionError, Delivery, UpdateRequest, FIRMWARE_KEYS};
pub use retry::{PendingRetry, RetrySlot};
pub use task::{run, spawn, UpdateEvent, UpdateHandle};
