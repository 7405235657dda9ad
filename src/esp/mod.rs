//! ESP-IDF implementations of the platform seams.

mod http;
mod mqtt;
mod net;
mod ota;
mod power;

pub use http::EspTransport;
pub use mqtt::SimpleMqttClient;
pub use net::{connect_wifi, init_sntp, install_ca_store, mount_storage};
pub use ota::EspImageSlot;
pub use power::EspPower;
