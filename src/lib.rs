//! Firmware for a battery-powered sensor node: over-the-air updates driven by
//! cloud attributes, a chat-bot command channel and a deep-sleep policy.

pub mod bot;
pub mod config;
pub mod firmware;
pub mod line_store;
pub mod platform;
pub mod sleep;
pub mod telemetry;
pub mod transport;

#[cfg(target_os = "espidf")]
pub mod esp;

#[cfg(test)]
mod testing;
