//! Firmware update pipeline for the ESP32 Modbus IoT gateway.
//!
//! The gateway's telemetry side lives elsewhere; this crate owns the part
//! that keeps the device updatable in the field over unreliable links: two
//! download transports (a streaming HTTPS client and a modem-mediated
//! AT-command HTTPS client), a rollback-safe partition writer, and the
//! update orchestrator with progress reporting and cancellation.
//!
//! Hardware access is injected through the [`platform`] traits, so the
//! whole pipeline builds and tests on the host; ESP-IDF-backed
//! implementations are behind the `esp` feature.

pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod modem;
pub mod ota;
pub mod platform;
pub mod version;

#[cfg(test)]
mod tests;

pub use config::{Config, NetworkMode};
pub use error::UpdateError;
pub use http::streaming::StreamingClient;
pub use http::FirmwareSource;
pub use modem::ModemHttpClient;
pub use ota::{UpdateInfo, UpdateManager, UpdateStatus};
