// Centralized version information

// Cargo package version from Cargo.toml - this is what the device reports
// as its current firmware version
pub const FW_VERSION: &str = env!("CARGO_PKG_VERSION");

// Version info string for logging
pub fn version_info() -> String {
    format!("gateway-ota {}", FW_VERSION)
}
