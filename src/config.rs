use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::platform::KvStore;

const CONFIG_KEY: &str = "config";

/// Which network link the gateway is currently provisioned for. Link
/// bring-up itself (WiFi association, PPP negotiation) happens elsewhere;
/// the update pipeline only uses this to pick a download transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMode {
    Wifi,
    Sim,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Network settings
    pub network_mode: NetworkMode,
    pub sim_apn: String,

    // Download settings
    pub download_chunk_size: usize,
    pub modem_max_redirects: u32,
    pub stream_max_redirects: u32,

    // Timeouts
    pub http_timeout_secs: u32,
    pub connect_timeout_secs: u32,

    // Reboot behavior
    pub reboot_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network_mode: NetworkMode::Wifi,
            sim_apn: "airteliot".to_string(),
            download_chunk_size: 2048,
            modem_max_redirects: crate::http::redirect::MODEM_MAX_REDIRECTS,
            stream_max_redirects: crate::http::redirect::STREAM_MAX_REDIRECTS,
            http_timeout_secs: 60,
            connect_timeout_secs: 30,
            reboot_delay_ms: 1000,
        }
    }
}

impl Config {
    pub fn save(&self, kv: &mut dyn KvStore) -> Result<()> {
        let json = serde_json::to_string(self)?;
        kv.set_str(CONFIG_KEY, &json)?;
        log::info!("Configuration saved");
        Ok(())
    }
}

pub fn load_or_default(kv: &dyn KvStore) -> Config {
    match kv.get_str(CONFIG_KEY) {
        Some(json) => match serde_json::from_str(&json) {
            Ok(config) => {
                log::info!("Loaded configuration from store");
                config
            }
            Err(e) => {
                log::warn!("Stored configuration unreadable ({}), using defaults", e);
                Config::default()
            }
        },
        None => {
            log::info!("No stored configuration, using defaults");
            Config::default()
        }
    }
}
