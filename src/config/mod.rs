//! Runtime settings, loaded from an optional JSON file.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::camera::UploadLimits;
use crate::discovery::DiscoveryTiming;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read settings: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid settings file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid setting '{0}': must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Missing keys fall back to the defaults below
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,

    pub camera_server_enabled: bool,
    pub camera_server_bind: String,
    pub socket_connect_timeout_ms: u64,
    pub socket_read_timeout_ms: u64,
    pub socket_write_timeout_ms: u64,
    pub server_header_timeout_ms: u64,
    pub server_idle_timeout_ms: u64,
    pub server_max_body_bytes: usize,

    pub discovery_enabled: bool,
    pub discovery_port: u16,
    pub discovery_group: Ipv4Addr,
    pub discovery_interface: Ipv4Addr,
    pub discovery_tick_ms: u64,
    pub discovery_recv_window_ms: u64,
    pub discovery_expiry_secs: u64,

    pub serial_read_timeout_ms: u64,
    pub serial_scan_interval_ms: u64,
    pub wifi_reconfigure_delay_ms: u64,

    pub shutdown_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),

            camera_server_enabled: true,
            camera_server_bind: "0.0.0.0:10000".to_string(),
            socket_connect_timeout_ms: 1000,
            socket_read_timeout_ms: 1000,
            socket_write_timeout_ms: 5000,
            server_header_timeout_ms: 1000,
            server_idle_timeout_ms: 300,
            server_max_body_bytes: 16 * 1024 * 1024,

            discovery_enabled: true,
            discovery_port: 5000,
            discovery_group: Ipv4Addr::new(224, 0, 0, 1),
            discovery_interface: Ipv4Addr::UNSPECIFIED,
            discovery_tick_ms: 200,
            discovery_recv_window_ms: 100,
            discovery_expiry_secs: 20,

            serial_read_timeout_ms: 500,
            serial_scan_interval_ms: 2000,
            wifi_reconfigure_delay_ms: 1000,

            shutdown_timeout_ms: 2000,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let settings = Self::from_json(&text)?;
        log::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Periods used for timers must be non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("discovery_tick_ms", self.discovery_tick_ms),
            ("serial_scan_interval_ms", self.serial_scan_interval_ms),
            ("socket_connect_timeout_ms", self.socket_connect_timeout_ms),
            ("socket_read_timeout_ms", self.socket_read_timeout_ms),
            ("socket_write_timeout_ms", self.socket_write_timeout_ms),
            ("serial_read_timeout_ms", self.serial_read_timeout_ms),
        ];
        match periods.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::ZeroDuration(name)),
            None => Ok(()),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_write_timeout_ms)
    }

    pub fn serial_read_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_read_timeout_ms)
    }

    pub fn serial_scan_interval(&self) -> Duration {
        Duration::from_millis(self.serial_scan_interval_ms)
    }

    pub fn wifi_reconfigure_delay(&self) -> Duration {
        Duration::from_millis(self.wifi_reconfigure_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn upload_limits(&self) -> UploadLimits {
        UploadLimits {
            header_timeout: Duration::from_millis(self.server_header_timeout_ms),
            idle_timeout: Duration::from_millis(self.server_idle_timeout_ms),
            max_body: self.server_max_body_bytes,
        }
    }

    pub fn discovery_timing(&self) -> DiscoveryTiming {
        DiscoveryTiming {
            tick: Duration::from_millis(self.discovery_tick_ms),
            recv_window: Duration::from_millis(self.discovery_recv_window_ms),
            expiry: Duration::from_secs(self.discovery_expiry_secs),
        }
    }
}
