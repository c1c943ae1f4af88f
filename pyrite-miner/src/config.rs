//! Configuration for mining devices.
//!
//! Device settings are supplied as JSON, one entry per physical device. The
//! port, clock, and core count come from the operator; the baud rate does
//! not appear here because it is fixed per device family.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_cores() -> u32 {
    1
}

/// Settings for one serial-attached mining device.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// The port the device is connected to. Linux /dev/tty*, Windows COM*.
    pub port: String,

    /// Chip clock in MHz. Clamped by the device family to its supported
    /// range.
    pub clock: u16,

    /// Number of hashing cores on the device
    #[serde(default = "default_cores")]
    pub cores: u32,

    /// Milliseconds the listener waits between polls for incoming data.
    /// Larger values lower processor usage but delay share submission.
    #[serde(rename = "poll", default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Milliseconds without any sign of life before the device is declared
    /// hung and reconnected.
    #[serde(rename = "watchdog")]
    pub watchdog_timeout_ms: u64,
}

impl DeviceConfig {
    /// Check the settings and apply defaults for out-of-range values.
    ///
    /// A zero poll interval is replaced with the default rather than
    /// rejected, matching the behavior operators expect from hand-edited
    /// settings files. An empty port or a zero watchdog timeout has no sane
    /// substitute and is an error.
    pub fn validate(mut self) -> Result<Self> {
        if self.port.is_empty() {
            return Err(Error::Config("device port must not be empty".into()));
        }
        if self.watchdog_timeout_ms == 0 {
            return Err(Error::Config(format!(
                "device {}: watchdog timeout must be positive",
                self.port
            )));
        }
        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = DEFAULT_POLL_INTERVAL_MS;
        }
        Ok(self)
    }
}

/// Top-level settings file: a list of devices to load.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub devices: Vec<DeviceConfig>,
}

impl Settings {
    /// Load and validate settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        let raw: Settings = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;
        let devices = raw
            .devices
            .into_iter()
            .map(DeviceConfig::validate)
            .collect::<Result<Vec<_>>>()?;
        Ok(Settings { devices })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(port: &str) -> DeviceConfig {
        DeviceConfig {
            port: port.to_string(),
            clock: 328,
            cores: 6,
            poll_interval_ms: 50,
            watchdog_timeout_ms: 60_000,
        }
    }

    #[test]
    fn rejects_empty_port() {
        assert!(config("").validate().is_err());
    }

    #[test]
    fn rejects_zero_watchdog() {
        let mut cfg = config("/dev/ttyUSB0");
        cfg.watchdog_timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_poll_interval_gets_default() {
        let mut cfg = config("/dev/ttyUSB0");
        cfg.poll_interval_ms = 0;
        let cfg = cfg.validate().unwrap();
        assert_eq!(cfg.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
    }

    #[test]
    fn parses_settings_json() {
        let json = r#"{
            "devices": [
                { "port": "/dev/ttyUSB0", "clock": 328, "cores": 6, "watchdog": 60000 },
                { "port": "COM3", "clock": 350, "poll": 100, "watchdog": 2000 }
            ]
        }"#;
        let raw: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(raw.devices.len(), 2);
        assert_eq!(raw.devices[0].poll_interval_ms, 50);
        assert_eq!(raw.devices[0].cores, 6);
        assert_eq!(raw.devices[1].poll_interval_ms, 100);
        assert_eq!(raw.devices[1].cores, 1);
        assert_eq!(raw.devices[1].watchdog_timeout_ms, 2000);
    }
}
