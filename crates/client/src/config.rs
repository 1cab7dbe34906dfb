//! Client configuration management.
//!
//! Grounded on the teacher's `ClientConfig` (TOML on disk, `dirs::config_dir`
//! default path, validate-then-use), generalised to this bridge's TCP
//! server address and device-filter settings in place of the teacher's
//! Iroh/approved-servers sections, which have no counterpart here.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub client: ClientSettings,
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// `host:port` of the bridge server to connect to.
    pub server_addr: String,
    /// Name advertised in the CONNECT handshake.
    pub client_name: String,
    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub log_level: String,
}

/// Which locally-attached devices get offered to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// `VID:PID` allowlist, e.g. `"046d:c52b"`. Empty means "attach
    /// everything rusb can open".
    #[serde(default)]
    pub filters: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client: ClientSettings {
                server_addr: format!("127.0.0.1:{}", protocol::DEFAULT_PORT),
                client_name: "vusb-client".to_string(),
                auto_reconnect: true,
                reconnect_delay_ms: 5_000,
                log_level: "info".to_string(),
            },
            usb: UsbSettings {
                filters: Vec::new(),
            },
        }
    }
}

impl ClientConfig {
    /// Load configuration from the specified path, or the first standard
    /// location that exists.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/vusb-bridge/client.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("no configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file: {}", config_path.display()))?;

        let config: ClientConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults if none is found.
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("failed to load config: {e}, using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
        }

        fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        tracing::info!("saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("vusb-bridge").join("client.toml")
        } else {
            PathBuf::from(".config/vusb-bridge/client.toml")
        }
    }

    /// Parsed `VID:PID` filters, lower-cased hex without validation beyond
    /// parseability; an unparseable entry is dropped with a warning rather
    /// than rejected outright, since it's re-checked at the point of use.
    pub fn parsed_filters(&self) -> Vec<(u16, u16)> {
        self.usb
            .filters
            .iter()
            .filter_map(|f| {
                let (vid, pid) = f.split_once(':')?;
                let vid = u16::from_str_radix(vid.trim(), 16).ok()?;
                let pid = u16::from_str_radix(pid.trim(), 16).ok()?;
                Some((vid, pid))
            })
            .collect()
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.client.reconnect_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.client.log_level.as_str()) {
            return Err(anyhow!(
                "invalid log level '{}', must be one of: {}",
                self.client.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.client.server_addr.trim().is_empty() {
            return Err(anyhow!("client.server_addr must not be empty"));
        }

        if self.client.client_name.trim().is_empty() {
            return Err(anyhow!("client.client_name must not be empty"));
        }

        for filter in &self.usb.filters {
            let (vid, pid) = filter
                .split_once(':')
                .ok_or_else(|| anyhow!("invalid usb filter '{filter}', expected VID:PID"))?;
            u16::from_str_radix(vid.trim(), 16)
                .map_err(|_| anyhow!("invalid vendor id in filter '{filter}'"))?;
            u16::from_str_radix(pid.trim(), 16)
                .map_err(|_| anyhow!("invalid product id in filter '{filter}'"))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.client.log_level, "info");
        assert!(config.client.auto_reconnect);
        assert!(config.usb.filters.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = ClientConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ClientConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.client.server_addr, parsed.client.server_addr);
        assert_eq!(config.client.client_name, parsed.client.client_name);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = ClientConfig::default();
        config.client.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_server_addr() {
        let mut config = ClientConfig::default();
        config.client.server_addr = "".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_and_parse_filters() {
        let mut config = ClientConfig::default();
        config.usb.filters.push("046d:c52b".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.parsed_filters(), vec![(0x046d, 0xc52b)]);

        config.usb.filters.push("not-a-filter".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_and_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        let config = ClientConfig::default();
        config.save(&path).unwrap();

        let loaded = ClientConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.client.server_addr, config.client.server_addr);
    }
}
