//! Server configuration management.
//!
//! Grounded on the teacher's `ServerConfig` (TOML on disk, `dirs::config_dir`
//! default path, validate-then-use), generalised to this bridge's TCP
//! listener and URB-timeout knobs in place of the teacher's Iroh/security
//! sections, which have no counterpart here.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub limits: LimitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub service_mode: bool,
    pub log_level: String,
}

/// Tunables that otherwise default to the constants in `protocol::constants`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    pub urb_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind_addr: format!("0.0.0.0:{}", protocol::DEFAULT_PORT),
                service_mode: false,
                log_level: "info".to_string(),
            },
            limits: LimitSettings {
                urb_timeout_ms: protocol::DEFAULT_URB_TIMEOUT_MS,
            },
        }
    }
}

impl ServerConfig {
    /// Load configuration from the specified path, or the first standard
    /// location that exists.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/vusb-bridge/server.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("no configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file: {}", config_path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
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
            config_dir.join("vusb-bridge").join("server.toml")
        } else {
            PathBuf::from(".config/vusb-bridge/server.toml")
        }
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        self.server
            .bind_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow!("invalid bind_addr '{}': {e}", self.server.bind_addr))?;

        if self.limits.urb_timeout_ms == 0 {
            return Err(anyhow!("limits.urb_timeout_ms must be greater than zero"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert!(!config.server.service_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = ServerConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ServerConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.server.bind_addr, parsed.server.bind_addr);
        assert_eq!(config.limits.urb_timeout_ms, parsed.limits.urb_timeout_ms);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_ok());

        config.server.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.server.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_bind_addr() {
        let mut config = ServerConfig::default();
        config.server.bind_addr = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_urb_timeout() {
        let mut config = ServerConfig::default();
        config.limits.urb_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_and_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        let config = ServerConfig::default();
        config.save(&path).unwrap();

        let loaded = ServerConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.server.bind_addr, config.server.bind_addr);
    }
}
