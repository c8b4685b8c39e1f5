//! Link settings and TOML persistence helpers shared by the host and client.
//!
//! Each binary stores one `config.toml` in the platform config directory:
//! - Windows:  `%APPDATA%\<app>\config.toml`
//! - Linux:    `$XDG_CONFIG_HOME/<app>/config.toml` or `~/.config/<app>/config.toml`
//! - macOS:    `~/Library/Application Support/<app>/config.toml`
//!
//! The `[link]` table of that file deserialises into [`LinkConfig`]:
//!
//! ```toml
//! [link]
//! service_name = "vdm.remote-session"
//! device_name = "living-room-tablet"
//! handshake_timeout_ms = 10000
//! attach_retries = 1
//! attach_retry_delay_ms = 500
//! bind_address = "0.0.0.0"
//! ```
//!
//! Every field has a `#[serde(default = "...")]`, so a missing file, a missing
//! table or a missing key all fall back to the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Discovery and handshake settings of the session coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    /// Service name the host publishes and the client subscribes to.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Identity sent to the peer during the handshake.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Upper bound for the TCP accept (host) or connect (client).
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// How many times a failed discovery attach is retried.
    #[serde(default = "default_attach_retries")]
    pub attach_retries: u32,
    #[serde(default = "default_attach_retry_delay_ms")]
    pub attach_retry_delay_ms: u64,
    /// Address the host's data socket listens on.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl LinkConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn attach_retry_delay(&self) -> Duration {
        Duration::from_millis(self.attach_retry_delay_ms)
    }
}

fn default_service_name() -> String {
    "vdm.remote-session".to_string()
}
fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "vdm-device".to_string())
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_attach_retries() -> u32 {
    1
}
fn default_attach_retry_delay_ms() -> u64 {
    500
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            device_name: default_device_name(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            attach_retries: default_attach_retries(),
            attach_retry_delay_ms: default_attach_retry_delay_ms(),
            bind_address: default_bind_address(),
        }
    }
}

// ── Persistence ──────────────────────────────────────────────────────────────

/// Platform config directory for the application `app`.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the base directory cannot
/// be determined from the environment.
pub fn config_dir(app: &str) -> Result<PathBuf, ConfigError> {
    platform_config_base()
        .map(|base| base.join(app))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Reads `path` as TOML, returning `T::default()` if the file does not exist.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] for malformed TOML.
pub fn load_toml<T>(path: &Path) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `value` to `path` as pretty TOML, creating parent directories.
pub fn save_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(value)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_base() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(PathBuf::from)
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join("Library").join("Application Support"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch_file() -> PathBuf {
        std::env::temp_dir()
            .join(format!("vdm-link-config-{}", Uuid::new_v4()))
            .join("config.toml")
    }

    #[test]
    fn test_link_config_defaults() {
        // Arrange / Act
        let cfg = LinkConfig::default();

        // Assert
        assert_eq!(cfg.service_name, "vdm.remote-session");
        assert_eq!(cfg.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.attach_retries, 1);
        assert_eq!(cfg.attach_retry_delay(), Duration::from_millis(500));
        assert_eq!(cfg.bind_address, "0.0.0.0");
        assert!(!cfg.device_name.is_empty());
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let cfg: LinkConfig = toml::from_str("device_name = \"tablet\"").expect("parse");
        assert_eq!(cfg.device_name, "tablet");
        assert_eq!(cfg.handshake_timeout_ms, 10_000);
    }

    #[test]
    fn test_load_missing_file_yields_default() {
        let cfg: LinkConfig = load_toml(&scratch_file()).expect("load");
        assert_eq!(cfg.service_name, "vdm.remote-session");
    }

    #[test]
    fn test_save_then_load_restores_values() {
        // Arrange
        let path = scratch_file();
        let cfg = LinkConfig {
            device_name: "client-A".to_string(),
            attach_retries: 3,
            ..LinkConfig::default()
        };

        // Act
        save_toml(&path, &cfg).expect("save");
        let restored: LinkConfig = load_toml(&path).expect("load");

        // Assert
        assert_eq!(restored, cfg);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        let path = scratch_file();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "attach_retries = \"many\"").unwrap();

        let result: Result<LinkConfig, _> = load_toml(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
