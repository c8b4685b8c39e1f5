//! TOML-based configuration for the client application.
//!
//! The file lives at `<platform config dir>/vdm-client/config.toml`:
//!
//! ```toml
//! [client]
//! viewport_width = 1280
//! viewport_height = 800
//! density_dpi = 213
//!
//! [link]
//! device_name = "tablet"
//! ```
//!
//! Missing tables and keys fall back to the defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vdm_link::config::{config_dir, load_toml, save_toml, ConfigError, LinkConfig};
use vdm_link::infrastructure::discovery::lan::LanDiscoveryConfig;

use crate::application::client_display::Viewport;

const APP_DIR: &str = "vdm-client";

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level client configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub discovery: LanDiscoveryConfig,
}

/// Viewport and logging settings of the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Size in pixels of the area each remote display is shown in.
    #[serde(default = "default_viewport_width")]
    pub viewport_width: u32,
    #[serde(default = "default_viewport_height")]
    pub viewport_height: u32,
    #[serde(default = "default_density_dpi")]
    pub density_dpi: u32,
}

fn default_version() -> String {
    "1.0".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_viewport_width() -> u32 {
    1080
}
fn default_viewport_height() -> u32 {
    1920
}
fn default_density_dpi() -> u32 {
    320
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            log_level: default_log_level(),
            viewport_width: default_viewport_width(),
            viewport_height: default_viewport_height(),
            density_dpi: default_density_dpi(),
        }
    }
}

impl ClientConfig {
    pub fn viewport(&self) -> Viewport {
        Viewport {
            width: self.viewport_width,
            height: self.viewport_height,
            density_dpi: self.density_dpi,
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Full path of the client's config file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir(APP_DIR)?.join("config.toml"))
}

/// Loads the config at `path`, or the defaults if the file does not exist.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    load_toml(path)
}

pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    save_toml(path, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_viewport_is_portrait_phone() {
        let viewport = AppConfig::default().client.viewport();

        assert_eq!(
            viewport,
            Viewport {
                width: 1080,
                height: 1920,
                density_dpi: 320
            }
        );
    }

    #[test]
    fn test_partial_client_table_keeps_other_defaults() {
        // Arrange
        let text = r#"
            [client]
            viewport_width = 1280
            log_level = "debug"
        "#;

        // Act
        let cfg: AppConfig = toml::from_str(text).expect("parse");

        // Assert
        assert_eq!(cfg.client.viewport_width, 1280);
        assert_eq!(cfg.client.viewport_height, 1920);
        assert_eq!(cfg.client.log_level, "debug");
        assert_eq!(cfg.link, LinkConfig::default());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        // Arrange
        let path = std::env::temp_dir()
            .join(format!("vdm-client-missing-{}", uuid::Uuid::new_v4()))
            .join("config.toml");

        // Act
        let cfg = load_config(&path).expect("load");

        // Assert
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_save_then_load_restores_config() {
        let path = std::env::temp_dir()
            .join(format!("vdm-client-config-{}", uuid::Uuid::new_v4()))
            .join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.client.density_dpi = 160;
        cfg.link.device_name = "tablet".to_string();

        save_config(&path, &cfg).expect("save");
        let restored = load_config(&path).expect("load");

        assert_eq!(restored, cfg);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
