//! TOML-based configuration for the host application.
//!
//! The file lives at `<platform config dir>/vdm-host/config.toml`:
//!
//! ```toml
//! [host]
//! log_level = "info"
//! display_fps = 60
//! display_rotation_enabled = true
//! # record_dir = "/tmp/vdm-recordings"
//!
//! [link]
//! device_name = "office-pc"
//!
//! [discovery]
//! discovery_port = 24810
//! ```
//!
//! Every table and every key is optional.  Missing ones fall back to the
//! defaults, so a first run without any file works out of the box.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vdm_link::config::{config_dir, load_toml, save_toml, ConfigError, LinkConfig};
use vdm_link::infrastructure::discovery::lan::LanDiscoveryConfig;

const APP_DIR: &str = "vdm-host";

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level host configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub discovery: LanDiscoveryConfig,
}

/// Display streaming behaviour of the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    /// Schema version string.
    #[serde(default = "default_version")]
    pub version: String,
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Frame rate the encoders are configured with.
    #[serde(default = "default_display_fps")]
    pub display_fps: u32,
    /// Whether rotation changes of a virtual display are reported to the client.
    #[serde(default = "default_true")]
    pub display_rotation_enabled: bool,
    /// When set, each display's encoded stream is also written to
    /// `vdm_encoder_output_<id>.h264` in this directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_dir: Option<PathBuf>,
}

fn default_version() -> String {
    "1.0".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_display_fps() -> u32 {
    60
}
fn default_true() -> bool {
    true
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            log_level: default_log_level(),
            display_fps: default_display_fps(),
            display_rotation_enabled: default_true(),
            record_dir: None,
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Full path of the host's config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
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

// ── Tests ─────────────────────────────────────────────────────────────────────
