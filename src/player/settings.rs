//! Persisted viewer settings
//!
//! Flat `key = value` TOML written next to the user configuration. A missing
//! file yields the defaults.

use crate::utils::error::{IntoStreamError, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerSettings {
    /// Shift applied to reported positions and incoming seeks
    pub offset_ms: i64,

    /// Output volume in percent (0 to 100)
    pub volume: u8,

    /// Whether video frames are delivered at all
    pub visible: bool,

    /// Height frames are displayed at; 0 keeps the native height
    pub display_height: u32,
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self {
            offset_ms: 0,
            volume: 100,
            visible: true,
            display_height: 0,
        }
    }
}

impl ViewerSettings {
    /// Load from `path`, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No viewer settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).file_err("Failed to read viewer settings")?;
        let mut settings: ViewerSettings =
            toml::from_str(&contents).config_err("Failed to parse viewer settings")?;

        if settings.volume > 100 {
            warn!("Viewer volume {} clamped to 100", settings.volume);
            settings.volume = 100;
        }
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).file_err("Failed to create settings directory")?;
        }
        let contents = toml::to_string(self).config_err("Failed to serialize viewer settings")?;
        fs::write(path, contents).file_err("Failed to write viewer settings")
    }

    /// Default location beside the user configuration
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("avsync").join("viewer.toml"))
    }

    /// Volume as a gain factor
    pub fn gain(&self) -> f32 {
        self.volume.min(100) as f32 / 100.0
    }

    /// Frame size scaled to the display height, keeping the aspect ratio
    pub fn display_size(&self, width: u32, height: u32) -> (u32, u32) {
        if self.display_height == 0 || height == 0 {
            return (width, height);
        }
        let scaled = (width as u64 * self.display_height as u64 + height as u64 / 2) / height as u64;
        (scaled as u32, self.display_height)
    }
}
