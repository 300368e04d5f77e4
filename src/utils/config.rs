//! Configuration management for avsync
//!
//! This module handles loading and managing engine configuration
//! from config files and environment variables.

use crate::decoder::{MAX_SPEED, MIN_SPEED};
use crate::utils::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Playback engine configuration
    pub engine: EngineConfig,

    /// Audio output configuration
    pub audio: AudioConfig,

    /// Decoder configuration
    pub decoder: DecoderConfig,

    /// Spectrum analysis configuration
    pub spectrum: SpectrumConfig,

    /// General application settings
    pub general: GeneralConfig,
}

/// Playback engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Slowest (most negative) playback speed accepted
    pub min_speed: f32,

    /// Fastest playback speed accepted
    pub max_speed: f32,

    /// How long a stream reader waits before polling an idle decoder again
    pub idle_poll_ms: u64,
}

/// Audio output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Maximum span of queued audio ahead of playback, in milliseconds
    pub buffer_horizon_ms: u64,

    /// Size of one decoded audio chunk in bytes
    pub chunk_size: usize,

    /// Output sink
    pub output: OutputKind,

    /// Pacing factor of the null sink (0 disables pacing)
    pub null_time_scale: f32,

    /// Initial volume (0.0 - 1.0)
    pub volume: f32,
}

/// Where decoded audio goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Default system output device
    Device,

    /// Discard samples
    Null,
}

/// Decoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Backend name: auto, wav, synthetic or ffmpeg
    pub backend: String,

    /// Requested color space
    pub color_space: String,

    /// Requested audio layout: mono_signed or stereo_unsigned
    pub audio: String,
}

/// Spectrum analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrumConfig {
    /// Run the spectrum processor next to audio playback
    pub enabled: bool,

    /// Number of logarithmically spaced bands
    pub bands: usize,
}

/// General application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Default buffering horizon
pub const DEFAULT_BUFFER_HORIZON_MS: u64 = 1000;

/// Default audio chunk size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Audio chunk size of the simple variant (8 KiB)
pub const SMALL_CHUNK_SIZE: usize = 8 * 1024;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_speed: MIN_SPEED,
            max_speed: MAX_SPEED,
            idle_poll_ms: 20,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            buffer_horizon_ms: DEFAULT_BUFFER_HORIZON_MS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            output: OutputKind::Device,
            null_time_scale: 1.0,
            volume: 1.0,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            backend: "auto".to_string(),
            color_space: "srgb".to_string(),
            audio: "mono_signed".to_string(),
        }
    }
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bands: 30,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Reader idle wait as a Duration
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

impl AudioConfig {
    /// Buffering horizon in microseconds
    pub fn buffer_horizon_us(&self) -> i64 {
        self.buffer_horizon_ms as i64 * 1000
    }
}

impl Config {
    /// Load configuration from various sources
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. System config file (/etc/avsync/config.toml on Linux)
    /// 3. User config file (~/.config/avsync/config.toml on Linux)
    /// 4. The explicitly given file, if any
    /// 5. Environment variables (AVSYNC_* prefix)
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(system_path) = Self::system_config_path() {
            if system_path.exists() {
                config = Self::from_file(&system_path)?;
            }
        }

        if let Some(user_path) = Self::user_config_path() {
            if user_path.exists() {
                config = Self::from_file(&user_path)?;
            }
        }

        if let Some(path) = explicit {
            config = Self::from_file(path)?;
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to user config file
    pub fn save(&self) -> Result<()> {
        let path = Self::user_config_path()
            .ok_or_else(|| StreamError::Config("Cannot determine user config path".to_string()))?;
        self.save_to(&path)
    }

    /// Save configuration to the given file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StreamError::Config(format!("Failed to create config directory: {}", e)))?;
        }

        let toml = toml::to_string_pretty(self)
            .map_err(|e| StreamError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml)
            .map_err(|e| StreamError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Read a complete configuration from a TOML file; missing keys take defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StreamError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&contents)
            .map_err(|e| StreamError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(horizon) = std::env::var("AVSYNC_BUFFER_HORIZON_MS") {
            self.audio.buffer_horizon_ms = horizon
                .parse()
                .map_err(|_| StreamError::Config("Invalid AVSYNC_BUFFER_HORIZON_MS".to_string()))?;
        }

        if let Ok(chunk) = std::env::var("AVSYNC_CHUNK_SIZE") {
            self.audio.chunk_size = chunk
                .parse()
                .map_err(|_| StreamError::Config("Invalid AVSYNC_CHUNK_SIZE".to_string()))?;
        }

        if let Ok(backend) = std::env::var("AVSYNC_BACKEND") {
            self.decoder.backend = backend;
        }

        if let Ok(log_level) = std::env::var("AVSYNC_LOG_LEVEL") {
            self.general.log_level = log_level;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.audio.buffer_horizon_ms == 0 {
            return Err(StreamError::Config("Buffer horizon must be non-zero".to_string()));
        }

        if self.audio.chunk_size == 0 {
            return Err(StreamError::Config("Audio chunk size must be non-zero".to_string()));
        }

        if !(0.0..=1.0).contains(&self.audio.volume) {
            return Err(StreamError::Config("Audio volume must be between 0.0 and 1.0".to_string()));
        }

        if !(self.engine.min_speed < 0.0 && self.engine.max_speed > 0.0) {
            return Err(StreamError::Config(format!(
                "Speed bounds [{}, {}] must straddle zero",
                self.engine.min_speed, self.engine.max_speed
            )));
        }

        if self.engine.min_speed < MIN_SPEED || self.engine.max_speed > MAX_SPEED {
            return Err(StreamError::Config(format!(
                "Speed bounds [{}, {}] exceed what decoders accept ([{}, {}])",
                self.engine.min_speed, self.engine.max_speed, MIN_SPEED, MAX_SPEED
            )));
        }

        if self.spectrum.bands < 2 {
            return Err(StreamError::Config("Spectrum needs at least two bands".to_string()));
        }

        let valid_backends = ["auto", "wav", "synthetic", "ffmpeg"];
        if !valid_backends.contains(&self.decoder.backend.as_str()) {
            return Err(StreamError::Config(format!(
                "Invalid backend '{}', must be one of: {:?}",
                self.decoder.backend, valid_backends
            )));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.general.log_level.as_str()) {
            return Err(StreamError::Config(format!(
                "Invalid log level '{}', must be one of: {:?}",
                self.general.log_level, valid_log_levels
            )));
        }

        Ok(())
    }

    /// Get system config file path
    fn system_config_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        return Some(PathBuf::from("/etc/avsync/config.toml"));

        #[cfg(target_os = "windows")]
        return std::env::var("PROGRAMDATA")
            .ok()
            .map(|p| PathBuf::from(p).join("avsync").join("config.toml"));

        #[cfg(target_os = "macos")]
        return Some(PathBuf::from("/Library/Application Support/avsync/config.toml"));

        #[allow(unreachable_code)]
        None
    }

    /// Get user config file path
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("avsync").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.audio.buffer_horizon_ms, 1000);
        assert_eq!(config.audio.buffer_horizon_us(), 1_000_000);
        assert_eq!(config.audio.chunk_size, 64 * 1024);
        assert_eq!(config.engine.min_speed, -4.0);
        assert_eq!(config.engine.max_speed, 4.0);
        assert_eq!(config.spectrum.bands, 30);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.audio.buffer_horizon_ms = 0;
        assert!(config.validate().is_err());

        config.audio.buffer_horizon_ms = 1000;
        config.engine.min_speed = 0.5;
        assert!(config.validate().is_err());

        config.engine.min_speed = -4.0;
        config.decoder.backend = "quicktime".to_string();
        assert!(config.validate().is_err());

        config.decoder.backend = "wav".to_string();
        config.general.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_speed_bounds_within_decoder_limits() {
        let mut config = Config::default();
        config.engine.max_speed = 8.0;
        assert!(matches!(config.validate(), Err(StreamError::Config(_))));

        config.engine.max_speed = 2.0;
        config.engine.min_speed = -4.5;
        assert!(config.validate().is_err());

        config.engine.min_speed = -1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.audio.output = OutputKind::Null;
        let toml = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml).unwrap();

        assert_eq!(config.audio.buffer_horizon_ms, deserialized.audio.buffer_horizon_ms);
        assert_eq!(deserialized.audio.output, OutputKind::Null);
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[audio]\nchunk_size = 8192\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.audio.chunk_size, SMALL_CHUNK_SIZE);
        assert_eq!(config.audio.buffer_horizon_ms, DEFAULT_BUFFER_HORIZON_MS);
        assert_eq!(config.decoder.backend, "auto");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.spectrum.enabled = true;
        config.save_to(&path).unwrap();

        let reloaded = Config::from_file(&path).unwrap();
        assert!(reloaded.spectrum.enabled);
    }
}
