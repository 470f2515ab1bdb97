//! Configuration management for kmscap

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Capture configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// DRM device node
    pub device: PathBuf,

    /// Plane to capture, 0 picks the first plane with a framebuffer
    pub plane: u32,

    /// Restrict automatic plane selection to this CRTC, 0 for any
    pub crtc: u32,

    /// Use this driver's access strategy instead of the kernel driver name
    pub force_driver: Option<String>,

    /// Read hardware surfaces through a derived image
    pub va_derive: bool,

    /// Log every VA-API image format and relax format matching
    pub va_list_formats: bool,

    /// Capture the hardware cursor plane
    pub capture_cursor: bool,

    /// Sample the cursor every N frames
    pub cursor_frameskip: u32,

    /// Report every frame fully dirty instead of diffing
    pub disable_compare: bool,

    /// Target capture rate
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/dri/card0"),
            plane: 0,
            crtc: 0,
            force_driver: None,
            va_derive: false,
            va_list_formats: false,
            capture_cursor: false,
            cursor_frameskip: 15,
            disable_compare: false,
            fps: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

/// Maximum accepted `fps`
pub const MAX_FPS: u32 = 240;

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    Read(PathBuf, std::io::Error),
    Parse(toml::de::Error),
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(path, e) => write!(f, "Failed to read {}: {}", path.display(), e),
            ConfigError::Parse(e) => write!(f, "Invalid configuration file: {}", e),
            ConfigError::Invalid(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capture = &self.capture;
        if capture.device.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("Capture device must not be empty"));
        }

        if capture.fps == 0 {
            return Err(ConfigError::Invalid("Capture fps must be non-zero"));
        }

        if capture.fps > MAX_FPS {
            return Err(ConfigError::Invalid("Capture fps cannot exceed 240"));
        }

        if capture.cursor_frameskip == 0 {
            return Err(ConfigError::Invalid("Cursor frameskip must be non-zero"));
        }

        if let Some(ref driver) = capture.force_driver {
            if driver.trim().is_empty() {
                return Err(ConfigError::Invalid("Forced driver name must not be empty"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.capture.cursor_frameskip, 15);
        assert_eq!(cfg.capture.fps, 30);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn validate_rejects_bad_fps() {
        let mut cfg = Config::default();
        cfg.capture.fps = 0;
        assert!(cfg.validate().is_err());
        cfg.capture.fps = 241;
        assert!(cfg.validate().is_err());
        cfg.capture.fps = 240;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_frameskip_and_empty_device() {
        let mut cfg = Config::default();
        cfg.capture.cursor_frameskip = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.capture.device = PathBuf::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parse_partial_file() {
        let cfg = Config::parse(
            r#"
            [capture]
            device = "/dev/dri/card1"
            force_driver = "test-map-dumb"
            capture_cursor = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.capture.device, PathBuf::from("/dev/dri/card1"));
        assert_eq!(cfg.capture.force_driver.as_deref(), Some("test-map-dumb"));
        assert!(cfg.capture.capture_cursor);
        assert_eq!(cfg.capture.fps, 30);
        assert_eq!(cfg.logging, LoggingConfig::default());
    }

    #[test]
    fn parse_rejects_wrong_types() {
        assert!(matches!(Config::parse("[capture]\nfps = \"fast\""), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/kmscap.toml")).unwrap();
        assert_eq!(cfg.capture, CaptureConfig::default());
    }
}
