//! Configuration system
//!
//! Settings are plain serde structs loadable from TOML or RON files. All
//! render configuration is supplied once at device creation; there is no
//! runtime reconfiguration surface.

use serde::{Deserialize, Serialize};

use crate::render::BackendType;

/// Configuration trait for serde-backed settings types
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, Default::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Render settings consumed once by [`crate::render::GraphicsDevice::new`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Preferred rendering backend
    pub backend: BackendType,
    /// Initial swapchain width in pixels
    pub width: u32,
    /// Initial swapchain height in pixels
    pub height: u32,
    /// Window title
    pub title: String,
    /// Enable API validation layers when available
    pub validation: bool,
    /// Run without a window or swapchain
    pub headless: bool,
    /// Prefer a vsync-locked present mode
    pub vsync: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            backend: BackendType::Default,
            width: 1280,
            height: 720,
            title: "Ember".to_string(),
            validation: cfg!(debug_assertions),
            headless: false,
            vsync: true,
        }
    }
}

impl Config for RenderSettings {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_windowed_vulkan() {
        let settings = RenderSettings::default();
        assert_eq!(settings.backend, BackendType::Default);
        assert!(!settings.headless);
        assert!(settings.width > 0 && settings.height > 0);
    }

    #[test]
    fn settings_round_trip_through_toml() {
        let mut settings = RenderSettings::default();
        settings.backend = BackendType::Vulkan;
        settings.validation = true;
        settings.headless = true;

        let text = toml::to_string_pretty(&settings).unwrap();
        let parsed: RenderSettings = toml::from_str(&text).unwrap();
        assert_eq!(parsed.backend, BackendType::Vulkan);
        assert!(parsed.validation);
        assert!(parsed.headless);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let parsed: RenderSettings = toml::from_str("width = 640\nheight = 480\n").unwrap();
        assert_eq!(parsed.width, 640);
        assert_eq!(parsed.height, 480);
        assert_eq!(parsed.title, RenderSettings::default().title);
    }
}
