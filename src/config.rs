// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Device selection, render defaults and logging options. Every table falls back
// to defaults, so an empty or missing file is a valid configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub render: RenderConfig,
    pub debug: DebugConfig,
}

/// Device settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub app_name: String,
    /// Vulkan loader library to open, empty uses the platform default
    pub backend: String,
    pub validation_layers: bool,
    pub prefer_discrete_gpu: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "offscreen-renderer".to_string(),
            backend: String::new(),
            validation_layers: false,
            prefer_discrete_gpu: true,
        }
    }
}

/// Render defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub clear_color: [f32; 4],
    pub default_format: String,
    pub row_order: String,
    /// Fence wait bound in milliseconds, 0 waits forever
    pub timeout_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            default_format: "4b".to_string(),
            row_order: "top_down".to_string(),
            timeout_ms: 0,
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_to_file: false,
            log_file: "offscreen_renderer.log".to_string(),
        }
    }
}

/// Row order used by image read/write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOrder {
    TopDown,
    BottomUp,
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get row order as enum
    pub fn get_row_order(&self) -> RowOrder {
        match self.render.row_order.to_lowercase().as_str() {
            "top_down" => RowOrder::TopDown,
            "bottom_up" => RowOrder::BottomUp,
            _ => {
                log::warn!(
                    "Unknown row order '{}', defaulting to top_down",
                    self.render.row_order
                );
                RowOrder::TopDown
            }
        }
    }

    /// Fence timeout in nanoseconds
    pub fn get_timeout_ns(&self) -> u64 {
        match self.render.timeout_ms {
            0 => u64::MAX,
            ms => ms.saturating_mul(1_000_000),
        }
    }
}
