//! Runtime configuration
//!
//! Every field has a default matching the classic `childwin.py` tutorial
//! window, so an empty (or absent) config file reproduces it exactly.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default display name. An empty string defers to `$DISPLAY`.
pub const DEFAULT_DISPLAY: &str = ":9";

/// Seconds the sleep tail blocks for when not overridden.
pub const DEFAULT_SLEEP_SECONDS: u64 = 60 * 60 * 60;

/// How the background tile is drawn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackgroundStyle {
    /// One fill covering the whole tile with the white pixel
    #[default]
    Solid,
    /// Black tile with four overlapping white circles
    FourArcPattern,
}

/// What happens after the window is mapped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tail {
    #[default]
    EventLoop,
    Sleep,
}

/// ICCCM properties set on the window when WM integration is on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WmConfig {
    /// WM_NAME
    pub name: String,
    /// WM_ICON_NAME
    pub icon_name: String,
    /// First half of WM_CLASS
    pub instance: String,
    /// Second half of WM_CLASS
    pub class: String,
    pub min_width: i32,
    pub min_height: i32,
}

impl Default for WmConfig {
    fn default() -> Self {
        Self {
            name: "Xlib example: childwin.py".to_string(),
            icon_name: "childwin.py".to_string(),
            instance: "childwin".to_string(),
            class: "XlibExample".to_string(),
            min_width: 50,
            min_height: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// X display to connect to (e.g. ":9", "127.0.0.1:3")
    pub display: String,

    /// Edge length of the square background tile (pixels)
    pub background_size: u16,
    pub background_style: BackgroundStyle,

    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    pub border_width: u16,

    /// Set WM_NAME, WM_CLASS, WM_PROTOCOLS and friends
    pub wm_integration: bool,
    /// Leave the event loop on a WM_DELETE_WINDOW client message
    pub honor_close_request: bool,
    /// Leave the event loop once DestroyNotify has been seen
    pub exit_on_destroy: bool,

    pub wm: WmConfig,

    pub tail: Tail,
    pub sleep_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display: DEFAULT_DISPLAY.to_string(),
            background_size: 20,
            background_style: BackgroundStyle::default(),
            x: 20,
            y: 200,
            width: 500,
            height: 500,
            border_width: 0,
            wm_integration: false,
            honor_close_request: false,
            exit_on_destroy: true,
            wm: WmConfig::default(),
            tail: Tail::default(),
            sleep_seconds: DEFAULT_SLEEP_SECONDS,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&content).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(?path, display = %config.display, tail = ?config.tail, "loaded configuration");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Display name handed to x11rb; `None` means "use $DISPLAY".
    pub fn display_name(&self) -> Option<&str> {
        if self.display.is_empty() {
            None
        } else {
            Some(&self.display)
        }
    }

    pub fn sleep_duration(&self) -> Duration {
        Duration::from_secs(self.sleep_seconds)
    }
}
