//! TOML-based configuration persistence for the daemon.
//!
//! Reads and writes [`AppConfig`] at
//! `$XDG_CONFIG_HOME/guest-input/config.toml` (falling back to
//! `~/.config/guest-input/config.toml`).
//!
//! # Serde default values
//!
//! Every field carries a `#[serde(default = "...")]`, so a missing file,
//! an empty file, and a file from an older release all load cleanly with
//! the documented defaults filled in.
//!
//! # Setting paths
//!
//! The control surface addresses individual settings with slash-separated
//! paths (`/mouse/speed`, `/keyboard/numlock-restore-on-switch`, ...),
//! a convention kept from the platform's settings tree.  The path-keyed
//! accessors at the bottom translate between those paths and the typed
//! config.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::engine::EngineConfig;
use crate::application::routing::RoutingConfig;
use crate::application::switcher::SwitcherConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine the config directory")]
    NoConfigDir,

    #[error("i/o error accessing config at {path}: {source}")]
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

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level daemon configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub mouse: MouseConfig,
    #[serde(default)]
    pub keyboard: KeyboardConfig,
    #[serde(default)]
    pub touchpad: TouchpadSettings,
    #[serde(default)]
    pub switcher: SwitcherSettings,
}

/// General daemon behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// User the idle lock authenticates against.
    #[serde(default = "default_platform_user")]
    pub platform_user: String,
}

/// Pointer acceleration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MouseConfig {
    /// Speed step, 1..=10.
    #[serde(default = "default_speed_step")]
    pub speed: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyboardConfig {
    /// Restore the destination's numlock state on keyboard handover
    /// instead of forcing it off.
    #[serde(default = "default_true")]
    pub numlock_restore_on_switch: bool,
}

/// Touchpad pipeline toggles.  Named to avoid a clash with the pipeline's
/// own config type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TouchpadSettings {
    #[serde(default = "default_true")]
    pub tap_to_click_enabled: bool,
    #[serde(default = "default_true")]
    pub scrolling_enabled: bool,
    /// Speed step, 1..=10.
    #[serde(default = "default_speed_step")]
    pub speed: i32,
}

/// VM switching behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwitcherSettings {
    /// Whether screen-edge mouse switching is available at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub keyboard_follows_mouse: bool,
    /// Ignore switch requests to the already-focused domain.
    #[serde(default = "default_true")]
    pub self_switch_disabled: bool,
    /// Pixels of push against the screen edge before a mouse switch.
    #[serde(default = "default_resistance")]
    pub resistance: i32,
    /// Idle seconds before the screen locks; 0 disables the timer.
    #[serde(default)]
    pub lock_timeout: u32,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_platform_user() -> String {
    "root".to_string()
}
fn default_true() -> bool {
    true
}
fn default_speed_step() -> i32 {
    5
}
fn default_resistance() -> i32 {
    10
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            platform_user: default_platform_user(),
        }
    }
}

impl Default for MouseConfig {
    fn default() -> Self {
        Self {
            speed: default_speed_step(),
        }
    }
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self {
            numlock_restore_on_switch: default_true(),
        }
    }
}

impl Default for TouchpadSettings {
    fn default() -> Self {
        Self {
            tap_to_click_enabled: default_true(),
            scrolling_enabled: default_true(),
            speed: default_speed_step(),
        }
    }
}

impl Default for SwitcherSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            keyboard_follows_mouse: false,
            self_switch_disabled: default_true(),
            resistance: default_resistance(),
            lock_timeout: 0,
        }
    }
}

impl TouchpadSettings {
    pub fn to_pipeline_config(&self) -> input_core::normalize::touchpad::TouchpadConfig {
        input_core::normalize::touchpad::TouchpadConfig {
            tap_to_click_enabled: self.tap_to_click_enabled,
            scrolling_enabled: self.scrolling_enabled,
            speed: self.speed,
        }
    }
}

impl AppConfig {
    /// Folds the persisted settings into the engine's runtime config.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            routing: RoutingConfig {
                mouse_speed_step: self.mouse.speed,
                numlock_restore_on_switch: self.keyboard.numlock_restore_on_switch,
                switch_resistance: self.switcher.resistance,
            },
            switcher: SwitcherConfig {
                enabled: self.switcher.enabled,
                keyboard_follows_mouse: self.switcher.keyboard_follows_mouse,
                self_switch_disabled: self.switcher.self_switch_disabled,
            },
            touchpad: self.touchpad.to_pipeline_config(),
            lock_timeout_secs: self.switcher.lock_timeout,
            platform_user: self.daemon.platform_user.clone(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

pub fn config_dir() -> Result<PathBuf, ConfigError> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .ok_or(ConfigError::NoConfigDir)?;
    Ok(base.join("guest-input"))
}

pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config from disk; a missing file yields the defaults.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

pub fn load_config_from(path: &PathBuf) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.clone(),
            source: e,
        }),
    }
}

/// Persists the config, creating the directory on first save.
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(config, &config_file_path()?)
}

pub fn save_config_to(config: &AppConfig, path: &PathBuf) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })
}

// ── Path-keyed accessors ──────────────────────────────────────────────────────

/// Every setting path the control surface knows about.
pub const SETTING_PATHS: &[&str] = &[
    "/mouse/speed",
    "/keyboard/numlock-restore-on-switch",
    "/touchpad/tap-to-click-enabled",
    "/touchpad/scrolling-enabled",
    "/touchpad/speed",
    "/switcher/enabled",
    "/switcher/keyboard-follows-mouse",
    "/switcher/resistance",
    "/switcher/lock-timeout",
];

pub fn setting_exists(path: &str) -> bool {
    SETTING_PATHS.contains(&path)
}

/// Reads one setting as its string form, `None` for unknown paths.
pub fn read_setting(config: &AppConfig, path: &str) -> Option<String> {
    let value = match path {
        "/mouse/speed" => config.mouse.speed.to_string(),
        "/keyboard/numlock-restore-on-switch" => {
            config.keyboard.numlock_restore_on_switch.to_string()
        }
        "/touchpad/tap-to-click-enabled" => config.touchpad.tap_to_click_enabled.to_string(),
        "/touchpad/scrolling-enabled" => config.touchpad.scrolling_enabled.to_string(),
        "/touchpad/speed" => config.touchpad.speed.to_string(),
        "/switcher/enabled" => config.switcher.enabled.to_string(),
        "/switcher/keyboard-follows-mouse" => config.switcher.keyboard_follows_mouse.to_string(),
        "/switcher/resistance" => config.switcher.resistance.to_string(),
        "/switcher/lock-timeout" => config.switcher.lock_timeout.to_string(),
        _ => return None,
    };
    Some(value)
}

/// Writes one setting from its string form.  Returns false for unknown
/// paths or unparsable values.
pub fn write_setting(config: &mut AppConfig, path: &str, value: &str) -> bool {
    fn set<T: std::str::FromStr>(slot: &mut T, value: &str) -> bool {
        match value.trim().parse() {
            Ok(v) => {
                *slot = v;
                true
            }
            Err(_) => false,
        }
    }

    match path {
        "/mouse/speed" => set(&mut config.mouse.speed, value),
        "/keyboard/numlock-restore-on-switch" => {
            set(&mut config.keyboard.numlock_restore_on_switch, value)
        }
        "/touchpad/tap-to-click-enabled" => set(&mut config.touchpad.tap_to_click_enabled, value),
        "/touchpad/scrolling-enabled" => set(&mut config.touchpad.scrolling_enabled, value),
        "/touchpad/speed" => set(&mut config.touchpad.speed, value),
        "/switcher/enabled" => set(&mut config.switcher.enabled, value),
        "/switcher/keyboard-follows-mouse" => {
            set(&mut config.switcher.keyboard_follows_mouse, value)
        }
        "/switcher/resistance" => set(&mut config.switcher.resistance, value),
        "/switcher/lock-timeout" => set(&mut config.switcher.lock_timeout, value),
        _ => false,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.mouse.speed, 5);
        assert!(cfg.keyboard.numlock_restore_on_switch);
        assert!(cfg.touchpad.tap_to_click_enabled);
        assert!(cfg.touchpad.scrolling_enabled);
        assert_eq!(cfg.touchpad.speed, 5);
        assert!(cfg.switcher.enabled);
        assert!(!cfg.switcher.keyboard_follows_mouse);
        assert_eq!(cfg.switcher.resistance, 10);
        assert_eq!(cfg.switcher.lock_timeout, 0);
        assert_eq!(cfg.daemon.log_level, "info");
    }

    #[test]
    fn test_round_trip() {
        // Arrange
        let mut cfg = AppConfig::default();
        cfg.mouse.speed = 8;
        cfg.switcher.lock_timeout = 300;

        // Act
        let text = toml::to_string_pretty(&cfg).expect("serialize");
        let restored: AppConfig = toml::from_str(&text).expect("deserialize");

        // Assert
        assert_eq!(cfg, restored);
    }

    #[test]
    fn test_empty_file_loads_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        // Arrange
        let text = r#"
[mouse]
speed = 9
"#;

        // Act
        let cfg: AppConfig = toml::from_str(text).expect("deserialize");

        // Assert
        assert_eq!(cfg.mouse.speed, 9);
        assert!(cfg.keyboard.numlock_restore_on_switch);
        assert_eq!(cfg.switcher.resistance, 10);
    }

    #[test]
    fn test_save_and_load_round_trip_via_temp_dir() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("guest-input-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.touchpad.speed = 2;

        // Act
        save_config_to(&cfg, &path).expect("save");
        let loaded = load_config_from(&path).expect("load");

        // Assert
        assert_eq!(loaded, cfg);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let path = PathBuf::from("/nonexistent/guest-input/config.toml");
        let cfg = load_config_from(&path).expect("load");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_engine_config_folds_sections() {
        // Arrange
        let mut cfg = AppConfig::default();
        cfg.mouse.speed = 7;
        cfg.keyboard.numlock_restore_on_switch = false;
        cfg.touchpad.tap_to_click_enabled = false;
        cfg.switcher.resistance = 25;
        cfg.switcher.lock_timeout = 600;

        // Act
        let engine = cfg.engine_config();

        // Assert
        assert_eq!(engine.routing.mouse_speed_step, 7);
        assert!(!engine.routing.numlock_restore_on_switch);
        assert_eq!(engine.routing.switch_resistance, 25);
        assert!(!engine.touchpad.tap_to_click_enabled);
        assert_eq!(engine.lock_timeout_secs, 600);
        assert_eq!(engine.platform_user, "root");
    }

    #[test]
    fn test_setting_paths_read_back() {
        // Arrange
        let cfg = AppConfig::default();

        // Act / Assert
        for path in SETTING_PATHS {
            assert!(setting_exists(path));
            assert!(read_setting(&cfg, path).is_some(), "missing {path}");
        }
        assert!(read_setting(&cfg, "/no/such/path").is_none());
        assert!(!setting_exists("/no/such/path"));
    }

    #[test]
    fn test_write_setting_updates_config() {
        // Arrange
        let mut cfg = AppConfig::default();

        // Act
        assert!(write_setting(&mut cfg, "/mouse/speed", "3"));
        assert!(write_setting(
            &mut cfg,
            "/keyboard/numlock-restore-on-switch",
            "false"
        ));

        // Assert
        assert_eq!(cfg.mouse.speed, 3);
        assert!(!cfg.keyboard.numlock_restore_on_switch);
    }

    #[test]
    fn test_write_setting_rejects_garbage() {
        let mut cfg = AppConfig::default();
        assert!(!write_setting(&mut cfg, "/mouse/speed", "fast"));
        assert!(!write_setting(&mut cfg, "/no/such/path", "1"));
        assert_eq!(cfg, AppConfig::default());
    }
}
