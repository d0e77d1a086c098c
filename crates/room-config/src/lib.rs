//! Server configuration loading (SPEC_FULL §4.9): parses a TOML file into
//! [`ConfigFile`], the raw deserialized shape, and exposes [`Config`], the
//! effective read-only-after-load values spec.md §6's Configuration
//! Surface names. Mirrors the teacher's `core-config::{ConfigFile,
//! Config}` split: raw parsed data vs. the resolved values the rest of the
//! program actually consumes.

use std::path::{Path, PathBuf};

use room_catalog::ColorWhitelist;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config toml: {0}")]
    Parse(#[from] toml::de::Error),
}

fn default_tick_rate_hz() -> u32 {
    20
}
fn default_avatar_speed() -> f64 {
    4.0
}
fn default_emote_duration_ms() -> u64 {
    2000
}
fn default_room_id() -> String {
    "lobby".to_string()
}
fn default_max_stack_z() -> f64 {
    20.0
}
fn default_stack_factor() -> f64 {
    1.0
}

/// The raw, tolerantly-parsed shape of the config file. Unknown fields are
/// ignored (forward-compatible, matching the teacher's TOML deserialization
/// stance); fields with no sensible default (the catalog paths) are
/// required and a missing one is a parse error, since a room server with
/// no furniture catalog cannot start (spec §7).
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_tick_rate_hz")]
    pub tick_rate_hz: u32,
    #[serde(default = "default_avatar_speed")]
    pub avatar_speed: f64,
    #[serde(default = "default_emote_duration_ms")]
    pub default_emote_duration_ms: u64,
    #[serde(default = "default_room_id")]
    pub default_room_id: String,
    #[serde(default)]
    pub initial_rooms: Vec<String>,
    #[serde(default = "default_max_stack_z")]
    pub max_stack_z: f64,
    #[serde(default = "default_stack_factor")]
    pub default_stack_factor: f64,
    #[serde(default)]
    pub avatar_default_z: f64,
    #[serde(default)]
    pub valid_recolor_hex: Vec<String>,
    pub furniture_catalog_path: String,
    #[serde(default)]
    pub emote_catalog_path: Option<String>,
    #[serde(default)]
    pub shop_catalog_path: Option<String>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            tick_rate_hz: default_tick_rate_hz(),
            avatar_speed: default_avatar_speed(),
            default_emote_duration_ms: default_emote_duration_ms(),
            default_room_id: default_room_id(),
            initial_rooms: Vec::new(),
            max_stack_z: default_max_stack_z(),
            default_stack_factor: default_stack_factor(),
            avatar_default_z: 0.0,
            valid_recolor_hex: Vec::new(),
            furniture_catalog_path: "furniture.toml".to_string(),
            emote_catalog_path: None,
            shop_catalog_path: None,
        }
    }
}

/// Effective, read-only-after-load configuration. No method here takes
/// `&mut self`; the only way to get one is [`Config::load`] or
/// [`Config::from_file`].
#[derive(Debug, Clone)]
pub struct Config {
    pub file: ConfigFile,
    pub recolor_whitelist: ColorWhitelist,
}

impl Config {
    fn from_file(file: ConfigFile) -> Self {
        let recolor_whitelist = ColorWhitelist::new(file.valid_recolor_hex.iter().cloned());
        Self { file, recolor_whitelist }
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.file.tick_rate_hz.max(1) as f64)
    }

    /// Load from `path`, or from `room-server.toml` in the current
    /// directory when `path` is `None`. A missing file falls back to
    /// defaults (matching the teacher's resilience); an existing file that
    /// fails to parse is a hard error, since a server should not silently
    /// boot with defaults that disagree with an operator's intent.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("room-server.toml"));
        if !path.exists() {
            tracing::warn!(target: "room.config", path = %path.display(), "config file not found, using defaults");
            return Ok(Self::from_file(ConfigFile::default()));
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file: ConfigFile = toml::from_str(&raw)?;
        tracing::info!(target: "room.config", path = %path.display(), "loaded config");
        Ok(Self::from_file(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::load(Some(Path::new("__definitely_not_there__.toml"))).unwrap();
        assert_eq!(cfg.file.tick_rate_hz, 20);
        assert_eq!(cfg.file.default_room_id, "lobby");
    }

    #[test]
    fn parses_full_surface_from_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            r#"
tick_rate_hz = 30
avatar_speed = 5.0
default_emote_duration_ms = 3000
default_room_id = "plaza"
initial_rooms = ["plaza", "lounge"]
max_stack_z = 12.0
default_stack_factor = 0.5
avatar_default_z = 0.0
valid_recolor_hex = ["#AABBCC", "#112233"]
furniture_catalog_path = "furniture.toml"
emote_catalog_path = "emotes.toml"
shop_catalog_path = "shop.toml"
"#,
        )
        .unwrap();
        let cfg = Config::load(Some(tmp.path())).unwrap();
        assert_eq!(cfg.file.tick_rate_hz, 30);
        assert_eq!(cfg.file.initial_rooms, vec!["plaza", "lounge"]);
        assert!(cfg.recolor_whitelist.is_allowed("#aabbcc"));
        assert_eq!(cfg.file.emote_catalog_path.as_deref(), Some("emotes.toml"));
    }

    #[test]
    fn missing_furniture_catalog_path_is_a_parse_error() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "tick_rate_hz = 20\n").unwrap();
        let err = Config::load(Some(tmp.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn tick_interval_matches_tick_rate() {
        let cfg = Config::from_file(ConfigFile {
            tick_rate_hz: 20,
            ..ConfigFile::default()
        });
        assert_eq!(cfg.tick_interval(), std::time::Duration::from_millis(50));
    }
}
