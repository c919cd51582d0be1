//! TOML configuration file loading
//!
//! Supports `~/.config/live-orb/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::audio::Resampling;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct OrbConfigFile {
    /// Remote session configuration
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Audio pipeline configuration
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Visual signal configuration
    #[serde(default)]
    pub visuals: VisualsFileConfig,

    /// Language prefix to system instruction overrides
    #[serde(default)]
    pub instructions: BTreeMap<String, String>,
}

/// Remote session configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Model identifier
    pub model: Option<String>,

    /// Prebuilt voice name (e.g. "Orus")
    pub voice: Option<String>,

    /// BCP-47 language tag (e.g. "en-US")
    pub language: Option<String>,

    /// Speaking rate multiplier
    pub speaking_rate: Option<f32>,
}

/// Audio pipeline configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Samples per capture frame
    pub capture_buffer_size: Option<usize>,

    /// Resampling strategy for received audio
    pub resampling: Option<Resampling>,

    /// Play UI click/chime sounds
    pub ui_sounds: Option<bool>,

    /// Seconds to wait for the connection to open
    pub connect_timeout_secs: Option<u64>,
}

/// Visual signal configuration
#[derive(Debug, Default, Deserialize)]
pub struct VisualsFileConfig {
    /// Number of particles in the shell
    pub particle_count: Option<usize>,

    /// Animation ticks per second
    pub fps: Option<u32>,

    /// Fixed random seed for reproducible visuals
    pub seed: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `OrbConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> OrbConfigFile {
    config_file_path().map_or_else(OrbConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Returns `OrbConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_from(path: &Path) -> OrbConfigFile {
    if !path.exists() {
        return OrbConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                OrbConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            OrbConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/live-orb/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("live-orb").join("config.toml"))
}
