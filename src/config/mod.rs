//! Configuration management for the live-orb client

pub mod file;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::audio::Resampling;
use crate::visuals::DEFAULT_PARTICLE_COUNT;
use crate::{Error, Result};

/// Live audio dialog model
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-preview-native-audio-dialog";

/// Prebuilt voices the remote model offers
pub const KNOWN_VOICES: &[&str] = &["Orus", "Choral", "Lyra", "Seraph", "Echo", "Nimbus"];

/// Languages offered in the settings
pub const SUPPORTED_LANGUAGES: &[&str] = &["en-US", "es-US", "fr-FR", "de-DE"];

/// Speaking rate bounds (inclusive)
pub const SPEAKING_RATE_RANGE: std::ops::RangeInclusive<f32> = 0.5..=2.0;

/// Used when no prefix in the table matches the language tag
const FALLBACK_INSTRUCTION: &str =
    "You are a helpful voice assistant. Please respond in the user's language.";

/// Complete client configuration
#[derive(Debug, Clone, Default, Serialize)]
pub struct Config {
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub visuals: VisualsConfig,
    pub instructions: InstructionTable,
}

/// Settings sent to the remote model when a connection opens
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfig {
    /// Model identifier
    pub model: String,

    /// Prebuilt voice name
    pub voice: String,

    /// BCP-47 language tag
    pub language: String,

    /// Speaking rate multiplier
    pub speaking_rate: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice: "Orus".to_string(),
            language: "es-US".to_string(),
            speaking_rate: 1.0,
        }
    }
}

impl SessionConfig {
    /// Check voice, language and rate
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first invalid field
    pub fn validate(&self) -> Result<()> {
        validate_voice(&self.voice)?;
        validate_language(&self.language)?;
        validate_speaking_rate(self.speaking_rate)
    }
}

/// Audio pipeline settings
#[derive(Debug, Clone, Serialize)]
pub struct AudioConfig {
    /// Samples per capture frame
    pub capture_buffer_size: usize,

    /// Resampling strategy for received audio
    pub resampling: Resampling,

    /// Play UI click/chime sounds
    pub ui_sounds: bool,

    /// How long to wait for a connection to open
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_buffer_size: 256,
            resampling: Resampling::default(),
            ui_sounds: true,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Visual signal settings
#[derive(Debug, Clone, Serialize)]
pub struct VisualsConfig {
    /// Number of particles in the shell
    pub particle_count: usize,

    /// Animation ticks per second
    pub fps: u32,

    /// Fixed random seed, or entropy when unset
    pub seed: Option<u64>,
}

impl Default for VisualsConfig {
    fn default() -> Self {
        Self {
            particle_count: DEFAULT_PARTICLE_COUNT,
            fps: 60,
            seed: None,
        }
    }
}

impl VisualsConfig {
    /// Interval between animation ticks
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

/// Language-prefix keyed system instructions
///
/// The longest matching prefix wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct InstructionTable {
    entries: BTreeMap<String, String>,
}

impl Default for InstructionTable {
    fn default() -> Self {
        let entries = [
            (
                "en-",
                "You are a helpful voice assistant. Please respond in English.",
            ),
            (
                "es-",
                "Eres un asistente de voz muy útil. Por favor, responde en español.",
            ),
            (
                "fr-",
                "Vous êtes un assistant vocal utile. Veuillez répondre en français.",
            ),
            (
                "de-",
                "Sie sind ein hilfreicher Sprachassistent. Bitte antworten Sie auf Deutsch.",
            ),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self { entries }
    }
}

impl InstructionTable {
    /// Defaults with `overrides` layered on top
    #[must_use]
    pub fn with_overrides(overrides: BTreeMap<String, String>) -> Self {
        let mut table = Self::default();
        table.entries.extend(overrides);
        table
    }

    /// Instruction for a language tag
    #[must_use]
    pub fn resolve(&self, language: &str) -> &str {
        self.entries
            .iter()
            .filter(|(prefix, _)| language.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or(FALLBACK_INSTRUCTION, |(_, instruction)| instruction.as_str())
    }

    /// Number of prefixes in the table
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no prefixes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Config {
    /// Load configuration from environment and config file
    ///
    /// Precedence: env vars > `~/.config/live-orb/config.toml` > defaults
    ///
    /// # Errors
    ///
    /// Returns error if a resolved value is invalid
    pub fn load() -> Result<Self> {
        Self::resolve(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with an environment lookup
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a resolved value is invalid
    pub fn resolve(
        fc: file::OrbConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = SessionConfig::default();

        let speaking_rate = match env("ORB_SPEAKING_RATE") {
            Some(raw) => raw
                .trim()
                .parse::<f32>()
                .map_err(|_| Error::Config(format!("ORB_SPEAKING_RATE is not a number: {raw}")))?,
            None => fc.session.speaking_rate.unwrap_or(defaults.speaking_rate),
        };

        let session = SessionConfig {
            model: env("ORB_MODEL")
                .or(fc.session.model)
                .unwrap_or(defaults.model),
            voice: env("ORB_VOICE")
                .or(fc.session.voice)
                .unwrap_or(defaults.voice),
            language: env("ORB_LANGUAGE")
                .or(fc.session.language)
                .unwrap_or(defaults.language),
            speaking_rate,
        };
        session.validate()?;

        let audio_defaults = AudioConfig::default();
        let capture_buffer_size = fc
            .audio
            .capture_buffer_size
            .unwrap_or(audio_defaults.capture_buffer_size);
        if capture_buffer_size == 0 {
            return Err(Error::Config(
                "capture_buffer_size must be positive".to_string(),
            ));
        }

        let audio = AudioConfig {
            capture_buffer_size,
            resampling: fc.audio.resampling.unwrap_or(audio_defaults.resampling),
            ui_sounds: fc.audio.ui_sounds.unwrap_or(audio_defaults.ui_sounds),
            connect_timeout: fc
                .audio
                .connect_timeout_secs
                .map_or(audio_defaults.connect_timeout, Duration::from_secs),
        };

        let visuals_defaults = VisualsConfig::default();
        let visuals = VisualsConfig {
            particle_count: fc
                .visuals
                .particle_count
                .unwrap_or(visuals_defaults.particle_count),
            fps: fc.visuals.fps.unwrap_or(visuals_defaults.fps).max(1),
            seed: fc.visuals.seed,
        };

        tracing::debug!(
            model = %session.model,
            voice = %session.voice,
            language = %session.language,
            speaking_rate = session.speaking_rate,
            "configuration resolved"
        );

        Ok(Self {
            session,
            audio,
            visuals,
            instructions: InstructionTable::with_overrides(fc.instructions),
        })
    }
}

/// Reject voices the remote model does not offer
///
/// # Errors
///
/// Returns `Error::Config` for an unknown voice
pub fn validate_voice(voice: &str) -> Result<()> {
    if KNOWN_VOICES.contains(&voice) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "unknown voice {voice:?} (expected one of {})",
            KNOWN_VOICES.join(", ")
        )))
    }
}

/// Reject empty or malformed language tags
///
/// Tags outside [`SUPPORTED_LANGUAGES`] are accepted and fall back to the
/// generic instruction.
///
/// # Errors
///
/// Returns `Error::Config` for an empty tag or one without a region
pub fn validate_language(language: &str) -> Result<()> {
    let valid = language
        .split_once('-')
        .is_some_and(|(lang, region)| !lang.is_empty() && !region.is_empty());
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "language must look like \"en-US\", got {language:?}"
        )))
    }
}

/// Reject speaking rates outside the supported range
///
/// # Errors
///
/// Returns `Error::Config` when the rate is out of range or not finite
pub fn validate_speaking_rate(rate: f32) -> Result<()> {
    if SPEAKING_RATE_RANGE.contains(&rate) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "speaking rate {rate} outside {}..={}",
            SPEAKING_RATE_RANGE.start(),
            SPEAKING_RATE_RANGE.end()
        )))
    }
}

mod secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(file::OrbConfigFile::default(), no_env).unwrap();
        assert_eq!(config.session, SessionConfig::default());
        assert_eq!(config.session.language, "es-US");
        assert_eq!(config.audio.capture_buffer_size, 256);
        assert_eq!(config.audio.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.visuals.particle_count, 5000);
        assert_eq!(config.visuals.fps, 60);
        assert_eq!(config.instructions.len(), 4);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut fc = file::OrbConfigFile::default();
        fc.session.voice = Some("Lyra".to_string());
        fc.session.speaking_rate = Some(1.5);

        let env: HashMap<&str, &str> = [("ORB_VOICE", "Echo")].into_iter().collect();
        let config = Config::resolve(fc, |k| env.get(k).map(ToString::to_string)).unwrap();

        assert_eq!(config.session.voice, "Echo");
        assert!((config.session.speaking_rate - 1.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut fc = file::OrbConfigFile::default();
        fc.session.voice = Some("Robot".to_string());
        assert!(matches!(
            Config::resolve(fc, no_env),
            Err(Error::Config(_))
        ));

        let env = |k: &str| (k == "ORB_SPEAKING_RATE").then(|| "3.0".to_string());
        assert!(Config::resolve(file::OrbConfigFile::default(), env).is_err());

        let env = |k: &str| (k == "ORB_SPEAKING_RATE").then(|| "fast".to_string());
        assert!(Config::resolve(file::OrbConfigFile::default(), env).is_err());

        let mut fc = file::OrbConfigFile::default();
        fc.audio.capture_buffer_size = Some(0);
        assert!(Config::resolve(fc, no_env).is_err());
    }

    #[test]
    fn test_rate_bounds_inclusive() {
        assert!(validate_speaking_rate(0.5).is_ok());
        assert!(validate_speaking_rate(2.0).is_ok());
        assert!(validate_speaking_rate(0.49).is_err());
        assert!(validate_speaking_rate(f32::NAN).is_err());
    }

    #[test]
    fn test_instruction_lookup() {
        let table = InstructionTable::default();
        assert!(table.resolve("fr-FR").contains("français"));
        assert!(table.resolve("de-DE").contains("Deutsch"));
        assert!(table.resolve("es-US").contains("español"));
        assert!(table.resolve("en-GB").contains("English"));
        assert_eq!(table.resolve("ja-JP"), FALLBACK_INSTRUCTION);
    }

    #[test]
    fn test_instruction_override_longest_prefix() {
        let overrides = [
            ("en-GB".to_string(), "Respond in British English.".to_string()),
            ("it-".to_string(), "Rispondi in italiano.".to_string()),
        ]
        .into_iter()
        .collect();
        let table = InstructionTable::with_overrides(overrides);

        assert_eq!(table.resolve("en-GB"), "Respond in British English.");
        assert!(table.resolve("en-US").contains("English"));
        assert_eq!(table.resolve("it-IT"), "Rispondi in italiano.");
    }

    #[test]
    fn test_language_tag_shape() {
        assert!(validate_language("pt-BR").is_ok());
        assert!(validate_language("").is_err());
        assert!(validate_language("english").is_err());
        assert!(validate_language("en-").is_err());
    }

    #[test]
    fn test_frame_interval() {
        let visuals = VisualsConfig::default();
        let interval = visuals.frame_interval();
        assert!((interval.as_secs_f64() - 1.0 / 60.0).abs() < 1e-9);
    }
}
