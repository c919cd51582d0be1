//! Error types for the live orb client

use thiserror::Error;

/// Result type alias for live orb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the live orb client
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (invalid value, change rejected while streaming)
    #[error("configuration error: {0}")]
    Config(String),

    /// Remote connection failed to open or closed abnormally
    #[error("connection error: {0}")]
    Connection(String),

    /// Microphone permission denied or capture device unavailable
    #[error("device error: {0}")]
    Device(String),

    /// Malformed inbound audio chunk
    #[error("decode error: {0}")]
    Decode(String),

    /// Failed to send a capture frame or text message
    #[error("transmit error: {0}")]
    Transmit(String),

    /// Audio substrate error (playback, analysis, resampling)
    #[error("audio error: {0}")]
    Audio(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Short human-readable message suitable for the status line
    ///
    /// Never carries internal detail beyond what the user can act on.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(msg) => format!("Settings error: {msg}"),
            Self::Connection(msg) | Self::Transmit(msg) => msg.clone(),
            Self::Device(msg) => format!("Microphone error: {msg}"),
            Self::Decode(_) => "Received audio could not be played.".to_string(),
            Self::Audio(_) => "Audio output error.".to_string(),
            Self::Io(_) | Self::Serialization(_) | Self::Toml(_) => {
                "An internal error occurred.".to_string()
            }
        }
    }

    /// Whether the error ends the connection lifecycle
    ///
    /// Codec and scheduler failures are local; only connection failures
    /// require an explicit reset.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_detail() {
        let err = Error::Decode("odd byte length 7 at offset 0".to_string());
        assert_eq!(err.user_message(), "Received audio could not be played.");

        let err = Error::Device("permission denied".to_string());
        assert_eq!(err.user_message(), "Microphone error: permission denied");
    }

    #[test]
    fn test_only_connection_errors_are_fatal() {
        assert!(Error::Connection("closed".to_string()).is_fatal());
        assert!(!Error::Decode("bad".to_string()).is_fatal());
        assert!(!Error::Transmit("bad".to_string()).is_fatal());
    }
}
