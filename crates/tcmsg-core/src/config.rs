use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{TcmsgError, TcmsgResult};

/// Lowest PBKDF2 iteration count accepted from configuration.
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

/// Top-level configuration (loaded from tcmsg.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TcmsgConfig {
    pub logging: LoggingConfig,
    pub crypto: CryptoConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Conversation key derivation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// PBKDF2-HMAC-SHA256 iterations (default: 100000)
    pub kdf_iterations: u32,
}

/// Conversation sync engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound for a history fetch
    pub fetch_timeout_ms: u64,
    /// Upper bound for persisting a sent message
    pub send_timeout_ms: u64,
    /// Upper bound for a read-state update
    pub status_timeout_ms: u64,
    /// Upper bound for establishing the live feed
    pub subscribe_timeout_ms: u64,
    /// Maximum message length in characters, after sanitization
    pub max_message_chars: usize,
    /// Text shown in place of a message that failed to decrypt
    pub placeholder_text: String,
}

impl SyncConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: MIN_KDF_ITERATIONS,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 10_000,
            send_timeout_ms: 10_000,
            status_timeout_ms: 5_000,
            subscribe_timeout_ms: 5_000,
            max_message_chars: 4000,
            placeholder_text: "message unavailable".into(),
        }
    }
}

impl TcmsgConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> TcmsgResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TcmsgError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would weaken key derivation or make the
    /// engine unusable.
    pub fn validate(&self) -> TcmsgResult<()> {
        if self.crypto.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(TcmsgError::Config(format!(
                "crypto.kdf_iterations = {} is below the minimum of {MIN_KDF_ITERATIONS}",
                self.crypto.kdf_iterations
            )));
        }
        let timeouts = [
            ("sync.fetch_timeout_ms", self.sync.fetch_timeout_ms),
            ("sync.send_timeout_ms", self.sync.send_timeout_ms),
            ("sync.status_timeout_ms", self.sync.status_timeout_ms),
            ("sync.subscribe_timeout_ms", self.sync.subscribe_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(TcmsgError::Config(format!("{name} must be greater than 0")));
            }
        }
        if self.sync.max_message_chars == 0 {
            return Err(TcmsgError::Config(
                "sync.max_message_chars must be greater than 0".into(),
            ));
        }
        match self.logging.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(TcmsgError::Config(format!(
                "logging.format must be \"json\" or \"text\", got \"{other}\""
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[logging]
level = "debug"
format = "json"

[crypto]
kdf_iterations = 250000

[sync]
fetch_timeout_ms = 3000
send_timeout_ms = 4000
status_timeout_ms = 1000
subscribe_timeout_ms = 2000
max_message_chars = 500
placeholder_text = "[encrypted]"
"#;
        let config: TcmsgConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.crypto.kdf_iterations, 250_000);
        assert_eq!(config.sync.fetch_timeout(), Duration::from_secs(3));
        assert_eq!(config.sync.send_timeout_ms, 4000);
        assert_eq!(config.sync.max_message_chars, 500);
        assert_eq!(config.sync.placeholder_text, "[encrypted]");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_defaults() {
        let config: TcmsgConfig = toml::from_str("").unwrap();

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
        assert_eq!(config.crypto.kdf_iterations, MIN_KDF_ITERATIONS);
        assert_eq!(config.sync.placeholder_text, "message unavailable");
        assert_eq!(config.sync.max_message_chars, 4000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[sync]
fetch_timeout_ms = 1500
"#;
        let config: TcmsgConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.sync.fetch_timeout_ms, 1500);
        // Defaults
        assert_eq!(config.sync.send_timeout_ms, 10_000);
        assert_eq!(config.crypto.kdf_iterations, MIN_KDF_ITERATIONS);
    }

    #[test]
    fn test_validate_rejects_weak_kdf() {
        let mut config = TcmsgConfig::default();
        config.crypto.kdf_iterations = 1000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("kdf_iterations"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = TcmsgConfig::default();
        config.sync.send_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_log_format() {
        let mut config = TcmsgConfig::default();
        config.logging.format = "yaml".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = TcmsgConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.crypto.kdf_iterations, MIN_KDF_ITERATIONS);
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("tcmsg.toml");
        std::fs::write(&path, "[crypto]\nkdf_iterations = 300000\n").unwrap();
        let config = TcmsgConfig::load(&path).unwrap();
        assert_eq!(config.crypto.kdf_iterations, 300_000);

        std::fs::write(&path, "[crypto]\nkdf_iterations = 10\n").unwrap();
        assert!(TcmsgConfig::load(&path).is_err());

        std::fs::write(&path, "[crypto\n").unwrap();
        assert!(TcmsgConfig::load(&path).is_err());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = TcmsgConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: TcmsgConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.crypto.kdf_iterations, parsed.crypto.kdf_iterations);
        assert_eq!(config.sync.placeholder_text, parsed.sync.placeholder_text);
    }
}
