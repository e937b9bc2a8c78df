//! Configuration management for sessiond.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file (JSON)
//! 4. Default values

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::Args;
use crate::events::DEFAULT_CAPACITY;
use crate::identity::UserAccount;
use crate::session::SessionConfig;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session limits and sweep schedule.
    pub sessions: SessionSection,
    /// Users known to the built-in identity service.
    pub identity: IdentitySection,
    /// Logging configuration.
    pub logging: LoggingSection,
}

/// Session configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub default_time_to_idle_ms: u64,
    pub default_time_to_live_ms: u64,
    pub max_time_to_idle_ms: u64,
    pub max_time_to_live_ms: u64,
    /// Seconds between background reload passes.
    pub sweep_interval_secs: u64,
    /// Buffered events per subscriber on the event channel.
    pub event_capacity: usize,
    pub default_event_type: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            default_time_to_idle_ms: 600_000,
            default_time_to_live_ms: 3_600_000,
            max_time_to_idle_ms: 3_600_000,
            max_time_to_live_ms: 86_400_000,
            sweep_interval_secs: 30,
            event_capacity: DEFAULT_CAPACITY,
            default_event_type: "User".to_string(),
        }
    }
}

/// Identity configuration section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySection {
    pub users: Vec<UserAccount>,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace) or a full filter directive.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Some(ms) = env_u64("SESSIOND_DEFAULT_IDLE_MS") {
            self.sessions.default_time_to_idle_ms = ms;
        }
        if let Some(ms) = env_u64("SESSIOND_DEFAULT_LIVE_MS") {
            self.sessions.default_time_to_live_ms = ms;
        }
        if let Some(ms) = env_u64("SESSIOND_MAX_IDLE_MS") {
            self.sessions.max_time_to_idle_ms = ms;
        }
        if let Some(ms) = env_u64("SESSIOND_MAX_LIVE_MS") {
            self.sessions.max_time_to_live_ms = ms;
        }
        if let Some(secs) = env_u64("SESSIOND_SWEEP_SECS") {
            self.sessions.sweep_interval_secs = secs;
        }

        if let Ok(level) = std::env::var("SESSIOND_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(secs) = args.sweep_secs {
            self.sessions.sweep_interval_secs = secs;
        }
        if let Some(ms) = args.max_idle_ms {
            self.sessions.max_time_to_idle_ms = ms;
        }
        if let Some(ms) = args.max_live_ms {
            self.sessions.max_time_to_live_ms = ms;
        }
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Load configuration with full priority chain.
    ///
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(ref path) = args.config {
            config = Config::from_file(path)?;
        }

        config.apply_env();
        config.apply_args(args);

        Ok(config)
    }

    /// Validate and convert to the typed session limits.
    pub fn to_session_config(&self) -> Result<SessionConfig, ConfigError> {
        let s = &self.sessions;
        for (name, value) in [
            ("default_time_to_idle_ms", s.default_time_to_idle_ms),
            ("default_time_to_live_ms", s.default_time_to_live_ms),
            ("max_time_to_idle_ms", s.max_time_to_idle_ms),
            ("max_time_to_live_ms", s.max_time_to_live_ms),
            ("sweep_interval_secs", s.sweep_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if s.max_time_to_idle_ms < s.default_time_to_idle_ms {
            return Err(ConfigError::Invalid(
                "max_time_to_idle_ms is below default_time_to_idle_ms".to_string(),
            ));
        }
        if s.max_time_to_live_ms < s.default_time_to_live_ms {
            return Err(ConfigError::Invalid(
                "max_time_to_live_ms is below default_time_to_live_ms".to_string(),
            ));
        }

        Ok(SessionConfig {
            default_time_to_idle: Duration::from_millis(s.default_time_to_idle_ms),
            default_time_to_live: Duration::from_millis(s.default_time_to_live_ms),
            max_time_to_idle: Duration::from_millis(s.max_time_to_idle_ms),
            max_time_to_live: Duration::from_millis(s.max_time_to_live_ms),
            default_event_type: s.default_event_type.clone(),
            sweep_interval: Duration::from_secs(s.sweep_interval_secs),
        })
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
    /// Values that parse but make no sense together.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
            Self::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sessions.default_time_to_idle_ms, 600_000);
        assert_eq!(config.sessions.sweep_interval_secs, 30);
        assert!(config.identity.users.is_empty());
        assert_eq!(config.log_filter(), "info");
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "sessions": {
                "default_time_to_idle_ms": 1000,
                "max_time_to_idle_ms": 5000
            },
            "identity": {
                "users": [
                    {"name": "alice", "password": "secret", "groups": ["users"]}
                ]
            }
        }"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.sessions.default_time_to_idle_ms, 1000);
        assert_eq!(config.sessions.max_time_to_idle_ms, 5000);
        // Defaults fill the rest
        assert_eq!(config.sessions.default_time_to_live_ms, 3_600_000);
        assert_eq!(config.identity.users.len(), 1);
        assert_eq!(config.identity.users[0].groups, vec!["users".to_string()]);
    }

    #[test]
    fn test_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file(Path::new("/nonexistent/sessiond.json"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_apply_args() {
        let mut config = Config::default();
        let args = Args {
            sweep_secs: Some(5),
            max_idle_ms: Some(7_200_000),
            log_level: Some("debug".to_string()),
            ..Args::default()
        };

        config.apply_args(&args);

        assert_eq!(config.sessions.sweep_interval_secs, 5);
        assert_eq!(config.sessions.max_time_to_idle_ms, 7_200_000);
        assert_eq!(config.sessions.max_time_to_live_ms, 86_400_000);
        assert_eq!(config.log_filter(), "debug");
    }

    #[test]
    fn test_to_session_config() {
        let session = Config::default().to_session_config().unwrap();
        assert_eq!(session, SessionConfig::default());
    }

    #[test]
    fn test_zero_rejected() {
        let mut config = Config::default();
        config.sessions.max_time_to_live_ms = 0;
        let err = config.to_session_config().unwrap_err();
        assert!(err.to_string().contains("max_time_to_live_ms"));
    }

    #[test]
    fn test_max_below_default_rejected() {
        let mut config = Config::default();
        config.sessions.max_time_to_idle_ms = 1000;
        assert!(matches!(
            config.to_session_config(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"sessions\""));
        assert!(json.contains("\"max_time_to_idle_ms\""));
    }
}
