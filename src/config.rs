//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, OPENAI_API_KEY, PORT, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## Secrets:
//! The OpenAI API key is only ever read from the environment (`OPENAI_API_KEY`),
//! never from config.toml, so the file can be committed without leaking credentials.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, realtime, telephony, bridge)
/// makes it easier to understand and maintain as the application grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub realtime: RealtimeConfig,
    pub telephony: TelephonyConfig,
    pub bridge: BridgeConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// OpenAI realtime speech channel configuration.
///
/// ## Fields:
/// - `url`: Base WebSocket endpoint for the realtime API
/// - `model`: Model name appended as a query parameter
/// - `api_key`: Bearer token, populated from the OPENAI_API_KEY environment variable
/// - `voice`: Voice identifier sent in the session.update message
/// - `sample_rate`: Sample rate of the PCM16 audio exchanged with the model (Hz)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub url: String,
    pub model: String,
    pub api_key: String,
    pub voice: String,
    pub sample_rate: u32,
}

/// Telephony (media stream) configuration.
///
/// ## Fields:
/// - `sample_rate`: Sample rate of the µ-law audio on the phone leg (always 8000 in practice)
/// - `public_url`: Externally reachable hostname used when building the
///   `<Connect><Stream>` WebSocket URL in TwiML. Falls back to the request's
///   Host header when empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    pub sample_rate: u32,
    pub public_url: String,
}

/// Call-bridge behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// When the one-time greeting is pushed to the AI channel.
    pub greeting_trigger: GreetingTrigger,

    /// Maximum number of simultaneously bridged calls.
    pub max_concurrent_calls: usize,
}

/// When to ask the AI agent to speak its opening line.
///
/// ## The two variants produce different caller experiences:
/// - `FirstMedia`: the agent greets once the caller's first audio frame arrives.
///   This avoids racing the realtime channel's own session setup.
/// - `OnConnect`: the agent greets immediately after session.update is sent,
///   before the caller has made any sound.
///
/// This is a product choice, not a correctness one, which is why it lives in
/// configuration rather than code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GreetingTrigger {
    FirstMedia,
    OnConnect,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            realtime: RealtimeConfig {
                url: "wss://api.openai.com/v1/realtime".to_string(),
                model: "gpt-4o".to_string(),
                api_key: String::new(),            // must come from OPENAI_API_KEY
                voice: "alloy".to_string(),
                sample_rate: 24_000,               // realtime API native PCM16 rate
            },
            telephony: TelephonyConfig {
                sample_rate: 8_000,                // µ-law narrowband
                public_url: String::new(),
            },
            bridge: BridgeConfig {
                greeting_trigger: GreetingTrigger::FirstMedia,
                max_concurrent_calls: 50,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST, PORT, PUBLIC_URL and OPENAI_API_KEY
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`: Override server host
    /// - `APP_REALTIME_VOICE=verse`: Override the agent voice
    /// - `PORT=3000`: Special case for deployment platforms
    /// - `OPENAI_API_KEY=sk-...`: Bearer token for the realtime channel
    pub fn load() -> AppResult<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject these without the APP_ prefix.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(public_url) = env::var("PUBLIC_URL") {
            settings = settings.set_override("telephony.public_url", public_url)?;
        }
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("realtime.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0 (port 0 is reserved and can't be used)
    /// - The OpenAI API key is present (the bridge cannot run without it)
    /// - Both sample rates are non-zero
    /// - At least one concurrent call is allowed
    ///
    /// ## Why validate:
    /// Catching configuration errors early prevents runtime failures and
    /// provides clear error messages about what's wrong — a missing API key
    /// should fail the process at startup, not the first phone call.
    pub fn validate(&self) -> AppResult<()> {
        if self.server.port == 0 {
            return Err(AppError::ConfigError("Server port cannot be 0".to_string()));
        }

        if self.realtime.api_key.is_empty() {
            return Err(AppError::ConfigError(
                "OPENAI_API_KEY is missing, the realtime channel cannot authenticate".to_string(),
            ));
        }

        if self.realtime.sample_rate == 0 || self.telephony.sample_rate == 0 {
            return Err(AppError::ConfigError(
                "Sample rates must be greater than 0".to_string(),
            ));
        }

        if self.bridge.max_concurrent_calls == 0 {
            return Err(AppError::ConfigError(
                "Max concurrent calls must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the full realtime WebSocket URL including the model parameter.
    pub fn realtime_url(&self) -> String {
        format!("{}?model={}", self.realtime.url, self.realtime.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.realtime.api_key = "sk-test".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.telephony.sample_rate, 8_000);
        assert_eq!(config.realtime.sample_rate, 24_000);
        assert_eq!(config.bridge.greeting_trigger, GreetingTrigger::FirstMedia);
    }

    #[test]
    fn test_missing_api_key_fails_validation() {
        let config = AppConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));

        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = valid_config();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.bridge.max_concurrent_calls = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_realtime_url() {
        let config = AppConfig::default();
        assert_eq!(
            config.realtime_url(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o"
        );
    }

    #[test]
    fn test_greeting_trigger_kebab_case() {
        let trigger: GreetingTrigger = serde_json::from_str("\"first-media\"").unwrap();
        assert_eq!(trigger, GreetingTrigger::FirstMedia);
        let trigger: GreetingTrigger = serde_json::from_str("\"on-connect\"").unwrap();
        assert_eq!(trigger, GreetingTrigger::OnConnect);
    }
}
