//! Daemon configuration.
//!
//! All settings come from the environment. The token-signing secret and the
//! AI provider credentials are wrapped in [`SecretString`] so they are never
//! printed by `Debug` formatting or carried into log output.

use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

/// Minimum byte length for the token-signing secret.
///
/// HMAC-SHA256 keys shorter than the digest size weaken the construction, so
/// anything under 32 bytes is rejected at startup.
pub const MIN_AUTH_SECRET_LEN: usize = 32;

/// Default lifetime for user capabilities (24 h).
pub const DEFAULT_TTL_USER: Duration = Duration::from_secs(24 * 60 * 60);

/// Default lifetime for session-bound capabilities (15 min).
pub const DEFAULT_TTL_SESSION_TOKEN: Duration = Duration::from_secs(15 * 60);

/// Default hard cap on outbound AI provider calls.
pub const DEFAULT_AI_TIMEOUT: Duration = Duration::from_secs(20);

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// A variable is present but cannot be parsed.
    #[error("invalid value for {name}: {reason}")]
    Invalid {
        /// The environment variable name.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The signing secret is too short to be safe.
    #[error("auth secret too short: {len} bytes (min {min})")]
    SecretTooShort {
        /// Actual secret length in bytes.
        len: usize,
        /// Minimum accepted length.
        min: usize,
    },
}

/// Which generative-AI provider the proxy talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiProviderKind {
    /// OpenAI chat completions.
    OpenAi,
    /// Google Gemini.
    Gemini,
    /// No external provider; always use the deterministic fallback.
    Fallback,
}

impl AiProviderKind {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "openai" => Ok(Self::OpenAi),
            "gemini" => Ok(Self::Gemini),
            "fallback" => Ok(Self::Fallback),
            other => Err(ConfigError::Invalid {
                name: "GREENROOM_AI_PROVIDER",
                reason: format!("unknown provider {other:?}"),
            }),
        }
    }
}

/// Runtime configuration for the daemon.
pub struct Config {
    /// SQLite database path. `:memory:` is accepted for tests.
    pub db_path: String,
    /// Symmetric secret for the token authority.
    pub auth_secret: SecretString,
    /// Whether the session cookie carries the `Secure` attribute.
    pub cookie_secure: bool,
    /// Origins allowed by the CORS layer.
    pub allowed_origins: Vec<String>,
    /// Selected AI provider.
    pub ai_provider: AiProviderKind,
    /// OpenAI credential, if configured.
    pub openai_api_key: Option<SecretString>,
    /// Gemini credential, if configured.
    pub gemini_api_key: Option<SecretString>,
    /// Hard cap on a single provider call.
    pub ai_timeout: Duration,
    /// Listen address for the HTTP gateway.
    pub bind_addr: String,
    /// Directory media blobs are written to.
    pub upload_dir: String,
    /// Lifetime of user capabilities.
    pub ttl_user: Duration,
    /// Lifetime of session-bound capabilities (IST/WST/AIPT/UPT/ACET).
    pub ttl_session_token: Duration,
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `GREENROOM_AUTH_SECRET` is missing or too
    /// short, or if any present variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let secret = std::env::var("GREENROOM_AUTH_SECRET")
            .map_err(|_| ConfigError::Missing("GREENROOM_AUTH_SECRET"))?;
        Self::build(EnvSource::process(), secret)
    }

    /// Builds a configuration for tests with sane defaults and the given
    /// secret, ignoring the process environment. Uploads land under the
    /// system temp directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SecretTooShort`] if `secret` is under
    /// [`MIN_AUTH_SECRET_LEN`] bytes.
    pub fn for_tests(secret: &str) -> Result<Self, ConfigError> {
        let mut config = Self::build(EnvSource::empty(), secret.to_string())?;
        config.db_path = ":memory:".to_string();
        config.upload_dir = std::env::temp_dir()
            .join("greenroom-test-uploads")
            .to_string_lossy()
            .into_owned();
        Ok(config)
    }

    fn build(env: EnvSource, secret: String) -> Result<Self, ConfigError> {
        if secret.len() < MIN_AUTH_SECRET_LEN {
            return Err(ConfigError::SecretTooShort {
                len: secret.len(),
                min: MIN_AUTH_SECRET_LEN,
            });
        }

        let allowed_origins = env
            .get("GREENROOM_ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let ai_provider = match env.get("GREENROOM_AI_PROVIDER") {
            Some(value) => AiProviderKind::parse(&value)?,
            None => AiProviderKind::Fallback,
        };

        Ok(Self {
            db_path: env
                .get("GREENROOM_DB_PATH")
                .unwrap_or_else(|| "greenroom.db".to_string()),
            auth_secret: SecretString::from(secret),
            cookie_secure: parse_bool(&env, "GREENROOM_COOKIE_SECURE")?,
            allowed_origins,
            ai_provider,
            openai_api_key: env.get("GREENROOM_OPENAI_API_KEY").map(SecretString::from),
            gemini_api_key: env.get("GREENROOM_GEMINI_API_KEY").map(SecretString::from),
            ai_timeout: parse_secs(&env, "GREENROOM_AI_TIMEOUT_SECS", DEFAULT_AI_TIMEOUT)?,
            bind_addr: env
                .get("GREENROOM_BIND_ADDR")
                .unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            upload_dir: env
                .get("GREENROOM_UPLOAD_DIR")
                .unwrap_or_else(|| ".uploads".to_string()),
            ttl_user: parse_secs(&env, "GREENROOM_TTL_USER_SECS", DEFAULT_TTL_USER)?,
            ttl_session_token: parse_secs(
                &env,
                "GREENROOM_TTL_SESSION_TOKEN_SECS",
                DEFAULT_TTL_SESSION_TOKEN,
            )?,
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secrets are intentionally omitted.
        f.debug_struct("Config")
            .field("db_path", &self.db_path)
            .field("cookie_secure", &self.cookie_secure)
            .field("allowed_origins", &self.allowed_origins)
            .field("ai_provider", &self.ai_provider)
            .field("bind_addr", &self.bind_addr)
            .field("upload_dir", &self.upload_dir)
            .finish_non_exhaustive()
    }
}

/// Reads either the real process environment or nothing (test mode).
struct EnvSource {
    process: bool,
}

impl EnvSource {
    const fn process() -> Self {
        Self { process: true }
    }

    const fn empty() -> Self {
        Self { process: false }
    }

    fn get(&self, name: &str) -> Option<String> {
        if self.process {
            std::env::var(name).ok()
        } else {
            None
        }
    }
}

fn parse_bool(env: &EnvSource, name: &'static str) -> Result<bool, ConfigError> {
    match env.get(name) {
        None => Ok(false),
        Some(value) => match value.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(ConfigError::Invalid {
                name,
                reason: format!("expected a boolean, got {other:?}"),
            }),
        },
    }
}

fn parse_secs(
    env: &EnvSource,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match env.get(name) {
        None => Ok(default),
        Some(value) => value
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_short_secret() {
        let err = Config::for_tests("short").unwrap_err();
        assert!(matches!(err, ConfigError::SecretTooShort { len: 5, .. }));
    }

    #[test]
    fn test_defaults() {
        let config = Config::for_tests("0123456789abcdef0123456789abcdef").unwrap();
        assert_eq!(config.ai_provider, AiProviderKind::Fallback);
        assert_eq!(config.ttl_session_token, DEFAULT_TTL_SESSION_TOKEN);
        assert_eq!(config.allowed_origins, vec!["http://localhost:3000"]);
        assert!(!config.cookie_secure);
    }

    #[test]
    fn test_debug_omits_secret() {
        let config = Config::for_tests("0123456789abcdef0123456789abcdef").unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("0123456789abcdef"));
    }
}
