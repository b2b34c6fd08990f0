//! Configuration loaded from environment variables

use std::fmt;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use crate::auth::{AuthConfig, AuthHeaders, DEFAULT_SESSION_TTL};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {message}")]
    Invalid { name: &'static str, message: String },
}

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    /// Postgres store when set, in-memory store otherwise
    pub database_url: Option<String>,
    /// Redis session cache when set, in-memory cache otherwise
    pub redis_url: Option<String>,
    /// AES key for passwords at rest (16 or 32 bytes)
    pub encryption_key: Vec<u8>,
    pub session_ttl: Duration,
    pub persist_session_refresh: bool,
    /// Path segment the account routes are mounted under
    pub accounts_path: String,
    pub auth_headers: AuthHeaders,
    pub allowed_origins: Vec<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<set>"))
            .field("encryption_key", &"<redacted>")
            .field("session_ttl", &self.session_ttl)
            .field("persist_session_refresh", &self.persist_session_refresh)
            .field("accounts_path", &self.accounts_path)
            .field("auth_headers", &self.auth_headers)
            .field("allowed_origins", &self.allowed_origins)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let encryption_key = var("ENCRYPTION_KEY").ok_or(ConfigError::Missing("ENCRYPTION_KEY"))?;
        let encryption_key = decode_encryption_key(&encryption_key)?;

        let session_ttl = match var("SESSION_TTL_SECONDS") {
            Some(raw) => raw
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| ConfigError::Invalid {
                    name: "SESSION_TTL_SECONDS",
                    message: e.to_string(),
                })?,
            None => DEFAULT_SESSION_TTL,
        };

        let persist_session_refresh = match var("PERSIST_SESSION_REFRESH") {
            Some(raw) => parse_bool("PERSIST_SESSION_REFRESH", &raw)?,
            None => true,
        };

        let defaults = AuthHeaders::default();
        let auth_headers = AuthHeaders {
            account: var("AUTH_HEADER_ACCOUNT").unwrap_or(defaults.account),
            key: var("AUTH_HEADER_KEY").unwrap_or(defaults.key),
            session: var("AUTH_HEADER_SESSION").unwrap_or(defaults.session),
            username: var("AUTH_HEADER_USERNAME").unwrap_or(defaults.username),
            password: var("AUTH_HEADER_PASSWORD").unwrap_or(defaults.password),
        };

        let allowed_origins = var("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Ok(Self {
            bind_address: var("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_url: var("DATABASE_URL"),
            redis_url: var("REDIS_URL"),
            encryption_key,
            session_ttl,
            persist_session_refresh,
            accounts_path: var("ACCOUNTS_PATH")
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "accounts".to_string()),
            auth_headers,
            allowed_origins,
        })
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            headers: self.auth_headers.clone(),
            session_ttl: self.session_ttl,
            persist_session_refresh: self.persist_session_refresh,
        }
    }
}

/// Accept a raw 16/32 byte key, or the same sizes base64-encoded.
fn decode_encryption_key(raw: &str) -> Result<Vec<u8>, ConfigError> {
    if matches!(raw.len(), 16 | 32) {
        return Ok(raw.as_bytes().to_vec());
    }
    match STANDARD.decode(raw) {
        Ok(bytes) if matches!(bytes.len(), 16 | 32) => Ok(bytes),
        _ => Err(ConfigError::Invalid {
            name: "ENCRYPTION_KEY",
            message: "expected 16 or 32 bytes, raw or base64".to_string(),
        }),
    }
}

fn parse_bool(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            name,
            message: format!("'{}' is not a boolean", other),
        }),
    }
}
