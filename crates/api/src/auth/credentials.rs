//! Credential extraction from request headers and cookies

use std::fmt;

use axum::http::{header::COOKIE, HeaderMap};
use serde::{Deserialize, Serialize};

use super::error::AuthError;

/// Header names credentials are read from. The session header name doubles as
/// the session cookie name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthHeaders {
    pub account: String,
    pub key: String,
    pub session: String,
    pub username: String,
    pub password: String,
}

impl Default for AuthHeaders {
    fn default() -> Self {
        Self {
            account: "X-account".to_string(),
            key: "X-key".to_string(),
            session: "X-session".to_string(),
            username: "X-username".to_string(),
            password: "X-password".to_string(),
        }
    }
}

/// One of the three ways a request can identify itself.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Account { slug: String, api_key: String },
    User { username: String, password: String },
    Session { token: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Account { slug, .. } => f
                .debug_struct("Account")
                .field("slug", slug)
                .field("api_key", &"<redacted>")
                .finish(),
            Credentials::User { username, .. } => f
                .debug_struct("User")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::Session { token } => f
                .debug_struct("Session")
                .field("token", &token_prefix(token))
                .finish(),
        }
    }
}

impl Credentials {
    /// Resolve credentials in precedence order: account slug + API key, then
    /// username + password, then a session token (header, then cookie).
    pub fn from_headers(headers: &HeaderMap, names: &AuthHeaders) -> Result<Self, AuthError> {
        if let (Some(slug), Some(api_key)) = (
            header_value(headers, &names.account),
            header_value(headers, &names.key),
        ) {
            return Ok(Credentials::Account { slug, api_key });
        }

        if let (Some(username), Some(password)) = (
            header_value(headers, &names.username),
            header_value(headers, &names.password),
        ) {
            return Ok(Credentials::User { username, password });
        }

        session_token(headers, names)
            .map(|token| Credentials::Session { token })
            .ok_or(AuthError::Unauthenticated)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credentials::Account { .. } => "account",
            Credentials::User { .. } => "user",
            Credentials::Session { .. } => "session",
        }
    }
}

/// Session token from the session header, falling back to the same-named cookie.
pub fn session_token(headers: &HeaderMap, names: &AuthHeaders) -> Option<String> {
    header_value(headers, &names.session).or_else(|| cookie_value(headers, &names.session))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let prefix = format!("{}=", name);
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .find_map(|cookie| cookie.trim().strip_prefix(prefix.as_str()))
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// First characters of a token, safe for logs.
pub(crate) fn token_prefix(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}
