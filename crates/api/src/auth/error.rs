//! Authentication errors

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tenantauth_shared::{CacheError, CipherError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No account has been authenticated for this request")]
    Unauthenticated,
    #[error("No account matches that slug")]
    NoSuchAccount,
    #[error("No account matches that session")]
    NoSuchSession,
    #[error("API Key does not match account")]
    InvalidApiKey,
    #[error("That password is not valid for this user")]
    InvalidPassword,
    #[error("Session has expired, please reauthenticate")]
    SessionExpired,
    #[error("Orphaned user object has no account")]
    OrphanedUser,
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("Session encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl AuthError {
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, AuthError::Unauthenticated)
    }
}

/// `Unauthenticated` is a bare 401. Every other failure is a 500 carrying the
/// error text.
impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            AuthError::Unauthenticated => StatusCode::UNAUTHORIZED.into_response(),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
        }
    }
}
