//! Session store
//!
//! Sessions live in two places:
//! - the shared cache, under `session-<token>`, so every API instance sees them
//! - a process-local map that also remembers the account and user a session was
//!   created for, so the creating instance can skip the durable store
//!
//! Expiry is lazy: nothing is swept, validation checks `last_used + ttl`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tenantauth_shared::{Clock, SharedCache};
use time::OffsetDateTime;

use super::{credentials::token_prefix, error::AuthError};
use crate::accounts::{Account, Session, User};

/// How long a session stays valid after it was last used
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3 * 60 * 60);

/// Namespace for session records in the shared cache
pub const SESSION_CACHE_PREFIX: &str = "session-";

struct LocalSession {
    session: Session,
    account: Account,
    user: Option<User>,
}

pub struct SessionStore {
    cache: Arc<dyn SharedCache>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    local: RwLock<HashMap<String, LocalSession>>,
}

impl SessionStore {
    pub fn new(cache: Arc<dyn SharedCache>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            cache,
            clock,
            ttl,
            local: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create and store a session for `account` (and `user`, when the login was
    /// by username).
    pub async fn create(&self, account: &Account, user: Option<&User>) -> Result<Session, AuthError> {
        let now = self.clock.now();
        let session = Session {
            key: generate_token(&account.slug, now),
            account: account.entity_key(),
            user: user.and_then(|u| u.key().cloned()),
            initialized: now,
            last_used: now,
            ttl: self.ttl,
        };

        self.local.write().insert(
            session.key.clone(),
            LocalSession {
                session: session.clone(),
                account: account.clone(),
                user: user.cloned(),
            },
        );

        if let Err(e) = self.persist(&session).await {
            self.local.write().remove(&session.key);
            return Err(e);
        }

        tracing::debug!(
            account = %account.slug,
            session = %token_prefix(&session.key),
            "session created"
        );
        Ok(session)
    }

    /// Look a session up by token: local map first, then the shared cache.
    ///
    /// A local copy that looks expired is checked against the shared cache,
    /// since another instance may have used the session since. The later
    /// `last_used` wins.
    ///
    /// Fails with [`AuthError::NoSuchSession`] when neither knows the token.
    pub async fn get(&self, token: &str) -> Result<Session, AuthError> {
        let local = self.local.read().get(token).map(|l| l.session.clone());
        let Some(mut session) = local else {
            return self.shared(token).await?.ok_or(AuthError::NoSuchSession);
        };
        if !session.is_expired_at(self.clock.now()) {
            return Ok(session);
        }

        match self.shared(token).await {
            Ok(Some(shared)) if shared.last_used > session.last_used => {
                session.last_used = shared.last_used;
                if let Some(local) = self.local.write().get_mut(token) {
                    local.session.last_used = shared.last_used;
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(session = %token_prefix(token), error = %e, "session refresh lookup failed, using local copy");
            }
        }
        Ok(session)
    }

    async fn shared(&self, token: &str) -> Result<Option<Session>, AuthError> {
        match self.cache.get(&cache_key(token)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Account the session was created for, if this process created it.
    pub fn cached_account(&self, token: &str) -> Option<Account> {
        self.local.read().get(token).map(|l| l.account.clone())
    }

    /// User the session was created for, if this process created it.
    pub fn cached_user(&self, token: &str) -> Option<User> {
        self.local.read().get(token).and_then(|l| l.user.clone())
    }

    /// Mark the session as used now. Only the local copy is updated; call
    /// [`persist`](Self::persist) to write it back to the shared cache.
    pub fn touch(&self, session: &mut Session) {
        session.last_used = self.clock.now();
        if let Some(local) = self.local.write().get_mut(&session.key) {
            local.session.last_used = session.last_used;
        }
    }

    /// Write the session to the shared cache.
    pub async fn persist(&self, session: &Session) -> Result<(), AuthError> {
        let bytes = serde_json::to_vec(session)?;
        self.cache
            .set(&cache_key(&session.key), bytes, Some(session.ttl))
            .await?;
        Ok(())
    }

    /// Remove the session everywhere. Returns whether it existed.
    pub async fn delete(&self, token: &str) -> Result<bool, AuthError> {
        let in_local = self.local.write().remove(token).is_some();
        let in_cache = self.cache.delete(&cache_key(token)).await?;
        Ok(in_cache || in_local)
    }

    /// Number of sessions held in the local map.
    pub fn local_len(&self) -> usize {
        self.local.read().len()
    }
}

fn cache_key(token: &str) -> String {
    format!("{}{}", SESSION_CACHE_PREFIX, token)
}

/// Hex SHA-256 of `slug-<unix nanos>-<random>`.
fn generate_token(slug: &str, now: OffsetDateTime) -> String {
    let nonce: [u8; 16] = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(slug.as_bytes());
    hasher.update(b"-");
    hasher.update(now.unix_timestamp_nanos().to_string().as_bytes());
    hasher.update(b"-");
    hasher.update(nonce);
    hex::encode(hasher.finalize())
}
