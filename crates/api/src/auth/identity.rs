//! Request identity cache
//!
//! Maps a per-request id to the identity resolved for that request. Entries are
//! created on successful authentication and removed when the [`IdentityGuard`]
//! for the request is dropped, which also happens on early return, panic and
//! cancellation of the request future.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use super::error::AuthError;
use crate::accounts::{Account, Session, User};

/// Identifier unique to one in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// What a request authenticated as.
#[derive(Debug, Clone)]
pub struct Identity {
    pub account: Account,
    pub session: Option<Session>,
    pub user: Option<User>,
}

#[derive(Default)]
pub struct RequestIdentities {
    entries: RwLock<HashMap<RequestId, Identity>>,
    mock: RwLock<Option<Account>>,
}

impl RequestIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the identity for `id`, replacing any previous one.
    pub fn store(&self, id: RequestId, identity: Identity) {
        self.entries.write().insert(id, identity);
    }

    pub fn get(&self, id: RequestId) -> Result<Identity, AuthError> {
        self.entries
            .read()
            .get(&id)
            .cloned()
            .ok_or(AuthError::Unauthenticated)
    }

    /// Remove the account, session and user recorded for `id`.
    pub fn clear(&self, id: RequestId) -> bool {
        self.entries.write().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Account for `id`; the mock account when one is set.
    pub fn account(&self, id: RequestId) -> Result<Account, AuthError> {
        if let Some(mock) = self.mock() {
            return Ok(mock);
        }
        self.get(id).map(|identity| identity.account)
    }

    pub fn session(&self, id: RequestId) -> Result<Session, AuthError> {
        self.get(id)?.session.ok_or(AuthError::Unauthenticated)
    }

    pub fn user(&self, id: RequestId) -> Result<Option<User>, AuthError> {
        self.get(id).map(|identity| identity.user)
    }

    /// Force every request to authenticate as `account` until
    /// [`clear_mock`](Self::clear_mock) is called.
    pub fn set_mock(&self, account: Account) {
        *self.mock.write() = Some(account);
    }

    pub fn clear_mock(&self) {
        *self.mock.write() = None;
    }

    pub fn mock(&self) -> Option<Account> {
        self.mock.read().clone()
    }

    /// Open a request scope. The entry for the returned guard's id is removed
    /// when the guard drops.
    pub fn scope(self: &Arc<Self>) -> IdentityGuard {
        IdentityGuard {
            identities: Arc::clone(self),
            id: RequestId::new(),
        }
    }
}

/// Owns one request's slot in [`RequestIdentities`].
pub struct IdentityGuard {
    identities: Arc<RequestIdentities>,
    id: RequestId,
}

impl IdentityGuard {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn context(&self) -> RequestContext {
        RequestContext {
            request_id: self.id,
            identities: Arc::clone(&self.identities),
        }
    }
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        if self.identities.clear(self.id) {
            tracing::trace!(request_id = %self.id, "request identity cleared");
        }
    }
}

/// Per-request handle passed to everything that needs the current identity.
#[derive(Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    identities: Arc<RequestIdentities>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .finish()
    }
}

impl RequestContext {
    pub fn identity(&self) -> Result<Identity, AuthError> {
        self.identities.get(self.request_id)
    }

    pub fn account(&self) -> Result<Account, AuthError> {
        self.identities.account(self.request_id)
    }

    pub fn session(&self) -> Result<Session, AuthError> {
        self.identities.session(self.request_id)
    }

    pub fn user(&self) -> Result<Option<User>, AuthError> {
        self.identities.user(self.request_id)
    }

    /// Tenant namespace for the authenticated account (its slug).
    pub fn namespace(&self) -> Result<String, AuthError> {
        self.account().map(|account| account.slug)
    }

    pub(crate) fn record(&self, identity: Identity) {
        self.identities.store(self.request_id, identity);
    }
}
