//! Identity resolution
//!
//! [`AuthService`] turns [`Credentials`] into an [`Identity`] and records it in
//! the request identity cache. It owns every piece of shared authentication
//! state; one instance is built at startup and shared by reference.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tenantauth_shared::{
    persist::{self, SaveContext},
    slug::SLUG_FIELD,
    Cipher, Clock, DurableStore, EntityKey, Query, SharedCache,
};

use super::{
    credentials::{token_prefix, AuthHeaders, Credentials},
    error::AuthError,
    identity::{Identity, IdentityGuard, RequestContext, RequestIdentities},
    sessions::{SessionStore, DEFAULT_SESSION_TTL},
};
use crate::accounts::{Account, Session, User};

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Header (and cookie) names credentials are read from
    #[serde(default)]
    pub headers: AuthHeaders,
    /// How long a session stays valid after its last use
    #[serde(default = "default_session_ttl")]
    pub session_ttl: Duration,
    /// Write the refreshed `last_used` back to the shared cache on every
    /// successful session validation
    #[serde(default = "default_persist_session_refresh")]
    pub persist_session_refresh: bool,
}

fn default_session_ttl() -> Duration {
    DEFAULT_SESSION_TTL
}

fn default_persist_session_refresh() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            headers: AuthHeaders::default(),
            session_ttl: DEFAULT_SESSION_TTL,
            persist_session_refresh: true,
        }
    }
}

pub struct AuthService {
    store: Arc<dyn DurableStore>,
    cipher: Arc<Cipher>,
    clock: Arc<dyn Clock>,
    sessions: SessionStore,
    identities: Arc<RequestIdentities>,
    config: AuthConfig,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn SharedCache>,
        cipher: Arc<Cipher>,
        clock: Arc<dyn Clock>,
        config: AuthConfig,
    ) -> Self {
        let sessions = SessionStore::new(cache, clock.clone(), config.session_ttl);
        Self {
            store,
            cipher,
            clock,
            sessions,
            identities: Arc::new(RequestIdentities::new()),
            config,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn DurableStore {
        self.store.as_ref()
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn identities(&self) -> &Arc<RequestIdentities> {
        &self.identities
    }

    /// Collaborators for saving entities outside of a request.
    pub fn save_context(&self) -> SaveContext<'_> {
        SaveContext::new(self.store.as_ref(), &self.cipher, self.clock.as_ref())
    }

    /// Open the identity scope for one request.
    pub fn begin_request(&self) -> IdentityGuard {
        self.identities.scope()
    }

    /// Authenticate every request as `account` until [`clear_mock`](Self::clear_mock).
    pub fn mock_account(&self, account: Account) {
        tracing::warn!(account = %account.slug, "mock account enabled");
        self.identities.set_mock(account);
    }

    pub fn clear_mock(&self) {
        self.identities.clear_mock();
    }

    /// Resolve `credentials` and record the identity for the request.
    pub async fn authenticate(
        &self,
        ctx: &RequestContext,
        credentials: &Credentials,
    ) -> Result<Identity, AuthError> {
        if let Some(account) = self.identities.mock() {
            let identity = Identity {
                account,
                session: None,
                user: None,
            };
            ctx.record(identity.clone());
            return Ok(identity);
        }

        match credentials {
            Credentials::Account { slug, api_key } => {
                self.authenticate_by_account(ctx, slug, api_key).await
            }
            Credentials::User { username, password } => {
                self.authenticate_by_user(ctx, username, password).await
            }
            Credentials::Session { token } => self.authenticate_by_session(ctx, token).await,
        }
    }

    /// Authenticate with an account slug and its API key.
    pub async fn authenticate_by_account(
        &self,
        ctx: &RequestContext,
        slug: &str,
        api_key: &str,
    ) -> Result<Identity, AuthError> {
        let query = Query::kind(Account::KIND).filter(SLUG_FIELD, slug);
        let mut account = match persist::find_one::<Account>(self.store(), query).await {
            Ok(Some(account)) => account,
            Ok(None) => return Err(AuthError::NoSuchAccount),
            Err(e) if e.is_schema_mismatch() => {
                tracing::warn!(slug = %slug, error = %e, "authenticate_by_account: stored account does not decode");
                return Err(AuthError::NoSuchAccount);
            }
            Err(e) => return Err(e.into()),
        };

        if !bool::from(account.api_key.as_bytes().ct_eq(api_key.as_bytes())) {
            return Err(AuthError::InvalidApiKey);
        }
        account.load();

        let session = self.try_create_session(&account, None).await;
        let identity = Identity {
            account,
            session,
            user: None,
        };
        ctx.record(identity.clone());

        tracing::info!(
            request_id = %ctx.request_id,
            account = %identity.account.slug,
            "authenticate_by_account: authentication successful"
        );
        Ok(identity)
    }

    /// Authenticate with a username and password, scoped to the request's
    /// account when one is already established.
    pub async fn authenticate_by_user(
        &self,
        ctx: &RequestContext,
        username: &str,
        password: &str,
    ) -> Result<Identity, AuthError> {
        let mut query = Query::kind(User::KIND).filter("username", username);
        if let Ok(account) = ctx.account() {
            query = query.filter("account", account.entity_key().to_value());
        }

        let mut user = match persist::find_one::<User>(self.store(), query).await {
            Ok(Some(user)) => user,
            Ok(None) => return Err(AuthError::NoSuchAccount),
            Err(e) if e.is_schema_mismatch() => {
                // Most likely a record written before a field changed shape
                tracing::warn!(username = %username, error = %e, "authenticate_by_user: stored user does not decode");
                return Err(AuthError::NoSuchAccount);
            }
            Err(e) => {
                tracing::error!(username = %username, error = %e, "authenticate_by_user: error loading user");
                return Err(e.into());
            }
        };

        if !user.validate_password(&self.cipher, password) {
            return Err(AuthError::InvalidPassword);
        }

        user.last_login = Some(self.clock.now());
        if let Err(e) = persist::save(&self.save_context(), &mut user).await {
            tracing::warn!(username = %username, error = %e, "authenticate_by_user: failed to record last login");
        }

        let mut account = user
            .account(self.store())
            .await?
            .ok_or(AuthError::OrphanedUser)?;
        account.load();

        let session = self.try_create_session(&account, Some(&user)).await;
        let identity = Identity {
            account,
            session,
            user: Some(user),
        };
        ctx.record(identity.clone());

        tracing::info!(
            request_id = %ctx.request_id,
            account = %identity.account.slug,
            username = %username,
            "authenticate_by_user: authentication successful"
        );
        Ok(identity)
    }

    /// Authenticate with an existing session token.
    pub async fn authenticate_by_session(
        &self,
        ctx: &RequestContext,
        token: &str,
    ) -> Result<Identity, AuthError> {
        let mut session = match self.sessions.get(token).await {
            Ok(session) => session,
            Err(AuthError::NoSuchSession) => return Err(AuthError::Unauthenticated),
            Err(e) => return Err(e),
        };

        let mut account = match self.sessions.cached_account(token) {
            Some(account) => account,
            None => match persist::load::<Account>(self.store(), &session.account).await {
                Ok(Some(account)) => account,
                Ok(None) => return Err(AuthError::Unauthenticated),
                Err(e) => {
                    tracing::warn!(account = %session.account, error = %e, "authenticate_by_session: failed to load account");
                    return Err(AuthError::Unauthenticated);
                }
            },
        };
        account.load();

        if session.is_expired_at(self.clock.now()) {
            tracing::debug!(session = %token_prefix(token), "authenticate_by_session: session expired");
            if let Err(e) = self.sessions.delete(token).await {
                tracing::warn!(session = %token_prefix(token), error = %e, "authenticate_by_session: failed to remove expired session");
            }
            return Err(AuthError::SessionExpired);
        }

        self.sessions.touch(&mut session);
        if self.config.persist_session_refresh {
            if let Err(e) = self.sessions.persist(&session).await {
                tracing::warn!(session = %token_prefix(token), error = %e, "authenticate_by_session: failed to persist refreshed session");
            }
        }

        let user = self.session_user(&session).await;
        let identity = Identity {
            account,
            session: Some(session),
            user,
        };
        ctx.record(identity.clone());
        Ok(identity)
    }

    /// The request's session, or a new one for `account` when the request has none.
    pub async fn account_session(
        &self,
        ctx: &RequestContext,
        account: &Account,
    ) -> Result<Session, AuthError> {
        if let Ok(session) = ctx.session() {
            return Ok(session);
        }

        let session = self.sessions.create(account, None).await.map_err(|e| {
            tracing::error!(account = %account.slug, error = %e, "account_session: error creating session");
            e
        })?;
        let user = ctx.user().ok().flatten();
        ctx.record(Identity {
            account: account.clone(),
            session: Some(session.clone()),
            user,
        });
        Ok(session)
    }

    /// Remove a session. Returns whether it existed.
    pub async fn clear_session(&self, token: &str) -> Result<bool, AuthError> {
        self.sessions.delete(token).await
    }

    pub fn current_account(&self, ctx: &RequestContext) -> Result<Account, AuthError> {
        ctx.account()
    }

    pub fn current_user(&self, ctx: &RequestContext) -> Result<Option<User>, AuthError> {
        ctx.user()
    }

    pub fn current_session(&self, ctx: &RequestContext) -> Result<Session, AuthError> {
        ctx.session()
    }

    pub fn current_account_key(&self, ctx: &RequestContext) -> Result<EntityKey, AuthError> {
        ctx.account().map(|account| account.entity_key())
    }

    async fn try_create_session(&self, account: &Account, user: Option<&User>) -> Option<Session> {
        match self.sessions.create(account, user).await {
            Ok(session) => Some(session),
            Err(e) => {
                // Authenticated without a session is tolerated
                tracing::warn!(account = %account.slug, error = %e, "error creating session for account");
                None
            }
        }
    }

    async fn session_user(&self, session: &Session) -> Option<User> {
        if let Some(user) = self.sessions.cached_user(&session.key) {
            return Some(user);
        }
        let key = session.user.as_ref()?;
        match persist::load::<User>(self.store(), key).await {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(user = %key, error = %e, "failed to load session user");
                None
            }
        }
    }
}
