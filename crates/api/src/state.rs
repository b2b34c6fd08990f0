//! Application state

use std::sync::Arc;

use tenantauth_shared::{Cipher, Clock, DurableStore, SharedCache};

use crate::{
    auth::{AuthService, AuthState},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub auth: Arc<AuthService>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn SharedCache>,
        cipher: Arc<Cipher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let auth = AuthService::new(store, cache, cipher, clock, config.auth_config());
        tracing::info!(
            session_ttl_secs = config.session_ttl.as_secs(),
            persist_session_refresh = config.persist_session_refresh,
            "Auth service initialized"
        );
        Self {
            config,
            auth: Arc::new(auth),
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            auth: self.auth.clone(),
        }
    }
}
