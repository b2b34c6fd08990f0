//! Authentication module for TenantAuth

pub mod credentials;
pub mod error;
pub mod identity;
pub mod middleware;
pub mod resolver;
pub mod sessions;

pub use credentials::{session_token, AuthHeaders, Credentials};
pub use error::AuthError;
pub use identity::{Identity, IdentityGuard, RequestContext, RequestId, RequestIdentities};
pub use middleware::{require_auth, send_session, AuthState, AuthenticatedFn, CurrentIdentity};
pub use resolver::{AuthConfig, AuthService};
pub use sessions::{SessionStore, DEFAULT_SESSION_TTL, SESSION_CACHE_PREFIX};
