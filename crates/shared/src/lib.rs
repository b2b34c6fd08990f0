// Shared crate clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! TenantAuth shared collaborators
//!
//! The authentication core in `tenantauth-api` depends on four capabilities that
//! live here so they can be swapped per deployment:
//!
//! - **Durable store**: point lookups, equality queries and keyed puts
//!   ([`DurableStore`], [`MemoryStore`], [`PgStore`])
//! - **Shared cache**: namespaced volatile byte storage ([`SharedCache`],
//!   [`MemoryCache`], [`RedisCache`])
//! - **Cipher**: randomized symmetric encryption with a process-wide key ([`Cipher`])
//! - **Identifiers**: URL-safe slugs unique per entity kind ([`generate_unique_slug`])
//!
//! The [`persist`] module ties entities to the store with explicit
//! [`PreSave`] / [`PostSave`] hooks.

pub mod cache;
pub mod clock;
pub mod crypto;
pub mod memory;
pub mod persist;
pub mod postgres;
pub mod slug;
pub mod store;

pub use cache::{CacheError, CacheResult, RedisCache, SharedCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use crypto::{Cipher, CipherError};
pub use memory::{MemoryCache, MemoryStore};
pub use persist::{Entity, PostSave, PreSave, SaveContext};
pub use postgres::PgStore;
pub use slug::{generate_slug, generate_unique_slug};
pub use store::{DurableStore, EntityKey, KeyId, Query, StoreError, StoreResult};
