//! Account, User and Session records

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tenantauth_shared::{
    generate_unique_slug,
    persist::{self, Entity, PostSave, PreSave, SaveContext},
    Cipher, DurableStore, EntityKey, Query, StoreError, StoreResult,
};
use time::OffsetDateTime;
use uuid::Uuid;

/// Tenant account. Stored under `Account/<slug>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Account {
    /// Locally cached key, populated by [`Account::load`]
    #[serde(skip)]
    key: Option<EntityKey>,
    pub id: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created: Option<OffsetDateTime>,
    pub name: String,
    pub slug: String,
    /// Generated once on first save, compared exactly on authentication
    #[serde(rename = "apikey")]
    pub api_key: String,
    pub active: bool,
}

impl Account {
    pub const KIND: &'static str = "Account";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: true,
            ..Default::default()
        }
    }

    /// New account stored under a caller-chosen slug.
    pub fn with_slug(name: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            ..Self::new(name)
        }
    }

    /// Use `api_key` instead of a generated one on first save.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Populate the cached key handle.
    pub fn load(&mut self) -> &EntityKey {
        let slug = &self.slug;
        self.key
            .get_or_insert_with(|| EntityKey::named(Self::KIND, slug.as_str()))
    }

    /// Cached key, if [`load`](Self::load) has run.
    pub fn key(&self) -> Option<&EntityKey> {
        self.key.as_ref()
    }

    /// Cached key, or the key derived from the slug.
    pub fn entity_key(&self) -> EntityKey {
        self.key
            .clone()
            .unwrap_or_else(|| EntityKey::named(Self::KIND, self.slug.as_str()))
    }
}

#[async_trait]
impl PreSave for Account {
    async fn pre_save(&mut self, ctx: &SaveContext<'_>) -> StoreResult<()> {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        if self.name.is_empty() {
            self.name = format!("Account-{}", rand::random::<u32>());
        }

        if self.slug.is_empty() {
            self.slug = generate_unique_slug(ctx.store, Self::KIND, &self.name).await?;
        } else if self.key.is_none() {
            // Never saved or loaded: the slug must be free
            let key = EntityKey::named(Self::KIND, self.slug.as_str());
            if ctx.store.get(&key).await?.is_some() {
                return Err(StoreError::conflict(format!(
                    "Account slug '{}' is already taken",
                    self.slug
                )));
            }
        }

        if self.created.is_none() {
            self.created = Some(ctx.clock.now());
        }
        if self.api_key.is_empty() {
            self.api_key = hex::encode(rand::random::<[u8; 16]>());
        }
        Ok(())
    }
}

#[async_trait]
impl PostSave for Account {
    async fn post_save(&mut self, _ctx: &SaveContext<'_>, _key: &EntityKey) -> StoreResult<()> {
        self.load();
        Ok(())
    }
}

impl Entity for Account {
    const KIND: &'static str = Account::KIND;

    fn stored_key(&self) -> Option<EntityKey> {
        Some(self.entity_key())
    }

    fn assign_key(&mut self, key: EntityKey) {
        self.key = Some(key);
    }
}

/// Login belonging to an account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct User {
    #[serde(skip)]
    key: Option<EntityKey>,
    pub id: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_login: Option<OffsetDateTime>,
    pub username: String,
    pub email: String,
    /// Plaintext, only held until the next save
    #[serde(skip_serializing)]
    pub password: String,
    /// Hex of the cipher output
    pub encrypted_password: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(rename = "account")]
    pub account_key: Option<EntityKey>,
    #[serde(skip)]
    account: Option<Account>,
}

impl User {
    pub const KIND: &'static str = "User";

    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    /// Attach the user to `account`.
    pub fn owned_by(mut self, account: &Account) -> Self {
        self.account_key = Some(account.entity_key());
        self
    }

    pub fn key(&self) -> Option<&EntityKey> {
        self.key.as_ref()
    }

    /// Whether `password` matches the stored encrypted password.
    pub fn validate_password(&self, cipher: &Cipher, password: &str) -> bool {
        let Ok(encrypted) = hex::decode(&self.encrypted_password) else {
            return false;
        };
        match cipher.decrypt(&encrypted) {
            Ok(decrypted) => decrypted == password.as_bytes(),
            Err(e) => {
                tracing::debug!(username = %self.username, error = %e, "validate_password: decrypt failed");
                false
            }
        }
    }

    /// Owning account, loaded once and cached on the user.
    pub async fn account(&mut self, store: &dyn DurableStore) -> StoreResult<Option<Account>> {
        if self.account.is_none() {
            let Some(key) = self.account_key.as_ref() else {
                return Ok(None);
            };
            self.account = persist::load::<Account>(store, key).await?;
        }
        Ok(self.account.clone())
    }
}

#[async_trait]
impl PreSave for User {
    async fn pre_save(&mut self, ctx: &SaveContext<'_>) -> StoreResult<()> {
        if !self.password.is_empty() {
            let encrypted = ctx.cipher.encrypt(self.password.as_bytes())?;
            self.encrypted_password = hex::encode(encrypted);
            self.password.clear();
        }

        if self.username.is_empty() {
            self.username = if !self.email.is_empty() {
                self.email.clone()
            } else {
                format!("{}{}", self.first_name, self.last_name)
            };
        }

        if self.account_key.is_none() {
            self.account_key = ctx.owner.cloned();
        }
        if let Some(account_key) = &self.account_key {
            if ctx.store.get(account_key).await?.is_none() {
                return Err(StoreError::not_found(account_key));
            }
        }

        // Usernames are unique within an account
        let account_filter = self
            .account_key
            .as_ref()
            .map(EntityKey::to_value)
            .unwrap_or(serde_json::Value::Null);
        let query = Query::kind(Self::KIND)
            .filter("username", self.username.as_str())
            .filter("account", account_filter)
            .limit(2);
        let own_key = self.stored_key();
        let taken = ctx
            .store
            .query(&query)
            .await?
            .into_iter()
            .any(|(key, _)| Some(&key) != own_key.as_ref());
        if taken {
            return Err(StoreError::conflict(format!(
                "Username '{}' is already taken",
                self.username
            )));
        }

        if self.created.is_none() {
            self.created = Some(ctx.clock.now());
        }
        Ok(())
    }
}

impl PostSave for User {}

impl Entity for User {
    const KIND: &'static str = User::KIND;

    fn stored_key(&self) -> Option<EntityKey> {
        match (&self.key, self.id) {
            (Some(key), _) => Some(key.clone()),
            (None, 0) => None,
            (None, id) => Some(EntityKey::numeric(Self::KIND, id)),
        }
    }

    fn assign_key(&mut self, key: EntityKey) {
        if let Some(id) = key.int_id() {
            self.id = id;
        }
        self.key = Some(key);
    }
}

/// Proof of a successful authentication, valid while `now <= last_used + ttl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub key: String,
    pub account: EntityKey,
    #[serde(default)]
    pub user: Option<EntityKey>,
    #[serde(with = "time::serde::rfc3339")]
    pub initialized: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_used: OffsetDateTime,
    #[serde(with = "duration_nanos")]
    pub ttl: Duration,
}

impl Session {
    /// Instant after which the session is expired. `None` if it never expires
    /// within the representable range.
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        time::Duration::try_from(self.ttl)
            .ok()
            .and_then(|ttl| self.last_used.checked_add(ttl))
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at().is_some_and(|at| now > at)
    }
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantauth_shared::{
        persist::{find_one, save},
        ManualClock, MemoryStore,
    };
    use time::macros::datetime;

    const KEY: &[u8] = b"0123456789abcdef";

    fn clock() -> ManualClock {
        ManualClock::new(datetime!(2024-03-01 09:00:00 UTC))
    }

    #[tokio::test]
    async fn test_account_pre_save_fills_defaults() {
        let store = MemoryStore::new();
        let cipher = Cipher::new();
        let clock = clock();
        let ctx = SaveContext::new(&store, &cipher, &clock);

        let mut account = Account::new("Acme Corp");
        let key = save(&ctx, &mut account).await.unwrap();

        assert_eq!(key, EntityKey::named("Account", "acme-corp"));
        assert_eq!(account.key(), Some(&key));
        assert_eq!(account.slug, "acme-corp");
        assert!(Uuid::parse_str(&account.id).is_ok());
        assert_eq!(account.api_key.len(), 32);
        assert_eq!(account.created, Some(datetime!(2024-03-01 09:00:00 UTC)));
    }

    #[tokio::test]
    async fn test_account_api_key_is_never_regenerated() {
        let store = MemoryStore::new();
        let cipher = Cipher::new();
        let clock = clock();
        let ctx = SaveContext::new(&store, &cipher, &clock);

        let mut account = Account::new("Acme");
        save(&ctx, &mut account).await.unwrap();
        let api_key = account.api_key.clone();

        account.name = "Acme Renamed".into();
        save(&ctx, &mut account).await.unwrap();
        assert_eq!(account.api_key, api_key);
        assert_eq!(account.slug, "acme");
    }

    #[tokio::test]
    async fn test_account_default_name_and_slug_suffix() {
        let store = MemoryStore::new();
        let cipher = Cipher::new();
        let clock = clock();
        let ctx = SaveContext::new(&store, &cipher, &clock);

        let mut unnamed = Account::default();
        save(&ctx, &mut unnamed).await.unwrap();
        assert!(unnamed.name.starts_with("Account-"));

        let mut first = Account::new("Acme");
        let mut second = Account::new("Acme");
        save(&ctx, &mut first).await.unwrap();
        save(&ctx, &mut second).await.unwrap();
        assert_eq!(first.slug, "acme");
        assert_eq!(second.slug, "acme-2");
    }

    #[tokio::test]
    async fn test_account_supplied_slug_cannot_overwrite() {
        let store = MemoryStore::new();
        let cipher = Cipher::new();
        let clock = clock();
        let ctx = SaveContext::new(&store, &cipher, &clock);

        let mut first = Account::new("Acme");
        save(&ctx, &mut first).await.unwrap();

        let mut intruder = Account {
            slug: "acme".into(),
            ..Account::new("Other")
        };
        let err = save(&ctx, &mut intruder).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_new_account_with_copied_id_cannot_overwrite() {
        let store = MemoryStore::new();
        let cipher = Cipher::new();
        let clock = clock();
        let ctx = SaveContext::new(&store, &cipher, &clock);

        let mut first = Account::new("Acme");
        save(&ctx, &mut first).await.unwrap();

        let mut copy = Account::with_slug("pwned", "acme").with_api_key("attacker");
        copy.id = first.id.clone();
        let err = save(&ctx, &mut copy).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let stored: Account = persist::load(&store, &first.entity_key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.api_key, first.api_key);
        assert_eq!(stored.name, "Acme");
    }

    #[tokio::test]
    async fn test_account_serializes_apikey_field() {
        let account = Account {
            slug: "acme".into(),
            api_key: "k1".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(&account).unwrap();
        assert_eq!(value["apikey"], "k1");
        assert!(value.get("key").is_none());
    }

    #[tokio::test]
    async fn test_user_pre_save_encrypts_and_defaults() {
        let store = MemoryStore::new();
        let cipher = Cipher::with_key(KEY).unwrap();
        let clock = clock();
        let ctx = SaveContext::new(&store, &cipher, &clock);

        let mut account = Account::new("Acme");
        let account_key = save(&ctx, &mut account).await.unwrap();

        let mut user = User {
            email: "ada@example.com".into(),
            password: "hunter2".into(),
            ..Default::default()
        };
        let owned = ctx.with_owner(Some(&account_key));
        let key = save(&owned, &mut user).await.unwrap();

        assert_eq!(key.kind, "User");
        assert_eq!(user.id, key.int_id().unwrap());
        assert_eq!(user.username, "ada@example.com");
        assert!(user.password.is_empty());
        assert_eq!(user.account_key, Some(account_key));
        assert!(user.validate_password(&cipher, "hunter2"));
        assert!(!user.validate_password(&cipher, "hunter3"));

        let stored = store.get(&key).await.unwrap().unwrap();
        assert!(stored.get("password").is_none());
        assert_ne!(stored["encryptedPassword"], "");
    }

    #[tokio::test]
    async fn test_user_username_from_names() {
        let store = MemoryStore::new();
        let cipher = Cipher::with_key(KEY).unwrap();
        let clock = clock();
        let ctx = SaveContext::new(&store, &cipher, &clock);

        let mut user = User {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            ..Default::default()
        };
        save(&ctx, &mut user).await.unwrap();
        assert_eq!(user.username, "AdaLovelace");
        assert_eq!(user.account_key, None);
    }

    #[tokio::test]
    async fn test_user_requires_existing_account() {
        let store = MemoryStore::new();
        let cipher = Cipher::with_key(KEY).unwrap();
        let clock = clock();
        let ctx = SaveContext::new(&store, &cipher, &clock);

        let mut user = User {
            username: "ada".into(),
            account_key: Some(EntityKey::named("Account", "ghost")),
            ..Default::default()
        };
        let err = save(&ctx, &mut user).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_username_unique_within_account_only() {
        let store = MemoryStore::new();
        let cipher = Cipher::with_key(KEY).unwrap();
        let clock = clock();
        let ctx = SaveContext::new(&store, &cipher, &clock);

        let mut acme = Account::new("Acme");
        let mut globex = Account::new("Globex");
        let acme_key = save(&ctx, &mut acme).await.unwrap();
        let globex_key = save(&ctx, &mut globex).await.unwrap();

        let mut first = User {
            username: "ada".into(),
            account_key: Some(acme_key.clone()),
            ..Default::default()
        };
        save(&ctx, &mut first).await.unwrap();

        // Resaving the same user is fine
        save(&ctx, &mut first).await.unwrap();

        let mut duplicate = User {
            username: "ada".into(),
            account_key: Some(acme_key),
            ..Default::default()
        };
        let err = save(&ctx, &mut duplicate).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let mut elsewhere = User {
            username: "ada".into(),
            account_key: Some(globex_key),
            ..Default::default()
        };
        save(&ctx, &mut elsewhere).await.unwrap();
    }

    #[tokio::test]
    async fn test_user_account_is_cached() {
        let store = MemoryStore::new();
        let cipher = Cipher::with_key(KEY).unwrap();
        let clock = clock();
        let ctx = SaveContext::new(&store, &cipher, &clock);

        let mut account = Account::new("Acme");
        let account_key = save(&ctx, &mut account).await.unwrap();
        let mut user = User {
            username: "ada".into(),
            account_key: Some(account_key.clone()),
            ..Default::default()
        };
        save(&ctx, &mut user).await.unwrap();

        let mut loaded: User = find_one(&store, Query::kind("User").filter("username", "ada"))
            .await
            .unwrap()
            .unwrap();
        let owner = loaded.account(&store).await.unwrap().unwrap();
        assert_eq!(owner.slug, "acme");

        // Still served after the account disappears from the store
        store.delete(&account_key).await.unwrap();
        assert!(loaded.account(&store).await.unwrap().is_some());
    }

    #[test]
    fn test_session_expiry_boundary() {
        let t0 = datetime!(2024-03-01 09:00:00 UTC);
        let ttl = Duration::from_secs(3 * 60 * 60);
        let session = Session {
            key: "abc".into(),
            account: EntityKey::named("Account", "acme"),
            user: None,
            initialized: t0,
            last_used: t0,
            ttl,
        };

        let one_ns = time::Duration::nanoseconds(1);
        let deadline = t0 + ttl;
        assert!(!session.is_expired_at(deadline - one_ns));
        assert!(!session.is_expired_at(deadline));
        assert!(session.is_expired_at(deadline + one_ns));
    }

    #[test]
    fn test_session_json_shape() {
        let session = Session {
            key: "abc".into(),
            account: EntityKey::named("Account", "acme"),
            user: Some(EntityKey::numeric("User", 4)),
            initialized: datetime!(2024-03-01 09:00:00.000000001 UTC),
            last_used: datetime!(2024-03-01 09:00:00.000000001 UTC),
            ttl: Duration::from_secs(1),
        };
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["ttl"], 1_000_000_000u64);
        assert_eq!(value["lastUsed"], "2024-03-01T09:00:00.000000001Z");

        let back: Session = serde_json::from_value(value).unwrap();
        assert_eq!(back, session);
    }
}
