//! Typed persistence on top of [`DurableStore`].
//!
//! Every save runs the entity's [`PreSave`] hook, assigns a key when the entity
//! has none, writes the document and then runs [`PostSave`]. Hooks receive a
//! [`SaveContext`] carrying the collaborators they may need; nothing is looked
//! up from globals.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    clock::Clock,
    crypto::{Cipher, CipherError},
    store::{DurableStore, EntityKey, Query, StoreError, StoreResult},
};

/// Collaborators available to save hooks.
#[derive(Clone, Copy)]
pub struct SaveContext<'a> {
    pub store: &'a dyn DurableStore,
    pub cipher: &'a Cipher,
    pub clock: &'a dyn Clock,
    /// Key of the entity the saved one should belong to, if the caller knows it.
    pub owner: Option<&'a EntityKey>,
}

impl<'a> SaveContext<'a> {
    pub fn new(store: &'a dyn DurableStore, cipher: &'a Cipher, clock: &'a dyn Clock) -> Self {
        Self {
            store,
            cipher,
            clock,
            owner: None,
        }
    }

    pub fn with_owner(mut self, owner: Option<&'a EntityKey>) -> Self {
        self.owner = owner;
        self
    }
}

#[async_trait]
pub trait PreSave {
    /// Runs before the document is written. An error aborts the save.
    async fn pre_save(&mut self, _ctx: &SaveContext<'_>) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
pub trait PostSave {
    /// Runs after the document is written, with the key it was written under.
    async fn post_save(&mut self, _ctx: &SaveContext<'_>, _key: &EntityKey) -> StoreResult<()> {
        Ok(())
    }
}

/// A persisted entity kind.
pub trait Entity: Serialize + DeserializeOwned + PreSave + PostSave + Send + Sync {
    /// Kind name used in keys and queries.
    const KIND: &'static str;

    /// Key to write under. `None` means a numeric id is allocated.
    fn stored_key(&self) -> Option<EntityKey>;

    /// Remember the key the entity was written under or loaded from.
    fn assign_key(&mut self, key: EntityKey);
}

impl From<CipherError> for StoreError {
    fn from(err: CipherError) -> Self {
        StoreError::internal(err)
    }
}

/// Save `entity`, returning the key it was written under.
pub async fn save<E: Entity>(ctx: &SaveContext<'_>, entity: &mut E) -> StoreResult<EntityKey> {
    entity.pre_save(ctx).await?;

    let key = match entity.stored_key() {
        Some(key) => key,
        None => EntityKey::numeric(E::KIND, ctx.store.allocate_id(E::KIND).await?),
    };
    entity.assign_key(key.clone());

    let doc = serde_json::to_value(&*entity).map_err(StoreError::serialization)?;
    ctx.store.put(&key, doc).await?;

    entity.post_save(ctx, &key).await?;
    Ok(key)
}

/// Load the entity stored under `key`.
pub async fn load<E: Entity>(store: &dyn DurableStore, key: &EntityKey) -> StoreResult<Option<E>> {
    match store.get(key).await? {
        Some(doc) => decode(key.clone(), doc).map(Some),
        None => Ok(None),
    }
}

/// First entity (in key order) matching `query`.
///
/// A stored document that no longer decodes into `E` yields
/// [`StoreError::SchemaMismatch`].
pub async fn find_one<E: Entity>(store: &dyn DurableStore, query: Query) -> StoreResult<Option<E>> {
    let mut rows = store.query(&query.limit(1)).await?;
    match rows.pop() {
        Some((key, doc)) => decode(key, doc).map(Some),
        None => Ok(None),
    }
}

/// Whether any entity matches `query`.
pub async fn exists(store: &dyn DurableStore, query: Query) -> StoreResult<bool> {
    Ok(store.count(&query.limit(1)).await? > 0)
}

fn decode<E: Entity>(key: EntityKey, doc: serde_json::Value) -> StoreResult<E> {
    let mut entity: E =
        serde_json::from_value(doc).map_err(|e| StoreError::schema_mismatch(E::KIND, e))?;
    entity.assign_key(key);
    Ok(entity)
}
