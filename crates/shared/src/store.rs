//! Durable store abstraction.
//!
//! Entities are stored as JSON documents addressed by an [`EntityKey`]. Backends
//! only need to support point reads, keyed writes, id allocation and
//! conjunctive equality queries; everything typed lives in [`crate::persist`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors produced by durable store backends and the persistence helper.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Entity not found: {key}")]
    NotFound { key: String },

    /// A uniqueness rule would be violated by the write.
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// A stored document no longer matches the shape of its entity type.
    #[error("Stored {kind} does not match its schema: {message}")]
    SchemaMismatch { kind: String, message: String },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl StoreError {
    pub fn not_found(key: impl fmt::Display) -> Self {
        Self::NotFound {
            key: key.to_string(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn schema_mismatch(kind: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::SchemaMismatch {
            kind: kind.into(),
            message: err.to_string(),
        }
    }

    pub fn serialization(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }

    pub fn connection<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connection {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }

    pub fn internal<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Internal {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }

    /// Schema mismatches are recoverable for lookups; everything else aborts.
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, Self::SchemaMismatch { .. })
    }
}

/// Identifier half of an [`EntityKey`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyId {
    Id(i64),
    Name(String),
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyId::Id(id) => write!(f, "{}", id),
            KeyId::Name(name) => f.write_str(name),
        }
    }
}

/// Address of a stored entity: its kind plus a numeric id or a string name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: String,
    pub id: KeyId,
}

impl EntityKey {
    pub fn named(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: KeyId::Name(name.into()),
        }
    }

    pub fn numeric(kind: impl Into<String>, id: i64) -> Self {
        Self {
            kind: kind.into(),
            id: KeyId::Id(id),
        }
    }

    /// Numeric id, if this key was allocated rather than named.
    pub fn int_id(&self) -> Option<i64> {
        match self.id {
            KeyId::Id(id) => Some(id),
            KeyId::Name(_) => None,
        }
    }

    /// The key's JSON form, as used in query filters against reference fields.
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "kind": self.kind, "id": self.id })
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Equality query over one entity kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub kind: String,
    pub filters: Vec<(String, Value)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            filters: Vec::new(),
            limit: None,
        }
    }

    /// Adds an equality filter; all filters must match.
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a document satisfies every filter of this query.
    pub fn matches(&self, doc: &Value) -> bool {
        self.filters
            .iter()
            .all(|(field, expected)| doc.get(field) == Some(expected))
    }
}

/// Durable key-value store for JSON entity documents.
///
/// Implementations must be safe to share across request tasks.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Point lookup by key.
    async fn get(&self, key: &EntityKey) -> StoreResult<Option<Value>>;

    /// Insert or replace the document stored under `key`.
    async fn put(&self, key: &EntityKey, doc: Value) -> StoreResult<()>;

    /// Remove a document, returning whether it existed.
    async fn delete(&self, key: &EntityKey) -> StoreResult<bool>;

    /// Allocate a fresh numeric id for `kind`.
    async fn allocate_id(&self, kind: &str) -> StoreResult<i64>;

    /// Run an equality query, returning matching keys and documents in key order.
    async fn query(&self, query: &Query) -> StoreResult<Vec<(EntityKey, Value)>>;

    /// Count documents matching `query`, ignoring its limit.
    async fn count(&self, query: &Query) -> StoreResult<usize>;
}
