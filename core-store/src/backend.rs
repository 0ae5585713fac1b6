//! Storage backend contract.
//!
//! Backends persist records keyed by canonical path. The contract guarantees
//! atomicity of `save` and `delete` individually and of `bulk` as a group;
//! durability is best-effort, with `flush` invoked at transaction commit.
//! `snapshot`/`restore` give transactions a rollback point.

use crate::error::Result;
use crate::model::MetadataRecord;
use async_trait::async_trait;
use serde_json::Value;

/// Opaque handle for a backend snapshot.
///
/// Handles are single-use: `restore` and `discard` both consume them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub(crate) u64);

/// One operation of an atomic `bulk` group.
#[derive(Debug, Clone)]
pub enum BulkOp {
    Save { path: String, record: MetadataRecord },
    Delete { path: String },
}

/// Per-operation outcome of a `bulk` group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkOutcome {
    Saved,
    /// Whether a record existed and was deleted.
    Deleted(bool),
}

/// Comparison pushed down to a backend's `query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateOp {
    /// Scalar equality, with list-contains semantics for list values.
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Field presence; the operand is a boolean.
    Exists,
}

/// A single field comparison a backend may push down.
#[derive(Debug, Clone)]
pub struct FieldPredicate {
    /// Dotted field name (`system.extension`, `user.tags`, ...).
    pub field: String,
    pub op: PredicateOp,
    pub value: Value,
}

/// Predicate set handed to `StorageBackend::query`.
///
/// Backends apply whatever subset they can and return a superset of the
/// matching paths; the query engine post-filters the remainder. Ignoring
/// every predicate and returning all paths is a valid implementation.
#[derive(Debug, Clone, Default)]
pub struct QueryCriteria {
    pub predicates: Vec<FieldPredicate>,
}

impl QueryCriteria {
    pub fn new(predicates: Vec<FieldPredicate>) -> Self {
        Self { predicates }
    }
}

/// Durable key/value store keyed by canonical path.
///
/// A repeated `save` with identical arguments must be observably equivalent
/// to a single save; `delete` reports whether a record existed.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn save(&self, path: &str, record: &MetadataRecord) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Option<MetadataRecord>>;

    async fn delete(&self, path: &str) -> Result<bool>;

    /// Return a superset of the paths matching `criteria`.
    async fn query(&self, criteria: &QueryCriteria) -> Result<Vec<String>>;

    /// Apply `ops` atomically as a group, reporting per-op outcomes.
    async fn bulk(&self, ops: Vec<BulkOp>) -> Result<Vec<BulkOutcome>>;

    /// All `(path, record)` pairs currently stored.
    async fn iter_all(&self) -> Result<Vec<(String, MetadataRecord)>>;

    /// Capture the current contents for a later `restore`.
    async fn snapshot(&self) -> Result<SnapshotId>;

    /// Roll the store back to `snapshot`, consuming the handle.
    async fn restore(&self, snapshot: SnapshotId) -> Result<()>;

    /// Drop a snapshot without restoring it.
    async fn discard(&self, snapshot: SnapshotId) -> Result<()>;

    /// Best-effort durability point; called at transaction commit.
    async fn flush(&self) -> Result<()>;
}
