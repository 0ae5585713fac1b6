//! In-memory index registry.
//!
//! The registry holds the primary path → record map and a configurable set
//! of secondary inverted indexes keyed by dotted field name. Every record
//! carries a monotonically increasing insertion sequence number; query
//! results are ordered by it, which makes result order deterministic for an
//! unchanged registry.
//!
//! When a cache cap is configured, only record *bodies* are evicted: the
//! path, its sequence number and its secondary-index memberships stay
//! resident, and the body is reloaded from storage on access.

use core_store::MetadataRecord;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Record-body eviction policy for the primary map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Evict the least recently touched body.
    Lru,
    /// Evict the least frequently touched body, ties broken by recency.
    Lfu,
    /// Never evict; every record body stays resident.
    #[default]
    None,
}

/// Hashable key for one secondary-index bucket.
///
/// Only scalars are indexable. Numbers are collapsed onto `i64` when they
/// are integral so `2` and `2.0` land in the same bucket, matching the JSON
/// equality rule used by matchers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IndexKey {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
}

impl IndexKey {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(IndexKey::Null),
            Value::Bool(b) => Some(IndexKey::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(IndexKey::Int(i))
                } else {
                    let f = n.as_f64()?;
                    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                        Some(IndexKey::Int(f as i64))
                    } else {
                        Some(IndexKey::Float(f.to_bits()))
                    }
                }
            }
            Value::String(s) => Some(IndexKey::Str(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }
}

/// Result of a primary-map lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordAccess {
    /// The record body is resident.
    Resident(MetadataRecord),
    /// The path is indexed but its body was evicted; reload from storage.
    Evicted,
    /// The path is not in the registry.
    Missing,
}

#[derive(Debug, Clone)]
struct RecordEntry {
    /// `None` when the body has been evicted by the cache policy.
    record: Option<MetadataRecord>,
    seq: u64,
    /// Bucket memberships, kept so removal works without the body.
    indexed: Vec<(String, IndexKey)>,
    touched_at: u64,
    touches: u64,
}

type FieldIndex = HashMap<IndexKey, HashSet<String>>;

/// The registry's interior state. All mutation happens through the exclusive
/// write lock held by a transaction; the whole state is `Clone` so a
/// transaction can capture it as its rollback snapshot.
#[derive(Debug, Clone)]
pub struct RegistryState {
    records: HashMap<String, RecordEntry>,
    secondary: HashMap<String, FieldIndex>,
    next_seq: u64,
    clock: u64,
    resident: usize,
    max_cache_size: Option<usize>,
    cache_policy: CachePolicy,
}

impl RegistryState {
    pub fn new(
        indexed_fields: Vec<String>,
        max_cache_size: Option<usize>,
        cache_policy: CachePolicy,
    ) -> Self {
        let secondary = indexed_fields
            .into_iter()
            .map(|field| (field, FieldIndex::new()))
            .collect();
        Self {
            records: HashMap::new(),
            secondary,
            next_seq: 0,
            clock: 0,
            resident: 0,
            max_cache_size,
            cache_policy,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.records.contains_key(path)
    }

    /// Insertion sequence of a path, if present.
    pub fn seq_of(&self, path: &str) -> Option<u64> {
        self.records.get(path).map(|entry| entry.seq)
    }

    /// All indexed paths in insertion order.
    pub fn paths_in_order(&self) -> Vec<String> {
        let mut with_seq: Vec<(u64, &String)> = self
            .records
            .iter()
            .map(|(path, entry)| (entry.seq, path))
            .collect();
        with_seq.sort_unstable();
        with_seq.into_iter().map(|(_, path)| path.clone()).collect()
    }

    /// Dotted field names with a declared secondary index.
    pub fn declared_indexes(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.secondary.keys().cloned().collect();
        fields.sort();
        fields
    }

    pub fn is_indexed(&self, field: &str) -> bool {
        self.secondary.contains_key(field)
    }

    /// Look up a record body without affecting cache accounting.
    pub fn get(&self, path: &str) -> RecordAccess {
        match self.records.get(path) {
            Some(entry) => match &entry.record {
                Some(record) => RecordAccess::Resident(record.clone()),
                None => RecordAccess::Evicted,
            },
            None => RecordAccess::Missing,
        }
    }

    /// Insert or replace a record, maintaining every secondary index.
    ///
    /// A replaced record keeps its original insertion sequence; a new one is
    /// appended to the insertion order.
    pub fn upsert(&mut self, path: &str, record: MetadataRecord) {
        self.clock += 1;
        let clock = self.clock;

        if let Some(mut entry) = self.records.remove(path) {
            self.unindex_entry(path, &entry);
            if entry.record.is_some() {
                self.resident -= 1;
            }
            entry.record = Some(record);
            entry.indexed = Vec::new();
            entry.touched_at = clock;
            entry.touches += 1;
            self.records.insert(path.to_string(), entry);
        } else {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.records.insert(
                path.to_string(),
                RecordEntry {
                    record: Some(record),
                    seq,
                    indexed: Vec::new(),
                    touched_at: clock,
                    touches: 1,
                },
            );
        }
        self.resident += 1;

        self.index_entry(path);
        self.enforce_cache_cap(path);
    }

    /// Remove a record and every secondary-index entry pointing at it.
    pub fn remove(&mut self, path: &str) -> bool {
        match self.records.remove(path) {
            Some(entry) => {
                self.unindex_entry(path, &entry);
                if entry.record.is_some() {
                    self.resident -= 1;
                }
                true
            }
            None => false,
        }
    }

    /// Put a body back for an entry whose record was evicted. The body must
    /// be the stored record for the path; secondary indexes are not touched.
    pub fn repopulate(&mut self, path: &str, record: MetadataRecord) {
        self.clock += 1;
        let clock = self.clock;
        if let Some(entry) = self.records.get_mut(path) {
            if entry.record.is_none() {
                entry.record = Some(record);
                self.resident += 1;
            }
            entry.touched_at = clock;
            entry.touches += 1;
        }
        self.enforce_cache_cap(path);
    }

    /// Declare a new secondary index and backfill it.
    ///
    /// `bodies` supplies record bodies for evicted entries; resident entries
    /// index their own body. Runs under the exclusive write lock, so writers
    /// are blocked for the duration of the pass.
    pub fn create_index(&mut self, field: &str, bodies: &HashMap<String, MetadataRecord>) {
        if self.secondary.contains_key(field) {
            return;
        }

        let mut index = FieldIndex::new();
        let mut memberships: Vec<(String, Vec<IndexKey>)> = Vec::new();
        for (path, entry) in &self.records {
            let record = entry.record.as_ref().or_else(|| bodies.get(path));
            let Some(record) = record else { continue };
            let Some(value) = record.field(field) else {
                continue;
            };
            let keys = index_keys_for(&value);
            for key in &keys {
                index.entry(key.clone()).or_default().insert(path.clone());
            }
            if !keys.is_empty() {
                memberships.push((path.clone(), keys));
            }
        }

        for (path, keys) in memberships {
            if let Some(entry) = self.records.get_mut(&path) {
                entry
                    .indexed
                    .extend(keys.into_iter().map(|key| (field.to_string(), key)));
            }
        }
        self.secondary.insert(field.to_string(), index);

        debug!(field, records = self.records.len(), "created secondary index");
    }

    /// Candidate paths whose indexed `field` carries `value` (scalar equal or
    /// list-contains). `None` when the field has no index or the value is not
    /// indexable; `Some(empty)` is a definitive no-match.
    pub fn lookup(&self, field: &str, value: &Value) -> Option<HashSet<String>> {
        let index = self.secondary.get(field)?;
        let key = IndexKey::from_value(value)?;
        Some(index.get(&key).cloned().unwrap_or_default())
    }

    /// Candidate paths for a `$contains` matcher on an indexed `field`.
    ///
    /// Exact-bucket hits cover scalar equality and list elements; for string
    /// operands the bucket *keys* are additionally scanned for substring
    /// matches, so string-valued fields containing the operand are never
    /// excluded. `None` when the field has no index or the operand is not
    /// indexable.
    pub fn lookup_contains(&self, field: &str, value: &Value) -> Option<HashSet<String>> {
        let index = self.secondary.get(field)?;
        let key = IndexKey::from_value(value)?;
        let mut result = index.get(&key).cloned().unwrap_or_default();
        if let Value::String(needle) = value {
            for (bucket_key, bucket) in index {
                if let IndexKey::Str(stored) = bucket_key {
                    if stored.contains(needle.as_str()) {
                        result.extend(bucket.iter().cloned());
                    }
                }
            }
        }
        Some(result)
    }

    /// Bucket size for selectivity estimates; `None` mirrors `lookup`.
    pub fn bucket_size(&self, field: &str, value: &Value) -> Option<usize> {
        let index = self.secondary.get(field)?;
        let key = IndexKey::from_value(value)?;
        Some(index.get(&key).map(HashSet::len).unwrap_or(0))
    }

    fn index_entry(&mut self, path: &str) {
        let Some(record) = self.records.get(path).and_then(|entry| entry.record.clone()) else {
            return;
        };
        let fields: Vec<String> = self.secondary.keys().cloned().collect();
        let mut memberships = Vec::new();
        for field in fields {
            let Some(value) = record.field(&field) else {
                continue;
            };
            let Some(index) = self.secondary.get_mut(&field) else {
                continue;
            };
            for key in index_keys_for(&value) {
                index.entry(key.clone()).or_default().insert(path.to_string());
                memberships.push((field.clone(), key));
            }
        }
        if let Some(entry) = self.records.get_mut(path) {
            entry.indexed.extend(memberships);
        }
    }

    fn unindex_entry(&mut self, path: &str, entry: &RecordEntry) {
        for (field, key) in &entry.indexed {
            if let Some(index) = self.secondary.get_mut(field) {
                if let Some(bucket) = index.get_mut(key) {
                    bucket.remove(path);
                    if bucket.is_empty() {
                        index.remove(key);
                    }
                }
            }
        }
    }

    /// Evict record bodies past the configured cap. `keep` is the path that
    /// triggered the call and is never evicted by it.
    fn enforce_cache_cap(&mut self, keep: &str) {
        let Some(max) = self.max_cache_size else {
            return;
        };
        let policy = self.cache_policy;
        if policy == CachePolicy::None {
            return;
        }

        while self.resident > max.max(1) {
            let victim = self
                .records
                .iter()
                .filter(|(path, entry)| entry.record.is_some() && path.as_str() != keep)
                .min_by_key(|(_, entry)| match policy {
                    CachePolicy::Lru => (entry.touched_at, 0),
                    CachePolicy::Lfu => (entry.touches, entry.touched_at),
                    CachePolicy::None => (u64::MAX, u64::MAX),
                })
                .map(|(path, _)| path.clone());

            let Some(victim) = victim else { break };
            if let Some(entry) = self.records.get_mut(&victim) {
                entry.record = None;
                self.resident -= 1;
            }
        }
    }
}

fn index_keys_for(value: &Value) -> Vec<IndexKey> {
    match value {
        // List values index element-wise; nested non-scalars are skipped.
        Value::Array(items) => items.iter().filter_map(IndexKey::from_value).collect(),
        Value::Object(_) => Vec::new(),
        other => IndexKey::from_value(other).into_iter().collect(),
    }
}

/// Shared handle to the registry state behind its read-write lock.
///
/// Readers (`get_metadata`, search evaluation) take the shared mode; writers
/// (transactions, index creation, sync) take the exclusive mode, so secondary
/// indexes are always observed consistent with the primary map.
#[derive(Debug, Clone)]
pub struct IndexRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl IndexRegistry {
    pub fn new(state: RegistryState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().await
    }

    /// Exclusive guard that can outlive the borrow of `self`; transactions
    /// hold this for their whole lifetime.
    pub async fn write_owned(&self) -> OwnedRwLockWriteGuard<RegistryState> {
        Arc::clone(&self.state).write_owned().await
    }
}
