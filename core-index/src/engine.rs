//! Query planning and lazy evaluation.
//!
//! For each top-level field predicate the planner asks whether a secondary
//! index exists and whether the matcher admits index lookup (`$eq` and
//! literal scalars, `$contains`, `$in` over scalars). Indexable predicates
//! produce candidate path sets that are intersected smallest-first; when no
//! predicate is indexable the plan falls back to a full scan through
//! `StorageBackend::query`, handing pushable predicates down for the backend
//! to pre-filter.
//!
//! The candidate path list is materialized at plan time (one consistent
//! snapshot of the registry); record bodies are loaded and post-filtered
//! lazily as the consumer pulls items from the stream. Result order is the
//! insertion order of paths into the primary index.

use crate::error::{QueryError, Result};
use crate::handler::HandlerRegistry;
use crate::query::{eval_query, parse_query, Clause, Matcher, OpMatcher, Query};
use crate::registry::{IndexRegistry, RecordAccess, RegistryState};
use core_store::{FieldPredicate, PredicateOp, QueryCriteria, StorageBackend};
use futures::stream::{self, BoxStream};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Parses, plans and lazily evaluates declarative queries.
#[derive(Clone)]
pub struct QueryEngine {
    registry: IndexRegistry,
    storage: Arc<dyn StorageBackend>,
    handlers: HandlerRegistry,
}

impl QueryEngine {
    pub fn new(
        registry: IndexRegistry,
        storage: Arc<dyn StorageBackend>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            registry,
            storage,
            handlers,
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Parse a JSON query tree, reporting shape errors eagerly.
    pub fn parse(&self, query: &Value) -> Result<Query> {
        parse_query(query, &self.handlers)
    }

    /// Execute a query, returning a lazy stream of matching canonical paths
    /// in primary-insertion order.
    pub async fn search(&self, query: &Value) -> Result<BoxStream<'static, Result<String>>> {
        let parsed = self.parse(query)?;
        let candidates = self.plan(&parsed).await?;
        Ok(self.stream(candidates, parsed))
    }

    /// Materialize the ordered candidate path list for `query`.
    async fn plan(&self, query: &Query) -> Result<Vec<String>> {
        let indexed: Option<HashSet<String>> = {
            let state = self.registry.read().await;
            let mut sets: Vec<HashSet<String>> = query
                .clauses
                .iter()
                .filter_map(|clause| match clause {
                    Clause::Field { field, matcher } => {
                        index_candidates(&state, field, matcher)
                    }
                    _ => None,
                })
                .collect();

            if sets.is_empty() {
                None
            } else {
                // Intersect the smallest candidate sets first.
                sets.sort_by_key(|set| set.len());
                let mut iter = sets.into_iter();
                let mut acc = iter.next().unwrap_or_default();
                for set in iter {
                    acc.retain(|path| set.contains(path));
                    if acc.is_empty() {
                        break;
                    }
                }
                Some(acc)
            }
        };

        let paths: Vec<String> = match indexed {
            Some(set) => {
                debug!(candidates = set.len(), "index-assisted plan");
                set.into_iter().collect()
            }
            None => {
                let criteria = pushdown_criteria(query);
                debug!(pushdown = criteria.predicates.len(), "full-scan plan");
                self.storage.query(&criteria).await?
            }
        };

        let mut ordered = self.order_by_insertion(paths).await;

        // Custom handler clauses filter the materialized candidate list.
        for clause in &query.clauses {
            if let Clause::Custom { field, value } = clause {
                let Some(handler) = self.handlers.find(field, value) else {
                    return Err(QueryError::UnknownOperator(format!(
                        "no registered handler accepts the matcher for '{field}'"
                    )));
                };
                let filtered = handler.process(ordered, field, value);
                ordered = self.order_by_insertion(filtered).await;
            }
        }

        Ok(ordered)
    }

    async fn order_by_insertion(&self, paths: Vec<String>) -> Vec<String> {
        let state = self.registry.read().await;
        let mut with_seq: Vec<(u64, String)> = paths
            .into_iter()
            .filter_map(|path| state.seq_of(&path).map(|seq| (seq, path)))
            .collect();
        drop(state);
        with_seq.sort_unstable_by_key(|(seq, _)| *seq);
        with_seq.into_iter().map(|(_, path)| path).collect()
    }

    fn stream(&self, candidates: Vec<String>, query: Query) -> BoxStream<'static, Result<String>> {
        struct EvalState {
            remaining: VecDeque<String>,
            registry: IndexRegistry,
            storage: Arc<dyn StorageBackend>,
            query: Arc<Query>,
        }

        let state = EvalState {
            remaining: candidates.into(),
            registry: self.registry.clone(),
            storage: Arc::clone(&self.storage),
            query: Arc::new(query),
        };

        Box::pin(stream::try_unfold(state, |mut state| async move {
            while let Some(path) = state.remaining.pop_front() {
                let access = state.registry.read().await.get(&path);
                let record = match access {
                    RecordAccess::Resident(record) => Some(record),
                    // Evicted body: the durable copy is authoritative.
                    RecordAccess::Evicted => state.storage.get(&path).await?,
                    RecordAccess::Missing => None,
                };
                if let Some(record) = record {
                    if eval_query(&state.query, &record) {
                        return Ok(Some((path, state)));
                    }
                }
            }
            Ok(None)
        }))
    }
}

/// Candidate set for one field clause, or `None` when the clause does not
/// admit index lookup. Returned sets are supersets of the clause's matches;
/// the post-filter re-evaluates the full query per record.
fn index_candidates(
    state: &RegistryState,
    field: &str,
    matcher: &Matcher,
) -> Option<HashSet<String>> {
    if !state.is_indexed(field) {
        return None;
    }
    match matcher {
        Matcher::Literal(value) => state.lookup(field, value),
        Matcher::Ops(ops) => ops.iter().find_map(|op| match op {
            OpMatcher::Eq(value) => state.lookup(field, value),
            OpMatcher::Contains(value) => state.lookup_contains(field, value),
            OpMatcher::In(items) => {
                let mut acc = HashSet::new();
                for item in items {
                    // A non-scalar operand defeats bucket lookup; fall back
                    // to the post-filter for the whole clause.
                    acc.extend(state.lookup(field, item)?);
                }
                Some(acc)
            }
            _ => None,
        }),
    }
}

/// Predicates a backend may be able to pre-filter during a full scan.
fn pushdown_criteria(query: &Query) -> QueryCriteria {
    let mut predicates = Vec::new();
    for clause in &query.clauses {
        let Clause::Field { field, matcher } = clause else {
            continue;
        };
        match matcher {
            Matcher::Literal(value) if is_scalar(value) => predicates.push(FieldPredicate {
                field: field.clone(),
                op: PredicateOp::Eq,
                value: value.clone(),
            }),
            Matcher::Ops(ops) => {
                for op in ops {
                    let (op, value) = match op {
                        OpMatcher::Eq(v) if is_scalar(v) => (PredicateOp::Eq, v.clone()),
                        OpMatcher::Gt(v) if is_scalar(v) => (PredicateOp::Gt, v.clone()),
                        OpMatcher::Gte(v) if is_scalar(v) => (PredicateOp::Gte, v.clone()),
                        OpMatcher::Lt(v) if is_scalar(v) => (PredicateOp::Lt, v.clone()),
                        OpMatcher::Lte(v) if is_scalar(v) => (PredicateOp::Lte, v.clone()),
                        OpMatcher::Exists(b) => (PredicateOp::Exists, Value::Bool(*b)),
                        _ => continue,
                    };
                    predicates.push(FieldPredicate {
                        field: field.clone(),
                        op,
                        value,
                    });
                }
            }
            _ => {}
        }
    }
    QueryCriteria::new(predicates)
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::QueryHandler;
    use crate::registry::{CachePolicy, RegistryState};
    use core_store::{MemoryBackend, MetadataRecord, SystemMetadata};
    use futures::TryStreamExt;
    use serde_json::json;

    fn record(path: &str, user: Value) -> MetadataRecord {
        let Value::Object(user) = user else {
            panic!("test user metadata must be an object")
        };
        MetadataRecord::new(SystemMetadata {
            path: path.to_string(),
            filename: path.rsplit('/').next().unwrap_or_default().to_string(),
            extension: path.rsplit('.').next().unwrap_or_default().to_string(),
            size: 10,
            created: 1.0,
            modified: 2.0,
            accessed: 3.0,
        })
        .with_user(user)
    }

    async fn engine_with(
        indexed_fields: &[&str],
        records: Vec<(&str, Value)>,
    ) -> QueryEngine {
        let storage = Arc::new(MemoryBackend::new());
        let registry = IndexRegistry::new(RegistryState::new(
            indexed_fields.iter().map(|f| f.to_string()).collect(),
            None,
            CachePolicy::None,
        ));

        for (path, user) in records {
            let rec = record(path, user);
            storage.save(path, &rec).await.unwrap();
            registry.write().await.upsert(path, rec);
        }

        QueryEngine::new(registry, storage, HandlerRegistry::new())
    }

    async fn run(engine: &QueryEngine, query: Value) -> Vec<String> {
        engine
            .search(&query)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn indexed_contains_finds_list_elements() {
        let engine = engine_with(
            &["user.tags"],
            vec![
                ("/a.png", json!({"tags": ["design", "ui"]})),
                ("/b.png", json!({"tags": ["ops"]})),
            ],
        )
        .await;

        let hits = run(&engine, json!({"user.tags": {"$contains": "design"}})).await;
        assert_eq!(hits, vec!["/a.png".to_string()]);
    }

    #[tokio::test]
    async fn indexed_contains_still_finds_substrings() {
        let engine = engine_with(
            &["user.title"],
            vec![
                ("/a", json!({"title": "first draft"})),
                ("/b", json!({"title": "final"})),
            ],
        )
        .await;

        let hits = run(&engine, json!({"user.title": {"$contains": "draft"}})).await;
        assert_eq!(hits, vec!["/a".to_string()]);
    }

    #[tokio::test]
    async fn unindexed_fields_fall_back_to_full_scan() {
        let engine = engine_with(
            &[],
            vec![
                ("/a", json!({"owner": "alice"})),
                ("/b", json!({"owner": "bob"})),
            ],
        )
        .await;

        let hits = run(&engine, json!({"owner": "bob"})).await;
        assert_eq!(hits, vec!["/b".to_string()]);
    }

    #[tokio::test]
    async fn results_come_in_insertion_order() {
        let engine = engine_with(
            &["user.kind"],
            vec![
                ("/c", json!({"kind": "x"})),
                ("/a", json!({"kind": "x"})),
                ("/b", json!({"kind": "x"})),
            ],
        )
        .await;

        let query = json!({"user.kind": "x"});
        let first = run(&engine, query.clone()).await;
        let second = run(&engine, query).await;
        assert_eq!(first, vec!["/c", "/a", "/b"]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn intersection_of_multiple_indexed_predicates() {
        let engine = engine_with(
            &["user.kind", "user.owner"],
            vec![
                ("/a", json!({"kind": "doc", "owner": "alice"})),
                ("/b", json!({"kind": "doc", "owner": "bob"})),
                ("/c", json!({"kind": "img", "owner": "alice"})),
            ],
        )
        .await;

        let hits = run(
            &engine,
            json!({"user.kind": "doc", "user.owner": "alice"}),
        )
        .await;
        assert_eq!(hits, vec!["/a".to_string()]);
    }

    #[tokio::test]
    async fn in_operator_unions_buckets() {
        let engine = engine_with(
            &["user.owner"],
            vec![
                ("/a", json!({"owner": "alice"})),
                ("/b", json!({"owner": "bob"})),
                ("/c", json!({"owner": "carol"})),
            ],
        )
        .await;

        let hits = run(&engine, json!({"user.owner": {"$in": ["alice", "carol"]}})).await;
        assert_eq!(hits, vec!["/a".to_string(), "/c".to_string()]);
    }

    #[tokio::test]
    async fn empty_query_returns_everything_in_order() {
        let engine = engine_with(
            &[],
            vec![("/b", json!({})), ("/a", json!({}))],
        )
        .await;

        let hits = run(&engine, json!({})).await;
        assert_eq!(hits, vec!["/b".to_string(), "/a".to_string()]);
    }

    #[tokio::test]
    async fn evicted_records_are_loaded_from_storage() {
        let storage = Arc::new(MemoryBackend::new());
        let registry = IndexRegistry::new(RegistryState::new(
            Vec::new(),
            Some(1),
            CachePolicy::Lru,
        ));

        for (path, user) in [
            ("/a", json!({"owner": "alice"})),
            ("/b", json!({"owner": "alice"})),
        ] {
            let rec = record(path, user);
            storage.save(path, &rec).await.unwrap();
            registry.write().await.upsert(path, rec);
        }
        assert_eq!(registry.read().await.get("/a"), RecordAccess::Evicted);

        let engine = QueryEngine::new(registry, storage, HandlerRegistry::new());
        let hits = run(&engine, json!({"owner": "alice"})).await;
        assert_eq!(hits, vec!["/a".to_string(), "/b".to_string()]);
    }

    struct SuffixHandler;

    impl QueryHandler for SuffixHandler {
        fn can_handle(&self, _field: &str, value: &Value) -> bool {
            value.get("$suffix").is_some()
        }

        fn process(&self, paths: Vec<String>, _field: &str, value: &Value) -> Vec<String> {
            let Some(suffix) = value.get("$suffix").and_then(Value::as_str) else {
                return paths;
            };
            paths
                .into_iter()
                .filter(|path| path.ends_with(suffix))
                .collect()
        }
    }

    #[tokio::test]
    async fn custom_handlers_run_in_the_post_filter_pass() {
        let engine = engine_with(
            &[],
            vec![("/a.png", json!({})), ("/b.txt", json!({}))],
        )
        .await;
        engine.handlers().register(Arc::new(SuffixHandler));

        let hits = run(&engine, json!({"path": {"$suffix": ".png"}})).await;
        assert_eq!(hits, vec!["/a.png".to_string()]);

        // Without the handler the operator is rejected at parse time.
        let bare = engine_with(&[], vec![]).await;
        assert!(bare.search(&json!({"path": {"$suffix": ".png"}})).await.is_err());
    }
}
