//! Embedded SQLite storage backend.
//!
//! One `records` table keyed by canonical path, with the three record tiers
//! stored as JSON text columns. `query` pushes the predicates it can express
//! with `json_each`/`json_extract` down into SQL and returns a superset; the
//! query engine post-filters the remainder.

use crate::backend::{
    BulkOp, BulkOutcome, FieldPredicate, PredicateOp, QueryCriteria, SnapshotId, StorageBackend,
};
use crate::error::{Result, StorageError};
use crate::model::{split_field, JsonMap, MetadataRecord, Section, SystemMetadata};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::debug;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS records (
    path TEXT PRIMARY KEY,
    system TEXT NOT NULL,
    user TEXT NOT NULL,
    plugin TEXT NOT NULL,
    updated_at REAL NOT NULL
)";

#[derive(Default)]
struct SnapshotStore {
    snapshots: HashMap<u64, Vec<(String, MetadataRecord)>>,
    next: u64,
}

/// SQLite-backed store using a sqlx connection pool.
pub struct SqliteBackend {
    pool: SqlitePool,
    snapshots: Mutex<SnapshotStore>,
}

impl SqliteBackend {
    /// Open (or create) a database file and prepare the schema.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// In-memory database, useful for tests. Pinned to a single connection so
    /// every statement sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Wrap an existing pool, creating the schema if needed.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool,
            snapshots: Mutex::new(SnapshotStore::default()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn read_all(&self) -> Result<Vec<(String, MetadataRecord)>> {
        let rows = sqlx::query("SELECT path, system, user, plugin FROM records ORDER BY path")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let path: String = row.get("path");
                let record = decode_record(
                    &path,
                    row.get::<String, _>("system"),
                    row.get::<String, _>("user"),
                    row.get::<String, _>("plugin"),
                )?;
                Ok((path, record))
            })
            .collect()
    }
}

fn decode_record(
    path: &str,
    system: String,
    user: String,
    plugin: String,
) -> Result<MetadataRecord> {
    let malformed = |message: String| StorageError::MalformedRecord {
        path: path.to_string(),
        message,
    };
    let system: SystemMetadata =
        serde_json::from_str(&system).map_err(|err| malformed(err.to_string()))?;
    let user: JsonMap = serde_json::from_str(&user).map_err(|err| malformed(err.to_string()))?;
    let plugin: JsonMap =
        serde_json::from_str(&plugin).map_err(|err| malformed(err.to_string()))?;
    Ok(MetadataRecord {
        system,
        user,
        plugin,
    })
}

enum Bind {
    Int(i64),
    Real(f64),
    Text(String),
}

fn bind_scalar(value: &Value) -> Option<Bind> {
    match value {
        Value::Bool(b) => Some(Bind::Int(i64::from(*b))),
        Value::Number(n) => n
            .as_i64()
            .map(Bind::Int)
            .or_else(|| n.as_f64().map(Bind::Real)),
        Value::String(s) => Some(Bind::Text(s.clone())),
        _ => None,
    }
}

/// Translate one predicate into a WHERE fragment, or `None` when it cannot
/// be pushed down without risking the exclusion of a valid row.
fn pushdown_clause(predicate: &FieldPredicate) -> Option<(String, Vec<Bind>)> {
    let (section, rest) = split_field(&predicate.field);
    // Multi-segment fields are skipped: a literal dotted key and a nested
    // path are indistinguishable from SQL, so pushing either form down could
    // drop valid rows.
    if !rest.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return None;
    }
    let column = match section {
        Section::System => "system",
        Section::User => "user",
        Section::Plugin => "plugin",
    };
    let json_path = format!("$.\"{rest}\"");

    match predicate.op {
        PredicateOp::Eq => {
            let bind = bind_scalar(&predicate.value)?;
            // json_each walks a scalar as a single row and an array
            // element-wise, which is exactly the equality/list-contains rule.
            Some((
                format!(
                    "EXISTS (SELECT 1 FROM json_each(records.{column}, '{json_path}') \
                     WHERE json_each.value = ?)"
                ),
                vec![bind],
            ))
        }
        PredicateOp::Gt | PredicateOp::Gte | PredicateOp::Lt | PredicateOp::Lte => {
            let bind = bind_scalar(&predicate.value)?;
            let op = match predicate.op {
                PredicateOp::Gt => ">",
                PredicateOp::Gte => ">=",
                PredicateOp::Lt => "<",
                _ => "<=",
            };
            Some((
                format!("json_extract(records.{column}, '{json_path}') {op} ?"),
                vec![bind],
            ))
        }
        PredicateOp::Exists => match predicate.value {
            Value::Bool(true) => Some((
                format!("json_type(records.{column}, '{json_path}') IS NOT NULL"),
                Vec::new(),
            )),
            Value::Bool(false) => Some((
                format!("json_type(records.{column}, '{json_path}') IS NULL"),
                Vec::new(),
            )),
            _ => None,
        },
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn save(&self, path: &str, record: &MetadataRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO records (path, system, user, plugin, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(path) DO UPDATE SET \
                 system = excluded.system, \
                 user = excluded.user, \
                 plugin = excluded.plugin, \
                 updated_at = excluded.updated_at",
        )
        .bind(path)
        .bind(serde_json::to_string(&record.system)?)
        .bind(serde_json::to_string(&record.user)?)
        .bind(serde_json::to_string(&record.plugin)?)
        .bind(record.system.modified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<MetadataRecord>> {
        let row = sqlx::query("SELECT system, user, plugin FROM records WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            decode_record(
                path,
                row.get::<String, _>("system"),
                row.get::<String, _>("user"),
                row.get::<String, _>("plugin"),
            )
        })
        .transpose()
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM records WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query(&self, criteria: &QueryCriteria) -> Result<Vec<String>> {
        let mut sql = String::from("SELECT path FROM records");
        let mut binds = Vec::new();
        let mut clauses = Vec::new();

        for predicate in &criteria.predicates {
            if let Some((clause, mut clause_binds)) = pushdown_clause(predicate) {
                clauses.push(clause);
                binds.append(&mut clause_binds);
            }
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY path");

        debug!(pushed = clauses.len(), total = criteria.predicates.len(), "sqlite pushdown");

        let mut query = sqlx::query(&sql);
        for bind in binds {
            query = match bind {
                Bind::Int(v) => query.bind(v),
                Bind::Real(v) => query.bind(v),
                Bind::Text(v) => query.bind(v),
            };
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|row| row.get("path")).collect())
    }

    async fn bulk(&self, ops: Vec<BulkOp>) -> Result<Vec<BulkOutcome>> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(ops.len());

        for op in ops {
            match op {
                BulkOp::Save { path, record } => {
                    sqlx::query(
                        "INSERT INTO records (path, system, user, plugin, updated_at) \
                         VALUES (?, ?, ?, ?, ?) \
                         ON CONFLICT(path) DO UPDATE SET \
                             system = excluded.system, \
                             user = excluded.user, \
                             plugin = excluded.plugin, \
                             updated_at = excluded.updated_at",
                    )
                    .bind(&path)
                    .bind(serde_json::to_string(&record.system)?)
                    .bind(serde_json::to_string(&record.user)?)
                    .bind(serde_json::to_string(&record.plugin)?)
                    .bind(record.system.modified)
                    .execute(&mut *tx)
                    .await?;
                    outcomes.push(BulkOutcome::Saved);
                }
                BulkOp::Delete { path } => {
                    let result = sqlx::query("DELETE FROM records WHERE path = ?")
                        .bind(&path)
                        .execute(&mut *tx)
                        .await?;
                    outcomes.push(BulkOutcome::Deleted(result.rows_affected() > 0));
                }
            }
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    async fn iter_all(&self) -> Result<Vec<(String, MetadataRecord)>> {
        self.read_all().await
    }

    async fn snapshot(&self) -> Result<SnapshotId> {
        let rows = self.read_all().await?;
        let mut store = self.snapshots.lock().await;
        let id = store.next;
        store.next += 1;
        store.snapshots.insert(id, rows);
        Ok(SnapshotId(id))
    }

    async fn restore(&self, snapshot: SnapshotId) -> Result<()> {
        let rows = {
            let mut store = self.snapshots.lock().await;
            store
                .snapshots
                .remove(&snapshot.0)
                .ok_or(StorageError::UnknownSnapshot(snapshot.0))?
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM records").execute(&mut *tx).await?;
        for (path, record) in rows {
            sqlx::query(
                "INSERT INTO records (path, system, user, plugin, updated_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&path)
            .bind(serde_json::to_string(&record.system)?)
            .bind(serde_json::to_string(&record.user)?)
            .bind(serde_json::to_string(&record.plugin)?)
            .bind(record.system.modified)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn discard(&self, snapshot: SnapshotId) -> Result<()> {
        let mut store = self.snapshots.lock().await;
        store
            .snapshots
            .remove(&snapshot.0)
            .ok_or(StorageError::UnknownSnapshot(snapshot.0))?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        // SQLite commits each statement durably; nothing buffered here.
        Ok(())
    }
}
