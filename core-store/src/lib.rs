//! # Storage Module
//!
//! Owns the three-tier metadata record model and the pluggable storage
//! backend contract, together with the built-in backends.
//!
//! ## Overview
//!
//! This crate manages:
//! - The `MetadataRecord` value object (system / user / plugin tiers)
//! - JSON value semantics used for matching and indexing
//! - The `StorageBackend` contract (save, get, delete, query, bulk,
//!   snapshot/restore)
//! - Built-in backends: in-memory, JSON document with write-ahead journal,
//!   and SQLite via sqlx

pub mod backend;
pub mod error;
pub mod json;
pub mod memory;
pub mod model;
pub mod sqlite;

pub use backend::{BulkOp, BulkOutcome, FieldPredicate, PredicateOp, QueryCriteria, SnapshotId, StorageBackend};
pub use error::{Result, StorageError};
pub use json::JsonBackend;
pub use memory::MemoryBackend;
pub use model::{
    compare_values, split_field, values_eq, ExportDocument, JsonMap, MetadataRecord, Section,
    SystemMetadata,
};
pub use sqlite::SqliteBackend;
