//! # filemeta
//!
//! Facade crate for the filemeta workspace. Host applications can depend on
//! this single crate and reach the full public surface of the member crates
//! (`core-store`, `core-index`, `core-extract`, `core-runtime`,
//! `core-service`) without wiring each one individually.
//!
//! ## Example
//!
//! ```no_run
//! use filemeta::{FileMetaManager, ManagerConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = FileMetaManager::bootstrap(ManagerConfig::builder().build()?).await?;
//!
//!     manager
//!         .add_file("notes/todo.md", json!({"tags": ["work"], "owner": "alice"}))
//!         .await?;
//!
//!     let hits = manager
//!         .search_collect(json!({"tags": {"$contains": "work"}}))
//!         .await?;
//!     assert_eq!(hits.len(), 1);
//!     Ok(())
//! }
//! ```

pub use core_extract::{FilePlugin, PathNormalizer, SystemAttributeProbe};
pub use core_index::{IndexRegistry, QueryHandler};
pub use core_runtime::events::{EventBus, MetaEvent};
pub use core_service::{
    ConflictMode, FileMetaManager, ManagerConfig, MetaError, Result, SyncReport,
};
pub use core_store::{
    JsonBackend, MemoryBackend, MetadataRecord, SqliteBackend, StorageBackend, SystemMetadata,
};
