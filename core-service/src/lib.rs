//! # Core Service
//!
//! Main API facade for the filemeta core.
//!
//! ## Overview
//!
//! This crate provides [`FileMetaManager`], the primary entry point for host
//! applications. It composes the path normalizer, the system attribute
//! probe, the plugin dispatcher, the index registry, the query engine and a
//! storage backend under a transaction scope, and publishes committed
//! mutations on an event bus.
//!
//! ## Example
//!
//! ```no_run
//! use core_service::{FileMetaManager, ManagerConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = FileMetaManager::bootstrap(ManagerConfig::builder().build()?).await?;
//!
//!     manager
//!         .add_file("report.pdf", json!({"tags": ["work"], "owner": "alice"}))
//!         .await?;
//!     let hits = manager
//!         .search_collect(json!({"tags": {"$contains": "work"}}))
//!         .await?;
//!     println!("{hits:?}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod serial;
pub mod sync;
pub mod transaction;

pub use config::{ManagerConfig, ManagerConfigBuilder};
pub use error::{MetaError, Result};
pub use manager::FileMetaManager;
pub use serial::ConflictMode;
pub use sync::SyncReport;
pub use transaction::MetaTransaction;
