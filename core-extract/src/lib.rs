//! # Extraction Module
//!
//! Everything that touches the real filesystem on the way into a record:
//!
//! - Path normalization into canonical primary keys
//! - The system attribute probe (size, timestamps, filename, extension)
//! - The `FilePlugin` capability contract
//! - The plugin dispatcher: priority ordering, conflict policies, bounded
//!   concurrent extraction with per-plugin timeouts, and supervised error
//!   handling

pub mod dispatcher;
pub mod error;
pub mod path;
pub mod plugin;
pub mod probe;

pub use dispatcher::{
    ConflictPolicy, DispatchOutcome, DispatcherConfig, PluginDispatcher, PluginErrorMode,
    PluginFailure,
};
pub use error::{ExtractError, Result};
pub use path::PathNormalizer;
pub use plugin::FilePlugin;
pub use probe::SystemAttributeProbe;
