//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the filemeta core:
//! - Event bus system
//! - Logging and tracing infrastructure
//!
//! ## Overview
//!
//! This crate contains the runtime utilities the other modules depend on. It
//! establishes the event broadcasting mechanism used to observe record
//! mutations and the logging conventions used throughout the workspace.

pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
pub use events::{EventBus, MetaEvent};
