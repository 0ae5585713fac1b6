//! # Event Bus System
//!
//! Event-driven observation of record mutations using `tokio::sync::broadcast`
//! plus a synchronous listener list.
//!
//! ## Overview
//!
//! Two consumption surfaces share one bus:
//!
//! - **Broadcast subscribers** (`subscribe`) receive events on independent
//!   channels; a slow subscriber observes `RecvError::Lagged` rather than
//!   blocking publishers.
//! - **Registered listeners** (`add_listener`) are plain callbacks invoked
//!   synchronously in registration order when an event is emitted. The
//!   manager emits after a transaction commits, so listeners observe only
//!   committed state. A panicking listener is isolated and logged; it never
//!   propagates to the caller that triggered the event.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{EventBus, MetaEvent};
//!
//! let bus = EventBus::new(100);
//! let mut subscriber = bus.subscribe();
//! bus.add_listener(|event| {
//!     if let MetaEvent::FileRemoved { path } = event {
//!         println!("removed: {path}");
//!     }
//! });
//!
//! bus.emit(MetaEvent::FileRemoved { path: "/tmp/a".to_string() });
//! ```

use core_store::MetadataRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::warn;

pub use tokio::sync::broadcast::error::RecvError;
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the broadcast channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Events published after committed record mutations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum MetaEvent {
    /// A record was created for a newly registered file.
    FileAdded {
        path: String,
        record: MetadataRecord,
    },
    /// A record was removed, either explicitly or by sync.
    FileRemoved { path: String },
    /// A record changed; carries both versions.
    MetadataChanged {
        path: String,
        old: MetadataRecord,
        new: MetadataRecord,
    },
    /// A reconciliation pass finished.
    SyncComplete {
        added: u64,
        updated: u64,
        removed: u64,
    },
}

impl MetaEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            MetaEvent::FileAdded { .. } => "File added to the index",
            MetaEvent::FileRemoved { .. } => "File removed from the index",
            MetaEvent::MetadataChanged { .. } => "Record metadata changed",
            MetaEvent::SyncComplete { .. } => "Filesystem sync completed",
        }
    }
}

type Listener = Arc<dyn Fn(&MetaEvent) + Send + Sync>;

/// Central bus for publishing and observing metadata events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MetaEvent>,
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl EventBus {
    /// Create a bus whose broadcast channel buffers `capacity` events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Publish an event to broadcast subscribers and then to every registered
    /// listener, in registration order.
    pub fn emit(&self, event: MetaEvent) {
        // A send error only means there is no broadcast subscriber.
        let _ = self.sender.send(event.clone());

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(event = event.description(), "event listener panicked; isolating");
            }
        }
    }

    /// Register a synchronous listener invoked on every committed event.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&MetaEvent) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(listener));
    }

    /// Create an independent broadcast receiver for future events.
    pub fn subscribe(&self) -> Receiver<MetaEvent> {
        self.sender.subscribe()
    }

    /// Number of active broadcast subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Number of registered synchronous listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("listener_count", &self.listener_count())
            .finish()
    }
}
