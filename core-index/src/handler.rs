//! Custom query handler registry.
//!
//! User-defined operators plug in through a capability pair: `can_handle`
//! claims a `(field, value)` matcher, `process` filters a materialized
//! candidate path list. Handlers run in the post-filter pass only; they are
//! never consulted for index planning.

use serde_json::Value;
use std::sync::{Arc, RwLock};

/// Capability bundle for a user-defined query operator.
pub trait QueryHandler: Send + Sync {
    /// Whether this handler understands the matcher for `field`.
    fn can_handle(&self, field: &str, value: &Value) -> bool;

    /// Filter the candidate paths. Implementations should preserve the input
    /// order; the engine re-establishes insertion order regardless.
    fn process(&self, paths: Vec<String>, field: &str, value: &Value) -> Vec<String>;
}

/// Ordered registry of custom handlers; the first claimant wins.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<Vec<Arc<dyn QueryHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn QueryHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    /// First registered handler claiming `(field, value)`.
    pub fn find(&self, field: &str, value: &Value) -> Option<Arc<dyn QueryHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|handler| handler.can_handle(field, value))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

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

    #[test]
    fn first_claimant_wins() {
        let registry = HandlerRegistry::new();
        assert!(registry.find("f", &json!({"$suffix": ".png"})).is_none());

        registry.register(Arc::new(SuffixHandler));
        assert!(registry.find("f", &json!({"$suffix": ".png"})).is_some());
        assert!(registry.find("f", &json!({"$other": 1})).is_none());
    }

    #[test]
    fn process_filters_candidates() {
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(SuffixHandler));

        let handler = registry.find("f", &json!({"$suffix": ".png"})).unwrap();
        let filtered = handler.process(
            vec!["/a.png".to_string(), "/b.txt".to_string()],
            "f",
            &json!({"$suffix": ".png"}),
        );
        assert_eq!(filtered, vec!["/a.png".to_string()]);
    }
}
