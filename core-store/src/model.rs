//! Three-tier metadata record model and JSON value semantics.
//!
//! A record binds one canonical path to three sub-maps: `system` (fixed
//! schema, captured from the filesystem), `user` (caller-owned, opaque JSON)
//! and `plugin` (rebuilt from extractor output). The `user` and `plugin`
//! tiers are `serde_json` maps, so values are exactly the JSON sum type:
//! null, bool, number, string, list, mapping.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Open mapping tier of a record (`user` or `plugin`).
pub type JsonMap = serde_json::Map<String, Value>;

/// Fixed-schema filesystem attributes captured by the probe.
///
/// Timestamps are epoch seconds with the fractional component preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetadata {
    /// Canonical path; always equal to the record's primary key.
    pub path: String,
    /// Final path component.
    pub filename: String,
    /// Lowercased extension without the leading dot; empty when absent.
    pub extension: String,
    /// File size in bytes.
    pub size: u64,
    pub created: f64,
    pub modified: f64,
    pub accessed: f64,
}

impl SystemMetadata {
    /// Read a system field as a JSON value, or `None` for an unknown name.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "path" => Some(Value::String(self.path.clone())),
            "filename" => Some(Value::String(self.filename.clone())),
            "extension" => Some(Value::String(self.extension.clone())),
            "size" => Some(Value::from(self.size)),
            "created" => Some(Value::from(self.created)),
            "modified" => Some(Value::from(self.modified)),
            "accessed" => Some(Value::from(self.accessed)),
            _ => None,
        }
    }

    /// Validate the fixed-schema invariants.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.path.is_empty() {
            return Err("system.path must not be empty".to_string());
        }
        if self.filename.is_empty() {
            return Err("system.filename must not be empty".to_string());
        }
        for (name, ts) in [
            ("created", self.created),
            ("modified", self.modified),
            ("accessed", self.accessed),
        ] {
            if !ts.is_finite() {
                return Err(format!("system.{name} must be a finite timestamp"));
            }
        }
        Ok(())
    }
}

/// Record tier addressed by the leading segment of a dotted field name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    System,
    User,
    Plugin,
}

/// Split a dotted field name into its section and the remaining field path.
///
/// A bare name with no recognized section prefix addresses the `user` tier,
/// so `"tags"` and `"user.tags"` are the same field.
pub fn split_field(field: &str) -> (Section, &str) {
    match field.split_once('.') {
        Some(("system", rest)) => (Section::System, rest),
        Some(("user", rest)) => (Section::User, rest),
        Some(("plugin", rest)) => (Section::Plugin, rest),
        _ => (Section::User, field),
    }
}

/// The three-tier metadata value bound to one canonical path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub system: SystemMetadata,
    #[serde(default)]
    pub user: JsonMap,
    #[serde(default)]
    pub plugin: JsonMap,
}

impl MetadataRecord {
    pub fn new(system: SystemMetadata) -> Self {
        Self {
            system,
            user: JsonMap::new(),
            plugin: JsonMap::new(),
        }
    }

    pub fn with_user(mut self, user: JsonMap) -> Self {
        self.user = user;
        self
    }

    /// Canonical path of the record.
    pub fn path(&self) -> &str {
        &self.system.path
    }

    /// Resolve a dotted field name against the record.
    ///
    /// `system.*` resolves the fixed schema; `user.*` / `plugin.*` (and bare
    /// names, which default to `user`) resolve into the open tiers,
    /// descending through nested mappings segment by segment. A key that
    /// literally contains dots wins over descent when present.
    pub fn field(&self, dotted: &str) -> Option<Value> {
        let (section, rest) = split_field(dotted);
        match section {
            Section::System => self.system.field(rest),
            Section::User => lookup_nested(&self.user, rest),
            Section::Plugin => lookup_nested(&self.plugin, rest),
        }
    }

    /// Shallow overlay of `patch` onto the `user` tier; untouched keys are
    /// preserved.
    pub fn merge_user(&mut self, patch: JsonMap) {
        for (key, value) in patch {
            self.user.insert(key, value);
        }
    }

    /// Replace the entire `user` tier.
    pub fn replace_user(&mut self, user: JsonMap) {
        self.user = user;
    }

    /// Replace the `plugin` tier with freshly dispatched output.
    pub fn set_plugin(&mut self, plugin: JsonMap) {
        self.plugin = plugin;
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        self.system.validate()
    }
}

fn lookup_nested(map: &JsonMap, path: &str) -> Option<Value> {
    if let Some(value) = map.get(path) {
        return Some(value.clone());
    }
    let (head, rest) = path.split_once('.')?;
    match map.get(head)? {
        Value::Object(inner) => lookup_nested(inner, rest),
        _ => None,
    }
}

/// JSON equality with numeric widening: `2` and `2.0` compare equal, as do
/// any two numbers with the same real value. Lists and mappings compare
/// structurally with the same rule applied element-wise.
pub fn values_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_eq(v, w)))
        }
        _ => a == b,
    }
}

/// Ordering for range operators: numbers compare numerically, strings
/// lexicographically. Any other pairing (including number vs string) has no
/// defined order and yields `None`, which matchers treat as "no match".
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// On-disk document shared by the JSON backend and export/import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    /// Format version; also serves as the journal header tag. Always 1.
    pub version: u32,
    /// Records keyed by canonical path, sorted for stable output.
    pub records: BTreeMap<String, MetadataRecord>,
    /// Secondary-index hint: dotted field names worth re-declaring on
    /// restore.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<String>,
}

impl ExportDocument {
    pub const VERSION: u32 = 1;

    pub fn new(records: BTreeMap<String, MetadataRecord>, indexes: Vec<String>) -> Self {
        Self {
            version: Self::VERSION,
            records,
            indexes,
        }
    }

    pub fn empty() -> Self {
        Self::new(BTreeMap::new(), Vec::new())
    }
}
