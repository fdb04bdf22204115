// SPDX-License-Identifier: Apache-2.0

//! Navigable snapshot tree consumed by the admin service.
//!
//! Branches are [`Node`]s holding named children. Leaves are either
//! [`DataEntry`] (a live [`Value`] produced on demand) or [`CallbackEntry`]
//! (an invokable action). Every entry renders as JSON and as indented
//! human-readable text with keys in sorted order.

use serde_json::{Map, Number as JsonNumber, Value as Json};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};
use thiserror::Error;

pub const INDENTATION: &str = "  ";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ApiError {
    #[error("not implemented")]
    NotImplemented,

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Failed(String),
}

pub type Params = HashMap<String, String>;

/// Scalar and structured values placed in the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Number(i64),
    Bytes(u64),
    Float(f64),
    String(String),
    KeyValue(KeyValue),
}

impl Value {
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Number(n) => Json::from(*n),
            Value::Bytes(n) => Json::from(*n),
            Value::Float(f) => JsonNumber::from_f64(*f).map_or(Json::Null, Json::Number),
            Value::String(s) => Json::String(s.clone()),
            Value::KeyValue(kv) => kv.to_json(),
        }
    }

    pub fn human_readable(&self, indent: &str) -> String {
        match self {
            Value::Null => "n/a".to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bytes(n) => format_bytes(*n),
            Value::Float(f) => format!("{:.2}", f),
            Value::String(s) => s.clone(),
            Value::KeyValue(kv) => kv.human_readable(indent),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<KeyValue> for Value {
    fn from(kv: KeyValue) -> Self {
        Value::KeyValue(kv)
    }
}

fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if n < 1024 {
        return format!("{} B", n);
    }
    let mut size = n as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

/// Ordered map of values, rendered as a nested block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyValue {
    entries: BTreeMap<String, Value>,
}

impl KeyValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.entries.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> Json {
        let map: Map<String, Json> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Json::Object(map)
    }

    pub fn human_readable(&self, indent: &str) -> String {
        render_block(
            indent,
            self.entries
                .iter()
                .map(|(k, v)| (k.as_str(), v.human_readable(&nested(indent)))),
        )
    }
}

fn nested(indent: &str) -> String {
    format!("{}{}", indent, INDENTATION)
}

// Single-line children go on the key's line, multi-line children below it.
fn render_block<'a>(indent: &str, parts: impl Iterator<Item = (&'a str, String)>) -> String {
    let mut out = String::new();
    for (key, part) in parts {
        if part.contains('\n') {
            let _ = write!(out, "{}{}:\n{}", indent, key, part);
        } else {
            let _ = writeln!(out, "{}{}: {}", indent, key, part);
        }
    }
    if out.is_empty() {
        return "none".to_string();
    }
    out
}

/// An entry in the admin tree.
pub trait Navigable: Send + Sync {
    fn get(&self, _name: &str) -> Option<Arc<dyn Navigable>> {
        None
    }

    fn call(&self, _params: &Params) -> Result<String, ApiError> {
        Err(ApiError::NotImplemented)
    }

    /// Refresh cached state before rendering.
    fn update(&self) -> Result<(), ApiError> {
        Ok(())
    }

    fn to_json(&self) -> Json;

    fn human_readable(&self, indent: &str) -> String;

    /// Whether this entry has children of its own, used by summaries.
    fn is_nested(&self) -> bool {
        false
    }

    fn type_name(&self) -> &'static str;
}

/// Branch of the tree.
#[derive(Default)]
pub struct Node {
    children: RwLock<BTreeMap<String, Arc<dyn Navigable>>>,
}

impl Node {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_entry(&self, name: &str, entry: Arc<dyn Navigable>) {
        self.children
            .write()
            .unwrap()
            .insert(name.to_string(), entry);
    }

    pub fn remove_entry(&self, name: &str) {
        self.children.write().unwrap().remove(name);
    }

    pub fn len(&self) -> usize {
        self.children.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One level view: leaves are rendered, nested entries only named by type.
    pub fn summary(&self) -> Json {
        let children = self.children.read().unwrap();
        let map: Map<String, Json> = children
            .iter()
            .map(|(name, entry)| {
                let value = if entry.is_nested() {
                    serde_json::json!({ "Type": entry.type_name() })
                } else {
                    entry.to_json()
                };
                (name.clone(), value)
            })
            .collect();
        Json::Object(map)
    }

    /// Resolve a slash separated path such as `prospector/status`.
    pub fn navigate(self: &Arc<Self>, path: &str) -> Result<Arc<dyn Navigable>, ApiError> {
        let mut current: Arc<dyn Navigable> = self.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = current.get(part).ok_or(ApiError::NotFound)?;
        }
        Ok(current)
    }
}

impl Navigable for Node {
    fn get(&self, name: &str) -> Option<Arc<dyn Navigable>> {
        self.children.read().unwrap().get(name).cloned()
    }

    fn update(&self) -> Result<(), ApiError> {
        let children: Vec<_> = self.children.read().unwrap().values().cloned().collect();
        for child in children {
            child.update()?;
        }
        Ok(())
    }

    fn to_json(&self) -> Json {
        let children = self.children.read().unwrap();
        Json::Object(
            children
                .iter()
                .map(|(name, entry)| (name.clone(), entry.to_json()))
                .collect(),
        )
    }

    fn human_readable(&self, indent: &str) -> String {
        let children = self.children.read().unwrap();
        let child_indent = nested(indent);
        render_block(
            indent,
            children
                .iter()
                .map(|(name, entry)| (name.as_str(), entry.human_readable(&child_indent))),
        )
    }

    fn is_nested(&self) -> bool {
        true
    }

    fn type_name(&self) -> &'static str {
        "Node"
    }
}

type Provider = Box<dyn Fn() -> Value + Send + Sync>;

/// Leaf whose value is produced when rendered.
pub struct DataEntry {
    provider: Provider,
}

impl DataEntry {
    pub fn new(provider: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        Self {
            provider: Box::new(provider),
        }
    }

    pub fn value(&self) -> Value {
        (self.provider)()
    }
}

impl Navigable for DataEntry {
    fn to_json(&self) -> Json {
        self.value().to_json()
    }

    fn human_readable(&self, indent: &str) -> String {
        self.value().human_readable(indent)
    }

    fn type_name(&self) -> &'static str {
        "DataEntry"
    }
}

type Callback = Box<dyn Fn(&Params) -> Result<String, ApiError> + Send + Sync>;

/// Leaf that performs an action when called.
pub struct CallbackEntry {
    callback: Callback,
}

impl CallbackEntry {
    pub fn new(
        callback: impl Fn(&Params) -> Result<String, ApiError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl Navigable for CallbackEntry {
    fn call(&self, params: &Params) -> Result<String, ApiError> {
        (self.callback)(params)
    }

    fn to_json(&self) -> Json {
        serde_json::json!({ "Type": self.type_name() })
    }

    fn human_readable(&self, _indent: &str) -> String {
        "callback".to_string()
    }

    fn type_name(&self) -> &'static str {
        "CallbackEntry"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn scalars_render() {
        assert_eq!("n/a", Value::Null.human_readable(""));
        assert_eq!("42", Value::Number(42).human_readable(""));
        assert_eq!("512 B", Value::Bytes(512).human_readable(""));
        assert_eq!("1.50 KiB", Value::Bytes(1536).human_readable(""));
        assert_eq!("10.00 MiB", Value::Bytes(10 * 1024 * 1024).human_readable(""));
        assert_eq!("0.25", Value::Float(0.25).human_readable(""));
        assert_eq!(Json::Null, Value::Float(f64::NAN).to_json());
    }

    #[test]
    fn empty_containers_render_none() {
        assert_eq!("none", KeyValue::new().human_readable(""));
        assert_eq!("none", Node::new().human_readable(""));
    }

    #[test]
    fn nested_rendering_is_sorted_and_indented() {
        let root = Node::new();
        let inner = KeyValue::new()
            .with("zeta", Value::Number(1))
            .with("alpha", "a");
        root.set_entry("status", Arc::new(DataEntry::new(move || inner.clone().into())));
        root.set_entry("count", Arc::new(DataEntry::new(|| Value::Number(3))));

        let expected = "count: 3\nstatus:\n  alpha: a\n  zeta: 1\n";
        assert_eq!(expected, root.human_readable(""));
    }

    #[test]
    fn json_and_summary() {
        let root = Arc::new(Node::new());
        let child = Arc::new(Node::new());
        child.set_entry("files", Arc::new(DataEntry::new(|| Value::Number(2))));
        root.set_entry("prospector", child);
        root.set_entry("version", Arc::new(DataEntry::new(|| "1.0".into())));

        assert_eq!(
            serde_json::json!({"prospector": {"files": 2}, "version": "1.0"}),
            root.to_json()
        );
        assert_eq!(
            serde_json::json!({"prospector": {"Type": "Node"}, "version": "1.0"}),
            root.summary()
        );
    }

    #[test]
    fn navigate_and_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let root = Arc::new(Node::new());
        let branch = Arc::new(Node::new());
        let counter = calls.clone();
        branch.set_entry(
            "reload",
            Arc::new(CallbackEntry::new(move |params| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(format!("reloaded {}", params.len()))
            })),
        );
        root.set_entry("config", branch);

        let entry = root.navigate("config/reload").unwrap();
        assert_eq!("callback", entry.human_readable(""));
        assert_eq!(Ok("reloaded 0".to_string()), entry.call(&Params::new()));
        assert_eq!(1, calls.load(Ordering::SeqCst));

        assert_eq!(Some(ApiError::NotFound), root.navigate("config/missing").err());
        assert_eq!(
            Err(ApiError::NotImplemented),
            root.navigate("config").unwrap().call(&Params::new())
        );
    }
}
