// SPDX-License-Identifier: Apache-2.0

//! Codecs turn the raw lines read by a harvester into events.
//!
//! A codec receives `(start_offset, end_offset, line)` tuples and passes zero
//! or more tuples on to its callback. Codecs are chained by a [`Stream`], the
//! last callback in the chain materialises the [`Event`](crate::event::Event).
//!
//! Codecs are looked up by name through a [`CodecRegistry`] that is built once
//! at startup and handed to the config loader.

pub mod filter;
pub mod multiline;
pub mod pattern;
pub mod plain;
pub mod stream;

use crate::admin::KeyValue;
use crate::config::GeneralConfig;
use crate::errors::{Error, Result};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub use filter::{Filter, FilterConfig};
pub use multiline::{Multiline, MultilineConfig, What};
pub use pattern::{MatchMode, PatternCollection};
pub use plain::Plain;
pub use stream::{EventSink, Stream, StreamSource};

/// One logical line travelling through the chain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Line {
    /// Raw line bytes as read from the source.
    pub data: Vec<u8>,
    /// Set when the reader had to force-terminate the line at the maximum
    /// line size.
    pub split: bool,
}

impl Line {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            split: false,
        }
    }

    pub fn split(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            split: true,
        }
    }

    /// Text view for pattern matching. Invalid UTF-8 is replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    pub fn into_text(self) -> String {
        match String::from_utf8(self.data) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        }
    }
}

pub type Callback = Box<dyn FnMut(i64, i64, Line) -> Result<()> + Send>;

pub trait Codec: Send {
    /// Accept one input line. Errors abort the owning harvester.
    fn event(&mut self, start_offset: i64, end_offset: i64, line: Line) -> Result<()>;

    /// Stop the codec without flushing and return the offset up to which every
    /// line has been fully emitted downstream.
    fn teardown(&mut self) -> i64;

    /// Discard any buffered state, used after truncation.
    fn reset(&mut self);

    /// Refresh the metering fields reported by `snapshot`.
    fn meter(&mut self) {}

    fn snapshot(&self) -> Option<KeyValue> {
        None
    }
}

pub(crate) type SharedCodec = Arc<Mutex<Box<dyn Codec>>>;

/// Parsed configuration for one codec in a stream's chain.
#[derive(Debug, Clone)]
pub enum CodecConfig {
    Plain,
    Filter(Arc<FilterConfig>),
    Multiline(Arc<MultilineConfig>),
}

impl CodecConfig {
    pub fn name(&self) -> &'static str {
        match self {
            CodecConfig::Plain => "plain",
            CodecConfig::Filter(_) => "filter",
            CodecConfig::Multiline(_) => "multiline",
        }
    }

    pub fn new_codec(&self, callback: Callback, offset: i64) -> Box<dyn Codec> {
        match self {
            CodecConfig::Plain => Box::new(Plain::new(callback, offset)),
            CodecConfig::Filter(config) => Box::new(Filter::new(config.clone(), callback, offset)),
            CodecConfig::Multiline(config) => {
                Box::new(Multiline::new(config.clone(), callback, offset))
            }
        }
    }
}

/// Parses the codec specific options left over once `name` has been read.
/// Receives the config path for error messages.
pub type CodecParser = fn(&str, Map<String, Value>, &GeneralConfig) -> Result<CodecConfig>;

#[derive(Clone)]
pub struct CodecRegistry {
    parsers: BTreeMap<&'static str, CodecParser>,
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self {
            parsers: BTreeMap::new(),
        }
    }

    /// Registry with every codec this crate ships.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("plain", plain::parse_config);
        registry.register("filter", filter::parse_config);
        registry.register("multiline", multiline::parse_config);
        registry
    }

    pub fn register(&mut self, name: &'static str, parser: CodecParser) {
        self.parsers.insert(name, parser);
    }

    pub fn available(&self) -> Vec<&'static str> {
        self.parsers.keys().copied().collect()
    }

    /// First phase of the codec parse: read `name`, then hand the remaining
    /// keys to the codec's own parser.
    pub fn parse(
        &self,
        path: &str,
        mut options: Map<String, Value>,
        general: &GeneralConfig,
    ) -> Result<CodecConfig> {
        let name = match options.remove("name") {
            Some(Value::String(name)) => name,
            Some(_) => return Err(Error::Config(format!("{}/name must be a string", path))),
            None => return Err(Error::Config(format!("{}: codec name is required", path))),
        };

        let parser = self.parsers.get(name.as_str()).ok_or_else(|| {
            Error::Config(format!(
                "Unrecognised codec '{}' for {} (available: {})",
                name,
                path,
                self.available().join(", ")
            ))
        })?;

        parser(path, options, general)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn registry_lists_builtin_codecs() {
        assert_eq!(
            vec!["filter", "multiline", "plain"],
            CodecRegistry::builtin().available()
        );
    }

    #[test]
    fn parse_dispatches_by_name() {
        let registry = CodecRegistry::builtin();
        let general = GeneralConfig::default();

        let plain = registry
            .parse("/files[0]/codecs[0]", options(json!({"name": "plain"})), &general)
            .unwrap();
        assert_eq!("plain", plain.name());

        let filter = registry
            .parse(
                "/files[0]/codecs[0]",
                options(json!({"name": "filter", "patterns": ["^a"]})),
                &general,
            )
            .unwrap();
        assert_eq!("filter", filter.name());
    }

    #[test]
    fn parse_rejects_unknown_codec_and_missing_name() {
        let registry = CodecRegistry::builtin();
        let general = GeneralConfig::default();

        let err = registry
            .parse("/stdin/codecs[0]", options(json!({"name": "grok"})), &general)
            .unwrap_err();
        assert!(err.to_string().contains("Unrecognised codec 'grok'"));

        let err = registry
            .parse("/stdin/codecs[0]", options(json!({})), &general)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unused_codec_keys_are_reported() {
        let registry = CodecRegistry::builtin();
        let general = GeneralConfig::default();

        let err = registry
            .parse(
                "/files[0]/codecs[0]",
                options(json!({"name": "plain", "patterns": ["x"]})),
                &general,
            )
            .unwrap_err();
        match err {
            Error::UnusedConfig { path, key } => {
                assert_eq!("/files[0]/codecs[0]", path);
                assert_eq!("patterns", key);
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
