// SPDX-License-Identifier: Apache-2.0

use serde_json::{Map, Value};
use std::fmt;
use std::sync::OnceLock;

pub const FIELD_MESSAGE: &str = "message";
pub const FIELD_OFFSET: &str = "offset";
pub const FIELD_PATH: &str = "path";
pub const FIELD_HOST: &str = "host";
pub const FIELD_TIMEZONE: &str = "timezone";
pub const FIELD_TAGS: &str = "tags";

pub const TAG_SPLITLINE: &str = "splitline";

/// Identifies one tracked file for the lifetime of the process. Allocated by
/// the prospector and used by the registrar to attribute acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey(u64);

impl StreamKey {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an event came from: the owning stream and the offset just past the
/// last byte it covers. Persisting `end_offset` after an ACK is what makes a
/// restart resume exactly after the delivered data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventContext {
    pub stream: StreamKey,
    pub end_offset: i64,
}

/// A single log event. Events without a context (stdin) are delivered but
/// never persisted.
#[derive(Debug, Clone)]
pub struct Event {
    context: Option<EventContext>,
    data: Map<String, Value>,
    encoded: OnceLock<Vec<u8>>,
}

impl Event {
    pub fn new(context: Option<EventContext>, data: Map<String, Value>) -> Self {
        Self {
            context,
            data,
            encoded: OnceLock::new(),
        }
    }

    /// Convenience constructor used where only the message matters.
    pub fn from_message(context: Option<EventContext>, message: &str) -> Self {
        let mut data = Map::new();
        data.insert(FIELD_MESSAGE.to_string(), Value::String(message.to_string()));
        Self::new(context, data)
    }

    pub fn context(&self) -> Option<EventContext> {
        self.context
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn message(&self) -> Option<&str> {
        self.data.get(FIELD_MESSAGE).and_then(Value::as_str)
    }

    /// Canonical JSON form, computed once.
    pub fn encoded(&self) -> &[u8] {
        self.encoded
            .get_or_init(|| serde_json::to_vec(&self.data).unwrap_or_default())
    }

    pub fn encoded_len(&self) -> usize {
        self.encoded().len()
    }
}

/// Renders a field value for key/value wire formats: strings verbatim, every
/// other value as its JSON text.
pub fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encoding_is_cached_json() {
        let event = Event::from_message(None, "hello");
        assert_eq!(br#"{"message":"hello"}"#, event.encoded());
        assert_eq!(19, event.encoded_len());
        assert_eq!(Some("hello"), event.message());
    }

    #[test]
    fn context_travels_with_clone() {
        let ctx = EventContext {
            stream: StreamKey::new(7),
            end_offset: 42,
        };
        let event = Event::from_message(Some(ctx), "x").clone();
        assert_eq!(Some(ctx), event.context());
    }

    #[test]
    fn text_values() {
        assert_eq!("plain", value_as_text(&json!("plain")));
        assert_eq!("12", value_as_text(&json!(12)));
        assert_eq!(r#"["a","b"]"#, value_as_text(&json!(["a", "b"])));
    }
}
