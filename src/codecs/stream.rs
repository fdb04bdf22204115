// SPDX-License-Identifier: Apache-2.0

use super::{Callback, Codec, Line, SharedCodec};
use crate::admin::{KeyValue, Value as ApiValue};
use crate::config::{GeneralConfig, StreamConfig};
use crate::errors::{Error, Result};
use crate::event::{
    Event, EventContext, FIELD_HOST, FIELD_MESSAGE, FIELD_OFFSET, FIELD_PATH, FIELD_TAGS,
    FIELD_TIMEZONE, StreamKey, TAG_SPLITLINE,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Receives every event produced by a stream.
pub type EventSink = Box<dyn FnMut(Event) -> Result<()> + Send>;

/// Describes where a stream reads from. Stdin has neither a key nor a path.
#[derive(Debug, Clone, Default)]
pub struct StreamSource {
    pub key: Option<StreamKey>,
    pub path: Option<String>,
}

/// The codec chain for one harvested file plus field augmentation.
pub struct Stream {
    codecs: Vec<(&'static str, SharedCodec)>,
}

impl Stream {
    pub fn new(
        config: &StreamConfig,
        general: &GeneralConfig,
        source: StreamSource,
        offset: i64,
        sink: EventSink,
    ) -> Self {
        let mut callback = event_builder(config, general, source, sink);

        let mut codecs = Vec::with_capacity(config.codecs.len());
        for codec_config in config.codecs.iter().rev() {
            let codec: SharedCodec = Arc::new(Mutex::new(codec_config.new_codec(callback, offset)));
            let next = codec.clone();
            callback = Box::new(move |start, end, line| next.lock().unwrap().event(start, end, line));
            codecs.push((codec_config.name(), codec));
        }
        codecs.reverse();

        Self { codecs }
    }

    pub fn process_event(&mut self, start_offset: i64, end_offset: i64, line: Line) -> Result<()> {
        match self.codecs.first() {
            Some((_, codec)) => codec.lock().unwrap().event(start_offset, end_offset, line),
            None => Ok(()),
        }
    }

    pub fn reset(&mut self) {
        for (_, codec) in &self.codecs {
            codec.lock().unwrap().reset();
        }
    }

    pub fn meter(&mut self) {
        for (_, codec) in &self.codecs {
            codec.lock().unwrap().meter();
        }
    }

    /// Tears down the whole chain in order and returns the offset to resume
    /// from. A codec further down may still hold lines the head has already
    /// passed on, so the lowest offset across the chain wins.
    pub fn close(self) -> i64 {
        self.codecs
            .iter()
            .map(|(_, codec)| codec.lock().unwrap().teardown())
            .min()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> KeyValue {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut snapshot = KeyValue::new();
        for (name, codec) in &self.codecs {
            let count = seen.entry(*name).or_default();
            *count += 1;
            let key = if *count == 1 {
                name.to_string()
            } else {
                format!("{}_{}", name, count)
            };

            let value = codec
                .lock()
                .unwrap()
                .snapshot()
                .map_or(ApiValue::Null, ApiValue::KeyValue);
            snapshot.set(&key, value);
        }
        snapshot
    }
}

/// Final link of the chain: turns a line into an [`Event`] and hands it on.
fn event_builder(
    config: &StreamConfig,
    general: &GeneralConfig,
    source: StreamSource,
    mut sink: EventSink,
) -> Callback {
    let mut base = Map::new();
    for (k, v) in general.global_fields.iter().chain(config.fields.iter()) {
        base.insert(k.clone(), v.clone());
    }
    if config.add_path_field {
        if let Some(path) = &source.path {
            base.insert(FIELD_PATH.to_string(), Value::String(path.clone()));
        }
    }
    if config.add_host_field {
        base.insert(FIELD_HOST.to_string(), Value::String(general.host.clone()));
    }
    if config.add_timezone_field {
        base.insert(
            FIELD_TIMEZONE.to_string(),
            Value::String(chrono::Local::now().format("%:z").to_string()),
        );
    }

    let add_offset = config.add_offset_field;
    let max = general.spool_max_bytes as usize;
    let key = source.key;

    Box::new(move |start, end, line: Line| {
        let split = line.split;
        let mut data = base.clone();
        data.insert(FIELD_MESSAGE.to_string(), Value::String(line.into_text()));
        if add_offset {
            data.insert(FIELD_OFFSET.to_string(), Value::from(start));
        }
        if split {
            add_tag(&mut data, TAG_SPLITLINE);
        }

        let context = key.map(|stream| EventContext {
            stream,
            end_offset: end,
        });
        let event = Event::new(context, data);

        // Split lines are already bounded by max line bytes or max multiline
        // bytes and are shipped alone by the spooler.
        let size = event.encoded_len() + 4;
        if !split && size > max {
            return Err(Error::EventTooLarge { size, max });
        }
        sink(event)
    })
}

fn add_tag(data: &mut Map<String, Value>, tag: &str) {
    match data.get_mut(FIELD_TAGS) {
        Some(Value::Array(tags)) => tags.push(Value::from(tag)),
        _ => {
            data.insert(FIELD_TAGS.to_string(), Value::Array(vec![Value::from(tag)]));
        }
    }
}
