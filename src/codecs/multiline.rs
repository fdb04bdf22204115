// SPDX-License-Identifier: Apache-2.0

//! Joins consecutive lines into a single event.
//!
//! In `previous` mode a line that does not match the pattern collection starts
//! a new event, flushing whatever was buffered. In `next` mode a line that does
//! not match ends the current event. The buffer never grows past
//! `max multiline bytes`: when it would, the largest prefix that fits is
//! emitted, tagged as a split, and the remainder carried into a fresh event.
//! Sizes and offsets are counted in raw bytes.
//!
//! With a `previous timeout` a helper thread flushes the buffer once no line
//! has been appended for the configured duration. A failure of that flush is
//! held and returned by the next call to [`Codec::event`].

use super::pattern::{MatchMode, PatternCollection};
use super::{Callback, Codec, CodecConfig, Line};
use crate::admin::{KeyValue, Value as ApiValue};
use crate::bounded_channel::{BoundedSender, Recv, bounded};
use crate::config::GeneralConfig;
use crate::config::parse::{deserialize_duration, populate};
use crate::errors::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum What {
    #[default]
    Previous,
    Next,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MultilineOptions {
    patterns: Vec<String>,
    #[serde(rename = "match")]
    match_mode: MatchMode,
    what: What,
    #[serde(rename = "previous timeout", deserialize_with = "deserialize_duration")]
    previous_timeout: Duration,
    #[serde(rename = "max multiline bytes")]
    max_multiline_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct MultilineConfig {
    pub patterns: PatternCollection,
    pub what: What,
    pub previous_timeout: Option<Duration>,
    pub max_multiline_bytes: i64,
}

pub(crate) fn parse_config(
    path: &str,
    options: Map<String, Value>,
    general: &GeneralConfig,
) -> Result<CodecConfig> {
    let options: MultilineOptions = populate(
        path,
        options,
        &[
            "patterns",
            "match",
            "what",
            "previous timeout",
            "max multiline bytes",
        ],
    )?;

    let patterns = PatternCollection::new(options.patterns.as_slice(), options.match_mode)
        .map_err(|e| {
            Error::Config(format!("Invalid patterns for multiline codec at {}: {}", path, e))
        })?;

    let mut max_multiline_bytes = options.max_multiline_bytes;
    if max_multiline_bytes == 0 {
        max_multiline_bytes = general.spool_max_bytes;
    }
    if max_multiline_bytes > general.spool_max_bytes {
        return Err(Error::Config(format!(
            "{}: max multiline bytes cannot be greater than /general/spool max bytes",
            path
        )));
    }

    Ok(CodecConfig::Multiline(Arc::new(MultilineConfig {
        patterns,
        what: options.what,
        previous_timeout: Some(options.previous_timeout).filter(|d| !d.is_zero()),
        max_multiline_bytes: max_multiline_bytes as i64,
    })))
}

struct State {
    callback: Callback,
    last_offset: i64,
    start_offset: i64,
    end_offset: i64,
    buffer: Vec<Vec<u8>>,
    buffer_lines: i64,
    buffer_len: i64,
    split: bool,
    deadline: Instant,
    meter_lines: i64,
    meter_bytes: i64,
    failed: Option<Error>,
}

impl State {
    fn append(&mut self, data: Vec<u8>) {
        self.buffer_lines += 1;
        self.buffer_len += data.len() as i64;
        self.buffer.push(data);
    }

    /// Emits the buffer. `last_offset` only moves once the callback accepted
    /// the event, so a failed flush is read again after a restart.
    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let data = self.buffer.join(&b'\n');

        self.buffer.clear();
        self.buffer_len = 0;
        self.buffer_lines = 0;
        let split = std::mem::take(&mut self.split);

        (self.callback)(self.start_offset, self.end_offset, Line { data, split })?;
        self.last_offset = self.end_offset;
        Ok(())
    }
}

struct DeadlineTimer {
    stop: BoundedSender<()>,
    handle: JoinHandle<()>,
}

pub struct Multiline {
    config: Arc<MultilineConfig>,
    state: Arc<Mutex<State>>,
    timer: Option<DeadlineTimer>,
}

impl Multiline {
    pub fn new(config: Arc<MultilineConfig>, callback: Callback, offset: i64) -> Self {
        let state = Arc::new(Mutex::new(State {
            callback,
            last_offset: offset,
            start_offset: offset,
            end_offset: offset,
            buffer: Vec::new(),
            buffer_lines: 0,
            buffer_len: 0,
            split: false,
            deadline: Instant::now() + config.previous_timeout.unwrap_or_default(),
            meter_lines: 0,
            meter_bytes: 0,
            failed: None,
        }));

        let timer = config.previous_timeout.map(|timeout| {
            let (stop, stop_rx) = bounded::<()>(1);
            let state = state.clone();
            let handle = thread::spawn(move || {
                let mut wait = Duration::ZERO;
                loop {
                    match stop_rx.recv_timeout(wait) {
                        Recv::Timeout => {}
                        Recv::Item(()) | Recv::Disconnected => break,
                    }

                    let mut state = state.lock().unwrap();
                    if state.failed.is_some() {
                        break;
                    }
                    let now = Instant::now();
                    if now < state.deadline {
                        wait = state.deadline - now;
                        continue;
                    }

                    debug!("Multiline previous timeout reached, flushing");
                    if let Err(e) = state.flush() {
                        warn!(error = %e, "Failed to flush multiline buffer after timeout");
                        state.failed = Some(e);
                        break;
                    }
                    wait = timeout;
                }
            });
            DeadlineTimer { stop, handle }
        });

        Self {
            config,
            state,
            timer,
        }
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            drop(timer.stop);
            if timer.handle.join().is_err() {
                warn!("Multiline timeout thread panicked");
            }
        }
    }
}

impl Codec for Multiline {
    fn event(&mut self, start_offset: i64, end_offset: i64, line: Line) -> Result<()> {
        let matched = self.config.patterns.is_match(&line.text());
        let max = self.config.max_multiline_bytes;

        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.failed.take() {
            return Err(err);
        }

        if self.config.what == What::Previous && !matched {
            state.flush()?;
        }

        if state.buffer.is_empty() {
            state.start_offset = start_offset;
        }
        let line_split = line.split;
        state.split |= line_split;

        // File offset of the first byte still held in `data`.
        let mut data = line.data;
        let mut data_offset = start_offset;
        let mut check_len = state.buffer_len + data.len() as i64 + state.buffer_lines;

        while check_len >= max {
            let overflow = check_len - max;
            let mut cut = floor_boundary(&data, (data.len() as i64 - overflow).max(0) as usize);
            if cut == 0 && state.buffer.is_empty() {
                cut = ceil_boundary(&data, 1);
            }

            if cut > 0 {
                let rest = data.split_off(cut);
                data_offset += cut as i64;
                state.end_offset = data_offset;
                state.append(data);
                data = rest;
            }
            state.split = true;
            state.flush()?;

            state.start_offset = data_offset;
            state.split = line_split;
            check_len = data.len() as i64;
        }

        state.end_offset = end_offset;
        state.append(data);

        match self.config.what {
            What::Previous => {
                if let Some(timeout) = self.config.previous_timeout {
                    state.deadline = Instant::now() + timeout;
                }
            }
            What::Next => {
                if !matched {
                    state.flush()?;
                }
            }
        }

        Ok(())
    }

    fn teardown(&mut self) -> i64 {
        self.stop_timer();
        self.state.lock().unwrap().last_offset
    }

    fn reset(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.last_offset = 0;
        state.buffer.clear();
        state.buffer_len = 0;
        state.buffer_lines = 0;
        state.split = false;
    }

    fn meter(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.meter_lines = state.buffer_lines;
        state.meter_bytes = state.end_offset - state.last_offset;
    }

    fn snapshot(&self) -> Option<KeyValue> {
        let state = self.state.lock().unwrap();
        Some(
            KeyValue::new()
                .with("pending_lines", ApiValue::Number(state.meter_lines))
                .with("pending_bytes", ApiValue::Number(state.meter_bytes)),
        )
    }
}

impl Drop for Multiline {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

fn is_continuation(data: &[u8], index: usize) -> bool {
    matches!(data.get(index), Some(b) if b & 0xc0 == 0x80)
}

/// Moves `index` back to the start of a UTF-8 sequence. Bytes that are not
/// valid UTF-8 are cut where they fall.
fn floor_boundary(data: &[u8], index: usize) -> usize {
    let index = index.min(data.len());
    (index.saturating_sub(3)..=index)
        .rev()
        .find(|&i| !is_continuation(data, i))
        .unwrap_or(index)
}

fn ceil_boundary(data: &[u8], index: usize) -> usize {
    let index = index.min(data.len());
    (index..=(index + 3).min(data.len()))
        .find(|&i| !is_continuation(data, i))
        .unwrap_or(index)
}
