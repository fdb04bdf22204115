// SPDX-License-Identifier: Apache-2.0

use super::pattern::{MatchMode, PatternCollection};
use super::{Callback, Codec, CodecConfig, Line};
use crate::admin::{KeyValue, Value as ApiValue};
use crate::config::GeneralConfig;
use crate::config::parse::populate;
use crate::errors::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FilterOptions {
    patterns: Vec<String>,
    #[serde(rename = "match")]
    match_mode: MatchMode,
}

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub patterns: PatternCollection,
}

pub(crate) fn parse_config(
    path: &str,
    options: Map<String, Value>,
    _general: &GeneralConfig,
) -> Result<CodecConfig> {
    let options: FilterOptions = populate(path, options, &["patterns", "match"])?;
    let patterns = PatternCollection::new(options.patterns.as_slice(), options.match_mode)
        .map_err(|e| Error::Config(format!("Invalid patterns for filter codec at {}: {}", path, e)))?;
    Ok(CodecConfig::Filter(Arc::new(FilterConfig { patterns })))
}

/// Drops lines that do not satisfy the pattern collection.
pub struct Filter {
    config: Arc<FilterConfig>,
    last_offset: i64,
    callback: Callback,
    filtered_lines: u64,
    meter_filtered: u64,
}

impl Filter {
    pub fn new(config: Arc<FilterConfig>, callback: Callback, offset: i64) -> Self {
        Self {
            config,
            last_offset: offset,
            callback,
            filtered_lines: 0,
            meter_filtered: 0,
        }
    }

    pub fn filtered_lines(&self) -> u64 {
        self.filtered_lines
    }
}

impl Codec for Filter {
    fn event(&mut self, start_offset: i64, end_offset: i64, line: Line) -> Result<()> {
        if self.config.patterns.is_match(&line.text()) {
            (self.callback)(start_offset, end_offset, line)?;
        } else {
            self.filtered_lines += 1;
        }

        self.last_offset = end_offset;
        Ok(())
    }

    fn teardown(&mut self) -> i64 {
        self.last_offset
    }

    fn reset(&mut self) {
        self.last_offset = 0;
    }

    fn meter(&mut self) {
        self.meter_filtered = self.filtered_lines;
    }

    fn snapshot(&self) -> Option<KeyValue> {
        Some(KeyValue::new().with(
            "filtered_lines",
            ApiValue::Number(self.meter_filtered as i64),
        ))
    }
}
