// SPDX-License-Identifier: Apache-2.0

use super::{Callback, Codec, CodecConfig, Line};
use crate::config::GeneralConfig;
use crate::config::parse::check_unused;
use crate::errors::Result;
use serde_json::{Map, Value};

pub(crate) fn parse_config(
    path: &str,
    options: Map<String, Value>,
    _general: &GeneralConfig,
) -> Result<CodecConfig> {
    check_unused(path, &options, &[])?;
    Ok(CodecConfig::Plain)
}

/// Passes every line through unchanged.
pub struct Plain {
    last_offset: i64,
    callback: Callback,
}

impl Plain {
    pub fn new(callback: Callback, offset: i64) -> Self {
        Self {
            last_offset: offset,
            callback,
        }
    }
}

impl Codec for Plain {
    fn event(&mut self, start_offset: i64, end_offset: i64, line: Line) -> Result<()> {
        (self.callback)(start_offset, end_offset, line)?;
        self.last_offset = end_offset;
        Ok(())
    }

    fn teardown(&mut self) -> i64 {
        self.last_offset
    }

    fn reset(&mut self) {
        self.last_offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::test_support::{capture, messages};

    #[test]
    fn passes_lines_and_tracks_offset() {
        let (callback, captured) = capture();
        let mut codec = Plain::new(callback, 0);

        codec.event(0, 2, Line::new("a")).unwrap();
        codec.event(2, 4, Line::new("b")).unwrap();

        assert_eq!(vec!["a", "b"], messages(&captured));
        assert_eq!((2, 4), {
            let c = captured.lock().unwrap();
            (c[1].0, c[1].1)
        });
        assert_eq!(4, codec.teardown());
    }

    #[test]
    fn teardown_without_events_returns_start_offset() {
        let (callback, _) = capture();
        let mut codec = Plain::new(callback, 120);
        assert_eq!(120, codec.teardown());
    }
}
