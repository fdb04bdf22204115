// SPDX-License-Identifier: Apache-2.0

use crate::errors::{Error, Result};
use serde::de::{DeserializeOwned, Deserializer, Error as DeError};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

/// Fails on the first key (in sorted order) that is not in `known`.
pub fn check_unused(path: &str, options: &Map<String, Value>, known: &[&str]) -> Result<()> {
    let mut unused: Vec<&String> = options
        .keys()
        .filter(|k| !known.contains(&k.as_str()))
        .collect();
    unused.sort();

    match unused.first() {
        Some(key) => Err(Error::UnusedConfig {
            path: path.to_string(),
            key: key.to_string(),
        }),
        None => Ok(()),
    }
}

/// Deserializes a section after checking it holds only known keys.
pub fn populate<T: DeserializeOwned>(
    path: &str,
    options: Map<String, Value>,
    known: &[&str],
) -> Result<T> {
    check_unused(path, &options, known)?;
    serde_json::from_value(Value::Object(options))
        .map_err(|e| Error::Config(format!("{}: {}", path, e)))
}

/// Removes a nested object from `options`. Missing or null yields an empty map.
pub fn take_section(
    options: &mut Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<Map<String, Value>> {
    match options.remove(key) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(Error::Config(format!("Option {}{} must be a hash", path, key))),
    }
}

/// Parses `"250ms"`, `"30s"`, `"5m"`, `"1h"` or a bare number of seconds.
pub fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    let value = value.trim();
    let (number, scale) = if let Some(n) = value.strip_suffix("ms") {
        (n, 0.001)
    } else if let Some(n) = value.strip_suffix('s') {
        (n, 1.0)
    } else if let Some(n) = value.strip_suffix('m') {
        (n, 60.0)
    } else if let Some(n) = value.strip_suffix('h') {
        (n, 3600.0)
    } else {
        (value, 1.0)
    };

    let number: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration '{}'", value))?;
    seconds_to_duration(number * scale).ok_or_else(|| format!("invalid duration '{}'", value))
}

fn seconds_to_duration(seconds: f64) -> Option<Duration> {
    if seconds.is_finite() && seconds >= 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_f64()
            .and_then(seconds_to_duration)
            .ok_or_else(|| D::Error::custom(format!("invalid duration {}", n))),
        Value::String(s) => parse_duration(&s).map_err(D::Error::custom),
        other => Err(D::Error::custom(format!(
            "expected a numeric or string duration, found {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Timed {
        #[serde(deserialize_with = "deserialize_duration")]
        wait: Duration,
    }

    #[test]
    fn durations_accept_numbers_and_suffixes() {
        assert_eq!(Ok(Duration::from_millis(250)), parse_duration("250ms"));
        assert_eq!(Ok(Duration::from_secs(30)), parse_duration("30s"));
        assert_eq!(Ok(Duration::from_secs(300)), parse_duration("5m"));
        assert_eq!(Ok(Duration::from_secs(3600)), parse_duration("1h"));
        assert_eq!(Ok(Duration::from_secs(7)), parse_duration("7"));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("-1s").is_err());

        let timed: Timed = serde_json::from_value(json!({"wait": 1.5})).unwrap();
        assert_eq!(Duration::from_millis(1500), timed.wait);
        let timed: Timed = serde_json::from_value(json!({"wait": "2m"})).unwrap();
        assert_eq!(Duration::from_secs(120), timed.wait);
        assert!(serde_json::from_value::<Timed>(json!({"wait": true})).is_err());
    }

    #[test]
    fn unused_keys_reported_in_sorted_order() {
        let options = json!({"zeta": 1, "alpha": 2, "known": 3});
        let options = options.as_object().unwrap();

        match check_unused("/general", options, &["known"]).unwrap_err() {
            Error::UnusedConfig { path, key } => {
                assert_eq!("/general", path);
                assert_eq!("alpha", key);
            }
            other => panic!("unexpected error: {}", other),
        }

        assert!(check_unused("/general", options, &["alpha", "known", "zeta"]).is_ok());
    }

    #[test]
    fn sections_must_be_objects() {
        let mut options = json!({"general": {"host": "a"}, "network": 5})
            .as_object()
            .unwrap()
            .clone();

        assert_eq!(1, take_section(&mut options, "/", "general").unwrap().len());
        assert!(take_section(&mut options, "/", "admin").unwrap().is_empty());
        assert!(take_section(&mut options, "/", "network").is_err());
    }
}
