// SPDX-License-Identifier: Apache-2.0

use crate::errors::{Error, Result};
use regex::Regex;
use serde::Deserialize;

/// How many patterns of a collection must match for the line to match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Any,
    All,
}

#[derive(Debug, Clone)]
struct Pattern {
    regex: Regex,
    negate: bool,
}

/// An ordered set of regular expressions evaluated against a line.
///
/// A leading `!` negates a pattern. A leading `=` is stripped and otherwise
/// ignored, so `=!foo` matches lines containing `!foo`.
#[derive(Debug, Clone)]
pub struct PatternCollection {
    patterns: Vec<Pattern>,
    required_matches: usize,
}

impl PatternCollection {
    pub fn new<S: AsRef<str>>(patterns: &[S], mode: MatchMode) -> Result<Self> {
        if patterns.is_empty() {
            return Err(Error::Config(
                "At least one pattern must be specified".to_string(),
            ));
        }

        let patterns = patterns
            .iter()
            .map(|p| compile(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let required_matches = match mode {
            MatchMode::Any => 1,
            MatchMode::All => patterns.len(),
        };

        Ok(Self {
            patterns,
            required_matches,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        let mut matches = 0;
        for pattern in &self.patterns {
            if pattern.regex.is_match(text) == pattern.negate {
                continue;
            }
            matches += 1;
            if matches == self.required_matches {
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn compile(raw: &str) -> Result<Pattern> {
    let (negate, expr) = if let Some(rest) = raw.strip_prefix('!') {
        (true, rest)
    } else if let Some(rest) = raw.strip_prefix('=') {
        (false, rest)
    } else {
        (false, raw)
    };

    let regex = Regex::new(expr).map_err(|source| Error::Regex {
        pattern: expr.to_string(),
        source,
    })?;

    Ok(Pattern { regex, negate })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_requires_one_match() {
        let c = PatternCollection::new(&["^DEBUG", "^INFO"], MatchMode::Any).unwrap();
        assert!(c.is_match("DEBUG one"));
        assert!(c.is_match("INFO two"));
        assert!(!c.is_match("WARN three"));
    }

    #[test]
    fn all_requires_every_match() {
        let c = PatternCollection::new(&["^DEBUG", "line$"], MatchMode::All).unwrap();
        assert!(c.is_match("DEBUG First line"));
        assert!(!c.is_match("DEBUG First"));
        assert!(!c.is_match("INFO line"));
    }

    #[test]
    fn negation_and_literal_prefix() {
        let negated = PatternCollection::new(&["!^START"], MatchMode::Any).unwrap();
        assert!(negated.is_match("continuation"));
        assert!(!negated.is_match("START of event"));

        let literal = PatternCollection::new(&["=!important"], MatchMode::Any).unwrap();
        assert!(literal.is_match("this is !important"));
        assert!(!literal.is_match("this is important"));

        let escaped = PatternCollection::new(&["==x"], MatchMode::Any).unwrap();
        assert!(escaped.is_match("a=x"));
    }

    #[test]
    fn mixed_negation_with_all() {
        let c = PatternCollection::new(&["^ERROR", "!timeout"], MatchMode::All).unwrap();
        assert!(c.is_match("ERROR disk full"));
        assert!(!c.is_match("ERROR timeout talking to peer"));
    }

    #[test]
    fn invalid_and_empty_patterns_fail() {
        let empty: [&str; 0] = [];
        assert!(PatternCollection::new(&empty, MatchMode::Any).is_err());

        let err = PatternCollection::new(&["("], MatchMode::Any).unwrap_err();
        assert!(matches!(err, Error::Regex { .. }));
    }
}
