//! Plain-text metrics exposition parser.
//!
//! Understands the line format served on `/metrics` endpoints:
//!
//! ```text
//! # HELP payments_total Processed payments.
//! # TYPE payments_total counter
//! payments_total{status="completed"} 812
//! payments_total{status="failed"} 9 1700000000000
//! ```
//!
//! Only samples are extracted; `HELP`/`TYPE` metadata is skipped.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

/// A single sample line.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpositionError {
    #[error("sample has no value: {0}")]
    MissingValue(String),
    #[error("invalid sample value `{value}`")]
    InvalidValue { value: String },
    #[error("unterminated label set: {0}")]
    UnterminatedLabels(String),
    #[error("invalid label pair: {0}")]
    InvalidLabel(String),
    #[error("invalid metric name: {0}")]
    InvalidName(String),
}

/// Parse one line. Blank lines and comments yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Sample>, ExpositionError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or(line.len());
    let name = &line[..name_end];
    if !valid_name(name) {
        return Err(ExpositionError::InvalidName(line.to_string()));
    }

    let mut rest = &line[name_end..];
    let mut labels = BTreeMap::new();
    if rest.starts_with('{') {
        let (parsed, after) = parse_labels(&rest[1..], line)?;
        labels = parsed;
        rest = after;
    }

    let raw_value = rest
        .split_whitespace()
        .next()
        .ok_or_else(|| ExpositionError::MissingValue(line.to_string()))?;
    let value = raw_value
        .parse::<f64>()
        .map_err(|_| ExpositionError::InvalidValue {
            value: raw_value.to_string(),
        })?;

    Ok(Some(Sample {
        name: name.to_string(),
        labels,
        value,
    }))
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Parse `key="value",...}` and return the remainder after `}`.
fn parse_labels<'a>(
    input: &'a str,
    line: &str,
) -> Result<(BTreeMap<String, String>, &'a str), ExpositionError> {
    let mut labels = BTreeMap::new();
    let mut chars = input.char_indices().peekable();

    loop {
        while matches!(chars.peek(), Some((_, c)) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let Some(&(start, c)) = chars.peek() else {
            return Err(ExpositionError::UnterminatedLabels(line.to_string()));
        };
        if c == '}' {
            return Ok((labels, &input[start + 1..]));
        }

        let mut key_end = None;
        for (i, c) in chars.by_ref() {
            if c == '=' {
                key_end = Some(i);
                break;
            }
            if c == '}' || c == '"' {
                return Err(ExpositionError::InvalidLabel(line.to_string()));
            }
        }
        let Some(key_end) = key_end else {
            return Err(ExpositionError::UnterminatedLabels(line.to_string()));
        };
        let key = input[start..key_end].trim();
        if key.is_empty() || chars.next().map(|(_, c)| c) != Some('"') {
            return Err(ExpositionError::InvalidLabel(line.to_string()));
        }

        let mut value = String::new();
        let mut closed = false;
        while let Some((_, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, other)) => value.push(other),
                    None => break,
                },
                '"' => {
                    closed = true;
                    break;
                }
                other => value.push(other),
            }
        }
        if !closed {
            return Err(ExpositionError::UnterminatedLabels(line.to_string()));
        }
        labels.insert(key.to_string(), value);
    }
}

/// Parse a whole document, skipping lines that do not parse.
pub fn parse(text: &str) -> Vec<Sample> {
    text.lines()
        .filter_map(|line| match parse_line(line) {
            Ok(sample) => sample,
            Err(e) => {
                debug!(error = %e, "skipping malformed exposition line");
                None
            }
        })
        .collect()
}

/// Sum of every sample of `name`, or `None` when the family is absent.
pub fn sum(samples: &[Sample], name: &str) -> Option<f64> {
    let mut matched = samples.iter().filter(|s| s.name == name).peekable();
    matched.peek()?;
    Some(matched.map(|s| s.value).sum())
}

/// Per-value totals of `label` within the `name` family.
pub fn group_by_label(samples: &[Sample], name: &str, label: &str) -> BTreeMap<String, f64> {
    let mut groups = BTreeMap::new();
    for sample in samples.iter().filter(|s| s.name == name) {
        if let Some(key) = sample.labels.get(label) {
            *groups.entry(key.clone()).or_insert(0.0) += sample.value;
        }
    }
    groups
}
