//! Typed PostgreSQL setting values and their canonical comparison form.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single `postgresql.conf` value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

const MEMORY_UNITS: [(&str, f64); 5] = [
    ("TB", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("GB", 1024.0 * 1024.0 * 1024.0),
    ("MB", 1024.0 * 1024.0),
    ("kB", 1024.0),
    ("B", 1.0),
];

const TIME_UNITS: [(&str, f64); 6] = [
    ("min", 60_000_000.0),
    ("ms", 1_000.0),
    ("us", 1.0),
    ("s", 1_000_000.0),
    ("h", 3_600_000_000.0),
    ("d", 86_400_000_000.0),
];

impl SettingValue {
    /// Parse a raw value as found in a configuration file.
    ///
    /// Quoted values stay strings; unquoted ones are typed as boolean, integer
    /// or float when they look like one.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(inner) = raw
            .strip_prefix('\'')
            .and_then(|rest| rest.strip_suffix('\''))
        {
            return Self::Str(unquote(inner));
        }
        if let Some(flag) = parse_bool(raw) {
            return Self::Bool(flag);
        }
        if let Ok(int) = raw.parse::<i64>() {
            return Self::Int(int);
        }
        if let Ok(float) = raw.parse::<f64>() {
            if float.is_finite() {
                return Self::Float(float);
            }
        }
        Self::Str(raw.to_string())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Unquoted text, as passed on a command line or in YAML
    pub fn raw(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Numeric value ignoring units, used for floor comparisons
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(_) => None,
            Self::Str(s) => {
                let s = s.trim();
                s.parse::<f64>()
                    .ok()
                    .or_else(|| with_unit(s, &MEMORY_UNITS))
                    .or_else(|| with_unit(s, &TIME_UNITS))
            }
        }
    }

    /// Canonical form used to decide whether two values mean the same thing.
    ///
    /// Booleans become `on`/`off`, numbers lose formatting differences, memory
    /// sizes become bytes and durations become microseconds.
    pub fn normalized(&self) -> String {
        match self {
            Self::Bool(true) => "on".to_string(),
            Self::Bool(false) => "off".to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => canonical_number(*f),
            Self::Str(s) => {
                let trimmed = s.trim();
                if let Some(flag) = parse_bool(trimmed) {
                    return if flag { "on" } else { "off" }.to_string();
                }
                if let Ok(number) = trimmed.parse::<f64>() {
                    return canonical_number(number);
                }
                if let Some(bytes) = with_unit(trimmed, &MEMORY_UNITS) {
                    return format!("{}B", canonical_number(bytes));
                }
                if let Some(micros) = with_unit(trimmed, &TIME_UNITS) {
                    return format!("{}us", canonical_number(micros));
                }
                trimmed.to_string()
            }
        }
    }

    /// Whether both values denote the same setting
    pub fn same_as(&self, other: &SettingValue) -> bool {
        self == other || self.normalized() == other.normalized()
    }
}

impl fmt::Display for SettingValue {
    /// Renders the value as it should appear in `postgresql.conf`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => write!(f, "on"),
            Self::Bool(false) => write!(f, "off"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "'{}'", escape(s)),
        }
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" => Some(true),
        "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Escape text for a single-quoted value; the inverse of [`unquote`]
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn unquote(inner: &str) -> String {
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if chars.peek() == Some(&'\'') => {
                chars.next();
                out.push('\'');
            }
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            },
            other => out.push(other),
        }
    }
    out
}

fn with_unit(raw: &str, units: &[(&str, f64)]) -> Option<f64> {
    units.iter().find_map(|(unit, factor)| {
        raw.strip_suffix(unit)
            .map(str::trim_end)
            .filter(|number| !number.is_empty())
            .and_then(|number| number.parse::<f64>().ok())
            .map(|number| number * factor)
    })
}

fn canonical_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_types_unquoted_values() {
        assert_eq!(SettingValue::parse("on"), SettingValue::Bool(true));
        assert_eq!(SettingValue::parse("100"), SettingValue::Int(100));
        assert_eq!(SettingValue::parse("0.9"), SettingValue::Float(0.9));
        assert_eq!(SettingValue::parse("128MB"), SettingValue::Str("128MB".into()));
        assert_eq!(
            SettingValue::parse("'it''s'"),
            SettingValue::Str("it's".into())
        );
    }

    #[test]
    fn test_rendered_strings_parse_back() {
        for text in [r"copy %p C:\wal\%f", "two\nlines", "it's", "tab\there", r"trailing\"] {
            let value = SettingValue::from(text);
            assert_eq!(SettingValue::parse(&value.to_string()), value, "{text:?}");
        }
        assert_eq!(SettingValue::from(r"C:\wal").to_string(), r"'C:\\wal'");
    }

    #[test]
    fn test_normalized_units_and_booleans() {
        assert!(SettingValue::from("1GB").same_as(&SettingValue::from("1024MB")));
        assert!(SettingValue::from("1min").same_as(&SettingValue::from("60s")));
        assert!(SettingValue::Bool(true).same_as(&SettingValue::from("on")));
        assert!(SettingValue::from("true").same_as(&SettingValue::from("yes")));
        assert!(SettingValue::Int(5).same_as(&SettingValue::Float(5.0)));
        assert!(!SettingValue::from("128MB").same_as(&SettingValue::Int(128)));
        assert!(!SettingValue::from("csvlog").same_as(&SettingValue::from("stderr")));
    }

    #[test]
    fn test_display_quotes_strings() {
        assert_eq!(SettingValue::from("%m [%p] ").to_string(), "'%m [%p] '");
        assert_eq!(SettingValue::from("it's").to_string(), "'it''s'");
        assert_eq!(SettingValue::Bool(false).to_string(), "off");
        assert_eq!(SettingValue::Int(42).to_string(), "42");
    }

    #[test]
    fn test_as_number_understands_units() {
        assert_eq!(SettingValue::Int(10).as_number(), Some(10.0));
        assert_eq!(SettingValue::from("2kB").as_number(), Some(2048.0));
        assert_eq!(SettingValue::from("syslog").as_number(), None);
    }
}
