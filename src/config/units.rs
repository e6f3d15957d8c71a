use crate::error::{Result, WardenError};
use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const KIB: u64 = 1024;

/// A byte count that deserializes from either an integer or a human size
/// string such as `"1G"`, `"512M"` or `"100MB"` (binary multiples).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Parse a size string. A bare number is a byte count.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(WardenError::ConfigValidationError(
                "memory size must not be empty".to_string(),
            ));
        }

        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);

        let value: f64 = number.parse().map_err(|_| {
            WardenError::ConfigValidationError(format!("invalid memory size: '{}'", input))
        })?;

        let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" | "KIB" => KIB,
            "M" | "MB" | "MIB" => KIB * KIB,
            "G" | "GB" | "GIB" => KIB * KIB * KIB,
            "T" | "TB" | "TIB" => KIB * KIB * KIB * KIB,
            other => {
                return Err(WardenError::ConfigValidationError(format!(
                    "unknown memory unit '{}' in '{}'",
                    other, input
                )))
            }
        };

        Ok(ByteSize((value * multiplier as f64).round() as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let units = [("G", KIB * KIB * KIB), ("M", KIB * KIB), ("K", KIB)];
        for (suffix, size) in units {
            if self.0 >= size && self.0 % size == 0 {
                return write!(f, "{}{}", self.0 / size, suffix);
            }
        }
        write!(f, "{}B", self.0)
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bytes(bytes) => Ok(ByteSize(bytes)),
            Raw::Text(text) => ByteSize::parse(&text).map_err(serde::de::Error::custom),
        }
    }
}

/// Moment-style tokens (as used by pm2's `log_date_format`) and their chrono
/// equivalents. Longer tokens come first so `YYYY` wins over `YY`.
const MOMENT_TOKENS: &[(&str, &str)] = &[
    ("YYYY", "%Y"),
    ("YY", "%y"),
    ("MM", "%m"),
    ("DD", "%d"),
    ("HH", "%H"),
    ("hh", "%I"),
    ("mm", "%M"),
    ("ss", "%S"),
    ("SSS", "%3f"),
    ("ZZ", "%z"),
    ("Z", "%:z"),
    ("A", "%p"),
];

/// Resolve a log date format into a chrono strftime string.
///
/// Strings containing `%` are taken as strftime already. Anything else is read
/// as moment tokens, with `[...]` as literal text.
pub fn resolve_date_format(format: &str) -> Result<String> {
    let resolved = if format.contains('%') {
        format.to_string()
    } else {
        translate_moment(format)
    };

    if StrftimeItems::new(&resolved).any(|item| matches!(item, Item::Error)) {
        return Err(WardenError::ConfigValidationError(format!(
            "invalid log_date_format: '{}'",
            format
        )));
    }

    Ok(resolved)
}

fn translate_moment(format: &str) -> String {
    let mut out = String::with_capacity(format.len() * 2);
    let mut rest = format;

    'outer: while !rest.is_empty() {
        if let Some(body) = rest.strip_prefix('[') {
            if let Some(end) = body.find(']') {
                out.push_str(&body[..end]);
                rest = &body[end + 1..];
                continue;
            }
        }

        for (token, strftime) in MOMENT_TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(strftime);
                rest = tail;
                continue 'outer;
            }
        }

        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }

    out
}
