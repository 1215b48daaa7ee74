//! Type coercion and value transforms
//!
//! Coercion is total and lossy: `"1.1k"` as a number is `1.1`, anything
//! unparseable as an integer is `0`. Callers that need unit-aware conversion
//! should not rely on it.

use serde_json::{Number, Value};
use url::Url;

use crate::schema::ValueType;

const TRUTHY: &[&str] = &["true", "yes", "1", "on"];

/// Convert a resolved raw string to the declared type
pub fn coerce(raw: &str, value_type: ValueType) -> Value {
    match value_type {
        ValueType::String => Value::String(collapse_whitespace(raw)),
        ValueType::Integer => Value::Number(parse_integer(raw).into()),
        ValueType::Number => {
            let n = parse_number(raw);
            // finite by construction; the fallback only guards overflow
            Value::Number(Number::from_f64(n).unwrap_or_else(|| Number::from(0)))
        }
        ValueType::Boolean => Value::Bool(parse_boolean(raw)),
        ValueType::Raw => Value::String(raw.to_string()),
    }
}

pub fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Digits with an optional leading minus; everything else is dropped first
pub fn parse_integer(raw: &str) -> i64 {
    let kept: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '-')
        .collect();

    let (negative, digits) = match kept.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, kept.as_str()),
    };

    let mut value: i64 = 0;
    for c in digits.chars().take_while(char::is_ascii_digit) {
        let digit = i64::from(c as u8 - b'0');
        value = value.saturating_mul(10).saturating_add(digit);
    }
    if negative {
        -value
    } else {
        value
    }
}

/// Digits, `.` and a leading minus are kept; the longest valid prefix is parsed
pub fn parse_number(raw: &str) -> f64 {
    let kept: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();

    let (negative, rest) = match kept.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, kept.as_str()),
    };

    let int_len = rest.bytes().take_while(u8::is_ascii_digit).count();
    let mut end = int_len;
    if rest[int_len..].starts_with('.') {
        let frac_len = rest[int_len + 1..]
            .bytes()
            .take_while(u8::is_ascii_digit)
            .count();
        if frac_len > 0 {
            end = int_len + 1 + frac_len;
        }
    }

    let magnitude = match &rest[..end] {
        "" => 0.0,
        digits => digits.parse::<f64>().unwrap_or(0.0),
    };
    let magnitude = if magnitude.is_finite() { magnitude } else { f64::MAX };
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

pub fn parse_boolean(raw: &str) -> bool {
    let lowered = raw.trim().to_lowercase();
    TRUTHY.contains(&lowered.as_str())
}

/// Apply a named transform to a resolved raw string.
///
/// Unknown transforms leave the value unchanged. `parse_price` yields `None`
/// when the string holds no digits.
pub fn apply_transform(value: String, transform: &str, base_url: Option<&Url>) -> Option<String> {
    match transform.trim() {
        "trim" => Some(value.trim().to_string()),
        "lowercase" => Some(value.to_lowercase()),
        "uppercase" => Some(value.to_uppercase()),
        "parse_price" => parse_price(&value),
        "absolute_url" => Some(absolute_url(value, base_url)),
        _ => Some(value),
    }
}

// "€12.99" or "12,99 €" -> "12.99"; the first separator is the decimal point
fn parse_price(value: &str) -> Option<String> {
    let mut result = String::new();
    let mut has_decimal = false;
    for c in value.chars() {
        if c.is_ascii_digit() {
            result.push(c);
        } else if (c == '.' || c == ',') && !has_decimal && !result.is_empty() {
            result.push('.');
            has_decimal = true;
        }
    }
    if result.is_empty() {
        None
    } else {
        Some(result)
    }
}

fn absolute_url(value: String, base_url: Option<&Url>) -> String {
    match base_url.map(|base| base.join(value.trim())) {
        Some(Ok(joined)) => joined.to_string(),
        _ => value,
    }
}
