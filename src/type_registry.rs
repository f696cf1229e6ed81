//! Maps PostgreSQL type names to parser functions applied to raw column
//! text. The registry is installed on every driver connection when it is
//! initialised and is immutable once the pool exists.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::value::PrimitiveValue;

type ParseFn = dyn Fn(&str) -> Result<PrimitiveValue, String> + Send + Sync;

/// A named column parser: `bytes|string -> value`.
#[derive(Clone)]
pub struct TypeParser {
    pub name: String,
    parse: Arc<ParseFn>,
}

impl TypeParser {
    pub fn new<F>(name: impl Into<String>, parse: F) -> Self
    where
        F: Fn(&str) -> Result<PrimitiveValue, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            parse: Arc::new(parse),
        }
    }
}

impl fmt::Debug for TypeParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeParser")
            .field("name", &self.name)
            .finish()
    }
}

/// Registry of type parsers keyed by PostgreSQL type name.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    parsers: HashMap<String, TypeParser>,
}

impl TypeRegistry {
    /// An empty registry: every column value passes through as text.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// The built-in parser set: numerics, booleans, bytea, timestamps,
    /// intervals, and their array forms.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for name in ["int2", "int4", "int8"] {
            registry.register(TypeParser::new(name, parse_int));
        }
        for name in ["float4", "float8", "numeric"] {
            registry.register(TypeParser::new(name, parse_float));
        }
        registry.register(TypeParser::new("bool", parse_bool));
        registry.register(TypeParser::new("bytea", parse_bytea));
        registry.register(TypeParser::new("timestamptz", parse_timestamptz));
        registry.register(TypeParser::new("timestamp", parse_timestamptz));
        registry.register(TypeParser::new("interval", parse_interval));

        let scalar_names = [
            "int2",
            "int4",
            "int8",
            "float4",
            "float8",
            "numeric",
            "bool",
            "text",
            "timestamptz",
        ];
        for scalar in scalar_names {
            let inner = registry.parsers.get(scalar).cloned();
            registry.register(TypeParser::new(format!("_{scalar}"), move |raw| {
                parse_array(raw, inner.as_ref())
            }));
        }
        registry
    }

    /// Register or replace a parser. User-supplied parsers win over the
    /// defaults with the same name.
    pub fn register(&mut self, parser: TypeParser) {
        self.parsers.insert(parser.name.clone(), parser);
    }

    #[must_use]
    pub fn has(&self, type_name: &str) -> bool {
        self.parsers.contains_key(type_name)
    }

    /// Parse a raw column value. Unregistered types pass through as
    /// text.
    ///
    /// # Errors
    /// Returns the parser's message when the value does not conform to
    /// the registered type.
    pub fn parse(&self, type_name: &str, raw: &str) -> Result<PrimitiveValue, String> {
        match self.parsers.get(type_name) {
            Some(parser) => (parser.parse)(raw),
            None => Ok(PrimitiveValue::Text(raw.to_string())),
        }
    }
}

fn parse_int(raw: &str) -> Result<PrimitiveValue, String> {
    raw.parse::<i64>()
        .map(PrimitiveValue::Int)
        .map_err(|e| format!("invalid integer {raw:?}: {e}"))
}

fn parse_float(raw: &str) -> Result<PrimitiveValue, String> {
    let value = raw
        .parse::<f64>()
        .map_err(|e| format!("invalid number {raw:?}: {e}"))?;
    if value.is_finite() {
        Ok(PrimitiveValue::Float(value))
    } else {
        Err(format!("non-finite number {raw:?}"))
    }
}

fn parse_bool(raw: &str) -> Result<PrimitiveValue, String> {
    match raw {
        "t" | "true" => Ok(PrimitiveValue::Bool(true)),
        "f" | "false" => Ok(PrimitiveValue::Bool(false)),
        _ => Err(format!("invalid boolean {raw:?}")),
    }
}

fn parse_bytea(raw: &str) -> Result<PrimitiveValue, String> {
    let hex = raw
        .strip_prefix("\\x")
        .ok_or_else(|| format!("bytea value {raw:?} is not in hex form"))?;
    if hex.len() % 2 != 0 {
        return Err(format!("bytea value {raw:?} has odd length"));
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for pair in hex.as_bytes().chunks(2) {
        let pair = std::str::from_utf8(pair).map_err(|e| e.to_string())?;
        bytes.push(u8::from_str_radix(pair, 16).map_err(|e| format!("invalid hex: {e}"))?);
    }
    Ok(PrimitiveValue::Bytes(bytes))
}

/// Normalise a server timestamp to an ISO-8601 UTC string.
fn parse_timestamptz(raw: &str) -> Result<PrimitiveValue, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(PrimitiveValue::Text(
            parsed.with_timezone(&Utc).to_rfc3339(),
        ));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%#z"] {
        if let Ok(parsed) = DateTime::parse_from_str(raw, format) {
            return Ok(PrimitiveValue::Text(
                parsed.with_timezone(&Utc).to_rfc3339(),
            ));
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(PrimitiveValue::Text(parsed.and_utc().to_rfc3339()));
        }
    }
    Err(format!("invalid timestamp {raw:?}"))
}

/// Convert PostgreSQL interval text (`1 day 02:03:04`) into an ISO-8601
/// duration (`P1DT2H3M4S`).
fn parse_interval(raw: &str) -> Result<PrimitiveValue, String> {
    let mut years = 0i64;
    let mut months = 0i64;
    let mut days = 0i64;
    let mut hours = 0i64;
    let mut minutes = 0i64;
    let mut seconds = 0f64;

    let mut words = raw.split_whitespace().peekable();
    while let Some(word) = words.next() {
        if word.contains(':') {
            let negative = word.starts_with('-');
            let clock = word.trim_start_matches('-');
            let parts: Vec<&str> = clock.split(':').collect();
            if parts.len() != 3 {
                return Err(format!("invalid interval clock part {word:?}"));
            }
            hours = parts[0].parse().map_err(|_| format!("invalid interval {raw:?}"))?;
            minutes = parts[1].parse().map_err(|_| format!("invalid interval {raw:?}"))?;
            seconds = parts[2].parse().map_err(|_| format!("invalid interval {raw:?}"))?;
            if negative {
                hours = -hours;
                minutes = -minutes;
                seconds = -seconds;
            }
            continue;
        }

        let amount: i64 = word
            .parse()
            .map_err(|_| format!("invalid interval {raw:?}"))?;
        let unit = words
            .next()
            .ok_or_else(|| format!("interval amount {word} has no unit"))?;
        match unit.trim_end_matches('s') {
            "year" => years = amount,
            "mon" | "month" => months = amount,
            "day" => days = amount,
            other => return Err(format!("unknown interval unit {other:?}")),
        }
    }

    let mut out = String::from("P");
    if years != 0 {
        out.push_str(&format!("{years}Y"));
    }
    if months != 0 {
        out.push_str(&format!("{months}M"));
    }
    if days != 0 {
        out.push_str(&format!("{days}D"));
    }
    if hours != 0 || minutes != 0 || seconds != 0.0 {
        out.push('T');
        if hours != 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes != 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if seconds != 0.0 {
            if seconds.fract() == 0.0 {
                out.push_str(&format!("{}S", seconds as i64));
            } else {
                out.push_str(&format!("{seconds}S"));
            }
        }
    }
    if out == "P" {
        out.push_str("T0S");
    }
    Ok(PrimitiveValue::Text(out))
}

/// Parse a PostgreSQL array literal (`{a,b,NULL,"c,d"}`), applying the
/// element parser to each member.
fn parse_array(raw: &str, element: Option<&TypeParser>) -> Result<PrimitiveValue, String> {
    let inner = raw
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| format!("invalid array literal {raw:?}"))?;

    let mut members = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = inner.chars().peekable();
    let mut any = false;
    let mut quoted = false;

    while let Some(ch) = chars.next() {
        match ch {
            '"' if !in_quotes => {
                in_quotes = true;
                quoted = true;
                any = true;
            }
            '"' if in_quotes => in_quotes = false,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ',' if !in_quotes => {
                members.push(finish_element(&mut current, quoted, element)?);
                quoted = false;
                any = true;
            }
            _ => {
                current.push(ch);
                any = true;
            }
        }
    }
    if any {
        members.push(finish_element(&mut current, quoted, element)?);
    }
    Ok(PrimitiveValue::Array(members))
}

fn finish_element(
    current: &mut String,
    quoted: bool,
    element: Option<&TypeParser>,
) -> Result<PrimitiveValue, String> {
    let text = std::mem::take(current);
    if !quoted && text == "NULL" {
        return Ok(PrimitiveValue::Null);
    }
    match element {
        Some(parser) => (parser.parse)(&text),
        None => Ok(PrimitiveValue::Text(text)),
    }
}
