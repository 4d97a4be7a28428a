//! The typing DSL.
//!
//! A typing leaf is a call expression `NAME(arg1,arg2,...)`. It is parsed
//! once into a [`Coercion`] and applied through a dispatch table keyed by
//! [`CoercionKind`].
//!
//! | Call | Result |
//! |------|--------|
//! | `DATE()` | ISO-8601 instant |
//! | `DATE_NEXT_DAY()` | next date carrying the leaf's day-of-month |
//! | `HOUR(raw, refPath)` | ISO-8601 instant from an hour token like `14h30` |
//! | `NUMBER()` | number, after `,` → `.` and stripping symbols |
//! | `STRING()` | string |
//! | `STRING_MAP_TO_STRING(a=x,...)` | looked-up string |
//! | `STRING_MAP_TO_STRING_CAMEL(...)` | looked-up string, camel-cased lookup |
//! | `STRING_MAP_TO_NUMBER(a=1,...)` | looked-up number |
//! | `STRING_MAP_TO_NUMBER_CAMEL(...)` | looked-up number, camel-cased lookup |
//!
//! Arguments are split on `,` and trimmed; surrounding quotes are stripped
//! and `null` or empty arguments are absent.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::TypingError;
use crate::path::get_path;
use crate::typer::TypingContext;

/// Closed set of coercions understood by the typer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoercionKind {
    Date,
    DateNextDay,
    Hour,
    Number,
    String,
    StringMapToString,
    StringMapToStringCamel,
    StringMapToNumber,
    StringMapToNumberCamel,
}

impl CoercionKind {
    pub fn from_name(name: &str) -> Option<CoercionKind> {
        Some(match name {
            "DATE" => CoercionKind::Date,
            "DATE_NEXT_DAY" => CoercionKind::DateNextDay,
            "HOUR" => CoercionKind::Hour,
            "NUMBER" => CoercionKind::Number,
            "STRING" => CoercionKind::String,
            "STRING_MAP_TO_STRING" => CoercionKind::StringMapToString,
            "STRING_MAP_TO_STRING_CAMEL" => CoercionKind::StringMapToStringCamel,
            "STRING_MAP_TO_NUMBER" => CoercionKind::StringMapToNumber,
            "STRING_MAP_TO_NUMBER_CAMEL" => CoercionKind::StringMapToNumberCamel,
            _ => return None,
        })
    }

    fn camel_lookup(self) -> bool {
        matches!(
            self,
            CoercionKind::StringMapToStringCamel | CoercionKind::StringMapToNumberCamel
        )
    }

    fn numeric_result(self) -> bool {
        matches!(
            self,
            CoercionKind::StringMapToNumber | CoercionKind::StringMapToNumberCamel
        )
    }
}

/// A parsed call expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Coercion {
    pub kind: CoercionKind,
    pub args: Vec<Option<String>>,
    /// The rule as written, for error messages.
    pub raw: String,
}

/// Why a call expression could not be parsed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error("expected NAME(arg,...)")]
    Malformed,

    #[error("unknown coercion '{0}'")]
    Unknown(String),

    #[error("{0}")]
    InvalidArguments(String),
}

impl CallError {
    /// Attach the schema path and the literal rule.
    pub fn at(self, path: &str, rule: &str) -> TypingError {
        match self {
            CallError::Unknown(_) => TypingError::UnknownCoercion {
                path: path.to_string(),
                rule: rule.to_string(),
            },
            other => TypingError::MalformedCall {
                path: path.to_string(),
                rule: rule.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl Coercion {
    /// Parse `NAME(arg1,arg2,...)`.
    pub fn parse(raw: &str) -> Result<Coercion, CallError> {
        let text = raw.trim();
        let open = text.find('(').ok_or(CallError::Malformed)?;
        if !text.ends_with(')') {
            return Err(CallError::Malformed);
        }
        let name = text[..open].trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
            return Err(CallError::Malformed);
        }
        let inner = &text[open + 1..text.len() - 1];
        if inner.contains(['(', ')']) {
            return Err(CallError::Malformed);
        }
        let kind = CoercionKind::from_name(name).ok_or_else(|| CallError::Unknown(name.into()))?;
        let args: Vec<Option<String>> = if inner.trim().is_empty() {
            Vec::new()
        } else {
            inner.split(',').map(parse_arg).collect()
        };

        let coercion = Coercion {
            kind,
            args,
            raw: text.to_string(),
        };
        coercion.check_arguments()?;
        Ok(coercion)
    }

    fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(|a| a.as_deref())
    }

    fn check_arguments(&self) -> Result<(), CallError> {
        match self.kind {
            CoercionKind::Date
            | CoercionKind::DateNextDay
            | CoercionKind::Number
            | CoercionKind::String => {
                if self.args.iter().any(Option::is_some) {
                    return Err(CallError::InvalidArguments("takes no arguments".into()));
                }
            }
            CoercionKind::Hour => {
                if self.args.len() > 2 {
                    return Err(CallError::InvalidArguments(
                        "takes at most (raw, refPath)".into(),
                    ));
                }
                if let Some(raw) = self.arg(0) {
                    parse_hour(raw).ok_or_else(|| {
                        CallError::InvalidArguments(format!("'{}' is not an hour", raw))
                    })?;
                }
            }
            _ => {
                let choices = self.choices()?;
                if choices.is_empty() {
                    return Err(CallError::InvalidArguments(
                        "expects at least one choice=value pair".into(),
                    ));
                }
                if self.kind.numeric_result() {
                    for (choice, value) in &choices {
                        parse_number(value).ok_or_else(|| {
                            CallError::InvalidArguments(format!(
                                "value for '{}' is not a number: '{}'",
                                choice, value
                            ))
                        })?;
                    }
                }
            }
        }
        Ok(())
    }

    /// `choice=value` pairs of a string-map coercion.
    fn choices(&self) -> Result<Vec<(&str, &str)>, CallError> {
        self.args
            .iter()
            .flatten()
            .map(|arg| {
                arg.split_once('=')
                    .map(|(c, v)| (c.trim(), v.trim()))
                    .ok_or_else(|| CallError::InvalidArguments(format!("'{}' is not choice=value", arg)))
            })
            .collect()
    }

    /// Apply this coercion to a scalar leaf.
    ///
    /// `siblings` is the parent object of the leaf in the mapped document,
    /// used by `HOUR` to resolve its reference path.
    pub fn apply(
        &self,
        value: &Value,
        siblings: Option<&Map<String, Value>>,
        ctx: &TypingContext,
    ) -> Result<Value, String> {
        let handler: CoercionFn = match self.kind {
            CoercionKind::Date => coerce_date,
            CoercionKind::DateNextDay => coerce_date_next_day,
            CoercionKind::Hour => coerce_hour,
            CoercionKind::Number => coerce_number,
            CoercionKind::String => coerce_string,
            CoercionKind::StringMapToString
            | CoercionKind::StringMapToStringCamel
            | CoercionKind::StringMapToNumber
            | CoercionKind::StringMapToNumberCamel => coerce_string_map,
        };
        handler(self, value, siblings, ctx)
    }
}

fn parse_arg(arg: &str) -> Option<String> {
    let trimmed = arg.trim();
    let unquoted = ['"', '\'']
        .iter()
        .find_map(|q| {
            trimmed
                .strip_prefix(*q)
                .and_then(|rest| rest.strip_suffix(*q))
        })
        .unwrap_or(trimmed);
    if unquoted.is_empty() || unquoted == "null" {
        None
    } else {
        Some(unquoted.to_string())
    }
}

type CoercionFn =
    fn(&Coercion, &Value, Option<&Map<String, Value>>, &TypingContext) -> Result<Value, String>;

fn coerce_date(
    _call: &Coercion,
    value: &Value,
    _siblings: Option<&Map<String, Value>>,
    _ctx: &TypingContext,
) -> Result<Value, String> {
    parse_datetime(value)
        .map(|dt| Value::String(iso(dt)))
        .ok_or_else(|| format!("{} is not a date", value))
}

fn coerce_date_next_day(
    _call: &Coercion,
    value: &Value,
    _siblings: Option<&Map<String, Value>>,
    ctx: &TypingContext,
) -> Result<Value, String> {
    let day = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
    .filter(|d| (1..=31).contains(d))
    .ok_or_else(|| format!("{} is not a day of month", value))? as u32;

    next_date_with_day(ctx.now.date_naive(), day)
        .map(|date| Value::String(iso(date.and_time(NaiveTime::MIN).and_utc())))
        .ok_or_else(|| format!("no upcoming date has day {}", day))
}

fn coerce_hour(
    call: &Coercion,
    value: &Value,
    siblings: Option<&Map<String, Value>>,
    ctx: &TypingContext,
) -> Result<Value, String> {
    let token = match call.arg(0) {
        Some(raw) => raw.to_string(),
        None => scalar_text(value),
    };
    let time = parse_hour(&token).ok_or_else(|| format!("'{}' is not an hour", token))?;

    let date = match call.arg(1) {
        Some(ref_path) => {
            let reference = siblings
                .and_then(|map| sibling(map, ref_path))
                .ok_or_else(|| format!("reference '{}' not found", ref_path))?;
            parse_datetime(reference)
                .ok_or_else(|| format!("reference '{}' is not a date: {}", ref_path, reference))?
                .date_naive()
        }
        None => ctx.now.date_naive(),
    };
    Ok(Value::String(iso(NaiveDateTime::new(date, time).and_utc())))
}

fn coerce_number(
    _call: &Coercion,
    value: &Value,
    _siblings: Option<&Map<String, Value>>,
    _ctx: &TypingContext,
) -> Result<Value, String> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::Bool(b) => Ok(Value::from(u8::from(*b))),
        Value::String(s) => parse_number(s).ok_or_else(|| format!("'{}' is not a number", s)),
        other => Err(format!("{} is not a number", other)),
    }
}

fn coerce_string(
    _call: &Coercion,
    value: &Value,
    _siblings: Option<&Map<String, Value>>,
    _ctx: &TypingContext,
) -> Result<Value, String> {
    Ok(Value::String(scalar_text(value)))
}

fn coerce_string_map(
    call: &Coercion,
    value: &Value,
    _siblings: Option<&Map<String, Value>>,
    _ctx: &TypingContext,
) -> Result<Value, String> {
    let text = scalar_text(value);
    let needle = if call.kind.camel_lookup() {
        camel_case(&text)
    } else {
        text.trim().to_string()
    };
    let choices = call.choices().map_err(|e| e.to_string())?;
    let (_, mapped) = choices
        .iter()
        .find(|(choice, _)| *choice == needle)
        .ok_or_else(|| format!("'{}' matches no choice", needle))?;

    if call.kind.numeric_result() {
        parse_number(mapped).ok_or_else(|| format!("'{}' is not a number", mapped))
    } else {
        Ok(Value::String((*mapped).to_string()))
    }
}

fn sibling<'a>(siblings: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, rest),
        None => (path, ""),
    };
    siblings.get(head).and_then(|v| get_path(v, rest))
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Format an instant the way every date coercion emits it.
pub fn iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a number from free text: `,` becomes `.`, and every character
/// other than digits, `.` and `-` is dropped.
///
/// Integral results are returned as JSON integers.
pub fn parse_number(text: &str) -> Option<Value> {
    let cleaned: String = text
        .replace(',', ".")
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    let n: f64 = cleaned.parse().ok()?;
    if !n.is_finite() {
        return None;
    }
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Some(Value::from(n as i64))
    } else {
        serde_json::Number::from_f64(n).map(Value::Number)
    }
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];

const MIN_TIMESTAMP_DIGITS: usize = 9;

/// Parse a calendar date or instant.
///
/// Accepts RFC 3339, naive `YYYY-MM-DD[ T]HH:MM[:SS]` (read as UTC),
/// `YYYY-MM-DD`, `DD/MM/YYYY`, and unix timestamps (seconds below 10^11,
/// milliseconds above). A string is read as a timestamp only when it has at
/// least nine integer digits. A dash date whose day overflows its month rolls into
/// the following month(s): `2024-02-30` is `2024-03-01`.
pub fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_timestamp),
        Value::String(s) => parse_datetime_str(s.trim()),
        _ => None,
    }
}

fn parse_datetime_str(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
            return Some(date.and_time(NaiveTime::MIN).and_utc());
        }
    }
    if let Some(date) = overflowing_date(text) {
        return Some(date.and_time(NaiveTime::MIN).and_utc());
    }
    if is_timestamp_text(text) {
        return text.parse::<f64>().ok().and_then(from_timestamp);
    }
    None
}

/// Seconds or milliseconds since the epoch, spelled out in full. Shorter
/// digit runs such as `20240101` are compact dates, not instants.
fn is_timestamp_text(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    let whole = digits.split('.').next().unwrap_or_default();
    whole.len() >= MIN_TIMESTAMP_DIGITS && whole.bytes().all(|b| b.is_ascii_digit())
}

fn from_timestamp(ts: f64) -> Option<DateTime<Utc>> {
    if !ts.is_finite() {
        return None;
    }
    let millis = if ts.abs() < 1.0e11 { ts * 1000.0 } else { ts };
    DateTime::from_timestamp_millis(millis as i64)
}

/// `YYYY-MM-DD` where `DD` exceeds the month length: day `DD` counted from
/// the first of the month.
fn overflowing_date(text: &str) -> Option<NaiveDate> {
    let mut parts = text.split('-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || day == 0 {
        return None;
    }
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    if day <= u64::from(days_in_month(start)?) {
        return None;
    }
    start.checked_add_days(Days::new(day - 1))
}

fn days_in_month(first: NaiveDate) -> Option<u32> {
    let (y, m) = if first.month() == 12 {
        (first.year() + 1, 1)
    } else {
        (first.year(), first.month() + 1)
    };
    let next = NaiveDate::from_ymd_opt(y, m, 1)?;
    u32::try_from((next - first).num_days()).ok()
}

/// The nearest date on or after `today` whose day-of-month is `day`.
fn next_date_with_day(today: NaiveDate, day: u32) -> Option<NaiveDate> {
    let base = today.year() * 12 + today.month0() as i32;
    (0..=12).find_map(|offset| {
        let total = base + offset;
        let date = NaiveDate::from_ymd_opt(total.div_euclid(12), total.rem_euclid(12) as u32 + 1, day)?;
        (date >= today).then_some(date)
    })
}

/// Parse hour tokens such as `14h30`, `9h`, `14h30s15` or `14:30`.
pub fn parse_hour(token: &str) -> Option<NaiveTime> {
    let parts: Vec<&str> = token
        .trim()
        .split(|c: char| matches!(c, 'h' | 'H' | 's' | 'S' | ':'))
        .map(str::trim)
        .collect();
    if parts.len() > 3 || parts[0].is_empty() {
        return None;
    }
    let field = |i: usize| -> Option<u32> {
        match parts.get(i) {
            None => Some(0),
            Some(p) if p.is_empty() => Some(0),
            Some(p) => p.parse().ok(),
        }
    };
    NaiveTime::from_hms_opt(field(0)?, field(1)?, field(2)?)
}

/// `"Open now"`, `"OPEN_NOW"` and `"openNow"` all become `openNow`.
pub fn camel_case(text: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in text.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }

    let mut out = String::new();
    for (i, word) in words.iter().enumerate() {
        let lower = word.to_lowercase();
        if i == 0 {
            out.push_str(&lower);
        } else {
            let mut chars = lower.chars();
            if let Some(first) = chars.next() {
                out.extend(first.to_uppercase());
                out.push_str(chars.as_str());
            }
        }
    }
    out
}
