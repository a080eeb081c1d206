//! Event schema shared by every producer, the dispatcher and the event log.
//!
//! An [`Event`] is one protocol callback captured as data: which callback
//! ([`Method`]), who produced it, when, and its positional arguments. Each
//! method has a fixed argument schema; events can only be built through
//! constructors that check the fields against it.
use crate::error::RecordError;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Error code the broker sends when the connection to its gateway drops.
pub const DISCONNECT_CODE: i32 = 504;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    CurrentTime,
    UpdateAccountValue,
    NextValidId,
    HistoricalData,
    RealtimeBar,
    TickGeneric,
    TickPrice,
    TickSize,
    TickString,
    UpdateMktDepth,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    I32,
    I64,
    F64,
    Str,
}

/// One named positional argument of a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arg {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn arg(name: &'static str, kind: FieldKind) -> Arg {
    Arg { name, kind }
}

use FieldKind::{F64, I32, I64, Str};

static CURRENT_TIME: [Arg; 1] = [arg("time", I64)];
static UPDATE_ACCOUNT_VALUE: [Arg; 4] = [
    arg("key", Str),
    arg("value", Str),
    arg("currency", Str),
    arg("accountName", Str),
];
static NEXT_VALID_ID: [Arg; 1] = [arg("nextId", I32)];
static HISTORICAL_DATA: [Arg; 10] = [
    arg("tickerId", I32),
    arg("date", Str),
    arg("open", F64),
    arg("high", F64),
    arg("low", F64),
    arg("close", F64),
    arg("volume", I32),
    arg("count", I32),
    arg("wap", F64),
    arg("hasGaps", I32), // 0 or 1
];
static REALTIME_BAR: [Arg; 9] = [
    arg("tickerId", I32),
    arg("time", I64),
    arg("open", F64),
    arg("high", F64),
    arg("low", F64),
    arg("close", F64),
    arg("volume", I64),
    arg("wap", F64),
    arg("count", I32),
];
static TICK_GENERIC: [Arg; 3] = [arg("tickerId", I32), arg("tickType", I32), arg("value", F64)];
static TICK_PRICE: [Arg; 4] = [
    arg("tickerId", I32),
    arg("field", I32),
    arg("price", F64),
    arg("canAutoExecute", I32),
];
static TICK_SIZE: [Arg; 3] = [arg("tickerId", I32), arg("field", I32), arg("size", I32)];
static TICK_STRING: [Arg; 3] = [arg("tickerId", I32), arg("tickType", I32), arg("value", Str)];
static UPDATE_MKT_DEPTH: [Arg; 6] = [
    arg("tickerId", I32),
    arg("position", I32),
    arg("operation", I32),
    arg("side", I32),
    arg("price", F64),
    arg("size", I32),
];
static ERROR: [Arg; 3] = [arg("id", I32), arg("errorCode", I32), arg("errorString", Str)];

static BY_NAME: Lazy<HashMap<&'static str, Method>> =
    Lazy::new(|| Method::ALL.iter().map(|m| (m.name(), *m)).collect());

impl Method {
    pub const COUNT: usize = 11;

    pub const ALL: [Method; Method::COUNT] = [
        Method::CurrentTime,
        Method::UpdateAccountValue,
        Method::NextValidId,
        Method::HistoricalData,
        Method::RealtimeBar,
        Method::TickGeneric,
        Method::TickPrice,
        Method::TickSize,
        Method::TickString,
        Method::UpdateMktDepth,
        Method::Error,
    ];

    /// Callback name as the protocol spells it (used in CSV feeds).
    pub fn name(self) -> &'static str {
        match self {
            Method::CurrentTime => "currentTime",
            Method::UpdateAccountValue => "updateAccountValue",
            Method::NextValidId => "nextValidId",
            Method::HistoricalData => "historicalData",
            Method::RealtimeBar => "realtimeBar",
            Method::TickGeneric => "tickGeneric",
            Method::TickPrice => "tickPrice",
            Method::TickSize => "tickSize",
            Method::TickString => "tickString",
            Method::UpdateMktDepth => "updateMktDepth",
            Method::Error => "error",
        }
    }

    pub fn from_name(name: &str) -> Option<Method> {
        BY_NAME.get(name).copied()
    }

    pub fn schema(self) -> &'static [Arg] {
        match self {
            Method::CurrentTime => &CURRENT_TIME,
            Method::UpdateAccountValue => &UPDATE_ACCOUNT_VALUE,
            Method::NextValidId => &NEXT_VALID_ID,
            Method::HistoricalData => &HISTORICAL_DATA,
            Method::RealtimeBar => &REALTIME_BAR,
            Method::TickGeneric => &TICK_GENERIC,
            Method::TickPrice => &TICK_PRICE,
            Method::TickSize => &TICK_SIZE,
            Method::TickString => &TICK_STRING,
            Method::UpdateMktDepth => &UPDATE_MKT_DEPTH,
            Method::Error => &ERROR,
        }
    }

    /// Position of this method in [`Method::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::I32(_) => FieldKind::I32,
            FieldValue::I64(_) => FieldKind::I64,
            FieldValue::F64(_) => FieldKind::F64,
            FieldValue::Str(_) => FieldKind::Str,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            FieldValue::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Parse a textual column into a value of the given kind.
    ///
    /// Booleans written as `true`/`false` are accepted for `I32` columns.
    pub fn parse(kind: FieldKind, raw: &str) -> Result<FieldValue, RecordError> {
        let raw = raw.trim();
        let bad = || RecordError::BadField { value: raw.to_string(), kind };
        Ok(match kind {
            FieldKind::I32 => match raw {
                "true" => FieldValue::I32(1),
                "false" => FieldValue::I32(0),
                _ => FieldValue::I32(raw.parse().map_err(|_| bad())?),
            },
            FieldKind::I64 => FieldValue::I64(raw.parse().map_err(|_| bad())?),
            FieldKind::F64 => FieldValue::F64(raw.parse().map_err(|_| bad())?),
            FieldKind::Str => FieldValue::Str(raw.to_string()),
        })
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::I32(v) => write!(f, "{v}"),
            FieldValue::I64(v) => write!(f, "{v}"),
            FieldValue::F64(v) => write!(f, "{v}"),
            FieldValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::I32(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::I64(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::F64(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::I32(v as i32)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

/// A single captured callback. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    method: Method,
    source: String,
    timestamp_micros: i64,
    fields: Vec<FieldValue>,
}

impl Event {
    pub fn new(
        method: Method,
        source: impl Into<String>,
        timestamp_micros: i64,
        fields: Vec<FieldValue>,
    ) -> Result<Self, RecordError> {
        let event = Event { method, source: source.into(), timestamp_micros, fields };
        event.validate()?;
        Ok(event)
    }

    /// Build from fields already known to follow the method's schema.
    pub(crate) fn trusted(
        method: Method,
        source: &str,
        timestamp_micros: i64,
        fields: Vec<FieldValue>,
    ) -> Self {
        debug_assert!(check_fields(method, &fields).is_ok());
        Event { method, source: source.to_string(), timestamp_micros, fields }
    }

    /// Check the fields against the method schema. Decoded events are not
    /// trusted and go through this before use.
    pub fn validate(&self) -> Result<(), RecordError> {
        check_fields(self.method, &self.fields)
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn timestamp_micros(&self) -> i64 {
        self.timestamp_micros
    }

    pub fn fields(&self) -> &[FieldValue] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&FieldValue> {
        self.fields.get(index)
    }

    /// True for the broker's "connectivity lost" error callback.
    pub fn is_disconnect(&self) -> bool {
        self.method == Method::Error
            && self.field(1).and_then(FieldValue::as_i32) == Some(DISCONNECT_CODE)
    }

    /// Parse one feed line: `timestamp,method,arg1,arg2,...`.
    ///
    /// Returns `Ok(None)` for blank lines, `#` comments and methods this
    /// schema does not know about.
    pub fn from_csv(source: &str, line: &str) -> Result<Option<Event>, RecordError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let cols: Vec<&str> = line.split(',').collect();
        if cols.len() < 2 {
            return Err(RecordError::Truncated { line: line.to_string() });
        }
        let Some(method) = Method::from_name(cols[1].trim()) else {
            return Ok(None);
        };
        let timestamp = cols[0]
            .trim()
            .parse::<i64>()
            .map_err(|_| RecordError::BadField { value: cols[0].to_string(), kind: FieldKind::I64 })?;
        let schema = method.schema();
        let args = &cols[2..];
        if args.len() != schema.len() {
            return Err(RecordError::Arity { method, expected: schema.len(), got: args.len() });
        }
        let fields = schema
            .iter()
            .zip(args)
            .map(|(a, raw)| FieldValue::parse(a.kind, raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(Event::trusted(method, source, timestamp, fields)))
    }

    /// Inverse of [`Event::from_csv`].
    pub fn to_csv(&self) -> String {
        let mut out = format!("{},{}", self.timestamp_micros, self.method.name());
        for f in &self.fields {
            out.push(',');
            out.push_str(&f.to_string());
        }
        out
    }
}

fn check_fields(method: Method, fields: &[FieldValue]) -> Result<(), RecordError> {
    let schema = method.schema();
    if schema.len() != fields.len() {
        return Err(RecordError::Arity { method, expected: schema.len(), got: fields.len() });
    }
    for (index, (a, f)) in schema.iter().zip(fields).enumerate() {
        if a.kind != f.kind() {
            return Err(RecordError::Kind { method, index, expected: a.kind, got: f.kind() });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve_back_to_methods() {
        for m in Method::ALL {
            assert_eq!(Method::from_name(m.name()), Some(m));
            assert_eq!(Method::ALL[m.index()], m);
        }
        assert_eq!(Method::from_name("tickOptionComputation"), None);
    }

    #[test]
    fn new_rejects_schema_mismatch() {
        let err = Event::new(Method::TickSize, "t", 1, vec![1.into(), 2.into()]).unwrap_err();
        assert!(matches!(err, RecordError::Arity { expected: 3, got: 2, .. }));

        let err = Event::new(Method::TickSize, "t", 1, vec![1.into(), 2.into(), 3.5.into()]).unwrap_err();
        assert!(matches!(err, RecordError::Kind { index: 2, .. }));
    }

    #[test]
    fn csv_line_parses_by_schema() {
        let ev = Event::from_csv("feed.csv", "1262304000000000,tickPrice,100,1,20.5,1")
            .unwrap()
            .unwrap();
        assert_eq!(ev.method(), Method::TickPrice);
        assert_eq!(ev.source(), "feed.csv");
        assert_eq!(ev.timestamp_micros(), 1262304000000000);
        assert_eq!(ev.fields(), &[100.into(), 1.into(), 20.5.into(), 1.into()]);
        assert_eq!(ev.to_csv(), "1262304000000000,tickPrice,100,1,20.5,1");
    }

    #[test]
    fn csv_skips_comments_and_unknown_methods() {
        assert_eq!(Event::from_csv("f", "# header").unwrap(), None);
        assert_eq!(Event::from_csv("f", "   ").unwrap(), None);
        assert_eq!(Event::from_csv("f", "1,tickEFP,1,2").unwrap(), None);
        assert!(Event::from_csv("f", "1,tickSize,1,x,3").is_err());
        assert!(Event::from_csv("f", "oops").is_err());
    }

    #[test]
    fn csv_accepts_boolean_flags() {
        let line = "5,historicalData,7,20100104,1.0,2.0,0.5,1.5,100,10,1.2,true";
        let ev = Event::from_csv("f", line).unwrap().unwrap();
        assert_eq!(ev.field(9), Some(&FieldValue::I32(1)));
    }

    #[test]
    fn disconnect_sentinel() {
        let ev = Event::new(Method::Error, "t", 1, vec![(-1).into(), DISCONNECT_CODE.into(), "Not connected".into()]).unwrap();
        assert!(ev.is_disconnect());
        let ev = Event::new(Method::Error, "t", 1, vec![(-1).into(), 2104.into(), "farm ok".into()]).unwrap();
        assert!(!ev.is_disconnect());
    }
}
