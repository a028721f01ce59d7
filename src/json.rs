use std::collections::BTreeMap;

use serde::{de::IgnoredAny, Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

/// Chromium JSON trace, as written by clang `-ftime-trace` and the kram memory and perf tracers.
///
/// Format spec: <https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU>
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[allow(non_snake_case)]
pub struct TraceProfile {
    pub traceEvents: Vec<TraceEvent>,
    pub beginningOfTime: Option<i64>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TraceEvent {
    pub cat: Option<String>,
    pub pid: Option<i64>,
    pub tid: Option<i64>,
    pub ph: Option<Phase>,
    pub ts: Option<i64>,
    pub dur: Option<i64>,
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, ArgValue>,

    /// Index of the innermost enclosing event, filled in by hierarchy reconstruction.
    #[serde(skip)]
    #[serialize_always]
    pub parent: Option<usize>,
    /// Summed duration of same-named children, filled in by hierarchy reconstruction.
    #[serde(skip)]
    pub subtracted_duration: i64,
}

/// The `ph` tag of an event.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum Phase {
    /// `X`, an interval with both `ts` and `dur`.
    Complete,
    /// `M`, names a thread or process through `args.name`.
    Metadata,
    Other(String),
}

/// Primitive value in an event's `args` object.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Number(f64),
    String(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed trace JSON")]
    Malformed(#[source] serde_json::Error),

    #[error("JSON has no traceEvents array")]
    NotATrace,
}

/// Same shape as [TraceProfile], but lets a missing or null `traceEvents` through so we can tell
/// “not a trace” apart from “broken trace”.
#[derive(Deserialize)]
#[allow(non_snake_case)]
struct MaybeProfile {
    traceEvents: Option<Vec<TraceEvent>>,
    beginningOfTime: Option<i64>,
}

pub fn decode(bytes: &[u8]) -> Result<TraceProfile, DecodeError> {
    // Derived struct impls also accept a JSON array, so only let objects through.
    let first = bytes.iter().find(|b| !b.is_ascii_whitespace());
    if first != Some(&b'{') {
        return match serde_json::from_slice::<IgnoredAny>(bytes) {
            Ok(_) => Err(DecodeError::NotATrace),
            Err(error) => Err(DecodeError::Malformed(error)),
        };
    }

    match serde_json::from_slice::<MaybeProfile>(bytes) {
        Ok(MaybeProfile {
            traceEvents: Some(events),
            beginningOfTime,
        }) => Ok(TraceProfile {
            traceEvents: events,
            beginningOfTime,
        }),
        Ok(_) => Err(DecodeError::NotATrace),
        Err(error) if error.is_data() => {
            // Either an event failed to decode, or the JSON is fine but isn't shaped like a trace.
            match serde_json::from_slice::<Value>(bytes) {
                Ok(Value::Object(object))
                    if object.get("traceEvents").is_some_and(|v| !v.is_null()) =>
                {
                    Err(DecodeError::Malformed(error))
                }
                Ok(_) => Err(DecodeError::NotATrace),
                Err(_) => Err(DecodeError::Malformed(error)),
            }
        }
        Err(error) => Err(DecodeError::Malformed(error)),
    }
}

pub fn encode(profile: &TraceProfile) -> Vec<u8> {
    // Every field is a plain string, integer, finite float or bool, so this can't fail.
    serde_json::to_vec(profile).unwrap_or_default()
}

impl TraceEvent {
    pub fn is_complete(&self) -> bool {
        self.ph == Some(Phase::Complete)
    }

    pub fn is_metadata(&self) -> bool {
        self.ph == Some(Phase::Metadata)
    }

    /// `(start, end)` for `X` events that have both `ts` and `dur`, unless the end overflows.
    pub fn interval(&self) -> Option<(i64, i64)> {
        if !self.is_complete() {
            return None;
        }
        let (ts, dur) = self.ts.zip(self.dur)?;

        Some((ts, ts.checked_add(dur)?))
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name)
    }

    /// Duration minus the duration of same-named children.
    pub fn self_time(&self) -> i64 {
        self.dur.unwrap_or(0).saturating_sub(self.subtracted_duration)
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        match self.args.get(key) {
            Some(ArgValue::String(value)) => Some(value),
            _ => None,
        }
    }

    /// `thread_name` or `process_name` metadata event.
    pub fn metadata(name: &str, pid: i64, tid: Option<i64>, display_name: &str) -> Self {
        Self {
            cat: Some("__metadata".to_owned()),
            pid: Some(pid),
            tid,
            ph: Some(Phase::Metadata),
            name: Some(name.to_owned()),
            args: [(
                "name".to_owned(),
                ArgValue::String(display_name.to_owned()),
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        }
    }

    pub fn complete(name: String, pid: i64, tid: i64, ts: i64, dur: i64) -> Self {
        Self {
            pid: Some(pid),
            tid: Some(tid),
            ph: Some(Phase::Complete),
            ts: Some(ts),
            dur: Some(dur),
            name: Some(name),
            ..Default::default()
        }
    }
}

impl From<String> for Phase {
    fn from(value: String) -> Self {
        match &*value {
            "X" => Self::Complete,
            "M" => Self::Metadata,
            _ => Self::Other(value),
        }
    }
}

impl From<Phase> for String {
    fn from(value: Phase) -> Self {
        match value {
            Phase::Complete => "X".to_owned(),
            Phase::Metadata => "M".to_owned(),
            Phase::Other(other) => other,
        }
    }
}

impl Phase {
    pub fn as_str(&self) -> &str {
        match self {
            Phase::Complete => "X",
            Phase::Metadata => "M",
            Phase::Other(other) => other,
        }
    }
}

#[test]
fn test_decode_rejects_non_traces() {
    assert!(matches!(decode(b"{}"), Err(DecodeError::NotATrace)));
    assert!(matches!(
        decode(br#"{"traceEvents": null}"#),
        Err(DecodeError::NotATrace)
    ));
    assert!(matches!(decode(b"[1, 2]"), Err(DecodeError::NotATrace)));
    assert!(matches!(decode(b"[[], 5]"), Err(DecodeError::NotATrace)));
    assert!(matches!(decode(b" 42 "), Err(DecodeError::NotATrace)));
    assert!(matches!(decode(b"[[], "), Err(DecodeError::Malformed(_))));
    assert!(matches!(decode(b""), Err(DecodeError::Malformed(_))));
    assert!(matches!(decode(b"not json"), Err(DecodeError::Malformed(_))));
    assert!(matches!(
        decode(br#"{"traceEvents": [{"ts": "soon"}]}"#),
        Err(DecodeError::Malformed(_))
    ));
    assert!(matches!(
        decode(br#"{"traceEvents": [{"args": {"detail": {"nested": 1}}}]}"#),
        Err(DecodeError::Malformed(_))
    ));
}

#[test]
fn test_decode_event_fields() -> Result<(), DecodeError> {
    let profile = decode(
        br#"{"beginningOfTime": 1700000000, "otherData": {}, "traceEvents": [
            {"pid": 1, "tid": 2, "ph": "X", "ts": 10, "dur": 5, "name": "Source",
             "args": {"detail": "a.h", "count": 3, "hot": true}, "unknown": [1]},
            {"ph": "i", "name": "mark"}
        ]}"#,
    )?;
    assert_eq!(profile.beginningOfTime, Some(1700000000));
    let [source, mark] = &profile.traceEvents[..] else {
        panic!("Expected two events");
    };
    assert_eq!(source.interval(), Some((10, 15)));
    assert_eq!(source.cat, None);
    assert_eq!(source.arg_str("detail"), Some("a.h"));
    assert_eq!(source.args["count"], ArgValue::Number(3.0));
    assert_eq!(source.args["hot"], ArgValue::Bool(true));
    assert_eq!(mark.ph, Some(Phase::Other("i".to_owned())));
    assert_eq!(mark.interval(), None);

    Ok(())
}

#[test]
fn test_encode_omits_absent_fields() -> Result<(), DecodeError> {
    let bytes = br#"{"traceEvents":[{"tid":7,"ph":"M","name":"thread_name","args":{"name":"main"}},{"ph":"X","ts":0,"dur":3,"args":{"b":false,"n":1.5,"s":"x"}}]}"#;
    let profile = decode(bytes)?;
    let encoded = String::from_utf8(encode(&profile)).unwrap();
    assert_eq!(encoded, std::str::from_utf8(bytes).unwrap());
    assert!(!encoded.contains("null"));
    assert!(!encoded.contains("beginningOfTime"));

    Ok(())
}

#[test]
fn test_round_trip_is_idempotent() -> Result<(), DecodeError> {
    let bytes = br#"{"beginningOfTime": 5, "traceEvents": [
        {"cat": "c", "pid": 1, "tid": 1, "ph": "X", "ts": 0, "dur": 100, "name": "Source",
         "args": {"detail": "x.cpp", "avg ms": 12, "flag": true}},
        {"ph": "M", "pid": 1, "tid": 1, "name": "process_name", "args": {"name": "clang"}}
    ]}"#;
    let decoded = decode(bytes)?;
    assert_eq!(decode(&encode(&decoded))?, decoded);

    Ok(())
}

#[test]
fn test_overflowing_interval_is_skipped() -> Result<(), DecodeError> {
    let profile = decode(
        br#"{"traceEvents": [{"ph": "X", "tid": 1, "ts": 9223372036854775800, "dur": 100, "name": "a"}]}"#,
    )?;
    assert_eq!(profile.traceEvents[0].interval(), None);

    Ok(())
}
