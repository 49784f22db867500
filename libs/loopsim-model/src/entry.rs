//! Timestamped data and error entries
//!
//! A [`DataEntry`] is a single command or reading for one channel; an
//! [`ErrorEntry`] reports a fault from any component. Both travel inside
//! framed packets (see [`crate::packet`]) and carry absolute timestamps
//! as floating-point seconds since the Unix epoch.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Current time as floating-point seconds since the Unix epoch.
///
/// Millisecond precision survives the wire format, so timestamps are
/// taken from `chrono` at microsecond granularity and carried as f64.
pub fn epoch_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Signal direction of a channel or entry.
///
/// `In` is the node-local indicator light; the master may list it in its
/// catalog but commands against it are refused by the node executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Analog output (4-20 mA transmitter)
    Ao,
    /// Analog input (4-20 mA receiver)
    Ai,
    /// Digital output (relay)
    Do,
    /// Digital input
    Di,
    /// Indicator light (node-local)
    In,
}

impl SignalKind {
    /// True for directions the node drives (AO/DO).
    ///
    /// Output entries are re-queued by the transport worker after a
    /// failed exchange; input polls are simply re-issued by the next
    /// poll tick.
    pub fn is_output(self) -> bool {
        matches!(self, SignalKind::Ao | SignalKind::Do)
    }

    /// True for directions the node samples (AI/DI).
    pub fn is_input(self) -> bool {
        matches!(self, SignalKind::Ai | SignalKind::Di)
    }

    /// True for analog directions.
    pub fn is_analog(self) -> bool {
        matches!(self, SignalKind::Ao | SignalKind::Ai)
    }

    /// Wire tag, e.g. `"ao"`.
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Ao => "ao",
            SignalKind::Ai => "ai",
            SignalKind::Do => "do",
            SignalKind::Di => "di",
            SignalKind::In => "in",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value carried by a data entry: a number, or the negative-ACK sentinel
/// the node echoes when a command was refused or failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntryValue {
    Number(f64),
    Nak,
}

impl EntryValue {
    /// Numeric value, if this is not a NAK.
    pub fn as_number(self) -> Option<f64> {
        match self {
            EntryValue::Number(v) => Some(v),
            EntryValue::Nak => None,
        }
    }

    pub fn is_nak(self) -> bool {
        matches!(self, EntryValue::Nak)
    }
}

impl From<f64> for EntryValue {
    fn from(v: f64) -> Self {
        EntryValue::Number(v)
    }
}

impl Serialize for EntryValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EntryValue::Number(v) => serializer.serialize_f64(*v),
            EntryValue::Nak => serializer.serialize_str("NAK"),
        }
    }
}

impl<'de> Deserialize<'de> for EntryValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(v) => Ok(EntryValue::Number(v)),
            Raw::Text(s) if s == "NAK" => Ok(EntryValue::Nak),
            Raw::Text(s) => Err(serde::de::Error::custom(format!(
                "expected a number or \"NAK\" as entry value, got \"{s}\""
            ))),
        }
    }
}

/// A single timestamped command or reading for one channel.
///
/// Field names on the wire are fixed by deployed peers: `chType`,
/// `gpio_str`, `val`, `time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEntry {
    #[serde(rename = "chType")]
    pub kind: SignalKind,
    #[serde(rename = "gpio_str")]
    pub pin: String,
    #[serde(rename = "val")]
    pub value: EntryValue,
    /// Absolute due time (command) or sample time (reading), seconds
    /// since epoch.
    pub time: f64,
}

impl DataEntry {
    pub fn new(kind: SignalKind, pin: impl Into<String>, value: impl Into<EntryValue>, time: f64) -> Self {
        Self {
            kind,
            pin: pin.into(),
            value: value.into(),
            time,
        }
    }

    /// Entry stamped with the current time.
    pub fn stamped_now(kind: SignalKind, pin: impl Into<String>, value: impl Into<EntryValue>) -> Self {
        Self::new(kind, pin, value, epoch_now())
    }
}

impl PartialOrd for DataEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.time.total_cmp(&other.time))
    }
}

/// Fault severity, as reported upstream to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "high")]
    High,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "null")]
    None,
}

/// A fault report from any component. Flows only upstream (node ->
/// master -> operator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub source: String,
    #[serde(rename = "criticalityLevel")]
    pub severity: Severity,
    pub description: String,
    pub time: f64,
}

impl ErrorEntry {
    /// Build an error entry stamped now. Free-form `source` and
    /// `description` are sanitized for embedding in the wire payload.
    pub fn new(source: impl AsRef<str>, severity: Severity, description: impl AsRef<str>) -> Self {
        Self {
            source: sanitize_free_text(source.as_ref()),
            severity,
            description: sanitize_free_text(description.as_ref()),
            time: epoch_now(),
        }
    }
}

/// Clean a free-form string for JSON embedding: strip trailing commas,
/// then replace double quotes with backticks.
///
/// Deployed peers reject payloads where fault text from foreign code
/// (driver messages, OS errors) injects quotes or dangling commas, so
/// the cleanup is applied at entry construction rather than trusting
/// every producer.
pub fn sanitize_free_text(s: &str) -> String {
    let trimmed = s.trim_end_matches(',');
    trimmed.replace('"', "`")
}
