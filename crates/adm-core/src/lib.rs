use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::ser::Formatter;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use std::fmt;
use std::io;
use std::str::FromStr;

pub mod stream_ipc;

pub const DEFAULT_EVENT_VERSION: &str = "1.0";

/// Pipeline stage markers carried in `event_type`.
///
/// Producers may be newer than this client, so unknown markers are kept
/// verbatim in `Other` instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    PlanRequested,
    PlanCreated,
    PlanRevisionSuggested,
    TaskAssigned,
    CodeGenerated,
    PrRequested,
    PrCreated,
    PrPendingApproval,
    PrHumanApproved,
    PrHumanRejected,
    MemoryStore,
    MemoryQuery,
    QaPassed,
    QaFailed,
    SecurityApproved,
    SecurityBlocked,
    PipelineConclusion,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::PlanRequested => "plan.requested",
            EventType::PlanCreated => "plan.created",
            EventType::PlanRevisionSuggested => "plan.revision_suggested",
            EventType::TaskAssigned => "task.assigned",
            EventType::CodeGenerated => "code.generated",
            EventType::PrRequested => "pr.requested",
            EventType::PrCreated => "pr.created",
            EventType::PrPendingApproval => "pr.pending_approval",
            EventType::PrHumanApproved => "pr.human_approved",
            EventType::PrHumanRejected => "pr.human_rejected",
            EventType::MemoryStore => "memory.store",
            EventType::MemoryQuery => "memory.query",
            EventType::QaPassed => "qa.passed",
            EventType::QaFailed => "qa.failed",
            EventType::SecurityApproved => "security.approved",
            EventType::SecurityBlocked => "security.blocked",
            EventType::PipelineConclusion => "pipeline.conclusion",
            EventType::Other(raw) => raw.as_str(),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventType::Other(_))
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "plan.requested" => EventType::PlanRequested,
            "plan.created" => EventType::PlanCreated,
            "plan.revision_suggested" => EventType::PlanRevisionSuggested,
            "task.assigned" => EventType::TaskAssigned,
            "code.generated" => EventType::CodeGenerated,
            "pr.requested" => EventType::PrRequested,
            "pr.created" => EventType::PrCreated,
            "pr.pending_approval" => EventType::PrPendingApproval,
            "pr.human_approved" => EventType::PrHumanApproved,
            "pr.human_rejected" => EventType::PrHumanRejected,
            "memory.store" => EventType::MemoryStore,
            "memory.query" => EventType::MemoryQuery,
            "qa.passed" => EventType::QaPassed,
            "qa.failed" => EventType::QaFailed,
            "security.approved" => EventType::SecurityApproved,
            "security.blocked" => EventType::SecurityBlocked,
            "pipeline.conclusion" => EventType::PipelineConclusion,
            _ => EventType::Other(value),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        match value {
            EventType::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Infallible;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(EventType::from(input.trim().to_string()))
    }
}

/// One occurrence in the monitored pipeline, as broadcast by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event_id: String,
    pub event_type: EventType,
    #[serde(default = "default_version")]
    pub version: String,
    pub timestamp: String,
    pub producer: String,
    #[serde(default)]
    pub idempotency_key: String,
    #[serde(default, deserialize_with = "deserialize_object")]
    pub payload: Map<String, Value>,
}

impl StreamEvent {
    /// Non-empty string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }
}

/// Backlog row as served from the memory service event log. Only the id and
/// type are guaranteed; everything else is filled in by [`StreamEvent::from`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub event_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub producer: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default, deserialize_with = "deserialize_object")]
    pub payload: Map<String, Value>,
}

impl From<HistoryRecord> for StreamEvent {
    fn from(record: HistoryRecord) -> Self {
        let idempotency_key = match record.idempotency_key {
            Some(key) if !key.is_empty() => key,
            _ => derive_idempotency_key(&record.event_type, &record.payload),
        };
        StreamEvent {
            event_id: record.event_id,
            event_type: record.event_type,
            version: record
                .version
                .filter(|version| !version.is_empty())
                .unwrap_or_else(default_version),
            timestamp: record.timestamp.or(record.created_at).unwrap_or_default(),
            producer: record.producer,
            idempotency_key,
            payload: record.payload,
        }
    }
}

/// A pending human decision on a pull request that passed the security gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub plan_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub branch_name: String,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub files_count: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub security_reasoning: String,
    #[serde(default, deserialize_with = "deserialize_object")]
    pub pr_context: Map<String, Value>,
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub reviewer: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Connecting
    }
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "connecting" => Ok(ConnectionStatus::Connecting),
            "connected" => Ok(ConnectionStatus::Connected),
            "disconnected" => Ok(ConnectionStatus::Disconnected),
            other => Err(format!("Unknown connection status: {other}")),
        }
    }
}

/// Same derivation producers use when they publish without an explicit key:
/// `sha256("{event_type}:{sha256(canonical payload)}")`.
pub fn derive_idempotency_key(event_type: &EventType, payload: &Map<String, Value>) -> String {
    let canonical = canonicalize_value(Value::Object(payload.clone()));
    let payload_hash = sha256_hex(hash_json(&canonical).as_bytes());
    sha256_hex(format!("{}:{payload_hash}", event_type.as_str()).as_bytes())
}

/// Accepts RFC 3339 and the offset-less ISO-8601 form some rows carry (read as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn default_version() -> String {
    DEFAULT_EVENT_VERSION.to_string()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn canonicalize_value(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));

            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize_value(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize_value).collect()),
        other => other,
    }
}

/// Renders `{"key": value, "list": [1, 2]}` with non-ASCII escaped, the
/// layout producers hash when they derive keys.
fn hash_json(value: &Value) -> String {
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, HashFormatter);
    if value.serialize(&mut serializer).is_err() {
        return value.to_string();
    }
    String::from_utf8(out).unwrap_or_default()
}

struct HashFormatter;

impl Formatter for HashFormatter {
    fn write_f64<W>(&mut self, writer: &mut W, value: f64) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(shortest_float_repr(value).as_bytes())
    }

    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut units = [0u16; 2];
        for ch in fragment.chars() {
            if ch == '\x7f' {
                writer.write_all(b"\\u007f")?;
            } else if ch.is_ascii() {
                writer.write_all(&[ch as u8])?;
            } else {
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

/// Shortest round-trip digits, positional for decimal exponents in
/// `-4..16`, otherwise `1.5e-07` style with a signed two-digit exponent.
fn shortest_float_repr(value: f64) -> String {
    let scientific = format!("{value:e}");
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return scientific;
    };
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };
    let point = exponent + 1;
    if point <= -4 || point > 16 {
        let exponent_sign = if exponent < 0 { '-' } else { '+' };
        return format!("{sign}{mantissa}e{exponent_sign}{:02}", exponent.unsigned_abs());
    }

    let digits: String = mantissa.chars().filter(|ch| *ch != '.').collect();
    if point <= 0 {
        let zeros = "0".repeat(point.unsigned_abs() as usize);
        return format!("{sign}0.{zeros}{digits}");
    }
    let point = point as usize;
    if digits.len() <= point {
        let zeros = "0".repeat(point - digits.len());
        format!("{sign}{digits}{zeros}.0")
    } else {
        format!("{sign}{}.{}", &digits[..point], &digits[point..])
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Payload maps may arrive as `null` from older producers.
fn deserialize_object<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(serde::de::Error::custom("expected object or null")),
    }
}

/// Deserialize a count that can be either a string or a number into a u64
fn deserialize_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom("invalid count")),
        Value::String(s) => s.trim().parse::<u64>().map_err(serde::de::Error::custom),
        Value::Null => Ok(0),
        _ => Err(serde::de::Error::custom("expected string or number for count")),
    }
}
