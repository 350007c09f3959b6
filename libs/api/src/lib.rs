pub mod error;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use error::{StoreError, StreamError, ValidationError};

// ════════════════════════════════════════════════════════════════
//  Stream Types
// ════════════════════════════════════════════════════════════════

/// Opaque entry identifier, strictly increasing per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flexible-typed key/value payload of a stream entry. Producers write
/// numbers or numeric strings interchangeably; consumers coerce.
pub type EntryFields = BTreeMap<String, serde_json::Value>;

/// One record in the durable stream. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: EntryFields,
}

// ════════════════════════════════════════════════════════════════
//  Position Report
// ════════════════════════════════════════════════════════════════

/// A validated vehicle position, decoded from the flexible-typed
/// fields of a stream entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionReport {
    pub bus_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Unix epoch seconds.
    pub timestamp: i64,
    pub speed_kph: f64,
    pub heading: f64,
}

impl PositionReport {
    /// Decode entry fields into a typed report.
    ///
    /// `busId` must be a non-empty string; `lat`, `lon`, `speed` and `ts`
    /// coerce from numbers or numeric strings. `heading` is tolerated
    /// missing or malformed and defaults to 0.0.
    pub fn decode(fields: &EntryFields) -> Result<Self, ValidationError> {
        let bus_id = match fields.get("busId").and_then(|v| v.as_str()) {
            Some(s) if !s.is_empty() => s.to_string(),
            Some(_) | None => return Err(ValidationError::MissingField("busId")),
        };
        Ok(Self {
            bus_id,
            latitude: coerce_f64("lat", fields.get("lat"))?,
            longitude: coerce_f64("lon", fields.get("lon"))?,
            timestamp: coerce_i64("ts", fields.get("ts"))?,
            speed_kph: coerce_f64("speed", fields.get("speed"))?,
            heading: coerce_f64("heading", fields.get("heading")).unwrap_or(0.0),
        })
    }
}

/// Confirmed-event wire payload, relayed to live subscribers after a
/// report has been persisted. Ephemeral; never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedEvent {
    #[serde(rename = "msgId")]
    pub msg_id: String,
    #[serde(rename = "busId")]
    pub bus_id: String,
    pub lat: f64,
    pub lon: f64,
    pub ts: i64,
    pub speed: f64,
    pub heading: f64,
}

impl ConfirmedEvent {
    pub fn from_report(msg_id: String, report: &PositionReport) -> Self {
        Self {
            msg_id,
            bus_id: report.bus_id.clone(),
            lat: report.latitude,
            lon: report.longitude,
            ts: report.timestamp,
            speed: report.speed_kph,
            heading: report.heading,
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  Field Coercion
// ════════════════════════════════════════════════════════════════

/// Coerce a field to f64: JSON number, or a string parsing as one.
pub fn coerce_f64(
    field: &'static str,
    value: Option<&serde_json::Value>,
) -> Result<f64, ValidationError> {
    let value = value.ok_or(ValidationError::MissingField(field))?;
    match value {
        serde_json::Value::Number(n) => n.as_f64().ok_or_else(|| bad(field, "a number", value)),
        serde_json::Value::String(s) => {
            s.parse::<f64>().map_err(|_| bad(field, "a number", value))
        }
        _ => Err(bad(field, "a number", value)),
    }
}

/// Coerce a field to i64: JSON integer, or a string parsing as one.
pub fn coerce_i64(
    field: &'static str,
    value: Option<&serde_json::Value>,
) -> Result<i64, ValidationError> {
    let value = value.ok_or(ValidationError::MissingField(field))?;
    match value {
        serde_json::Value::Number(n) => n.as_i64().ok_or_else(|| bad(field, "an integer", value)),
        serde_json::Value::String(s) => {
            s.parse::<i64>().map_err(|_| bad(field, "an integer", value))
        }
        _ => Err(bad(field, "an integer", value)),
    }
}

fn bad(field: &'static str, expected: &'static str, got: &serde_json::Value) -> ValidationError {
    ValidationError::BadField {
        field,
        expected,
        got: got.to_string(),
    }
}

// ════════════════════════════════════════════════════════════════
//  Port Traits
// ════════════════════════════════════════════════════════════════

/// Durable append-only stream with consumer-group checkpointing.
///
/// Delivery guarantee is at-least-once: an entry handed to a consumer
/// stays in the group's pending set until acknowledged. The stream
/// itself serializes claim and ack per entry; callers never need
/// external locking.
pub trait PositionStream: Send + Sync {
    /// Append an entry. Assigns a strictly increasing id.
    fn append(
        &self,
        fields: EntryFields,
    ) -> Pin<Box<dyn Future<Output = Result<EntryId, StreamError>> + Send + '_>>;

    /// Create a consumer group positioned at the current end of the
    /// stream. Creating a group that already exists is a no-op.
    fn create_group(
        &self,
        group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send + '_>>;

    /// Read entries never before delivered to any consumer in the group,
    /// up to `max_count`. Blocks up to `block` waiting for new entries;
    /// an empty batch (not an error) signals the timeout.
    fn read_group(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StreamEntry>, StreamError>> + Send + '_>>;

    /// Remove an entry from the group's pending set. Idempotent: acking
    /// an unknown or already-acked id succeeds.
    fn ack(
        &self,
        group: &str,
        id: EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send + '_>>;
}

/// Persistence port consumed by the ingestion worker. The storage
/// engine behind it is a swappable collaborator.
pub trait PositionStore: Send + Sync {
    fn insert_position(
        &self,
        bus_id: &str,
        ts: i64,
        lat: f64,
        lon: f64,
        speed_kph: f64,
        raw_fields: &EntryFields,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Startup reachability check.
    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;
}

// ════════════════════════════════════════════════════════════════
//  Utilities
// ════════════════════════════════════════════════════════════════

/// Current Unix time in seconds.
pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
