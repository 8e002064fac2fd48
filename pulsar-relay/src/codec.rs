//! Line codec for the positioning device and the envelope pushed to subscribers.
//!
//! The device prints one JSON object per line, interleaved with free-form
//! debug output. Only lines that open with `{` are treated as data; anything
//! else is dropped without complaint.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Envelope tag for decoded position samples.
pub const POSITION_UPDATE: &str = "position_update";

/// One decoded telemetry reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: i64,
    pub position: Position,
    pub wifi: BTreeMap<String, Beacon>,
    pub ble: BTreeMap<String, Beacon>,
    pub fusion: Fusion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub accuracy: f64,
}

/// Ranging result for a single beacon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub rssi: i32,
    pub distance: f64,
    pub found: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fusion {
    pub wifi_weight: f64,
    pub ble_weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub temperature: f64,
    pub humidity: f64,
}

/// The unit of delivery: a tagged payload plus the time it was handed to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: T,
    pub timestamp: i64,
}

impl Envelope<Sample> {
    /// Wraps a sample, stamping the delivery time from the wall clock.
    ///
    /// The delivery timestamp never precedes the sample's own timestamp, even
    /// when the device clock runs ahead of ours.
    pub fn position_update(sample: Sample) -> Self {
        let timestamp = now_millis().max(sample.timestamp);
        Self {
            kind: POSITION_UPDATE.to_string(),
            data: sample,
            timestamp,
        }
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        encode_envelope(&self.kind, &self.data, self.timestamp)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("line is not a data frame")]
    NotData,
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
#[error("failed to encode envelope: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Returns true when the trimmed line carries a JSON object.
pub fn is_data_line(line: &str) -> bool {
    line.trim_start().starts_with('{')
}

pub fn decode(line: &str) -> Result<Sample, DecodeError> {
    let line = line.trim();
    if !is_data_line(line) {
        return Err(DecodeError::NotData);
    }
    Ok(serde_json::from_str(line)?)
}

pub fn encode_envelope<T: Serialize>(
    kind: &str,
    payload: &T,
    delivered_at: i64,
) -> Result<Bytes, EncodeError> {
    #[derive(Serialize)]
    struct Wire<'a, T> {
        #[serde(rename = "type")]
        kind: &'a str,
        data: &'a T,
        timestamp: i64,
    }

    let encoded = serde_json::to_vec(&Wire {
        kind,
        data: payload,
        timestamp: delivered_at,
    })?;
    Ok(Bytes::from(encoded))
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
