//! Decoded packets as produced by a protocol adapter
//!
//! A packet is a header naming the anchor that relayed it plus a payload
//! discriminated by its kind name. Only time-of-flight reports are given a
//! typed body here; every other kind is kept as its named field map so it
//! can be surfaced to observers untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::device::{AnchorId, TagId};

/// Payload kind name of a time-of-flight report
pub const TOF_REPORT: &str = "Tof Report";

/// Speed of light in meters per picosecond
const METERS_PER_PICOSECOND: f64 = 299_792_458.0e-12;

/// Decoded unit handed to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Payload,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: Payload) -> Self {
        Self { header, payload }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Anchor that relayed the packet
    pub anchor_id: AnchorId,
    /// Link-level sequence number, if the protocol carries one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u32>,
}

impl PacketHeader {
    pub fn new(anchor_id: impl Into<AnchorId>) -> Self {
        Self {
            anchor_id: anchor_id.into(),
            sequence: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Ranging data between the relaying anchor and a tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TofReport {
    pub tag_id: TagId,
    /// Ranging exchange sequence number
    pub sequence: u32,
    /// Measured one-way time of flight in picoseconds
    pub tof_ps: u64,
}

impl TofReport {
    /// Range implied by the time of flight, in meters
    pub fn distance_m(&self) -> f64 {
        self.tof_ps as f64 * METERS_PER_PICOSECOND
    }
}

/// Packet payload, discriminated by kind name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPayload", into = "RawPayload")]
pub enum Payload {
    /// "Tof Report"
    TofReport(TofReport),
    /// Any other kind, kept as its field map
    Other { name: String, fields: Map<String, Value> },
}

impl Payload {
    /// Kind name as it appears on the wire
    pub fn name(&self) -> &str {
        match self {
            Payload::TofReport(_) => TOF_REPORT,
            Payload::Other { name, .. } => name,
        }
    }

    pub fn as_tof_report(&self) -> Option<&TofReport> {
        match self {
            Payload::TofReport(report) => Some(report),
            Payload::Other { .. } => None,
        }
    }
}

/// Serialized form: the kind name next to the kind-specific fields
#[derive(Clone, Serialize, Deserialize)]
struct RawPayload {
    name: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl TryFrom<RawPayload> for Payload {
    type Error = serde_json::Error;

    fn try_from(raw: RawPayload) -> Result<Self, Self::Error> {
        if raw.name == TOF_REPORT {
            let report = serde_json::from_value(Value::Object(raw.fields))?;
            Ok(Payload::TofReport(report))
        } else {
            Ok(Payload::Other {
                name: raw.name,
                fields: raw.fields,
            })
        }
    }
}

impl From<Payload> for RawPayload {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::TofReport(report) => {
                let fields = match serde_json::to_value(report) {
                    Ok(Value::Object(fields)) => fields,
                    _ => Map::new(),
                };
                RawPayload {
                    name: TOF_REPORT.to_string(),
                    fields,
                }
            }
            Payload::Other { name, fields } => RawPayload { name, fields },
        }
    }
}
