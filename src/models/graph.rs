// Data models for the calculator graph: timestamps, packets, side packets and status errors

use crate::models::frame::ImageFrame;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// ==============================================================================
// Timestamps
// ==============================================================================

/// Packet timestamp in microseconds since the session stopwatch started
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn micros(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

// ==============================================================================
// Packets
// ==============================================================================

/// Payload carried by a packet or a side packet
#[derive(Debug, Clone, PartialEq)]
pub enum PacketData {
    Image(ImageFrame),
    Int(i64),
    Bool(bool),
    Float(f64),
    Text(String),
}

impl PacketData {
    pub fn type_name(&self) -> &'static str {
        match self {
            PacketData::Image(_) => "ImageFrame",
            PacketData::Int(_) => "int",
            PacketData::Bool(_) => "bool",
            PacketData::Float(_) => "float",
            PacketData::Text(_) => "string",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PacketData::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PacketData::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// Immutable timestamped payload flowing along a stream.
///
/// Cloning a packet shares the payload.
#[derive(Debug, Clone)]
pub struct Packet {
    data: Arc<PacketData>,
    timestamp: Timestamp,
}

impl Packet {
    pub fn new(data: PacketData, timestamp: Timestamp) -> Self {
        Self {
            data: Arc::new(data),
            timestamp,
        }
    }

    pub fn image(frame: ImageFrame, timestamp: Timestamp) -> Self {
        Self::new(PacketData::Image(frame), timestamp)
    }

    /// Same payload at another timestamp
    pub fn at(&self, timestamp: Timestamp) -> Self {
        Self {
            data: Arc::clone(&self.data),
            timestamp,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn data(&self) -> &PacketData {
        &self.data
    }

    pub fn as_image_frame(&self) -> Option<&ImageFrame> {
        match self.data.as_ref() {
            PacketData::Image(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn shares_payload_with(&self, other: &Packet) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// Named values handed to calculators when the graph run starts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SidePacket {
    values: BTreeMap<String, PacketData>,
}

impl SidePacket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value
    pub fn emplace(&mut self, name: impl Into<String>, value: PacketData) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&PacketData> {
        self.values.get(name)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(PacketData::as_int)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(PacketData::as_bool)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

// ==============================================================================
// Error Types
// ==============================================================================

/// Status errors reported by graph parsing, validation and execution
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("Parse error at line {line}, column {column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// The input queue is full; the packet was not accepted
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Calculator {node} failed: {message}")]
    Calculator { node: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type GraphResult<T> = Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_restamp_shares_payload() {
        let packet = Packet::new(PacketData::Int(3), Timestamp::from_micros(10));
        let moved = packet.at(Timestamp::from_micros(20));

        assert!(moved.shares_payload_with(&packet));
        assert_eq!(moved.timestamp().micros(), 20);
        assert_eq!(moved.data().as_int(), Some(3));
        assert!(moved.as_image_frame().is_none());
    }

    #[test]
    fn test_side_packet_typed_lookup() {
        let mut side_packet = SidePacket::new();
        side_packet.emplace("model_complexity", PacketData::Int(1));
        side_packet.emplace("smooth_landmarks", PacketData::Bool(true));

        assert_eq!(side_packet.get_int("model_complexity"), Some(1));
        assert_eq!(side_packet.get_bool("smooth_landmarks"), Some(true));
        assert_eq!(side_packet.get_bool("model_complexity"), None);
        assert!(!side_packet.contains("enable_segmentation"));

        side_packet.emplace("model_complexity", PacketData::Int(2));
        assert_eq!(side_packet.len(), 2);
        assert_eq!(side_packet.get_int("model_complexity"), Some(2));
    }
}
