//! Wire types of the storage RPC.
//!
//! A read is one request followed by a stream of responses, each carrying a
//! sequence of frames. Timestamps are nanoseconds since the epoch.

use serde::{Deserialize, Serialize};

use rivulet_core::{DataType, Expression};

/// Closed `[start, end]` nanosecond range of a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampRange {
    /// Range start.
    pub start: i64,
    /// Range end.
    pub end: i64,
}

/// A read request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadRequest {
    /// Database to read.
    pub database: String,
    /// Optional predicate evaluated server side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Expression>,
    /// Read points in descending time order.
    #[serde(default)]
    pub descending: bool,
    /// Time range of the read.
    pub timestamp_range: TimestampRange,
    /// Per-series point limit. Set authoritatively by push-down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

/// A series tag pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

/// One unit of the response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// Marks the beginning of a new block; its tags become the block's tag
    /// map.
    Series {
        /// Series tags.
        tags: Vec<Tag>,
    },
    /// A run of integer points.
    IntegerPoints {
        /// Point timestamps.
        timestamps: Vec<i64>,
        /// Point values, parallel to `timestamps`.
        values: Vec<i64>,
    },
    /// A run of float points.
    FloatPoints {
        /// Point timestamps.
        timestamps: Vec<i64>,
        /// Point values, parallel to `timestamps`.
        values: Vec<f64>,
    },
    /// A run of string points.
    StringPoints {
        /// Point timestamps.
        timestamps: Vec<i64>,
        /// Point values, parallel to `timestamps`.
        values: Vec<String>,
    },
    /// A run of boolean points.
    BooleanPoints {
        /// Point timestamps.
        timestamps: Vec<i64>,
        /// Point values, parallel to `timestamps`.
        values: Vec<bool>,
    },
    /// A run of unsigned points.
    UnsignedPoints {
        /// Point timestamps.
        timestamps: Vec<i64>,
        /// Point values, parallel to `timestamps`.
        values: Vec<u64>,
    },
}

impl Frame {
    /// Whether this frame opens a new block.
    pub const fn is_series(&self) -> bool {
        matches!(self, Self::Series { .. })
    }

    /// The value type carried by a point frame.
    pub const fn point_type(&self) -> Option<DataType> {
        match self {
            Self::Series { .. } => None,
            Self::IntegerPoints { .. } => Some(DataType::Int),
            Self::FloatPoints { .. } => Some(DataType::Float),
            Self::StringPoints { .. } => Some(DataType::String),
            Self::BooleanPoints { .. } => Some(DataType::Bool),
            Self::UnsignedPoints { .. } => Some(DataType::UInt),
        }
    }
}

/// One message of the response stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadResponse {
    /// Frames, in stream order.
    pub frames: Vec<Frame>,
}
