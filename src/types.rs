use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WhisperError;

/// Timestamp type (seconds since epoch, as stored on disk).
pub type Timestamp = u32;

/// Value type.
pub type Value = f64;

/// A single stored slot: `(timestamp, value)`. A timestamp of 0 marks an
/// empty slot that has never been written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub timestamp: Timestamp,
    pub value: Value,
}

impl Point {
    pub fn new(timestamp: Timestamp, value: Value) -> Self {
        Point { timestamp, value }
    }

    /// True if this slot has never been written.
    pub fn is_empty(&self) -> bool {
        self.timestamp == 0
    }
}

/// The reduction applied when downsampling fine points into a coarser archive.
///
/// The discriminants are the integer codes stored in the file header; unknown
/// codes are rejected when a header is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    Average = 1,
    Sum = 2,
    Last = 3,
    Max = 4,
    Min = 5,
    AvgZero = 6,
    #[serde(rename = "absmax")]
    AbsMax = 7,
    #[serde(rename = "absmin")]
    AbsMin = 8,
}

/// All supported methods, in header-code order.
pub const AGGREGATION_METHODS: [AggregationMethod; 8] = [
    AggregationMethod::Average,
    AggregationMethod::Sum,
    AggregationMethod::Last,
    AggregationMethod::Max,
    AggregationMethod::Min,
    AggregationMethod::AvgZero,
    AggregationMethod::AbsMax,
    AggregationMethod::AbsMin,
];

impl AggregationMethod {
    /// The integer code stored in the file header.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Maps a header code back to a method. Unknown codes yield `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(AggregationMethod::Average),
            2 => Some(AggregationMethod::Sum),
            3 => Some(AggregationMethod::Last),
            4 => Some(AggregationMethod::Max),
            5 => Some(AggregationMethod::Min),
            6 => Some(AggregationMethod::AvgZero),
            7 => Some(AggregationMethod::AbsMax),
            8 => Some(AggregationMethod::AbsMin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AggregationMethod::Average => "average",
            AggregationMethod::Sum => "sum",
            AggregationMethod::Last => "last",
            AggregationMethod::Max => "max",
            AggregationMethod::Min => "min",
            AggregationMethod::AvgZero => "avg_zero",
            AggregationMethod::AbsMax => "absmax",
            AggregationMethod::AbsMin => "absmin",
        }
    }

    /// Reduces the known values of one coarse interval to a single value.
    ///
    /// `known` holds the values of the covered fine slots that were actually
    /// written, in ascending slot order. `expected` is the total number of
    /// fine slots covering the interval, including empty ones. Returns `None`
    /// when there is nothing to aggregate.
    pub fn apply(self, known: &[Value], expected: usize) -> Option<Value> {
        if known.is_empty() || expected == 0 {
            return None;
        }
        let value = match self {
            AggregationMethod::Average => {
                known.iter().sum::<f64>() / known.len() as f64
            }
            AggregationMethod::Sum => known.iter().sum(),
            // Slot order is ascending by timestamp, so the last known value
            // is the one with the greatest timestamp.
            AggregationMethod::Last => *known.last()?,
            AggregationMethod::Max => {
                known.iter().copied().fold(f64::NEG_INFINITY, f64::max)
            }
            AggregationMethod::Min => {
                known.iter().copied().fold(f64::INFINITY, f64::min)
            }
            // Missing slots count as zero.
            AggregationMethod::AvgZero => {
                known.iter().sum::<f64>() / expected as f64
            }
            AggregationMethod::AbsMax => pick_by_magnitude(known, |a, b| a > b)?,
            AggregationMethod::AbsMin => pick_by_magnitude(known, |a, b| a < b)?,
        };
        Some(value)
    }
}

/// Returns the value whose |v| wins under `better`; ties keep the
/// earliest-seen value, original sign preserved.
fn pick_by_magnitude(values: &[Value], better: fn(f64, f64) -> bool) -> Option<Value> {
    let mut best = *values.first()?;
    for &v in &values[1..] {
        if better(v.abs(), best.abs()) {
            best = v;
        }
    }
    Some(best)
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationMethod {
    type Err = WhisperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AGGREGATION_METHODS
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| WhisperError::InvalidAggregationMethod(s.to_string()))
    }
}
