//! Aggregation kinds and window granularities for meter views.
//!
//! This module defines the closed set of aggregations a meter may declare and
//! the compile-time table mapping each one to its two-phase primitives:
//! - the state function used when the view folds raw events into 1-minute
//!   partial aggregates
//! - the merge function used when a query combines those partials
//! - the intermediate type stored in the view's value column
//!
//! It also defines the window sizes a query may re-bucket into, together with
//! the range alignment applied to windowed queries.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::error::{MeterError, Result};

/// Aggregation a meter applies to its value property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Count matching events
    Count,
    /// Sum the value property
    Sum,
    /// Average the value property
    Avg,
    /// Count distinct values of the value property
    UniqueCount,
    /// Minimum of the value property
    Min,
    /// Maximum of the value property
    Max,
}

/// The (state, merge, intermediate type) triple behind an aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationFunctions {
    /// Partial aggregate written by the view, e.g. `sumState`
    pub state_fn: &'static str,
    /// Base function named in the view's `AggregateFunction(..)` column type
    pub merge_fn: &'static str,
    /// Intermediate type of the aggregated argument
    pub data_type: &'static str,
}

impl Aggregation {
    pub const ALL: [Aggregation; 6] = [
        Aggregation::Count,
        Aggregation::Sum,
        Aggregation::Avg,
        Aggregation::UniqueCount,
        Aggregation::Min,
        Aggregation::Max,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Count => "count",
            Aggregation::Sum => "sum",
            Aggregation::Avg => "avg",
            Aggregation::UniqueCount => "unique_count",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
        }
    }

    /// Looks up the two-phase functions for this aggregation.
    pub fn functions(&self) -> AggregationFunctions {
        match self {
            Aggregation::Sum => AggregationFunctions { state_fn: "sumState", merge_fn: "sum", data_type: "Float64" },
            Aggregation::Avg => AggregationFunctions { state_fn: "avgState", merge_fn: "avg", data_type: "Float64" },
            Aggregation::Min => AggregationFunctions { state_fn: "minState", merge_fn: "min", data_type: "Float64" },
            Aggregation::Max => AggregationFunctions { state_fn: "maxState", merge_fn: "max", data_type: "Float64" },
            Aggregation::Count => AggregationFunctions { state_fn: "countState", merge_fn: "count", data_type: "Float64" },
            Aggregation::UniqueCount => AggregationFunctions { state_fn: "uniqState", merge_fn: "uniq", data_type: "String" },
        }
    }

    /// Whether a meter with this aggregation must name a value property.
    pub fn requires_value_property(&self) -> bool {
        !matches!(self, Aggregation::Count)
    }

    /// Column type of the view's value state.
    pub fn state_column_type(&self) -> String {
        let functions = self.functions();
        format!("AggregateFunction({}, {})", functions.merge_fn, functions.data_type)
    }

    /// Generates the select expression that merges stored partials into a
    /// numeric `value` column.
    pub fn merge_sql(&self) -> String {
        let merge = format!("{}Merge(value)", self.functions().merge_fn);
        match self {
            Aggregation::Count | Aggregation::UniqueCount => format!("toFloat64({}) AS value", merge),
            _ => format!("{} AS value", merge),
        }
    }
}

impl Display for Aggregation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = MeterError;

    fn from_str(s: &str) -> Result<Self> {
        Aggregation::ALL
            .into_iter()
            .find(|agg| agg.as_str() == s)
            .ok_or_else(|| MeterError::invalid_input(format!("invalid aggregation type: {}", s)))
    }
}

/// Granularity a query may re-bucket the stored 1-minute partials into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowSize {
    Minute,
    Hour,
    Day,
}

impl WindowSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowSize::Minute => "minute",
            WindowSize::Hour => "hour",
            WindowSize::Day => "day",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            WindowSize::Minute => 60,
            WindowSize::Hour => 3_600,
            WindowSize::Day => 86_400,
        }
    }

    /// Generates the interval expression used by tumbling windows.
    pub fn interval_sql(&self) -> &'static str {
        match self {
            WindowSize::Minute => "toIntervalMinute(1)",
            WindowSize::Hour => "toIntervalHour(1)",
            WindowSize::Day => "toIntervalDay(1)",
        }
    }

    /// Calculates the window boundaries containing a timestamp
    pub fn window_bounds(&self, timestamp: i64) -> (i64, i64) {
        let size = self.seconds();
        let start = timestamp.div_euclid(size) * size;
        (start, start + size)
    }

    /// Widens `[from, to]` to whole windows: `from` moves down to its window
    /// start, `to` moves up to the next boundary unless already aligned.
    pub fn align_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let (from_start, _) = self.window_bounds(from.timestamp());
        let (to_start, to_end) = self.window_bounds(to.timestamp());
        let to_aligned = to.timestamp() == to_start && to.timestamp_subsec_nanos() == 0;

        let adjusted_from = from_unix(from_start)?;
        let adjusted_to = if to_aligned { to } else { from_unix(to_end)? };
        Ok((adjusted_from, adjusted_to))
    }
}

fn from_unix(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| MeterError::invalid_input(format!("timestamp out of range: {}", secs)))
}

impl Display for WindowSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowSize {
    type Err = MeterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "minute" => Ok(WindowSize::Minute),
            "hour" => Ok(WindowSize::Hour),
            "day" => Ok(WindowSize::Day),
            other => Err(MeterError::invalid_input(format!("unsupported window size: {}", other))),
        }
    }
}
