//! Windowed reads against a meter's aggregation view.
//!
//! A [`QueryMeter`] is turned into a parameterized statement that merges the
//! stored 1-minute partials, either re-bucketed into tumbling windows of the
//! requested size or collapsed into a single row over the whole range. Every
//! name that ends up as a bare identifier is validated before any statement
//! text is produced.

use std::collections::BTreeMap;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use crate::aggregation::{Aggregation, WindowSize};
use crate::error::{MeterError, Result};
use crate::statement::{Identifier, SelectBuilder, SqlValue, Statement};
use crate::view::meter_view_name;

/// The only window timezone currently supported.
pub const CANONICAL_TIMEZONE: &str = "UTC";

/// Output names of the window bounds. They differ from the stored
/// `windowstart`/`windowend` columns so that WHERE always reads stored values.
const WINDOW_START: &str = "window_start";
const WINDOW_END: &str = "window_end";

/// Columns produced by the query itself; they cannot be grouped or filtered on.
const RESERVED_COLUMNS: [&str; 5] = ["windowstart", "windowend", "value", WINDOW_START, WINDOW_END];

/// Read request against one meter's view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMeter {
    pub tenant_slug: String,
    pub meter_slug: String,
    /// Aggregation declared by the meter; selects the merge function.
    pub aggregation: Aggregation,
    #[serde(default)]
    pub organizations: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
    /// Dimension name to accepted values.
    #[serde(default)]
    pub filter_group_by: BTreeMap<String, Vec<String>>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub window_size: Option<WindowSize>,
    #[serde(default)]
    pub window_timezone: Option<String>,
}

impl QueryMeter {
    /// Parses a request, reporting malformed input (such as an unknown
    /// window size or aggregation) as `invalid_input`.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| MeterError::invalid_input(format!("invalid meter query: {}", e)))
    }

    /// The range actually applied to the view: aligned to whole windows when
    /// a window size is set, as given otherwise.
    pub fn effective_range(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        if self.from > self.to {
            return Err(MeterError::invalid_input(format!(
                "query range start {} is after its end {}",
                self.from, self.to
            )));
        }
        match self.window_size {
            Some(size) => size.align_range(self.from, self.to),
            None => Ok((self.from, self.to)),
        }
    }

    /// Builds the read statement. Fails with `invalid_input` before any text
    /// is produced if the request cannot be expressed safely.
    pub fn to_statement(&self) -> Result<Statement> {
        let timezone = self.timezone()?;
        let group_by = query_identifiers(&self.group_by, "group_by")?;
        let filters = self.dimension_filters()?;
        let (from, to) = self.effective_range()?;

        let view = meter_view_name(&self.tenant_slug, &self.meter_slug);
        let mut builder = SelectBuilder::new(&view);

        match self.window_size {
            Some(size) => {
                let interval = size.interval_sql();
                builder
                    .column_with_args(
                        format!("tumbleStart(windowstart, {}, ?) AS {}", interval, WINDOW_START),
                        vec![SqlValue::from(timezone)],
                    )
                    .column_with_args(
                        format!("tumbleEnd(windowstart, {}, ?) AS {}", interval, WINDOW_END),
                        vec![SqlValue::from(timezone)],
                    );
                builder.group_by(WINDOW_START).group_by(WINDOW_END);
            }
            None => {
                builder
                    .column(format!("min(windowstart) AS {}", WINDOW_START))
                    .column(format!("max(windowend) AS {}", WINDOW_END));
            }
        }
        builder.column(self.aggregation.merge_sql());

        for column in &group_by {
            builder.column(column.quoted()).group_by(column.quoted());
        }

        builder
            .any_of(&column("organization"), &self.organizations)
            .any_of(&column("user"), &self.users);
        for (column, values) in &filters {
            builder.any_of(column, values);
        }

        builder
            .condition("windowstart >= ?", vec![SqlValue::from(from.timestamp())])
            .condition("windowend <= ?", vec![SqlValue::from(to.timestamp())]);

        match self.window_size {
            Some(_) => {
                builder.order_by(WINDOW_START);
            }
            // an aggregate without GROUP BY yields one row even when nothing matched
            None if group_by.is_empty() => {
                builder.having("count() > 0");
            }
            None => {}
        }

        Ok(builder.build())
    }

    fn timezone(&self) -> Result<&'static str> {
        match self.window_timezone.as_deref() {
            None => Ok(CANONICAL_TIMEZONE),
            Some(tz) if tz == CANONICAL_TIMEZONE => Ok(CANONICAL_TIMEZONE),
            Some(tz) => Err(MeterError::invalid_input(format!(
                "unsupported window timezone {:?}: only {} is supported",
                tz, CANONICAL_TIMEZONE
            ))),
        }
    }

    fn dimension_filters(&self) -> Result<Vec<(Identifier, &Vec<String>)>> {
        self.filter_group_by
            .iter()
            .map(|(name, values)| {
                if values.is_empty() {
                    return Err(MeterError::invalid_input(format!(
                        "filter_group_by {:?} has no values",
                        name
                    )));
                }
                Ok((query_identifier(name, "filter_group_by")?, values))
            })
            .collect()
    }
}

fn column(name: &str) -> Identifier {
    Identifier::sanitized(name)
}

fn query_identifier(name: &str, field: &str) -> Result<Identifier> {
    if RESERVED_COLUMNS.contains(&name) {
        return Err(MeterError::invalid_input(format!(
            "invalid {} column name: {:?} is reserved",
            field, name
        )));
    }
    Identifier::new(name).map_err(|_| {
        MeterError::invalid_input(format!(
            "invalid {} column name: {:?}. Only alphanumeric characters and underscores are allowed",
            field, name
        ))
    })
}

fn query_identifiers(names: &[String], field: &str) -> Result<Vec<Identifier>> {
    let mut out: Vec<Identifier> = Vec::with_capacity(names.len());
    for name in names {
        let ident = query_identifier(name, field)?;
        if !out.contains(&ident) {
            out.push(ident);
        }
    }
    Ok(out)
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMeterRow {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub group_by: BTreeMap<String, String>,
}

impl QueryMeterRow {
    /// Maps a store row keyed by column name. Unknown columns become group-by
    /// values; nulls are skipped.
    pub fn from_row(row: &Map<String, Value>) -> Result<Self> {
        let mut window_start = None;
        let mut window_end = None;
        let mut value = 0.0;
        let mut group_by = BTreeMap::new();

        for (column, val) in row {
            match column.as_str() {
                WINDOW_START => window_start = Some(parse_timestamp(column, val)?),
                WINDOW_END => window_end = Some(parse_timestamp(column, val)?),
                "value" => value = parse_value(val)?,
                _ => match val {
                    Value::Null => {}
                    Value::String(s) => {
                        group_by.insert(column.clone(), s.clone());
                    }
                    other => {
                        group_by.insert(column.clone(), other.to_string());
                    }
                },
            }
        }

        Ok(Self {
            window_start: window_start
                .ok_or_else(|| MeterError::internal("query result is missing window_start"))?,
            window_end: window_end.ok_or_else(|| MeterError::internal("query result is missing window_end"))?,
            value,
            group_by,
        })
    }
}

fn parse_timestamp(column: &str, val: &Value) -> Result<DateTime<Utc>> {
    let parsed = match val {
        Value::String(s) => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .map(|naive| naive.and_utc())
            .ok()
            .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        _ => None,
    };
    parsed.ok_or_else(|| MeterError::internal(format!("invalid {} in query result: {}", column, val)))
}

fn parse_value(val: &Value) -> Result<f64> {
    match val {
        Value::Null => Ok(0.0),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| MeterError::internal(format!("invalid value in query result: {}", n))),
        // 64-bit numbers may arrive quoted
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| MeterError::internal(format!("invalid value in query result: {:?}", s))),
        other => Err(MeterError::internal(format!("invalid value in query result: {}", other))),
    }
}

/// Query result with the window it actually covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMeterOutput {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_size: Option<WindowSize>,
    pub data: Vec<QueryMeterRow>,
}

impl QueryMeterOutput {
    /// Reports the first row's start and the last row's end, clamped to the
    /// requested range, or the requested range when there are no rows.
    /// Rows that cannot belong to the range, such as the epoch-dated row an
    /// empty aggregate produces, are dropped.
    pub fn new(query: &QueryMeter, mut data: Vec<QueryMeterRow>) -> Self {
        data.retain(|row| row.window_start <= row.window_end && row.window_end > query.from);
        let (window_start, window_end) = match (data.first(), data.last()) {
            (Some(first), Some(last)) => (first.window_start.max(query.from), last.window_end.min(query.to)),
            _ => (query.from, query.to),
        };
        Self {
            window_start,
            window_end,
            window_size: query.window_size,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::TimeZone;
    use serde_json::json;

    fn normalize(sql: &str) -> String {
        sql.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, h, m, s).unwrap()
    }

    fn query() -> QueryMeter {
        QueryMeter {
            tenant_slug: "acme".to_string(),
            meter_slug: "api_calls".to_string(),
            aggregation: Aggregation::Sum,
            organizations: Vec::new(),
            users: Vec::new(),
            filter_group_by: BTreeMap::new(),
            from: ts(10, 17, 42),
            to: ts(12, 5, 0),
            group_by: Vec::new(),
            window_size: None,
            window_timezone: None,
        }
    }

    #[test]
    fn test_collapsed_query_without_window() {
        let stmt = query().to_statement().unwrap();
        assert_eq!(
            normalize(&stmt.sql),
            "SELECT min(windowstart) AS window_start, max(windowend) AS window_end, sumMerge(value) AS value \
             FROM rc_acme_api_calls_mv WHERE windowstart >= ? AND windowend <= ? HAVING count() > 0"
        );
        assert_eq!(
            stmt.args,
            vec![SqlValue::Int(ts(10, 17, 42).timestamp()), SqlValue::Int(ts(12, 5, 0).timestamp())]
        );
    }

    #[test]
    fn test_windowed_query_rebuckets_and_aligns_range() {
        let mut q = query();
        q.aggregation = Aggregation::Count;
        q.window_size = Some(WindowSize::Hour);
        q.group_by = vec!["region".to_string()];
        let stmt = q.to_statement().unwrap();

        assert_eq!(
            normalize(&stmt.sql),
            "SELECT tumbleStart(windowstart, toIntervalHour(1), ?) AS window_start, \
             tumbleEnd(windowstart, toIntervalHour(1), ?) AS window_end, \
             toFloat64(countMerge(value)) AS value, `region` \
             FROM rc_acme_api_calls_mv WHERE windowstart >= ? AND windowend <= ? \
             GROUP BY window_start, window_end, `region` ORDER BY window_start"
        );
        assert_eq!(
            stmt.args,
            vec![
                SqlValue::from("UTC"),
                SqlValue::from("UTC"),
                SqlValue::Int(ts(10, 0, 0).timestamp()),
                SqlValue::Int(ts(13, 0, 0).timestamp()),
            ]
        );
    }

    #[test]
    fn test_filters_are_or_within_and_across() {
        let mut q = query();
        q.organizations = vec!["org1".to_string(), "org2".to_string()];
        q.users = vec!["u1".to_string()];
        q.filter_group_by.insert("region".to_string(), vec!["eu".to_string(), "us".to_string()]);
        q.filter_group_by.insert("method".to_string(), vec!["GET".to_string()]);
        let stmt = q.to_statement().unwrap();

        assert!(normalize(&stmt.sql).contains(
            "WHERE (`organization` = ? OR `organization` = ?) AND `user` = ? AND `method` = ? \
             AND (`region` = ? OR `region` = ?) AND windowstart >= ? AND windowend <= ?"
        ));
        assert_eq!(
            &stmt.args[..6],
            &[
                SqlValue::from("org1"),
                SqlValue::from("org2"),
                SqlValue::from("u1"),
                SqlValue::from("GET"),
                SqlValue::from("eu"),
                SqlValue::from("us"),
            ]
        );
    }

    #[test]
    fn test_non_canonical_timezone_rejected() {
        let mut q = query();
        q.window_size = Some(WindowSize::Day);
        q.window_timezone = Some("Europe/Berlin".to_string());
        assert_eq!(q.to_statement().unwrap_err().kind(), ErrorKind::InvalidInput);

        q.window_timezone = Some("UTC".to_string());
        assert!(q.to_statement().is_ok());
    }

    #[test]
    fn test_invalid_group_by_identifiers_rejected() {
        for bad in ["region;DROP TABLE x", "a-b", "", "value", "windowstart", "window_end"] {
            let mut q = query();
            q.group_by = vec![bad.to_string()];
            assert_eq!(q.to_statement().unwrap_err().kind(), ErrorKind::InvalidInput, "{:?}", bad);
        }
    }

    #[test]
    fn test_invalid_or_empty_filters_rejected() {
        let mut q = query();
        q.filter_group_by.insert("re gion".to_string(), vec!["eu".to_string()]);
        assert_eq!(q.to_statement().unwrap_err().kind(), ErrorKind::InvalidInput);

        let mut q = query();
        q.filter_group_by.insert("region".to_string(), Vec::new());
        assert_eq!(q.to_statement().unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut q = query();
        std::mem::swap(&mut q.from, &mut q.to);
        assert_eq!(q.to_statement().unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_collapsed_query_with_group_by_skips_having() {
        let mut q = query();
        q.group_by = vec!["order".to_string()];
        let sql = normalize(&q.to_statement().unwrap().sql);
        assert!(sql.ends_with("windowend <= ? GROUP BY `order`"));
        assert!(sql.contains("sumMerge(value) AS value, `order` FROM"));
    }

    #[test]
    fn test_unknown_window_size_is_invalid_input() {
        let mut raw = serde_json::to_value(query()).unwrap();
        raw["window_size"] = json!("week");
        let err = QueryMeter::from_json(&raw.to_string()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.message().contains("week"));

        raw["window_size"] = json!("hour");
        let q = QueryMeter::from_json(&raw.to_string()).unwrap();
        assert_eq!(q.window_size, Some(WindowSize::Hour));
    }

    #[test]
    fn test_row_mapping() {
        let row = json!({
            "window_start": "2023-01-01 10:00:00",
            "window_end": "2023-01-01 11:00:00",
            "value": "42",
            "region": "eu",
            "code": 200,
            "missing": null
        });
        let row = QueryMeterRow::from_row(row.as_object().unwrap()).unwrap();
        assert_eq!(row.window_start, ts(10, 0, 0));
        assert_eq!(row.window_end, ts(11, 0, 0));
        assert_eq!(row.value, 42.0);
        assert_eq!(row.group_by.get("region").map(String::as_str), Some("eu"));
        assert_eq!(row.group_by.get("code").map(String::as_str), Some("200"));
        assert!(!row.group_by.contains_key("missing"));
    }

    #[test]
    fn test_row_without_window_is_internal() {
        let row = json!({"value": 1.5});
        let err = QueryMeterRow::from_row(row.as_object().unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_output_clamps_window_to_requested_range() {
        let q = query();
        let rows = vec![
            QueryMeterRow { window_start: ts(10, 0, 0), window_end: ts(11, 0, 0), value: 1.0, group_by: BTreeMap::new() },
            QueryMeterRow { window_start: ts(12, 0, 0), window_end: ts(13, 0, 0), value: 2.0, group_by: BTreeMap::new() },
        ];
        let out = QueryMeterOutput::new(&q, rows);
        assert_eq!(out.window_start, q.from);
        assert_eq!(out.window_end, q.to);

        let empty = QueryMeterOutput::new(&q, Vec::new());
        assert_eq!((empty.window_start, empty.window_end), (q.from, q.to));
        assert!(empty.data.is_empty());
    }

    #[test]
    fn test_empty_collapsed_range_reports_requested_window() {
        let q = query();
        let row = json!({
            "window_start": "1970-01-01 00:00:00",
            "window_end": "1970-01-01 00:00:00",
            "value": 0
        });
        let row = QueryMeterRow::from_row(row.as_object().unwrap()).unwrap();
        let out = QueryMeterOutput::new(&q, vec![row]);

        assert!(out.data.is_empty());
        assert_eq!((out.window_start, out.window_end), (q.from, q.to));
        assert!(out.window_start <= out.window_end);
    }
}
