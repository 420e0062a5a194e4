//! Compiles meter definitions into aggregation view statements.
//!
//! A meter becomes a materialized view over the raw events table that keeps
//! partial aggregates per (organization, user, 1-minute bucket, dimension
//! values). Dimensions are sorted before anything is generated, so two
//! meters naming the same dimension set in a different order compile to the
//! same statement.

use crate::aggregation::Aggregation;
use crate::error::{MeterError, Result};
use crate::meter::{CreateMeter, DeleteMeter, Meter};
use crate::statement::{Identifier, SelectBuilder, SqlValue, Statement};
use crate::view::{events_table, meter_view_name};

/// Column names every view carries ahead of its dimensions.
pub const BASE_COLUMNS: [&str; 5] = ["organization", "user", "windowstart", "windowend", "value"];

/// A compiled view: its name, column set, sort key and defining select.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewDefinition {
    pub name: Identifier,
    pub columns: Vec<String>,
    pub order_by: Vec<String>,
    pub select: Statement,
    pub populate: bool,
}

impl ViewDefinition {
    /// Compiles a create request.
    pub fn compile(request: &CreateMeter) -> Result<Self> {
        let meter = &request.meter;
        meter.validate()?;

        let dimensions = sorted_dimensions(&meter.properties)?;
        let aggregation = meter.aggregation;

        let mut columns = vec![
            "organization String".to_string(),
            "user String".to_string(),
            "windowstart DateTime".to_string(),
            "windowend DateTime".to_string(),
            format!("value {}", aggregation.state_column_type()),
        ];
        let mut order_by: Vec<String> = ["windowstart", "windowend", "organization", "user"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        for dim in &dimensions {
            columns.push(format!("{} String", dim.quoted()));
            order_by.push(dim.quoted());
        }

        Ok(Self {
            name: meter_view_name(&meter.tenant_slug, &meter.slug),
            columns,
            order_by,
            select: build_select(meter, &dimensions),
            populate: request.populate,
        })
    }

    /// Assembles the `CREATE MATERIALIZED VIEW` statement.
    pub fn to_create_statement(&self) -> Statement {
        let populate = if self.populate { "POPULATE " } else { "" };
        let sql = format!(
            "CREATE MATERIALIZED VIEW IF NOT EXISTS {} (\n    {}\n) ENGINE = AggregatingMergeTree()\nORDER BY ({})\n{}AS\n{}",
            self.name,
            self.columns.join(",\n    "),
            self.order_by.join(", "),
            populate,
            self.select.sql,
        );
        Statement::new(sql, self.select.args.clone())
    }
}

/// Builds the view-creation statement for a meter.
pub fn create_statement(request: &CreateMeter) -> Result<Statement> {
    Ok(ViewDefinition::compile(request)?.to_create_statement())
}

/// Builds the idempotent view-removal statement for a meter.
pub fn drop_statement(request: &DeleteMeter) -> Statement {
    let view = meter_view_name(&request.tenant_slug, &request.meter_slug);
    Statement::new(format!("DROP VIEW IF EXISTS {}", view), Vec::new())
}

/// Sorts, de-duplicates and validates dimension names.
fn sorted_dimensions(properties: &[String]) -> Result<Vec<Identifier>> {
    let mut names: Vec<&str> = properties.iter().map(String::as_str).collect();
    names.sort_unstable();
    names.dedup();

    names
        .into_iter()
        .map(|name| {
            if BASE_COLUMNS.contains(&name) {
                return Err(MeterError::invalid_input(format!(
                    "dimension {:?} collides with a reserved column name",
                    name
                )));
            }
            Identifier::new(name)
        })
        .collect()
}

fn build_select(meter: &Meter, dimensions: &[Identifier]) -> Statement {
    let aggregation = meter.aggregation;
    let functions = aggregation.functions();
    let mut builder = SelectBuilder::new(&events_table());

    builder
        .column("organization")
        .column("user")
        .column("tumbleStart(timestamp, toIntervalMinute(1)) AS windowstart")
        .column("tumbleEnd(timestamp, toIntervalMinute(1)) AS windowend");

    match (aggregation, meter.value_property()) {
        (Aggregation::Count, None) => {
            builder.column(format!("{}(*) AS value", functions.state_fn));
        }
        (Aggregation::UniqueCount, Some(property)) => {
            builder.column_with_args(
                format!("{}(JSONExtractString(properties, ?)) AS value", functions.state_fn),
                vec![SqlValue::from(property)],
            );
        }
        (_, property) => {
            // validate() guarantees a property for everything but count
            let property = property.unwrap_or_default();
            builder.column_with_args(
                format!(
                    "{}(CAST(JSONExtractString(properties, ?), '{}')) AS value",
                    functions.state_fn, functions.data_type
                ),
                vec![SqlValue::from(property)],
            );
        }
    }

    for dim in dimensions {
        builder.column_with_args(
            format!("JSONExtractString(properties, ?) AS {}", dim.quoted()),
            vec![SqlValue::from(dim.as_str())],
        );
    }

    builder
        .condition("type = ?", vec![SqlValue::from(meter.event_type.as_str())])
        .condition("empty(validation_errors) = 1", Vec::new());

    for column in ["windowstart", "windowend", "organization", "user"] {
        builder.group_by(column);
    }
    for dim in dimensions {
        builder.group_by(dim.quoted());
    }

    builder.build()
}
