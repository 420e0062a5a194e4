//! Aggregation store access.
//!
//! This module provides:
//! - `StatementExecutor`: the seam every store backend implements
//! - `MeterViews`: create/delete/query of meter views on top of an executor,
//!   with every call bounded by a cancellation token
//! - `clickhouse`: an executor speaking the ClickHouse HTTP interface

pub mod clickhouse;

use std::future::Future;
use std::sync::Arc;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use crate::compiler::{create_statement, drop_statement};
use crate::error::{MeterError, Result};
use crate::meter::{CreateMeter, DeleteMeter};
use crate::query::{QueryMeter, QueryMeterOutput, QueryMeterRow};
use crate::statement::Statement;
use crate::view::meter_view_name;

/// A result row keyed by column name.
pub type Row = Map<String, Value>;

/// Executes statements against the aggregation store.
///
/// Implementations bind `statement.args` to its positional placeholders and
/// classify their failures into [`MeterError`] kinds.
#[async_trait]
pub trait StatementExecutor: Send + Sync + 'static {
    /// Run a statement that returns no rows.
    async fn execute(&self, statement: &Statement) -> Result<()>;

    /// Run a statement and collect its rows.
    async fn query(&self, statement: &Statement) -> Result<Vec<Row>>;

    /// Release the underlying connection.
    async fn close(&self) -> Result<()>;
}

/// Races `fut` against `cancel`, tagging failures with `operation`.
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            Err(MeterError::cancelled(format!("{} was cancelled", operation)).with_operation(operation))
        }
        res = fut => res.map_err(|e| match e.operation() {
            Some(_) => e,
            None => e.with_operation(operation),
        }),
    }
}

/// Meter view lifecycle and reads against one store.
#[derive(Clone)]
pub struct MeterViews {
    executor: Arc<dyn StatementExecutor>,
}

impl MeterViews {
    pub fn new(executor: Arc<dyn StatementExecutor>) -> Self {
        Self { executor }
    }

    /// Compiles and executes the view DDL for a new meter. Invalid meters
    /// fail before the store is touched.
    pub async fn create(&self, request: &CreateMeter, cancel: &CancellationToken) -> Result<()> {
        const OP: &str = "ClickHouse.CreateMeter";
        let statement = create_statement(request).map_err(|e| e.with_operation(OP))?;
        let view = meter_view_name(&request.meter.tenant_slug, &request.meter.slug);
        debug!(view = %view, sql = %statement.sql, "creating meter view");

        cancellable(cancel, OP, self.executor.execute(&statement)).await?;
        info!(view = %view, populate = request.populate, "created meter view");
        Ok(())
    }

    /// Drops a meter's view. Dropping an absent view succeeds.
    pub async fn delete(&self, request: &DeleteMeter, cancel: &CancellationToken) -> Result<()> {
        const OP: &str = "ClickHouse.DeleteMeter";
        let statement = drop_statement(request);
        cancellable(cancel, OP, self.executor.execute(&statement)).await?;
        info!(view = %meter_view_name(&request.tenant_slug, &request.meter_slug), "deleted meter view");
        Ok(())
    }

    pub async fn query(&self, query: &QueryMeter, cancel: &CancellationToken) -> Result<QueryMeterOutput> {
        const OP: &str = "ClickHouse.QueryMeter";
        let statement = query.to_statement().map_err(|e| e.with_operation(OP))?;
        debug!(sql = %statement.sql, args = ?statement.args, "querying meter view");

        let rows = cancellable(cancel, OP, self.executor.query(&statement)).await?;
        let data = rows
            .iter()
            .map(QueryMeterRow::from_row)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| e.with_operation(OP))?;
        debug!(
            view = %meter_view_name(&query.tenant_slug, &query.meter_slug),
            rows = data.len(),
            "queried meter view"
        );
        Ok(QueryMeterOutput::new(query, data))
    }

    pub async fn close(&self) -> Result<()> {
        self.executor.close().await
    }
}
