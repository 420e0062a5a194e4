//! Meter lifecycle service.
//!
//! Ties the view store and the meter registry together:
//! - create compiles and executes the view DDL, then registers the meter
//! - delete drops the view (idempotently), then deregisters the meter
//! - query resolves the meter to pick the matching merge function

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use crate::error::{MeterError, Result};
use crate::meter::{CreateMeter, DeleteMeter, Meter};
use crate::query::{QueryMeter, QueryMeterOutput};
use crate::registry::InMemoryMeterRegistry;
use crate::storage::MeterViews;

#[derive(Clone)]
pub struct MeterService {
    views: MeterViews,
    registry: InMemoryMeterRegistry,
}

impl MeterService {
    pub fn new(views: MeterViews, registry: InMemoryMeterRegistry) -> Self {
        Self { views, registry }
    }

    pub fn registry(&self) -> &InMemoryMeterRegistry {
        &self.registry
    }

    pub async fn create_meter(&self, request: CreateMeter, cancel: &CancellationToken) -> Result<Meter> {
        let meter = &request.meter;
        if self.registry.get(&meter.tenant_slug, &meter.slug).await.is_ok() {
            return Err(MeterError::conflict(format!(
                "meter {} already exists for tenant {}",
                meter.slug, meter.tenant_slug
            ))
            .with_operation("MeterService.CreateMeter"));
        }

        self.views.create(&request, cancel).await?;
        self.registry.insert(request.meter.clone()).await?;
        info!(tenant = %request.meter.tenant_slug, meter = %request.meter.slug, "meter created");
        Ok(request.meter)
    }

    /// Removes a meter. Succeeds when neither the view nor the registration
    /// exists.
    pub async fn delete_meter(&self, request: DeleteMeter, cancel: &CancellationToken) -> Result<()> {
        self.views.delete(&request, cancel).await?;
        if self.registry.remove(&request.tenant_slug, &request.meter_slug).await.is_none() {
            warn!(tenant = %request.tenant_slug, meter = %request.meter_slug, "deleted meter was not registered");
        }
        Ok(())
    }

    /// Runs a query, taking the aggregation from the registered meter rather
    /// than from the request.
    pub async fn query_meter(&self, mut query: QueryMeter, cancel: &CancellationToken) -> Result<QueryMeterOutput> {
        let meter = self
            .registry
            .get(&query.tenant_slug, &query.meter_slug)
            .await
            .map_err(|e| e.with_operation("MeterService.QueryMeter"))?;
        query.aggregation = meter.aggregation;
        self.views.query(&query, cancel).await
    }

    pub async fn close(&self) -> Result<()> {
        self.views.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::Aggregation;
    use crate::error::ErrorKind;
    use crate::statement::Statement;
    use crate::storage::{Row, StatementExecutor};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    /// Records every statement it is handed.
    #[derive(Default)]
    struct RecordingExecutor {
        statements: Mutex<Vec<Statement>>,
    }

    impl RecordingExecutor {
        fn sql(&self) -> Vec<String> {
            self.statements.lock().unwrap().iter().map(|s| s.sql.clone()).collect()
        }
    }

    #[async_trait]
    impl StatementExecutor for RecordingExecutor {
        async fn execute(&self, statement: &Statement) -> Result<()> {
            self.statements.lock().unwrap().push(statement.clone());
            Ok(())
        }

        async fn query(&self, statement: &Statement) -> Result<Vec<Row>> {
            self.statements.lock().unwrap().push(statement.clone());
            Ok(Vec::new())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn create_request() -> CreateMeter {
        CreateMeter {
            meter: Meter {
                name: "Unique sessions".to_string(),
                slug: "sessions".to_string(),
                event_type: "page_view".to_string(),
                description: Some("distinct sessions".to_string()),
                value_property: Some("session_id".to_string()),
                properties: Vec::new(),
                aggregation: Aggregation::UniqueCount,
                tenant_slug: "acme".to_string(),
            },
            populate: false,
        }
    }

    fn service() -> (MeterService, Arc<RecordingExecutor>) {
        let executor = Arc::new(RecordingExecutor::default());
        let views = MeterViews::new(executor.clone());
        (MeterService::new(views, InMemoryMeterRegistry::new()), executor)
    }

    #[tokio::test]
    async fn test_create_then_duplicate_conflicts() {
        let (service, executor) = service();
        let cancel = CancellationToken::new();

        service.create_meter(create_request(), &cancel).await.unwrap();
        let err = service.create_meter(create_request(), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(executor.sql().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (service, executor) = service();
        let cancel = CancellationToken::new();
        let request = DeleteMeter { tenant_slug: "acme".to_string(), meter_slug: "sessions".to_string() };

        service.create_meter(create_request(), &cancel).await.unwrap();
        service.delete_meter(request.clone(), &cancel).await.unwrap();
        service.delete_meter(request, &cancel).await.unwrap();

        assert!(service.registry().is_empty().await);
        let sql = executor.sql();
        assert_eq!(sql.len(), 3);
        assert!(sql[1..].iter().all(|s| s == "DROP VIEW IF EXISTS rc_acme_sessions_mv"));
    }

    #[tokio::test]
    async fn test_query_uses_registered_aggregation() {
        let (service, executor) = service();
        let cancel = CancellationToken::new();
        service.create_meter(create_request(), &cancel).await.unwrap();

        let query = QueryMeter {
            tenant_slug: "acme".to_string(),
            meter_slug: "sessions".to_string(),
            aggregation: Aggregation::Sum,
            organizations: Vec::new(),
            users: Vec::new(),
            filter_group_by: BTreeMap::new(),
            from: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            to: Utc.with_ymd_and_hms(2023, 1, 1, 1, 0, 0).unwrap(),
            group_by: Vec::new(),
            window_size: None,
            window_timezone: None,
        };
        let out = service.query_meter(query.clone(), &cancel).await.unwrap();
        assert!(out.data.is_empty());
        assert_eq!((out.window_start, out.window_end), (query.from, query.to));
        assert!(executor.sql()[1].contains("toFloat64(uniqMerge(value)) AS value"));

        let mut unknown = query;
        unknown.meter_slug = "nope".to_string();
        let err = service.query_meter(unknown, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
