//! Meter registry: resolving event types and slugs to meter definitions.

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::RwLock;
use crate::error::{MeterError, Result};
use crate::meter::Meter;

/// Bulk lookup of meters by the event types they consume.
///
/// Implemented by whatever store owns meter persistence. A type with no
/// meter is simply absent from the result; it is not an error.
#[async_trait]
pub trait MeterLookup: Send + Sync {
    async fn list_meters_by_event_types(&self, event_types: &[String]) -> Result<Vec<Meter>>;
}

#[derive(Debug)]
pub struct InMemoryMeterRegistry {
    /// Keyed by (tenant slug, meter slug).
    meters: Arc<RwLock<HashMap<(String, String), Meter>>>,
}

impl Clone for InMemoryMeterRegistry {
    fn clone(&self) -> Self {
        Self {
            meters: self.meters.clone(),
        }
    }
}

impl Default for InMemoryMeterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMeterRegistry {
    pub fn new() -> Self {
        Self {
            meters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Builds a registry from meters loaded elsewhere, e.g. a JSON file.
    pub async fn from_meters(meters: impl IntoIterator<Item = Meter>) -> Result<Self> {
        let registry = Self::new();
        for meter in meters {
            registry.insert(meter).await?;
        }
        Ok(registry)
    }

    pub async fn insert(&self, meter: Meter) -> Result<()> {
        meter.validate()?;
        let key = (meter.tenant_slug.clone(), meter.slug.clone());
        let mut meters = self.meters.write().await;
        if meters.contains_key(&key) {
            return Err(MeterError::conflict(format!(
                "meter {} already exists for tenant {}",
                key.1, key.0
            )));
        }
        meters.insert(key, meter);
        Ok(())
    }

    pub async fn get(&self, tenant_slug: &str, meter_slug: &str) -> Result<Meter> {
        let meters = self.meters.read().await;
        meters
            .get(&(tenant_slug.to_string(), meter_slug.to_string()))
            .cloned()
            .ok_or_else(|| {
                MeterError::not_found(format!("meter {} not found for tenant {}", meter_slug, tenant_slug))
            })
    }

    /// Removes a meter, returning it if it was registered.
    pub async fn remove(&self, tenant_slug: &str, meter_slug: &str) -> Option<Meter> {
        let mut meters = self.meters.write().await;
        meters.remove(&(tenant_slug.to_string(), meter_slug.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.meters.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.meters.read().await.is_empty()
    }
}

#[async_trait]
impl MeterLookup for InMemoryMeterRegistry {
    async fn list_meters_by_event_types(&self, event_types: &[String]) -> Result<Vec<Meter>> {
        let meters = self.meters.read().await;
        let mut found: Vec<Meter> = meters
            .values()
            .filter(|m| event_types.iter().any(|t| *t == m.event_type))
            .cloned()
            .collect();
        found.sort_by(|a, b| (&a.tenant_slug, &a.slug).cmp(&(&b.tenant_slug, &b.slug)));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::Aggregation;
    use crate::error::ErrorKind;

    fn meter(slug: &str, event_type: &str) -> Meter {
        Meter {
            name: slug.to_string(),
            slug: slug.to_string(),
            event_type: event_type.to_string(),
            description: None,
            value_property: None,
            properties: Vec::new(),
            aggregation: Aggregation::Count,
            tenant_slug: "acme".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let registry = InMemoryMeterRegistry::new();
        registry.insert(meter("calls", "api_call")).await.unwrap();
        let err = registry.insert(meter("calls", "other")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_insert_validates_meter() {
        let registry = InMemoryMeterRegistry::new();
        let mut bad = meter("tokens", "llm_call");
        bad.aggregation = Aggregation::Sum;
        assert_eq!(registry.insert(bad).await.unwrap_err().kind(), ErrorKind::InvalidInput);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_lookup_by_event_types() {
        let registry = InMemoryMeterRegistry::from_meters(vec![
            meter("a", "type1"),
            meter("b", "type1"),
            meter("c", "type2"),
        ])
        .await
        .unwrap();

        let found = registry
            .list_meters_by_event_types(&["type1".to_string(), "type3".to_string()])
            .await
            .unwrap();
        let slugs: Vec<_> = found.iter().map(|m| m.slug.as_str()).collect();
        assert_eq!(slugs, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_get_and_remove() {
        let registry = InMemoryMeterRegistry::new();
        registry.insert(meter("calls", "api_call")).await.unwrap();
        assert_eq!(registry.get("acme", "calls").await.unwrap().event_type, "api_call");

        assert!(registry.remove("acme", "calls").await.is_some());
        assert!(registry.remove("acme", "calls").await.is_none());
        assert_eq!(registry.get("acme", "calls").await.unwrap_err().kind(), ErrorKind::NotFound);
    }
}
