/*!
# metering-core: Meter Views and Windowed Queries

metering-core turns meter definitions into continuously maintained aggregation
views and turns read requests into windowed queries against them.

## Key Features

### Aggregation Definition Compiler
- One materialized view per (tenant, meter), named deterministically
- Partial aggregates per organization, user, 1-minute bucket and dimension values
- Dimension order never changes the generated statement
- Optional backfill from events already stored

### Windowed Query Builder
- Re-bucketing into minute, hour or day tumbling windows
- Organization, user and dimension filters
- Every caller-supplied value bound as a statement argument

### Store Access
- `StatementExecutor` seam with a ClickHouse HTTP implementation
- Classified errors (`invalid_input`, `not_found`, `conflict`, `unavailable`,
  `timeout`, `cancelled`, `internal`)
- Cancellation of every store call through a `CancellationToken`

## Usage

```rust,no_run
use metering_core::aggregation::Aggregation;
use metering_core::config::StoreConfig;
use metering_core::meter::{CreateMeter, Meter};
use metering_core::registry::InMemoryMeterRegistry;
use metering_core::service::MeterService;
use metering_core::storage::{clickhouse::ClickHouseExecutor, MeterViews};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = StoreConfig::default().with_env_credentials();
    let executor = Arc::new(ClickHouseExecutor::new(&config)?);
    let service = MeterService::new(MeterViews::new(executor), InMemoryMeterRegistry::new());

    let request = CreateMeter {
        meter: Meter {
            name: "LLM tokens".to_string(),
            slug: "llm_tokens".to_string(),
            event_type: "llm_call".to_string(),
            description: None,
            value_property: Some("tokens".to_string()),
            properties: vec!["model".to_string()],
            aggregation: Aggregation::Sum,
            tenant_slug: "acme".to_string(),
        },
        populate: false,
    };
    service.create_meter(request, &CancellationToken::new()).await?;
    Ok(())
}
```
*/

pub mod aggregation;
pub mod compiler;
pub mod config;
pub mod error;
pub mod meter;
pub mod query;
pub mod registry;
pub mod service;
pub mod statement;
pub mod storage;
pub mod view;

pub use error::{ErrorKind, MeterError, Result};
pub use service::MeterService;
