//! ClickHouse executor over the HTTP interface.
//!
//! # Configuration
//!
//! ```toml
//! [store]
//! url = "http://localhost:8123"
//! database = "metering"
//! timeout_secs = 30
//! options = { max_execution_time = "25" }
//! ```
//!
//! Credentials come from `METERING_STORE_USERNAME` and
//! `METERING_STORE_PASSWORD` and are sent as `X-ClickHouse-User` /
//! `X-ClickHouse-Key` headers. Statement arguments are rendered into escaped
//! literals client-side before the statement is sent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use crate::config::{Credentials, StoreConfig};
use crate::error::{MeterError, Result};
use crate::statement::Statement;
use crate::storage::{Row, StatementExecutor};

const EXCEPTION_CODE_HEADER: &str = "X-ClickHouse-Exception-Code";

pub struct ClickHouseExecutor {
    client: Client,
    url: String,
    database: String,
    options: HashMap<String, String>,
    credentials: Option<Credentials>,
    closed: AtomicBool,
}

impl ClickHouseExecutor {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| MeterError::internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            database: config.database.clone(),
            options: config.options.clone(),
            credentials: config.credentials.clone(),
            closed: AtomicBool::new(false),
        })
    }

    async fn send(&self, sql: String) -> Result<String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MeterError::unavailable("store connection is closed"));
        }

        let mut request = self
            .client
            .post(&self.url)
            .query(&[("database", self.database.as_str())])
            .query(&self.options)
            .body(sql);
        if let Some(creds) = &self.credentials {
            request = request
                .header("X-ClickHouse-User", &creds.username)
                .header("X-ClickHouse-Key", &creds.password);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let code = response
            .headers()
            .get(EXCEPTION_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok());
        let body = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(map_error(code, &body));
        }
        Ok(body)
    }
}

#[async_trait]
impl StatementExecutor for ClickHouseExecutor {
    async fn execute(&self, statement: &Statement) -> Result<()> {
        let sql = statement.render()?;
        debug!(sql = %sql, "executing statement");
        self.send(sql).await.map(|_| ())
    }

    async fn query(&self, statement: &Statement) -> Result<Vec<Row>> {
        let sql = format!("{}\nFORMAT JSONEachRow", statement.render()?);
        debug!(sql = %sql, "running query");
        let body = self.send(sql).await?;
        parse_json_each_row(&body)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

fn parse_json_each_row(body: &str) -> Result<Vec<Row>> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<Row>(line)
                .map_err(|e| MeterError::internal(format!("malformed result row: {}", e)))
        })
        .collect()
}

fn map_transport_error(err: reqwest::Error) -> MeterError {
    if err.is_timeout() {
        MeterError::timeout(format!("ClickHouse operation timed out: {}", err))
    } else if err.is_connect() {
        MeterError::unavailable(format!("ClickHouse service unavailable: {}", err))
    } else {
        map_error(None, &err.to_string())
    }
}

/// Pulls the number out of a `Code: 60. DB::Exception: ...` message.
pub fn extract_error_code(message: &str) -> Option<u32> {
    let lower = message.to_lowercase();
    let start = lower.find("code: ")? + "code: ".len();
    let digits: String = lower[start..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Classifies a ClickHouse failure, by exception code first and by message
/// pattern otherwise.
pub fn map_error(code: Option<u32>, message: &str) -> MeterError {
    let detail = message.trim();
    let code = code.or_else(|| extract_error_code(detail));

    match code {
        Some(516) | Some(497) => {
            return MeterError::internal(format!("authentication failed with ClickHouse: {}", detail))
        }
        Some(81) => return MeterError::not_found(format!("database does not exist: {}", detail)),
        Some(60) => return MeterError::not_found(format!("table does not exist: {}", detail)),
        Some(47) => return MeterError::invalid_input(format!("column does not exist: {}", detail)),
        Some(62) => return MeterError::invalid_input(format!("SQL syntax error: {}", detail)),
        Some(57) => return MeterError::conflict(format!("table already exists: {}", detail)),
        Some(159) => return MeterError::timeout(format!("query execution timed out: {}", detail)),
        Some(160) | Some(241) => {
            return MeterError::unavailable(format!("store resource limit exceeded: {}", detail))
        }
        _ => {}
    }

    let lower = detail.to_lowercase();
    let has = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if has(&["connection refused", "connection reset", "broken pipe"]) {
        MeterError::unavailable(format!("ClickHouse service unavailable: {}", detail))
    } else if has(&["authentication failed", "access denied"]) {
        MeterError::internal(format!("failed to authenticate with ClickHouse: {}", detail))
    } else if has(&["no such table", "table does not exist", "database does not exist"]) {
        MeterError::not_found(detail.to_string())
    } else if has(&["no such column", "unknown column", "syntax error", "type mismatch"]) {
        MeterError::invalid_input(detail.to_string())
    } else if has(&["duplicate", "already exists"]) {
        MeterError::conflict(detail.to_string())
    } else if has(&["timeout", "timed out", "deadline exceeded"]) {
        MeterError::timeout(format!("ClickHouse operation timed out: {}", detail))
    } else {
        MeterError::internal(format!("ClickHouse error: {}", detail))
    }
}
