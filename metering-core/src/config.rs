//! Aggregation store connection settings.
//!
//! The `[store]` section of the service configuration deserializes into
//! [`StoreConfig`]. Credentials are never read from configuration files; they
//! are attached afterwards from the environment:
//! - `METERING_STORE_USERNAME` - store username
//! - `METERING_STORE_PASSWORD` - store password

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

pub const STORE_USERNAME_ENV: &str = "METERING_STORE_USERNAME";
pub const STORE_PASSWORD_ENV: &str = "METERING_STORE_PASSWORD";

/// Connection settings for the aggregation store.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// HTTP endpoint, e.g. `http://localhost:8123`
    pub url: String,
    /// Database holding the events table and meter views
    #[serde(default = "default_database")]
    pub database: String,
    /// Per-statement timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra settings passed to the store with every statement
    #[serde(default)]
    pub options: HashMap<String, String>,
    /// Authentication credentials (not deserialized)
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

fn default_database() -> String {
    "default".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: default_database(),
            timeout_secs: default_timeout_secs(),
            options: HashMap::new(),
            credentials: None,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Attaches store credentials from the environment, if both are set.
    pub fn with_env_credentials(mut self) -> Self {
        self.credentials = Credentials::from_env(STORE_USERNAME_ENV, STORE_PASSWORD_ENV);
        self
    }
}

/// Username and password for the store or the event bus.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Reads credentials from a pair of environment variables. Both must be set.
    pub fn from_env(username_var: &str, password_var: &str) -> Option<Self> {
        match (env::var(username_var).ok(), env::var(password_var).ok()) {
            (Some(username), Some(password)) => Some(Self { username, password }),
            _ => None,
        }
    }
}
