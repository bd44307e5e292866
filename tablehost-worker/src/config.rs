/// Worker configuration
///
/// Loaded with the `config` crate from `TABLEHOST_*` environment variables
/// (after `.env`, through `dotenvy`), on top of built-in defaults.
///
/// # Environment Variables
///
/// - `TABLEHOST_DATABASE_URL`: PostgreSQL connection URL (required)
/// - `TABLEHOST_DATABASE_MAX_CONNECTIONS`: Pool size (default: 5)
/// - `TABLEHOST_IDENTITY_PROVIDER_URL`: Identity provider base URL (required)
/// - `TABLEHOST_IDENTITY_PROVIDER_SERVICE_KEY`: Identity provider service key (required)
/// - `TABLEHOST_IDENTITY_PROVIDER_TIMEOUT_SECS`: Request timeout (default: 10)
/// - `TABLEHOST_POLL_INTERVAL_SECS`: Pause between sweeps (default: 30)
/// - `TABLEHOST_BATCH_SIZE`: Stalled attempts handled per sweep (default: 20)
/// - `TABLEHOST_STALE_AFTER_SECS`: Idle time after which an attempt counts as stalled (default: 300)

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::reconciler::ReconcilerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,

    pub identity_provider_url: String,
    pub identity_provider_service_key: String,
    pub identity_provider_timeout_secs: u64,

    pub poll_interval_secs: u64,
    pub batch_size: i64,
    pub stale_after_secs: i64,
}

impl WorkerConfig {
    /// Loads configuration from the process environment
    pub fn from_env() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        Self::load(None)
    }

    /// Loads configuration from `vars` instead of the process environment
    ///
    /// Keys are full variable names (`TABLEHOST_BATCH_SIZE`).
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, config::ConfigError> {
        Self::load(Some(vars))
    }

    fn load(vars: Option<HashMap<String, String>>) -> Result<Self, config::ConfigError> {
        let config: WorkerConfig = config::Config::builder()
            .set_default("database_max_connections", 5)?
            .set_default("identity_provider_timeout_secs", 10)?
            .set_default("poll_interval_secs", 30)?
            .set_default("batch_size", 20)?
            .set_default("stale_after_secs", 300)?
            .add_source(
                config::Environment::with_prefix("TABLEHOST")
                    .try_parsing(true)
                    .source(vars),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(config::ConfigError::Message(
                "TABLEHOST_POLL_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        if self.batch_size <= 0 {
            return Err(config::ConfigError::Message("TABLEHOST_BATCH_SIZE must be positive".to_string()));
        }
        if self.stale_after_secs <= 0 {
            return Err(config::ConfigError::Message(
                "TABLEHOST_STALE_AFTER_SECS must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            batch_size: self.batch_size,
            stale_after: chrono::Duration::seconds(self.stale_after_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> HashMap<String, String> {
        HashMap::from([
            (
                "TABLEHOST_DATABASE_URL".to_string(),
                "postgresql://localhost:5432/tablehost".to_string(),
            ),
            (
                "TABLEHOST_IDENTITY_PROVIDER_URL".to_string(),
                "http://localhost:9999".to_string(),
            ),
            (
                "TABLEHOST_IDENTITY_PROVIDER_SERVICE_KEY".to_string(),
                "service-key".to_string(),
            ),
        ])
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_vars(required()).unwrap();

        assert_eq!(config.database_max_connections, 5);
        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.stale_after_secs, 300);

        let reconciler = config.reconciler();
        assert_eq!(reconciler.poll_interval, Duration::from_secs(30));
        assert_eq!(reconciler.stale_after, chrono::Duration::minutes(5));
    }

    #[test]
    fn test_overrides() {
        let mut vars = required();
        vars.insert("TABLEHOST_BATCH_SIZE".to_string(), "50".to_string());
        vars.insert("TABLEHOST_STALE_AFTER_SECS".to_string(), "60".to_string());

        let config = WorkerConfig::from_vars(vars).unwrap();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.stale_after_secs, 60);
    }

    #[test]
    fn test_missing_database_url() {
        let mut vars = required();
        vars.remove("TABLEHOST_DATABASE_URL");

        assert!(WorkerConfig::from_vars(vars).is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut vars = required();
        vars.insert("TABLEHOST_BATCH_SIZE".to_string(), "0".to_string());

        assert!(WorkerConfig::from_vars(vars).is_err());
    }
}
