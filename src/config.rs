//! Configuration for the courier dispatch service.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use courier_delivery::{
    BackoffStrategy, ClientConfig, DeliveryConfig, RestartPolicy, RetryPolicy, SweepConfig,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;

const CONFIG_FILE: &str = "courier.toml";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`courier.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Every field maps to the upper-cased environment variable of the same
/// name, e.g. `worker_count` is read from `WORKER_COUNT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// Database host.
    pub db_host: String,
    /// Database port.
    pub db_port: u16,
    /// Database user.
    pub db_user: String,
    /// Database password. Never logged.
    pub db_password: String,
    /// Database name; created at startup if missing.
    pub db_name: String,
    /// Maximum pooled connections. Each worker unit holds one for its
    /// whole life.
    pub db_pool_size: u32,
    /// Connection acquire timeout in seconds.
    pub db_acquire_timeout_secs: u64,

    // Workers
    /// Number of concurrent worker units.
    pub worker_count: usize,
    /// Candidates read per poll.
    pub candidate_batch_size: usize,
    /// Idle poll interval in milliseconds.
    pub poll_interval_ms: u64,

    // Retry
    /// Attempts after which a job becomes terminal `error`.
    pub max_attempts: u32,
    /// `fixed`, `linear`, `quadratic` or `exponential`.
    pub backoff_strategy: String,
    /// Backoff unit in seconds.
    pub backoff_base_delay_secs: u64,
    /// Backoff cap in seconds.
    pub backoff_max_delay_secs: u64,

    // HTTP
    /// Delivery request timeout in seconds.
    pub delivery_timeout_secs: u64,
    /// Callback request timeout in seconds.
    pub callback_timeout_secs: u64,

    // Recovery
    /// Claim age in seconds after which a job counts as stuck.
    pub stuck_job_threshold_secs: u64,
    /// Stuck-job sweep interval in seconds.
    pub sweep_interval_secs: u64,
    /// Restart failed worker units.
    pub restart_failed_workers: bool,
    /// Delay before restarting a unit, in milliseconds.
    pub worker_restart_delay_ms: u64,
    /// Graceful shutdown deadline in seconds.
    pub shutdown_timeout_secs: u64,

    /// Directory of `*.sql` migrations replacing the embedded schema.
    pub migrations_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_host: "localhost".to_string(),
            db_port: 5432,
            db_user: "postgres".to_string(),
            db_password: "password".to_string(),
            db_name: "webhooks".to_string(),
            db_pool_size: 20,
            db_acquire_timeout_secs: 10,
            worker_count: courier_delivery::DEFAULT_WORKER_COUNT,
            candidate_batch_size: courier_delivery::DEFAULT_BATCH_SIZE,
            poll_interval_ms: 100,
            max_attempts: courier_delivery::retry::DEFAULT_MAX_ATTEMPTS,
            backoff_strategy: BackoffStrategy::Quadratic.to_string(),
            backoff_base_delay_secs: 60,
            backoff_max_delay_secs: 6 * 60 * 60,
            delivery_timeout_secs: courier_delivery::DEFAULT_TIMEOUT_SECONDS,
            callback_timeout_secs: 10,
            stuck_job_threshold_secs: 300,
            sweep_interval_secs: 30,
            restart_failed_workers: true,
            worker_restart_delay_ms: 1000,
            shutdown_timeout_secs: 30,
            migrations_dir: None,
        }
    }
}

impl Config {
    /// Loads configuration from all sources and validates it.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or a value is invalid.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed("")),
        )
    }

    /// Extracts and validates configuration from a prepared figment.
    ///
    /// # Errors
    ///
    /// Returns error if extraction or validation fails.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values.
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be greater than 0");
        }

        if self.candidate_batch_size == 0 {
            anyhow::bail!("candidate_batch_size must be greater than 0");
        }

        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }

        if self.db_pool_size == 0 {
            anyhow::bail!("db_pool_size must be greater than 0");
        }

        let required = u32::try_from(self.worker_count).unwrap_or(u32::MAX).saturating_add(1);
        if self.db_pool_size < required {
            anyhow::bail!(
                "db_pool_size ({}) must be at least worker_count + 1 ({required})",
                self.db_pool_size
            );
        }

        if self.stuck_job_threshold_secs <= self.delivery_timeout_secs {
            anyhow::bail!("stuck_job_threshold_secs must be greater than delivery_timeout_secs");
        }

        if self.backoff_max_delay_secs < self.backoff_base_delay_secs {
            anyhow::bail!("backoff_max_delay_secs must not be smaller than backoff_base_delay_secs");
        }

        self.parse_backoff_strategy()?;
        Ok(())
    }

    fn parse_backoff_strategy(&self) -> Result<BackoffStrategy> {
        self.backoff_strategy.parse().context("Invalid backoff_strategy")
    }

    /// Connection options for the configured database.
    pub fn connect_options(&self) -> PgConnectOptions {
        self.connect_options_for(&self.db_name)
    }

    /// Connection options for another database on the same server.
    pub fn connect_options_for(&self, database: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.db_host)
            .port(self.db_port)
            .username(&self.db_user)
            .password(&self.db_password)
            .database(database)
    }

    /// Connection target for logging, without the password.
    pub fn connection_summary(&self) -> String {
        format!("postgres://{}@{}:{}/{}", self.db_user, self.db_host, self.db_port, self.db_name)
    }

    /// Converts to the delivery engine configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the backoff strategy is unknown.
    pub fn to_delivery_config(&self) -> Result<DeliveryConfig> {
        let defaults = DeliveryConfig::default();

        Ok(DeliveryConfig {
            worker_count: self.worker_count,
            batch_size: self.candidate_batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            client_config: ClientConfig {
                timeout: Duration::from_secs(self.delivery_timeout_secs),
                ..ClientConfig::default()
            },
            retry_policy: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_secs(self.backoff_base_delay_secs),
                max_delay: Duration::from_secs(self.backoff_max_delay_secs),
                backoff_strategy: self.parse_backoff_strategy()?,
            },
            restart_policy: RestartPolicy {
                enabled: self.restart_failed_workers,
                delay: Duration::from_millis(self.worker_restart_delay_ms),
            },
            sweep: SweepConfig {
                interval: Duration::from_secs(self.sweep_interval_secs),
                liveness_threshold: Duration::from_secs(self.stuck_job_threshold_secs),
            },
            callback_timeout: Duration::from_secs(self.callback_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            ..defaults
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, env, sync::Mutex};

    use super::*;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct TestEnvGuard {
        _lock: std::sync::MutexGuard<'static, ()>,
        originals: HashMap<String, Option<String>>,
    }

    impl TestEnvGuard {
        fn new() -> Self {
            let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Self { _lock: lock, originals: HashMap::new() }
        }

        fn set_var(&mut self, key: &str, value: &str) {
            self.originals.entry(key.to_string()).or_insert_with(|| env::var(key).ok());
            env::set_var(key, value);
        }
    }

    impl Drop for TestEnvGuard {
        fn drop(&mut self) {
            for (var, original) in &self.originals {
                match original {
                    Some(value) => env::set_var(var, value),
                    None => env::remove_var(var),
                }
            }
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.db_name, "webhooks");
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.candidate_batch_size, 5);
        assert_eq!(config.max_attempts, 20);
        assert_eq!(config.backoff_strategy, "quadratic");
        assert_eq!(config.backoff_max_delay_secs, 21_600);
        assert!(config.migrations_dir.is_none());
    }

    #[test]
    fn environment_overrides_defaults() {
        let mut guard = TestEnvGuard::new();
        guard.set_var("DB_HOST", "db.internal");
        guard.set_var("DB_PORT", "6543");
        guard.set_var("WORKER_COUNT", "8");
        guard.set_var("MAX_ATTEMPTS", "7");
        guard.set_var("BACKOFF_STRATEGY", "Linear");
        guard.set_var("RESTART_FAILED_WORKERS", "false");
        guard.set_var("MIGRATIONS_DIR", "/etc/courier/migrations");

        let config = Config::load().unwrap();
        assert_eq!(config.db_host, "db.internal");
        assert_eq!(config.db_port, 6543);
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.max_attempts, 7);
        assert!(!config.restart_failed_workers);
        assert_eq!(config.migrations_dir, Some(PathBuf::from("/etc/courier/migrations")));

        let delivery = config.to_delivery_config().unwrap();
        assert_eq!(delivery.retry_policy.backoff_strategy, BackoffStrategy::Linear);
        assert!(!delivery.restart_policy.enabled);
    }

    #[test]
    fn toml_file_values_apply() {
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string("worker_count = 2\ncandidate_batch_size = 9\ndb_name = \"jobs\""));

        let config = Config::from_figment(figment).unwrap();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.candidate_batch_size, 9);
        assert_eq!(config.db_name, "jobs");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = Config { worker_count: 0, ..Config::default() };
        assert!(config.validate().is_err());

        config = Config { max_attempts: 0, ..Config::default() };
        assert!(config.validate().is_err());

        config = Config { db_pool_size: 3, worker_count: 3, ..Config::default() };
        assert!(config.validate().is_err());

        config = Config {
            stuck_job_threshold_secs: 30,
            delivery_timeout_secs: 30,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        config = Config { backoff_strategy: "fibonacci".to_string(), ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn pool_of_workers_plus_one_is_enough() {
        let config = Config { db_pool_size: 4, worker_count: 3, ..Config::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn connection_summary_hides_password() {
        let config = Config { db_password: "secret123".to_string(), ..Config::default() };
        let summary = config.connection_summary();

        assert!(!summary.contains("secret123"));
        assert_eq!(summary, "postgres://postgres@localhost:5432/webhooks");
    }

    #[test]
    fn delivery_config_reflects_settings() {
        let config = Config {
            poll_interval_ms: 250,
            delivery_timeout_secs: 15,
            stuck_job_threshold_secs: 120,
            worker_restart_delay_ms: 500,
            ..Config::default()
        };

        let delivery = config.to_delivery_config().unwrap();
        assert!(delivery.validate().is_ok());
        assert_eq!(delivery.poll_interval, Duration::from_millis(250));
        assert_eq!(delivery.client_config.timeout, Duration::from_secs(15));
        assert_eq!(delivery.sweep.liveness_threshold, Duration::from_secs(120));
        assert_eq!(delivery.restart_policy.delay, Duration::from_millis(500));
        assert_eq!(delivery.retry_policy.backoff_strategy, BackoffStrategy::Quadratic);
        assert_eq!(delivery.retry_policy.max_delay, Duration::from_secs(21_600));
    }
}
