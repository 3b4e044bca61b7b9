use std::{env, net::SocketAddr};

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("invalid db port: {0}")]
    InvalidDbPort(String),
    #[error("invalid db pool size: {0}")]
    InvalidDbPoolSize(String),
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Which `LedgerStore`/`PriceStore`/... backend to construct at startup.
/// Mirrors the conditional-db wiring pattern: `Memory` is for local
/// development and tests, `Postgres` is the only backend fit for production.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

/// Long-poll tunables for one SQS queue consumer (§4.7).
#[derive(Clone, Debug)]
pub struct QueueTuning {
    pub max_messages: i32,
    pub visibility_timeout_seconds: i32,
    pub wait_time_seconds: i32,
    pub initial_delay_seconds: u64,
}

impl QueueTuning {
    fn from_env(prefix: &str, default_max_messages: i32) -> Result<Self, ConfigError> {
        Ok(Self {
            max_messages: parse_env_or(&format!("SQS_{prefix}_MAX_MESSAGES"), default_max_messages)?,
            visibility_timeout_seconds: parse_env_or(&format!("SQS_{prefix}_VISIBILITY_TIMEOUT"), 30)?,
            wait_time_seconds: parse_env_or(&format!("SQS_{prefix}_WAIT_TIME"), 20)?,
            initial_delay_seconds: parse_env_or(&format!("SQS_{prefix}_INITIAL_DELAY"), 0)?,
        })
    }
}

/// Per-service-type tunables for a periodic charging engine.
///
/// Mirrors the knobs every charger in the reference implementation exposes:
/// how long to sleep between ticks on success/failure, the throttling
/// thresholds for non-terminal charges, and how far back the rolling window
/// looks when selecting candidate jobs.
#[derive(Clone, Debug)]
pub struct ChargerTuning {
    pub loop_sleep_seconds: u64,
    pub error_sleep_seconds: u64,
    pub min_charging_interval_seconds: i64,
    pub min_charging_amount: Decimal,
    pub rolling_window_seconds: i64,
}

impl ChargerTuning {
    fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let loop_sleep_seconds = parse_env_or(&format!("CHARGE_{prefix}_LOOP_SLEEP"), 5)?;
        let error_sleep_seconds = parse_env_or(&format!("CHARGE_{prefix}_ERROR_SLEEP"), 30)?;
        let min_charging_interval_seconds =
            parse_env_or(&format!("CHARGE_{prefix}_MIN_CHARGING_INTERVAL"), 0)?;
        let min_charging_amount = env::var(format!("CHARGE_{prefix}_MIN_CHARGING_AMOUNT"))
            .ok()
            .map(|value| value.parse::<Decimal>())
            .transpose()
            .map_err(|error| ConfigError::InvalidValue {
                key: "CHARGE_*_MIN_CHARGING_AMOUNT",
                reason: error.to_string(),
            })?
            .unwrap_or(Decimal::ZERO);
        let rolling_window_seconds =
            parse_env_or(&format!("CHARGE_{prefix}_ROLLING_WINDOW"), 7 * 24 * 3600)?;
        Ok(Self {
            loop_sleep_seconds,
            error_sleep_seconds,
            min_charging_interval_seconds,
            min_charging_amount,
            rolling_window_seconds,
        })
    }
}

fn parse_env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|error| ConfigError::InvalidValue {
            key: Box::leak(key.to_string().into_boxed_str()),
            reason: error.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub build_sha: String,
    pub bind_addr: SocketAddr,
    pub log_level: String,
    pub log_format: String,

    pub store_backend: StoreBackend,
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub db_pool_size: usize,

    pub sqs_oneshot_queue_name: String,
    pub sqs_longrun_queue_name: String,
    pub sqs_storage_queue_name: String,
    pub sqs_region: Option<String>,
    pub sqs_endpoint_url: Option<String>,
    pub sqs_client_error_sleep_seconds: u64,
    pub queue_oneshot: QueueTuning,
    pub queue_longrun: QueueTuning,
    pub queue_storage: QueueTuning,

    pub charge_oneshot: ChargerTuning,
    pub charge_longrun: ChargerTuning,
    pub charge_storage: ChargerTuning,
    pub longrun_expiration_interval_seconds: i64,

    pub event_max_past_days: i64,
    pub event_max_future_seconds: i64,

    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let service_name = env::var("SERVICE_NAME").unwrap_or_else(|_| "accounting".to_string());
        let build_sha = env::var("BUILD_SHA").unwrap_or_else(|_| "unknown".to_string());
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|error: std::net::AddrParseError| {
                ConfigError::InvalidBindAddr(error.to_string())
            })?;
        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_format = env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

        let store_backend = match env::var("STORE_BACKEND").unwrap_or_else(|_| "postgres".to_string()).as_str() {
            "memory" => StoreBackend::Memory,
            "postgres" => StoreBackend::Postgres,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "STORE_BACKEND",
                    reason: format!("expected memory|postgres, got {other}"),
                })
            }
        };

        let db_host = env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string());
        let db_port = env::var("DB_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .map_err(|error: std::num::ParseIntError| ConfigError::InvalidDbPort(error.to_string()))?;
        let db_user = env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string());
        let db_password = env::var("DB_PASS").unwrap_or_default();
        let db_name = env::var("DB_NAME").unwrap_or_else(|_| "accounting".to_string());
        let db_pool_size = env::var("DB_POOL_SIZE")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|error: std::num::ParseIntError| {
                ConfigError::InvalidDbPoolSize(error.to_string())
            })?;

        let sqs_oneshot_queue_name =
            env::var("SQS_ONESHOT_QUEUE_NAME").unwrap_or_else(|_| "oneshot-events".to_string());
        let sqs_longrun_queue_name =
            env::var("SQS_LONGRUN_QUEUE_NAME").unwrap_or_else(|_| "longrun-events".to_string());
        let sqs_storage_queue_name =
            env::var("SQS_STORAGE_QUEUE_NAME").unwrap_or_else(|_| "storage-events".to_string());
        let sqs_region = env::var("SQS_REGION").ok();
        let sqs_endpoint_url = env::var("SQS_ENDPOINT_URL").ok();
        let sqs_client_error_sleep_seconds = parse_env_or("SQS_CLIENT_ERROR_SLEEP", 5)?;
        let queue_oneshot = QueueTuning::from_env("ONESHOT", 1)?;
        let queue_longrun = QueueTuning::from_env("LONGRUN", 10)?;
        let queue_storage = QueueTuning::from_env("STORAGE", 10)?;

        let charge_oneshot = ChargerTuning::from_env("ONESHOT")?;
        let charge_longrun = ChargerTuning::from_env("LONGRUN")?;
        let charge_storage = ChargerTuning::from_env("STORAGE")?;
        let longrun_expiration_interval_seconds =
            parse_env_or("CHARGE_LONGRUN_EXPIRATION_INTERVAL", 3600)?;

        let event_max_past_days = parse_env_or("EVENT_MAX_PAST_DAYS", 35)?;
        let event_max_future_seconds = parse_env_or("EVENT_MAX_FUTURE_SECONDS", 300)?;

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            service_name,
            build_sha,
            bind_addr,
            log_level,
            log_format,
            store_backend,
            db_host,
            db_port,
            db_user,
            db_password,
            db_name,
            db_pool_size,
            sqs_oneshot_queue_name,
            sqs_longrun_queue_name,
            sqs_storage_queue_name,
            sqs_region,
            sqs_endpoint_url,
            sqs_client_error_sleep_seconds,
            queue_oneshot,
            queue_longrun,
            queue_storage,
            charge_oneshot,
            charge_longrun,
            charge_storage,
            longrun_expiration_interval_seconds,
            event_max_past_days,
            event_max_future_seconds,
            cors_origins,
        })
    }
}
