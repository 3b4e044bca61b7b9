use std::time::Duration;

use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::error;

use crate::config::Config;

/// Shared, pooled connection to the accounting database.
///
/// A single `Pool` is created at startup and handed to every store and every
/// background task. Individual callers check out a client with `get()` and
/// return it to the pool on drop; nothing here serializes access globally.
#[derive(Clone)]
pub struct RuntimeDb {
    pool: Pool,
}

impl RuntimeDb {
    pub async fn connect(config: &Config) -> Result<Self, anyhow::Error> {
        let mut pool_config = PoolConfig::new();
        pool_config.host = Some(config.db_host.clone());
        pool_config.port = Some(config.db_port);
        pool_config.user = Some(config.db_user.clone());
        pool_config.password = Some(config.db_password.clone());
        pool_config.dbname = Some(config.db_name.clone());
        pool_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        pool_config.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.db_pool_size,
            ..Default::default()
        });

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|error| anyhow::anyhow!("failed to create postgres pool: {error}"))?;

        // fail fast rather than discovering a bad DSN on the first request
        let client = pool
            .get()
            .await
            .map_err(|error| anyhow::anyhow!("failed to reach postgres: {error}"))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|error| anyhow::anyhow!("postgres health probe failed: {error}"))?;
        drop(client);

        Ok(Self { pool })
    }

    pub async fn get(&self) -> Result<deadpool_postgres::Client, deadpool_postgres::PoolError> {
        self.pool.get().await
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn readiness_timeout(&self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.get()).await,
            Ok(Ok(_))
        )
    }
}

pub fn log_pool_error(context: &str, error: &deadpool_postgres::PoolError) {
    error!(reason = %error, context, "postgres pool error");
}
