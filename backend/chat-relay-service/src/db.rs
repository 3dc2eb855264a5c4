use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::{error, info};

use crate::config::DatabaseConfig;
use crate::error::StoreError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Schema files, applied in order. Every statement is idempotent.
const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_chat_relay",
    include_str!("../migrations/0001_chat_relay.sql"),
)];

/// Build the pool, verify one connection and apply the schema.
pub async fn init_pool(config: &DatabaseConfig) -> Result<Pool, StoreError> {
    let pg_config: tokio_postgres::Config = config.url.parse()?;

    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(mgr)
        .max_size(config.max_connections)
        .wait_timeout(Some(ACQUIRE_TIMEOUT))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| StoreError::Unavailable(format!("pool build: {e}")))?;

    match tokio::time::timeout(CONNECT_TIMEOUT, verify(&pool)).await {
        Ok(Ok(())) => {
            info!(
                max_connections = config.max_connections,
                "database pool created and verified"
            );
        }
        Ok(Err(e)) => {
            error!(error = %e, "database connection verification failed");
            return Err(e);
        }
        Err(_) => {
            error!(
                timeout_secs = CONNECT_TIMEOUT.as_secs(),
                "database connection verification timeout"
            );
            return Err(StoreError::Unavailable("connect timeout".into()));
        }
    }

    migrate(&pool).await?;
    Ok(pool)
}

async fn verify(pool: &Pool) -> Result<(), StoreError> {
    let client = pool.get().await?;
    client.simple_query("SELECT 1").await?;
    Ok(())
}

pub async fn migrate(pool: &Pool) -> Result<(), StoreError> {
    let client = pool.get().await?;
    for (name, sql) in MIGRATIONS {
        client.batch_execute(sql).await?;
        info!(migration = name, "schema migration applied");
    }
    Ok(())
}
