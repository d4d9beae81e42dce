//! Postgres backend.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{ResultRow, SaveResult, StorageBackend, StorageError, StoreConfig};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS monitoring_results (
    id             BIGSERIAL PRIMARY KEY,
    namespace      TEXT NOT NULL,
    inference_name TEXT NOT NULL,
    node_name      TEXT NOT NULL DEFAULT '',
    metric_key     TEXT NOT NULL,
    metric_value   TEXT NOT NULL,
    created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (namespace, inference_name, node_name, metric_key)
)
"#;

const CREATE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS monitoring_results_lookup
    ON monitoring_results (namespace, inference_name, updated_at DESC)
"#;

impl<'r> sqlx::FromRow<'r, PgRow> for ResultRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let node_name: String = row.try_get("node_name")?;
        Ok(Self {
            node_name: (!node_name.is_empty()).then_some(node_name),
            key: row.try_get("metric_key")?,
            value: row.try_get("metric_value")?,
        })
    }
}

/// Metrics backend over a Postgres connection pool.
///
/// `save` and `get` never wait on `initialize`: until a pool is installed
/// they fail fast with [`StorageError::NotInitialized`].
pub struct PostgresBackend {
    config: StoreConfig,
    pool: RwLock<Option<PgPool>>,
    /// Serializes concurrent `initialize` calls.
    init: Mutex<()>,
}

/// Run one query, bounded by `limit`.
async fn bounded<T>(
    limit: Duration,
    query: impl Future<Output = Result<T, sqlx::Error>>,
) -> Result<T, StorageError> {
    tokio::time::timeout(limit, query)
        .await
        .map_err(|_| StorageError::QueryTimeout(limit))?
        .map_err(StorageError::Query)
}

impl PostgresBackend {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
            init: Mutex::new(()),
        }
    }

    async fn pool(&self) -> Result<PgPool, StorageError> {
        match self.pool.read().await.as_ref() {
            Some(pool) if !pool.is_closed() => Ok(pool.clone()),
            _ => Err(StorageError::NotInitialized(self.name())),
        }
    }

    /// Retry the connection until it succeeds or the connect window runs out.
    async fn connect_with_retry(&self) -> Result<PgPool, StorageError> {
        let attempt = async {
            loop {
                match PgPoolOptions::new()
                    .max_connections(self.config.max_connections)
                    .acquire_timeout(self.config.query_timeout)
                    .connect(&self.config.database_url)
                    .await
                {
                    Ok(pool) => return pool,
                    Err(e) => {
                        warn!(
                            error = %e,
                            retry_in_secs = self.config.connect_interval.as_secs(),
                            "Database not reachable yet"
                        );
                        tokio::time::sleep(self.config.connect_interval).await;
                    }
                }
            }
        };

        tokio::time::timeout(self.config.connect_timeout, attempt)
            .await
            .map_err(|_| StorageError::ConnectTimeout(self.config.connect_timeout))
    }
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    async fn initialize(&self) -> Result<(), StorageError> {
        let _init = self.init.lock().await;
        if self.pool().await.is_ok() {
            return Ok(());
        }

        info!(max_connections = self.config.max_connections, "Connecting to metrics database");
        let pool = self.connect_with_retry().await?;

        let limit = self.config.query_timeout;
        bounded(limit, sqlx::query(CREATE_TABLE).execute(&pool)).await?;
        bounded(limit, sqlx::query(CREATE_INDEX).execute(&pool)).await?;

        info!("Metrics database ready");
        *self.pool.write().await = Some(pool);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            info!("Metrics database connection closed");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn save(&self, result: &SaveResult) -> Result<(), StorageError> {
        result.validate()?;
        let pool = self.pool().await?;

        debug!(
            namespace = %result.namespace,
            inference = %result.inference_name,
            key = %result.key,
            "Saving monitoring result"
        );

        let query = sqlx::query(
            r#"
            INSERT INTO monitoring_results
                (namespace, inference_name, node_name, metric_key, metric_value)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (namespace, inference_name, node_name, metric_key)
            DO UPDATE SET metric_value = EXCLUDED.metric_value, updated_at = now()
            "#,
        )
        .bind(&result.namespace)
        .bind(&result.inference_name)
        .bind(result.node_key())
        .bind(&result.key)
        .bind(&result.value);

        bounded(self.config.query_timeout, query.execute(&pool)).await?;
        Ok(())
    }

    async fn get(
        &self,
        namespace: &str,
        inference_name: &str,
    ) -> Result<Vec<ResultRow>, StorageError> {
        let pool = self.pool().await?;

        let query = sqlx::query_as::<_, ResultRow>(
            r#"
            SELECT node_name, metric_key, metric_value
            FROM monitoring_results
            WHERE namespace = $1 AND inference_name = $2
            ORDER BY updated_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(namespace)
        .bind(inference_name)
        .bind(self.config.window);

        bounded(self.config.query_timeout, query.fetch_all(&pool)).await
    }
}
