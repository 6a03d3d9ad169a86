//! Postgres / TimescaleDB 时序写入实现

use crate::error::StorageError;
use crate::traits::TimeSeriesStore;
use domain::Point;
use sqlx::PgPool;
use tracing::info;

pub struct PgTimeSeriesStore {
    pub pool: PgPool,
    table: String,
}

impl PgTimeSeriesStore {
    /// `table` 必须是合法标识符（配置加载时已校验），会直接拼入 SQL。
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    pub async fn connect(
        database_url: &str,
        username: Option<&str>,
        password: Option<&str>,
        table: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let pool = crate::connection::connect_pool(database_url, username, password).await?;
        Ok(Self::new(pool, table))
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn upsert_sql(&self) -> String {
        format!(
            "insert into {} (measurement, tags, ts, fields) \
             values ($1, $2::jsonb, to_timestamp($3 / 1000.0), $4::jsonb) \
             on conflict (measurement, tags, ts) do update set fields = excluded.fields",
            self.table
        )
    }

    async fn target_exists(&self) -> Result<bool, StorageError> {
        let exists: bool = sqlx::query_scalar(
            "select exists (select 1 from information_schema.tables \
             where table_schema = current_schema() and table_name = $1)",
        )
        .bind(&self.table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn timescale_available(&self) -> Result<bool, StorageError> {
        let available: bool = sqlx::query_scalar(
            "select exists (select 1 from pg_extension where extname = 'timescaledb')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(available)
    }
}

#[async_trait::async_trait]
impl TimeSeriesStore for PgTimeSeriesStore {
    async fn ensure_target(&self) -> Result<bool, StorageError> {
        if self.target_exists().await? {
            return Ok(false);
        }
        let create = format!(
            "create table if not exists {} ( \
             measurement text not null, \
             tags jsonb not null, \
             ts timestamptz not null, \
             fields jsonb not null, \
             primary key (measurement, tags, ts))",
            self.table
        );
        sqlx::query(&create).execute(&self.pool).await?;
        let hypertable = self.timescale_available().await?;
        if hypertable {
            sqlx::query("select create_hypertable($1::regclass, 'ts', if_not_exists => true)")
                .bind(&self.table)
                .execute(&self.pool)
                .await?;
        }
        info!(
            target: "bridge.storage",
            table = %self.table,
            hypertable = hypertable,
            "storage_target_created"
        );
        Ok(true)
    }

    async fn write_points(&self, points: &[Point]) -> Result<usize, StorageError> {
        if points.is_empty() {
            return Ok(0);
        }
        let sql = self.upsert_sql();
        let mut tx = self.pool.begin().await?;
        for point in points {
            let tags = serde_json::to_string(&point.tags)
                .map_err(|err| StorageError::rejected(err.to_string()))?;
            let fields = serde_json::to_string(&point.fields)
                .map_err(|err| StorageError::rejected(err.to_string()))?;
            sqlx::query(&sql)
                .bind(&point.measurement)
                .bind(tags)
                .bind(point.ts_ms as f64)
                .bind(fields)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(points.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    #[tokio::test]
    async fn upsert_targets_configured_table() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/iot")
            .expect("lazy pool");
        let store = PgTimeSeriesStore::new(pool, "iot_monitoring");
        let sql = store.upsert_sql();
        assert!(sql.starts_with("insert into iot_monitoring "));
        assert!(sql.contains("on conflict (measurement, tags, ts) do update"));
    }
}
