use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Executor, Row};
use tracing::debug;

use super::{is_variable_name, redact, ConnectionFactory, Connector, DigestRow};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const DIGEST_QUERY: &str = "SELECT \
    IFNULL(SCHEMA_NAME, '') AS schema_name, \
    IFNULL(DIGEST, '') AS digest, \
    IFNULL(DIGEST_TEXT, '') AS digest_text, \
    COUNT_STAR, SUM_TIMER_WAIT, MIN_TIMER_WAIT, AVG_TIMER_WAIT, MAX_TIMER_WAIT, \
    SUM_LOCK_TIME, SUM_ERRORS, SUM_WARNINGS, \
    SUM_ROWS_AFFECTED, SUM_ROWS_SENT, SUM_ROWS_EXAMINED, \
    SUM_CREATED_TMP_DISK_TABLES, SUM_CREATED_TMP_TABLES, \
    SUM_SELECT_FULL_JOIN, SUM_SELECT_SCAN, SUM_SORT_MERGE_PASSES, \
    SUM_NO_INDEX_USED, SUM_NO_GOOD_INDEX_USED \
    FROM performance_schema.events_statements_summary_by_digest";

/// [`Connector`] over a single-connection sqlx pool.
pub struct SqlxConnector {
    dsn: String,
    pool: tokio::sync::Mutex<Option<MySqlPool>>,
}

impl SqlxConnector {
    pub fn new(dsn: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            pool: tokio::sync::Mutex::new(None),
        }
    }

    async fn pool(&self) -> Result<MySqlPool> {
        let mut pool = self.pool.lock().await;
        if let Some(p) = pool.as_ref() {
            return Ok(p.clone());
        }

        let p = MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(CONNECT_TIMEOUT)
            .idle_timeout(IDLE_TIMEOUT)
            .connect(&self.dsn)
            .await
            .with_context(|| format!("connecting to {}", redact(&self.dsn)))?;

        debug!(dsn = %redact(&self.dsn), "mysql connected");
        *pool = Some(p.clone());
        Ok(p)
    }
}

fn col(row: &MySqlRow, name: &str) -> Result<u64> {
    row.try_get::<u64, _>(name)
        .with_context(|| format!("reading column {name}"))
}

fn digest_row(row: &MySqlRow) -> Result<DigestRow> {
    Ok(DigestRow {
        schema: row.try_get("schema_name")?,
        digest: row.try_get("digest")?,
        digest_text: row.try_get("digest_text")?,
        count_star: col(row, "COUNT_STAR")?,
        sum_timer_wait: col(row, "SUM_TIMER_WAIT")?,
        min_timer_wait: col(row, "MIN_TIMER_WAIT")?,
        avg_timer_wait: col(row, "AVG_TIMER_WAIT")?,
        max_timer_wait: col(row, "MAX_TIMER_WAIT")?,
        sum_lock_time: col(row, "SUM_LOCK_TIME")?,
        sum_errors: col(row, "SUM_ERRORS")?,
        sum_warnings: col(row, "SUM_WARNINGS")?,
        sum_rows_affected: col(row, "SUM_ROWS_AFFECTED")?,
        sum_rows_sent: col(row, "SUM_ROWS_SENT")?,
        sum_rows_examined: col(row, "SUM_ROWS_EXAMINED")?,
        sum_created_tmp_disk_tables: col(row, "SUM_CREATED_TMP_DISK_TABLES")?,
        sum_created_tmp_tables: col(row, "SUM_CREATED_TMP_TABLES")?,
        sum_select_full_join: col(row, "SUM_SELECT_FULL_JOIN")?,
        sum_select_scan: col(row, "SUM_SELECT_SCAN")?,
        sum_sort_merge_passes: col(row, "SUM_SORT_MERGE_PASSES")?,
        sum_no_index_used: col(row, "SUM_NO_INDEX_USED")?,
        sum_no_good_index_used: col(row, "SUM_NO_GOOD_INDEX_USED")?,
    })
}

impl Connector for SqlxConnector {
    fn dsn(&self) -> &str {
        &self.dsn
    }

    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.pool().await.map(|_| ()) })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(pool) = self.pool.lock().await.take() {
                pool.close().await;
            }
        })
    }

    fn exec<'a>(&'a self, queries: &'a [String]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            for q in queries {
                // Plain text protocol: SET GLOBAL and friends are not
                // always preparable.
                pool.execute(q.as_str())
                    .await
                    .with_context(|| format!("executing {q}"))?;
            }
            Ok(())
        })
    }

    fn uptime(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let row = sqlx::query("SHOW GLOBAL STATUS LIKE 'Uptime'")
                .fetch_optional(&pool)
                .await
                .context("reading Uptime")?;

            let Some(row) = row else {
                bail!("Uptime status variable not found");
            };
            let value: String = row.try_get(1).context("decoding Uptime")?;
            value
                .trim()
                .parse()
                .with_context(|| format!("parsing Uptime {value}"))
        })
    }

    fn global_var<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            if !is_variable_name(name) {
                bail!("invalid variable name: {name}");
            }

            let pool = self.pool().await?;
            let row = sqlx::query(&format!("SELECT CAST(@@GLOBAL.{name} AS CHAR) AS value"))
                .fetch_one(&pool)
                .await
                .with_context(|| format!("reading @@GLOBAL.{name}"))?;

            Ok(row.try_get::<Option<String>, _>("value")?)
        })
    }

    fn digest_rows(&self) -> BoxFuture<'_, Result<Vec<DigestRow>>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let rows = sqlx::query(DIGEST_QUERY)
                .fetch_all(&pool)
                .await
                .context("reading statement digests")?;

            rows.iter().map(digest_row).collect()
        })
    }
}

/// Factory handing out [`SqlxConnector`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlxConnectionFactory;

impl ConnectionFactory for SqlxConnectionFactory {
    fn make(&self, dsn: &str) -> Arc<dyn Connector> {
        Arc::new(SqlxConnector::new(dsn))
    }
}
