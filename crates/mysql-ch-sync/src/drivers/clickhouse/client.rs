//! ClickHouse HTTP client and destination store.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sql::{self, lenient_u64};
use crate::config::ClickHouseConfig;
use crate::core::identifier::{qualify, quote_ident, quote_literal};
use crate::core::schema::{ColumnMapping, SourceLink, TableStats};
use crate::core::traits::{
    DestinationStore, ProgressCallback, ProgressControl, StreamResult, TransferProgress,
};
use crate::error::{Result, SyncError};

const EXCEPTION_CODE_HEADER: &str = "X-ClickHouse-Exception-Code";
const SUMMARY_HEADER: &str = "X-ClickHouse-Summary";

/// Client for the ClickHouse HTTP interface.
///
/// Statements are sent as the POST body; `{name:Type}` placeholders are bound
/// through `param_name` query arguments.
pub struct ClickHouseClient {
    http: Client,
    url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
    request_timeout: Duration,
    progress_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct ProgressRow {
    #[serde(deserialize_with = "lenient_u64")]
    read_rows: u64,
    #[serde(deserialize_with = "lenient_u64")]
    read_bytes: u64,
    #[serde(deserialize_with = "lenient_u64")]
    total_rows_approx: u64,
}

#[derive(Debug, Default, Deserialize)]
struct Summary {
    #[serde(default, deserialize_with = "lenient_u64")]
    read_rows: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    read_bytes: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    total_rows_to_read: u64,
}

#[derive(Debug, Deserialize)]
struct MaxRow {
    v: Option<String>,
    #[serde(deserialize_with = "lenient_u64")]
    n: u64,
}

#[derive(Debug, Deserialize)]
struct StatsRow {
    #[serde(deserialize_with = "lenient_u64")]
    parts: u64,
    #[serde(deserialize_with = "lenient_u64")]
    rows: u64,
    #[serde(deserialize_with = "lenient_u64")]
    bytes_on_disk: u64,
    #[serde(deserialize_with = "lenient_u64")]
    compressed_bytes: u64,
    #[serde(deserialize_with = "lenient_u64")]
    uncompressed_bytes: u64,
    last_modified: Option<String>,
    engine: Option<String>,
    #[serde(deserialize_with = "lenient_u64")]
    total_rows: u64,
}

impl ClickHouseClient {
    /// Build a client and verify the server answers.
    pub async fn connect(config: &ClickHouseConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SyncError::connectivity("clickhouse", e))?;

        let client = Self {
            http,
            url: config.url.trim_end_matches('/').to_string(),
            database: config.db.clone(),
            user: config.username.clone(),
            password: config.password.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            progress_interval: Duration::from_millis(config.progress_interval_ms),
        };

        client
            .fetch_text("SELECT 1", &[])
            .await
            .map_err(|e| SyncError::connectivity("clickhouse", e))?;
        debug!("Connected to ClickHouse at {}", client.url);

        Ok(client)
    }

    fn request(&self, sql: String, params: &[(&str, &str)]) -> RequestBuilder {
        let mut req = self
            .http
            .post(&self.url)
            .query(&[
                ("database", self.database.as_str()),
                ("output_format_json_quote_64bit_integers", "0"),
            ])
            .body(sql);

        for (name, value) in params {
            req = req.query(&[(format!("param_{}", name), *value)]);
        }
        if let Some(ref user) = self.user {
            req = req.header("X-ClickHouse-User", user);
        }
        if let Some(ref password) = self.password {
            req = req.header("X-ClickHouse-Key", password);
        }
        req
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let resp = req.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }

        let header_code = resp
            .headers()
            .get(EXCEPTION_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let body = resp.text().await.unwrap_or_default();
        Err(sql::exception(header_code, &body))
    }

    pub(super) async fn fetch_text(&self, sql: &str, params: &[(&str, &str)]) -> Result<String> {
        let req = self
            .request(sql.to_string(), params)
            .timeout(self.request_timeout);
        Ok(self.send(req).await?.text().await?)
    }

    pub(super) async fn fetch_rows<T: serde::de::DeserializeOwned>(
        &self,
        sql: &str,
        params: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let body = self
            .fetch_text(&format!("{} FORMAT JSONEachRow", sql), params)
            .await?;
        sql::parse_rows(&body)
    }

    async fn query_progress(&self, query_id: &str) -> Result<Option<ProgressRow>> {
        let rows: Vec<ProgressRow> = self
            .fetch_rows(
                "SELECT read_rows, read_bytes, total_rows_approx FROM system.processes \
                 WHERE query_id = {qid:String}",
                &[("qid", query_id)],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn kill_query(&self, query_id: &str) -> Result<()> {
        self.fetch_text(
            &format!("KILL QUERY WHERE query_id = {} SYNC", quote_literal(query_id)),
            &[],
        )
        .await?;
        Ok(())
    }
}

fn parse_summary(resp: &Response) -> Summary {
    resp.headers()
        .get(SUMMARY_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| serde_json::from_str(v).ok())
        .unwrap_or_default()
}

#[async_trait]
impl DestinationStore for ClickHouseClient {
    fn database(&self) -> &str {
        &self.database
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        debug!("{}", sql);
        self.fetch_text(sql, &[]).await?;
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let body = self
            .fetch_text(&format!("EXISTS TABLE {}", qualify(&self.database, table)?), &[])
            .await?;
        Ok(body.trim() == "1")
    }

    async fn max_value(&self, table: &str, column: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT toString(max({col})) AS v, count({col}) AS n FROM {table}",
            col = quote_ident(column)?,
            table = qualify(&self.database, table)?
        );
        let rows: Vec<MaxRow> = self.fetch_rows(&sql, &[]).await?;
        Ok(rows
            .into_iter()
            .next()
            .filter(|r| r.n > 0)
            .and_then(|r| r.v)
            .map(|v| sql::watermark_literal(&v)))
    }

    async fn create_table(&self, table: &str, columns: &[ColumnMapping], engine: &str) -> Result<()> {
        let sql = sql::create_table_sql(&self.database, table, columns, engine)?;
        self.execute(&sql).await
    }

    async fn exchange_tables(&self, a: &str, b: &str) -> Result<()> {
        self.execute(&format!(
            "EXCHANGE TABLES {} AND {}",
            qualify(&self.database, a)?,
            qualify(&self.database, b)?
        ))
        .await
    }

    async fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        self.execute(&format!(
            "RENAME TABLE {} TO {}",
            qualify(&self.database, from)?,
            qualify(&self.database, to)?
        ))
        .await
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.execute(&format!(
            "DROP TABLE IF EXISTS {}",
            qualify(&self.database, table)?
        ))
        .await
    }

    async fn ensure_source_link(&self, link: &SourceLink) -> Result<String> {
        debug!("{}", sql::source_link_sql(link, true)?);
        self.fetch_text(&sql::source_link_sql(link, false)?, &[])
            .await?;
        Ok(link.linked_database())
    }

    async fn stream_insert_select(
        &self,
        table: &str,
        select: &str,
        on_progress: ProgressCallback<'_>,
    ) -> Result<StreamResult> {
        let query_id = Uuid::new_v4().to_string();
        let sql = format!("INSERT INTO {} {}", qualify(&self.database, table)?, select);
        debug!("{} (query_id {})", sql, query_id);

        let req = self
            .request(sql, &[])
            .query(&[("query_id", query_id.as_str())]);
        let insert = async {
            let resp = self.send(req).await?;
            let summary = parse_summary(&resp);
            resp.bytes().await?;
            Ok::<Summary, SyncError>(summary)
        };
        tokio::pin!(insert);

        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut last = TransferProgress::default();
        loop {
            tokio::select! {
                done = &mut insert => {
                    let summary = done?;
                    last = TransferProgress {
                        read_rows: summary.read_rows.max(last.read_rows),
                        read_bytes: summary.read_bytes.max(last.read_bytes),
                        total_rows_approx: summary.total_rows_to_read.max(last.total_rows_approx),
                        elapsed: started.elapsed(),
                    };
                    // final tick; the insert is already complete
                    let _ = on_progress(&last);
                    return Ok(StreamResult { rows: last.read_rows, stopped: false });
                }
                _ = ticker.tick() => {
                    match self.query_progress(&query_id).await {
                        Ok(Some(p)) => {
                            last.read_rows = p.read_rows.max(last.read_rows);
                            last.read_bytes = p.read_bytes.max(last.read_bytes);
                            last.total_rows_approx = p.total_rows_approx;
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Failed to poll progress of {}: {}", query_id, e),
                    }
                    last.elapsed = started.elapsed();

                    if on_progress(&last) == ProgressControl::Stop {
                        info!("Stop requested, cancelling insert into {} after {} rows", table, last.read_rows);
                        self.kill_query(&query_id).await?;
                        return match insert.await {
                            Ok(summary) => Ok(StreamResult {
                                rows: summary.read_rows.max(last.read_rows),
                                stopped: false,
                            }),
                            Err(e) => {
                                debug!("Insert {} ended after cancellation: {}", query_id, e);
                                Ok(StreamResult { rows: last.read_rows, stopped: true })
                            }
                        };
                    }
                }
            }
        }
    }

    async fn table_stats(&self, table: &str) -> Result<Option<TableStats>> {
        if !self.table_exists(table).await? {
            return Ok(None);
        }

        let rows: Vec<StatsRow> = self
            .fetch_rows(
                "SELECT count() AS parts, sum(rows) AS rows, sum(bytes_on_disk) AS bytes_on_disk, \
                 sum(data_compressed_bytes) AS compressed_bytes, \
                 sum(data_uncompressed_bytes) AS uncompressed_bytes, \
                 toString(max(modification_time)) AS last_modified, \
                 (SELECT any(engine) FROM system.tables WHERE database = {db:String} AND name = {tbl:String}) AS engine, \
                 (SELECT ifNull(any(total_rows), 0) FROM system.tables WHERE database = {db:String} AND name = {tbl:String}) AS total_rows \
                 FROM system.parts WHERE active AND database = {db:String} AND table = {tbl:String}",
                &[("db", self.database.as_str()), ("tbl", table)],
            )
            .await?;

        Ok(rows.into_iter().next().map(|r| TableStats {
            rows: if r.parts > 0 { r.rows } else { r.total_rows },
            bytes_on_disk: r.bytes_on_disk,
            compressed_bytes: r.compressed_bytes,
            uncompressed_bytes: r.uncompressed_bytes,
            last_modified: r.last_modified.as_deref().and_then(sql::parse_datetime),
            engine: r.engine.filter(|e| !e.is_empty()),
        }))
    }
}
