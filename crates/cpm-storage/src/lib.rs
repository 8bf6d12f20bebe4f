//! Destination table writer + HTTP SQL-proxy client for CPM.

use std::time::Duration;

use anyhow::{bail, Context};
use cpm_core::{parse_flexible_timestamp, CanonicalParent};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::Row;
use thiserror::Error;
use tracing::{info, info_span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpm-storage";

pub use sqlx::PgPool;

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(4)
        .connect(database_url)
        .await
        .context("connecting postgres pool")
}

/// Reject identifiers that cannot be safely interpolated into DDL.
fn checked_ident(ident: &str) -> anyhow::Result<&str> {
    let mut chars = ident.chars();
    let valid_head = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_head || !ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("invalid sql identifier: {ident:?}");
    }
    Ok(ident)
}

#[derive(Debug, Clone)]
pub struct ReplaceOutcome {
    pub rows_written: usize,
    pub staging_table: String,
}

/// Writes a master snapshot with a staging-table swap so a failed run can
/// never leave the destination without a published table.
#[derive(Debug, Clone)]
pub struct MasterTableWriter {
    schema: String,
    table: String,
}

impl MasterTableWriter {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    fn staging_name(&self) -> String {
        format!("{}__staging", self.table)
    }

    /// Build the staging table, bulk-insert, then drop-and-rename in a
    /// single transaction.
    pub async fn replace_all(
        &self,
        pool: &PgPool,
        parents: &[CanonicalParent],
    ) -> anyhow::Result<ReplaceOutcome> {
        let schema = checked_ident(&self.schema)?;
        let table = checked_ident(&self.table)?;
        let staging = self.staging_name();
        let staging = checked_ident(&staging)?;

        let span = info_span!("master_replace", schema, table, rows = parents.len());
        let _guard = span.enter();

        let mut tx = pool.begin().await.context("opening staging transaction")?;
        sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{schema}"."{staging}""#))
            .execute(&mut *tx)
            .await
            .context("dropping stale staging table")?;
        sqlx::query(&format!(
            r#"CREATE TABLE "{schema}"."{staging}" (
                parent_product_id text PRIMARY KEY,
                parent_product_name text NOT NULL,
                child_product_ids text[] NOT NULL,
                child_product_names text[] NOT NULL,
                all_possible_child_names text[] NOT NULL,
                created_at timestamptz
            )"#
        ))
        .execute(&mut *tx)
        .await
        .context("creating staging table")?;

        for parent in parents {
            sqlx::query(&format!(
                r#"INSERT INTO "{schema}"."{staging}"
                    (parent_product_id, parent_product_name, child_product_ids,
                     child_product_names, all_possible_child_names, created_at)
                   VALUES ($1, $2, $3, $4, $5, $6)"#
            ))
            .bind(parent.parent_id.to_string())
            .bind(&parent.parent_name)
            .bind(&parent.child_ids)
            .bind(&parent.child_names)
            .bind(&parent.all_possible_aliases)
            .bind(parent.created_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting parent {:?}", parent.parent_name))?;
        }

        sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{schema}"."{table}""#))
            .execute(&mut *tx)
            .await
            .context("dropping previous master table")?;
        sqlx::query(&format!(
            r#"ALTER TABLE "{schema}"."{staging}" RENAME TO "{table}""#
        ))
        .execute(&mut *tx)
        .await
        .context("renaming staging table into place")?;
        tx.commit().await.context("committing master swap")?;

        info!(rows = parents.len(), "published master snapshot");
        Ok(ReplaceOutcome {
            rows_written: parents.len(),
            staging_table: self.staging_name(),
        })
    }

    /// Read the currently published master table.
    ///
    /// Array columns are selected as text and parsed defensively: earlier
    /// generations of the table stored Python list reprs in plain text
    /// columns, and those rows must not fail the read.
    pub async fn read_published(&self, pool: &PgPool) -> anyhow::Result<Vec<CanonicalParent>> {
        let schema = checked_ident(&self.schema)?;
        let table = checked_ident(&self.table)?;

        let rows = sqlx::query(&format!(
            r#"SELECT parent_product_id::text AS parent_product_id,
                      parent_product_name,
                      child_product_ids::text AS child_product_ids,
                      child_product_names::text AS child_product_names,
                      all_possible_child_names::text AS all_possible_child_names,
                      created_at::text AS created_at
               FROM "{schema}"."{table}"
               ORDER BY parent_product_name"#
        ))
        .fetch_all(pool)
        .await
        .with_context(|| format!("reading published master {schema}.{table}"))?;

        let mut parents = Vec::with_capacity(rows.len());
        for row in rows {
            let id_text: String = row.try_get("parent_product_id")?;
            let parent_id = Uuid::parse_str(id_text.trim())
                .with_context(|| format!("parent_product_id {id_text:?} is not a uuid"))?;
            let created_at: Option<String> = row.try_get("created_at")?;
            parents.push(CanonicalParent {
                parent_id,
                parent_name: row.try_get("parent_product_name")?,
                child_ids: parse_text_array(row.try_get::<Option<String>, _>("child_product_ids")?.as_deref()),
                child_names: parse_text_array(row.try_get::<Option<String>, _>("child_product_names")?.as_deref()),
                all_possible_aliases: parse_text_array(
                    row.try_get::<Option<String>, _>("all_possible_child_names")?.as_deref(),
                ),
                created_at: created_at.as_deref().and_then(parse_flexible_timestamp),
            });
        }
        Ok(parents)
    }
}

/// Parse a text-encoded list column into its elements.
///
/// Accepts both Postgres array literals (`{a,b,"c d"}`) and the Python list
/// reprs (`['a', "b"]`) left behind by earlier pipeline generations. Input
/// that does not look like a list yields an empty vec rather than an error.
pub fn parse_text_array(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    let raw = raw.trim();
    let inner = if (raw.starts_with('{') && raw.ends_with('}'))
        || (raw.starts_with('[') && raw.ends_with(']'))
    {
        &raw[1..raw.len() - 1]
    } else {
        return Vec::new();
    };

    let mut items = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut quoted_item = false;
    let mut escaped = false;

    for ch in inner.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match quote {
            Some(q) => {
                if ch == '\\' {
                    escaped = true;
                } else if ch == q {
                    quote = None;
                } else {
                    current.push(ch);
                }
            }
            None => match ch {
                '\'' | '"' => {
                    if current.trim().is_empty() {
                        current.clear();
                    }
                    quote = Some(ch);
                    quoted_item = true;
                }
                ',' => {
                    push_array_item(&mut items, &mut current, &mut quoted_item);
                }
                _ => current.push(ch),
            },
        }
    }
    push_array_item(&mut items, &mut current, &mut quoted_item);
    items
}

fn push_array_item(items: &mut Vec<String>, current: &mut String, quoted: &mut bool) {
    let value = if *quoted {
        std::mem::take(current)
    } else {
        let trimmed = current.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
            current.clear();
            *quoted = false;
            return;
        }
        let owned = trimmed.to_string();
        current.clear();
        owned
    };
    *quoted = false;
    items.push(value);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_request_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from sql proxy at {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected sql proxy payload: {0}")]
    Payload(String),
}

#[derive(Debug, Clone)]
pub struct SqlProxyConfig {
    pub base_url: String,
    pub access_token: String,
    pub database_id: i64,
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

/// Client for the analytics store's HTTP SQL-proxy endpoint.
///
/// Queries are submitted synchronously (`runAsync: false`) and the result
/// rows come back inline in the response body.
#[derive(Debug)]
pub struct SqlProxyClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    database_id: i64,
    backoff: BackoffPolicy,
}

impl SqlProxyClient {
    pub fn new(config: SqlProxyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building sql proxy http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token,
            database_id: config.database_id,
            backoff: config.backoff,
        })
    }

    /// Execute a query and return the inline result rows.
    pub async fn execute_sql(
        &self,
        client_id: &str,
        schema: &str,
        sql: &str,
    ) -> Result<Vec<JsonValue>, ProxyError> {
        let url = format!("{}/api/v1/sqllab/execute/", self.base_url);
        let payload = serde_json::json!({
            "client_id": client_id,
            "database_id": self.database_id,
            "json": true,
            "runAsync": false,
            "schema": schema,
            "sql": sql,
            "tab": "",
            "expand_data": true,
        });

        let span = info_span!("proxy_execute", client_id, schema);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self
                .client
                .post(&url)
                .bearer_auth(&self.access_token)
                .json(&payload)
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body: JsonValue = resp.json().await?;
                        return extract_data_rows(body);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(ProxyError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_request_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(ProxyError::Request(err));
                }
            }
        }

        Err(ProxyError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

/// Pull the `data` array out of a proxy response body.
pub fn extract_data_rows(body: JsonValue) -> Result<Vec<JsonValue>, ProxyError> {
    match body.get("data") {
        Some(JsonValue::Array(rows)) => Ok(rows.clone()),
        Some(JsonValue::Null) | None => Ok(Vec::new()),
        Some(other) => Err(ProxyError::Payload(format!(
            "expected `data` to be an array, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pg_array_literals_parse() {
        assert_eq!(
            parse_text_array(Some(r#"{A1,A2,"Tomato A"}"#)),
            vec!["A1", "A2", "Tomato A"]
        );
        assert_eq!(parse_text_array(Some("{}")), Vec::<String>::new());
    }

    #[test]
    fn python_list_reprs_parse() {
        assert_eq!(
            parse_text_array(Some(r#"['Tomato A', "tomato a ", 'Tomatoes Grade A']"#)),
            vec!["Tomato A", "tomato a ", "Tomatoes Grade A"]
        );
        assert_eq!(parse_text_array(Some("[]")), Vec::<String>::new());
    }

    #[test]
    fn quoted_items_keep_commas_and_spaces() {
        assert_eq!(
            parse_text_array(Some(r#"['Victory Natural Water/Pack', 'a, b']"#)),
            vec!["Victory Natural Water/Pack", "a, b"]
        );
    }

    #[test]
    fn garbage_becomes_empty_not_error() {
        assert_eq!(parse_text_array(None), Vec::<String>::new());
        assert_eq!(parse_text_array(Some("")), Vec::<String>::new());
        assert_eq!(parse_text_array(Some("not a list")), Vec::<String>::new());
        assert_eq!(parse_text_array(Some("{NULL}")), Vec::<String>::new());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn identifiers_are_checked_before_ddl() {
        assert!(checked_ident("canonical_products_master").is_ok());
        assert!(checked_ident("public").is_ok());
        assert!(checked_ident("bad-name").is_err());
        assert!(checked_ident("1table").is_err());
        assert!(checked_ident(r#"x"; DROP TABLE y; --"#).is_err());
    }

    #[test]
    fn data_rows_extraction_tolerates_missing_data() {
        let rows = extract_data_rows(serde_json::json!({"data": [{"id": "1"}]})).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(extract_data_rows(serde_json::json!({})).unwrap().is_empty());
        assert!(extract_data_rows(serde_json::json!({"data": null})).unwrap().is_empty());
        assert!(extract_data_rows(serde_json::json!({"data": "oops"})).is_err());
    }
}
