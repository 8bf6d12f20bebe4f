//! Source adapter contracts + the relational, SQL-proxy and fixture adapters.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use cpm_core::{parse_flexible_timestamp, RawProductRecord};
use cpm_storage::{ProxyError, SqlProxyClient};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpm-adapters";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A source of raw product rows. Fetching is treated as a synchronous,
/// fully-materializing call; the engine never streams from an adapter.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Identifier of the origin table/endpoint, used for per-source counts.
    fn origin(&self) -> &str;

    async fn fetch_records(
        &self,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawProductRecord>, AdapterError>;
}

/// Adapter for one relational price table reachable through a Postgres pool.
///
/// `created_at` is selected as text so tables that drifted to a plain text
/// column are read the same way as proper timestamp columns.
pub struct RelationalTableAdapter {
    pool: PgPool,
    schema: String,
    table: String,
}

impl RelationalTableAdapter {
    pub fn new(pool: PgPool, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
            table: table.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for RelationalTableAdapter {
    fn origin(&self) -> &str {
        &self.table
    }

    async fn fetch_records(
        &self,
        _ctx: &AdapterContext,
    ) -> Result<Vec<RawProductRecord>, AdapterError> {
        let sql = format!(
            r#"SELECT id::text AS raw_product_id,
                      product_name AS raw_product_name,
                      created_at::text AS created_at
               FROM "{}"."{}""#,
            self.schema, self.table
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut records = Vec::with_capacity(rows.len());
        let mut dropped = 0usize;
        for row in rows {
            let source_id: Option<String> = row.try_get("raw_product_id")?;
            let raw_name: Option<String> = row.try_get("raw_product_name")?;
            let created_at: Option<String> = row.try_get("created_at")?;
            let (Some(source_id), Some(raw_name)) = (source_id, raw_name) else {
                dropped += 1;
                continue;
            };
            records.push(RawProductRecord {
                origin: self.table.clone(),
                source_id,
                raw_name,
                created_at: created_at.as_deref().and_then(parse_flexible_timestamp),
            });
        }
        if dropped > 0 {
            warn!(origin = %self.table, dropped, "dropped rows with null id or name");
        }
        Ok(records)
    }
}

/// Adapter for the columnar store behind the HTTP SQL-proxy endpoint.
pub struct SqlProxyTableAdapter {
    client: Arc<SqlProxyClient>,
    schema: String,
    table: String,
}

impl SqlProxyTableAdapter {
    pub fn new(
        client: Arc<SqlProxyClient>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            client,
            schema: schema.into(),
            table: table.into(),
        }
    }
}

/// Per-run client id for the proxy; the upstream enforces a short unique
/// value per submitted query.
fn proxy_client_id(run_id: Uuid) -> String {
    let hex = run_id.simple().to_string();
    format!("p_{}", &hex[..6])
}

#[async_trait]
impl SourceAdapter for SqlProxyTableAdapter {
    fn origin(&self) -> &str {
        &self.table
    }

    async fn fetch_records(
        &self,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawProductRecord>, AdapterError> {
        let sql = format!(
            r#"SELECT id AS raw_product_id, name AS raw_product_name, toString(created_at) AS created_at FROM "{}"."{}""#,
            self.schema, self.table
        );
        let rows = self
            .client
            .execute_sql(&proxy_client_id(ctx.run_id), &self.schema, &sql)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        let mut dropped = 0usize;
        for row in &rows {
            match record_from_proxy_row(&self.table, row) {
                Some(record) => records.push(record),
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            warn!(origin = %self.table, dropped, "dropped proxy rows with null id or name");
        }
        Ok(records)
    }
}

/// Convert one proxy result row into a record.
///
/// Ids come back as strings or numbers depending on the source column type;
/// both are stringified. Rows missing the id or the name are dropped.
pub fn record_from_proxy_row(origin: &str, row: &JsonValue) -> Option<RawProductRecord> {
    let source_id = json_field_to_string(row.get("raw_product_id"))?;
    let raw_name = match row.get("raw_product_name") {
        Some(JsonValue::String(s)) => s.clone(),
        _ => return None,
    };
    let created_at = row
        .get("created_at")
        .and_then(JsonValue::as_str)
        .and_then(parse_flexible_timestamp);
    Some(RawProductRecord {
        origin: origin.to_string(),
        source_id,
        raw_name,
        created_at,
    })
}

fn json_field_to_string(value: Option<&JsonValue>) -> Option<String> {
    match value {
        Some(JsonValue::String(s)) => Some(s.clone()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Adapter reading records from a JSON fixture file, for offline runs and
/// integration tests.
pub struct FixtureRecordsAdapter {
    origin: String,
    path: PathBuf,
}

impl FixtureRecordsAdapter {
    pub fn new(origin: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            origin: origin.into(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureRecord {
    source_id: String,
    raw_name: String,
    #[serde(default)]
    created_at: Option<String>,
}

pub fn parse_fixture_records(origin: &str, text: &str) -> anyhow::Result<Vec<RawProductRecord>> {
    let raw: Vec<FixtureRecord> = serde_json::from_str(text).context("parsing fixture records")?;
    Ok(raw
        .into_iter()
        .map(|r| RawProductRecord {
            origin: origin.to_string(),
            source_id: r.source_id,
            raw_name: r.raw_name,
            created_at: r.created_at.as_deref().and_then(parse_flexible_timestamp),
        })
        .collect())
}

pub fn load_fixture_records(
    origin: &str,
    path: impl AsRef<Path>,
) -> anyhow::Result<Vec<RawProductRecord>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_fixture_records(origin, &text)
        .with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl SourceAdapter for FixtureRecordsAdapter {
    fn origin(&self) -> &str {
        &self.origin
    }

    async fn fetch_records(
        &self,
        _ctx: &AdapterContext,
    ) -> Result<Vec<RawProductRecord>, AdapterError> {
        Ok(load_fixture_records(&self.origin, &self.path)?)
    }
}
