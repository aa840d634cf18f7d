//! Query Engine (§4.4): a non-blocking pool of PostgreSQL connections that
//! executes a batch of statements in one round-trip and reports completion
//! through the caller's `.await` — an async function *is* the "exactly one
//! of onDone/onError fires" callback contract here, since polling a future
//! to completion can only resolve once.
//!
//! Submission failure (no connection available) is reported synchronously
//! as `QueryError::Unavailable`, which the dispatcher maps to `503`.

use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Row, TypeInfo};
use thiserror::Error;

use crate::auth::GrantType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Access,
    Refresh,
}

/// Everything the Result Marshaller needs to know about how a query was
/// issued, recorded alongside the query itself (§3 `Query.context`).
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub path: String,
    pub grant_type: Option<GrantType>,
    pub token_type: Option<TokenType>,
    pub signed: bool,
    pub job_id: Option<String>,
}

impl QueryContext {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            grant_type: None,
            token_type: None,
            signed: false,
            job_id: None,
        }
    }
}

/// A single bind parameter for a batch statement. The SQL Builder picks the
/// variant; the engine only knows how to bind it.
#[derive(Debug, Clone)]
pub enum SqlParam {
    Text(String),
    Json(Value),
    IntervalMillis(i64),
}

#[derive(Debug, Clone)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// An ordered sequence of statements executed in one database round-trip;
/// results come back as a result-set array of equal length (§3 `Query`).
#[derive(Debug, Clone, Default)]
pub struct SqlBatch {
    pub statements: Vec<SqlStatement>,
}

impl SqlBatch {
    pub fn single(statement: SqlStatement) -> Self {
        Self {
            statements: vec![statement],
        }
    }

    pub fn push(&mut self, statement: SqlStatement) -> &mut Self {
        self.statements.push(statement);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ResultSet {
    pub rows: Vec<Value>,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("database unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Execution(String),
}

pub struct QueryEngine {
    pool: PgPool,
}

impl QueryEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Execute every statement in `batch` within a single transaction so
    /// that a login + run + logout triple either all happen or none do.
    /// Connection acquisition failure is the only "synchronous submission
    /// failure" path (§4.4) and is reported before any statement runs.
    pub async fn submit(&self, batch: &SqlBatch) -> Result<Vec<ResultSet>, QueryError> {
        let tx = self.begin().await?;
        Self::run_batch(tx, batch).await
    }

    /// Acquire a connection and start a transaction without running any
    /// statement yet. Separated from `submit` so a v2 request can observe
    /// "no connection available" synchronously while the statements
    /// themselves run in the background (§4.4, §4.6).
    pub async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Postgres>, QueryError> {
        self.pool
            .begin()
            .await
            .map_err(|e| QueryError::Unavailable(e.to_string()))
    }

    /// Run `batch` to completion against an already-open transaction and
    /// commit it. Takes the transaction by value so it can be moved into a
    /// spawned task for deferred (v2) execution.
    pub async fn run_batch(
        mut tx: sqlx::Transaction<'static, sqlx::Postgres>,
        batch: &SqlBatch,
    ) -> Result<Vec<ResultSet>, QueryError> {
        let mut results = Vec::with_capacity(batch.statements.len());
        for statement in &batch.statements {
            let mut query = sqlx::query(&statement.sql);
            for param in &statement.params {
                query = bind_param(query, param);
            }
            let rows = query
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| QueryError::Execution(e.to_string()))?;
            let json_rows = rows.iter().map(row_to_json).collect();
            results.push(ResultSet { rows: json_rows });
        }

        tx.commit()
            .await
            .map_err(|e| QueryError::Execution(e.to_string()))?;

        Ok(results)
    }
}

fn bind_param<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    param: &'q SqlParam,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match param {
        SqlParam::Text(s) => query.bind(s),
        SqlParam::Json(v) => query.bind(v),
        SqlParam::IntervalMillis(ms) => query.bind(chrono::Duration::milliseconds(*ms)),
    }
}

/// Convert one result row into a JSON object, decoding columns by their
/// Postgres type name. Centralizes the "special-case columns named `session`
/// and `result`" handling the redesign note calls for, replacing the
/// original's ad-hoc string building with a real JSON encoder.
fn row_to_json(row: &PgRow) -> Value {
    let mut map = Map::new();
    for column in row.columns() {
        let name = column.name().to_string();
        let type_name = column.type_info().name();
        let value = decode_column(row, column.ordinal(), type_name);
        map.insert(name, value);
    }
    Value::Object(map)
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> Value {
    match type_name {
        "JSON" | "JSONB" => row
            .try_get::<Value, _>(idx)
            .unwrap_or(Value::Null),
        "BOOL" => row
            .try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        "INT2" | "INT4" => row
            .try_get::<Option<i32>, _>(idx)
            .ok()
            .flatten()
            .map(|v| Value::from(v))
            .unwrap_or(Value::Null),
        "INT8" => row
            .try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" | "TIMESTAMP" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_rfc3339()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}
