//! PostgreSQL backend implementation for siphon-rdbc
//!
//! Provides PostgreSQL-specific implementations:
//! - Connection with optional per-statement timeout
//! - Binary row decoding through [`crate::decode`]
//! - Connection factory honoring connect timeout and application name
//! - Server error classification by SQLSTATE

use async_trait::async_trait;
use bytes::BytesMut;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_postgres::types::{IsNull, ToSql, Type};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::decode::{decode_value, RawColumn};
use crate::error::{classify_sqlstate, Error, Result};
use crate::types::{Row, Value};

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Untyped SQL NULL accepted for any parameter type
#[derive(Debug)]
struct Null;

impl ToSql for Null {
    fn to_sql(
        &self,
        _ty: &Type,
        _out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        Ok(IsNull::Yes)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    tokio_postgres::types::to_sql_checked!();
}

/// Convert a Value to a tokio-postgres compatible parameter
fn value_to_sql(value: &Value) -> BoxedParam {
    match value {
        Value::Null => Box::new(Null),
        Value::Bool(b) => Box::new(*b),
        Value::Int16(n) => Box::new(*n),
        Value::Int32(n) => Box::new(*n),
        Value::Int64(n) => Box::new(*n),
        Value::Float32(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::Decimal(d) => Box::new(*d),
        Value::String(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Date(d) => Box::new(*d),
        Value::Time(t) => Box::new(*t),
        Value::DateTime(dt) => Box::new(*dt),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Uuid(u) => Box::new(*u),
        Value::Json(j) => Box::new(j.clone()),
        Value::Literal(s) => Box::new(s.clone()),
    }
}

/// Convert a tokio-postgres row to a Row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Result<Row> {
    let mut columns = Vec::with_capacity(pg_row.len());
    let mut values = Vec::with_capacity(pg_row.len());

    for (idx, col) in pg_row.columns().iter().enumerate() {
        let raw = pg_row
            .try_get::<_, Option<RawColumn<'_>>>(idx)
            .map_err(|e| Error::type_conversion(format!("column \"{}\": {}", col.name(), e)))?;
        let value = decode_value(col.type_(), raw.map(|r| r.0)).map_err(|e| match e {
            Error::TypeConversion { message } => {
                Error::type_conversion(format!("column \"{}\": {}", col.name(), message))
            }
            other => other,
        })?;
        columns.push(col.name().to_string());
        values.push(value);
    }

    Ok(Row::new(columns, values))
}

/// Map a driver error onto the siphon error taxonomy.
///
/// Server errors are classified by SQLSTATE; a closed connection or an I/O
/// failure underneath the driver is a connection error.
pub fn map_pg_error(err: tokio_postgres::Error, sql: &str) -> Error {
    if let Some(db) = err.as_db_error() {
        return classify_sqlstate(db.code().code(), db.message(), Some(sql));
    }
    let io_failure = err
        .source()
        .is_some_and(|s| s.downcast_ref::<std::io::Error>().is_some());
    if err.is_closed() || io_failure {
        return Error::connection_with_source("connection lost", err);
    }
    Error::Query {
        message: err.to_string(),
        sql: Some(sql.to_string()),
        source: Some(Box::new(err)),
    }
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: tokio_postgres::Client,
    closed: AtomicBool,
    query_timeout: Option<Duration>,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
            query_timeout: None,
        }
    }

    /// Bound every statement on this connection by `timeout`
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }

    async fn bounded<T, F>(&self, sql: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, tokio_postgres::Error>>,
    {
        let outcome = match self.query_timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                Error::timeout(format!("statement exceeded {}ms", limit.as_millis()))
            })?,
            None => fut.await,
        };
        outcome.map_err(|e| map_pg_error(e, sql))
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;

        let boxed_params: Vec<BoxedParam> = params.iter().map(value_to_sql).collect();
        let param_refs: Vec<&(dyn ToSql + Sync)> = boxed_params
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let pg_rows = self
            .bounded(sql, self.client.query(sql, &param_refs))
            .await?;

        pg_rows.iter().map(pg_row_to_row).collect()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;

        let boxed_params: Vec<BoxedParam> = params.iter().map(value_to_sql).collect();
        let param_refs: Vec<&(dyn ToSql + Sync)> = boxed_params
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        self.bounded(sql, self.client.execute(sql, &param_refs))
            .await
    }

    async fn is_valid(&self) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL connection factory
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::config(format!("invalid PostgreSQL URL: {}", e)))?;
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }
        if config.connect_timeout_ms > 0 {
            pg_config.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        }

        let (client, connection) = pg_config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| match e.as_db_error() {
                Some(db) => classify_sqlstate(db.code().code(), db.message(), None),
                None => Error::connection_with_source("failed to connect", e),
            })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "postgres connection task ended with error");
            }
        });

        let mut conn = PgConnection::new(client);
        if config.query_timeout_ms > 0 {
            conn = conn.with_query_timeout(Duration::from_millis(config.query_timeout_ms));
        }
        Ok(Box::new(conn))
    }
}

/// Open a single connection to `url` with default settings
pub async fn connect(url: &str) -> Result<Box<dyn Connection>> {
    PgConnectionFactory
        .connect(&ConnectionConfig::new(url))
        .await
}
