//! Scripted in-memory source database shared by the integration tests.
//!
//! Tables hold rows `(id BIGINT, name TEXT)` with ids `1..=rows`. The fake
//! understands the statements the engine issues: catalog lookups, keyset
//! pages (`"id" > $1 ... LIMIT n`), offset pages (`LIMIT n OFFSET m`) and
//! wrapped custom queries selecting from a known table.

#![allow(dead_code)]

use async_trait::async_trait;
use siphon_extract::{BatchSink, MemorySink, SinkError, StreamInfo};
use siphon_extract::{Batch, RetryConfig};
use siphon_rdbc::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How an injected failure looks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Connection reset; retriable
    Transient,
    /// Permission denied; not retriable
    Fatal,
}

impl Failure {
    fn to_error(self) -> Error {
        match self {
            Self::Transient => Error::connection("connection reset by peer"),
            Self::Fatal => Error::permission("permission denied for table"),
        }
    }
}

#[derive(Debug, Clone)]
struct FailRule {
    /// Page queries that succeed before failures start
    after: usize,
    /// Failures to return; `None` fails forever
    times: Option<usize>,
    kind: Failure,
}

#[derive(Debug, Clone)]
struct Table {
    rows: i64,
    primary_key: bool,
    page_queries: usize,
    fail: Option<FailRule>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<(String, String), Table>,
    statements: Vec<String>,
    page_queries: usize,
}

/// Handle to the fake database; clones share state
#[derive(Clone, Default)]
pub struct FakeDb {
    state: Arc<Mutex<State>>,
}

impl FakeDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a keyed table with `rows` rows
    pub fn with_table(self, schema: &str, table: &str, rows: i64) -> Self {
        self.insert(schema, table, rows, true);
        self
    }

    /// Add a table without a primary key
    pub fn with_keyless_table(self, schema: &str, table: &str, rows: i64) -> Self {
        self.insert(schema, table, rows, false);
        self
    }

    fn insert(&self, schema: &str, table: &str, rows: i64, primary_key: bool) {
        self.lock().tables.insert(
            (schema.to_string(), table.to_string()),
            Table {
                rows,
                primary_key,
                page_queries: 0,
                fail: None,
            },
        );
    }

    /// Fail page queries on a table after `after` successful ones
    pub fn fail_table(&self, schema: &str, table: &str, after: usize, times: Option<usize>, kind: Failure) {
        let mut state = self.lock();
        if let Some(t) = state.tables.get_mut(&(schema.to_string(), table.to_string())) {
            t.fail = Some(FailRule { after, times, kind });
        }
    }

    /// Page queries issued against a table, including failed ones
    pub fn page_queries(&self, schema: &str, table: &str) -> usize {
        self.lock()
            .tables
            .get(&(schema.to_string(), table.to_string()))
            .map(|t| t.page_queries)
            .unwrap_or(0)
    }

    /// Every statement received
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    /// Total page queries across tables
    pub fn total_page_queries(&self) -> usize {
        self.lock().page_queries
    }

    /// Pool over this database
    pub async fn pool(&self) -> Arc<dyn ConnectionPool> {
        let pool: Arc<dyn ConnectionPool> = SimpleConnectionPool::new(
            PoolConfig::new("postgres://fake/db").with_max_size(8),
            Arc::new(FakeFactory { db: self.clone() }),
        )
        .await
        .expect("fake pool");
        pool
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn catalog_literal(sql: &str, marker: &str) -> Option<String> {
        let start = sql.find(marker)? + marker.len();
        let end = sql[start..].find('\'')?;
        Some(sql[start..start + end].to_string())
    }

    fn columns(&self, sql: &str) -> Vec<Row> {
        let schema = Self::catalog_literal(sql, "c.table_schema = '").unwrap_or_default();
        let table = Self::catalog_literal(sql, "c.table_name = '").unwrap_or_default();
        let state = self.lock();
        let Some(t) = state.tables.get(&(schema, table)) else {
            return Vec::new();
        };

        let cols = vec![
            "column_name".to_string(),
            "data_type".to_string(),
            "nullable".to_string(),
            "ordinal_position".to_string(),
            "pk_ordinal".to_string(),
        ];
        let pk = if t.primary_key { Value::Int32(1) } else { Value::Null };
        vec![
            Row::new(
                cols.clone(),
                vec![
                    Value::String("id".into()),
                    Value::String("bigint".into()),
                    Value::Bool(!t.primary_key),
                    Value::Int32(1),
                    pk,
                ],
            ),
            Row::new(
                cols,
                vec![
                    Value::String("name".into()),
                    Value::String("text".into()),
                    Value::Bool(true),
                    Value::Int32(2),
                    Value::Null,
                ],
            ),
        ]
    }

    fn table_exists(&self, sql: &str) -> Vec<Row> {
        let schema = Self::catalog_literal(sql, "table_schema = '").unwrap_or_default();
        let table = Self::catalog_literal(sql, "table_name = '").unwrap_or_default();
        let present = self.lock().tables.contains_key(&(schema, table));
        vec![Row::new(vec!["present".into()], vec![Value::Bool(present)])]
    }

    fn page(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut state = self.lock();
        state.page_queries += 1;

        let key = state
            .tables
            .keys()
            .find(|(s, t)| sql.contains(&format!("\"{}\".\"{}\"", s, t)))
            .cloned()
            .ok_or_else(|| Error::TableNotFound {
                table: sql.to_string(),
            })?;
        let table = state.tables.get_mut(&key).expect("table present");
        let served = table.page_queries;
        table.page_queries += 1;

        if let Some(rule) = &mut table.fail {
            if served >= rule.after {
                match &mut rule.times {
                    None => return Err(rule.kind.to_error()),
                    Some(0) => {}
                    Some(n) => {
                        *n -= 1;
                        return Err(rule.kind.to_error());
                    }
                }
            }
        }

        let after_key = if sql.contains("\"id\" > $1") {
            params.first().and_then(|v| v.as_i64()).unwrap_or(0)
        } else {
            0
        };
        let even_only = sql.contains("id % 2 = 0");
        let limit = number_after(sql, " LIMIT ").unwrap_or(i64::MAX);
        let offset = number_after(sql, " OFFSET ").unwrap_or(0);

        let rows = (1..=table.rows)
            .filter(|id| *id > after_key)
            .filter(|id| !even_only || id % 2 == 0)
            .skip(offset as usize)
            .take(limit as usize)
            .map(|id| {
                Row::new(
                    vec!["id".into(), "name".into()],
                    vec![Value::Int64(id), Value::String(format!("row-{}", id))],
                )
            })
            .collect();
        Ok(rows)
    }
}

fn number_after(sql: &str, marker: &str) -> Option<i64> {
    let start = sql.rfind(marker)? + marker.len();
    let digits: String = sql[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

struct FakeConnection {
    db: FakeDb,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.db.lock().statements.push(sql.to_string());
        if sql.contains("information_schema.columns") {
            Ok(self.db.columns(sql))
        } else if sql.contains("information_schema.tables") {
            Ok(self.db.table_exists(sql))
        } else if sql.trim() == "SELECT 1" {
            Ok(vec![Row::new(vec!["?column?".into()], vec![Value::Int32(1)])])
        } else {
            self.db.page(sql, params)
        }
    }

    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<u64> {
        self.db.lock().statements.push(sql.to_string());
        Ok(0)
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct FakeFactory {
    db: FakeDb,
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        Ok(Box::new(FakeConnection {
            db: self.db.clone(),
        }))
    }
}

/// Retry policy without real waiting
pub fn fast_retry() -> RetryConfig {
    RetryConfig::new()
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5))
        .with_jitter(0.0)
}

/// Sink that cancels a token once it accepted `after` batches
pub struct CancellingSink {
    pub inner: MemorySink,
    pub token: CancellationToken,
    pub after: usize,
}

#[async_trait]
impl BatchSink for CancellingSink {
    fn name(&self) -> &'static str {
        "cancelling"
    }

    async fn write_batch(&self, stream: &StreamInfo, batch: &Batch) -> std::result::Result<(), SinkError> {
        self.inner.write_batch(stream, batch).await?;
        if self.inner.batches().len() >= self.after {
            self.token.cancel();
        }
        Ok(())
    }
}

/// Ids carried by a batch
pub fn ids(batch: &Batch) -> Vec<i64> {
    batch
        .rows
        .iter()
        .filter_map(|r| r.get_by_name("id").and_then(|v| v.as_i64()))
        .collect()
}
