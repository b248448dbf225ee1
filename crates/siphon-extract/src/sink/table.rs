//! Destination table sink
//!
//! Replays batches into existing tables on a second database, one
//! transaction per batch.

use async_trait::async_trait;
use siphon_rdbc::prelude::*;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{BatchSink, StreamInfo};
use crate::cursor::Batch;
use crate::error::SinkError;

/// PostgreSQL caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = 65_535;

/// Inserts batches into mirrored tables on a destination database.
///
/// Each batch is written in its own transaction with multi-row INSERTs, so
/// a retried batch never leaves a partial copy behind. Target tables must
/// already exist.
pub struct TableSink {
    pool: Arc<dyn ConnectionPool>,
    dialect: PostgresDialect,
    truncate_on_open: bool,
}

impl TableSink {
    /// Write through connections from `pool`
    pub fn new(pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            pool,
            dialect: PostgresDialect,
            truncate_on_open: false,
        }
    }

    /// Empty each target before its first batch (skipped for resumed streams)
    pub fn with_truncate(mut self, truncate: bool) -> Self {
        self.truncate_on_open = truncate;
        self
    }

    async fn insert_all(&self, conn: &dyn Connection, stream: &StreamInfo, batch: &Batch) -> Result<u64> {
        let Some(columns) = batch.columns() else {
            return Ok(0);
        };
        let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
        let rows_per_statement = (MAX_BIND_PARAMS / columns.len().max(1)).max(1);

        let mut written = 0;
        for chunk in batch.rows.chunks(rows_per_statement) {
            let (sql, params) = self.dialect.insert_sql(
                Some(&stream.target.schema),
                &stream.target.table,
                &columns,
                chunk,
            );
            written += conn.execute(&sql, &params).await?;
        }
        Ok(written)
    }
}

#[async_trait]
impl BatchSink for TableSink {
    fn name(&self) -> &'static str {
        "table"
    }

    async fn open_stream(&self, stream: &StreamInfo) -> std::result::Result<(), SinkError> {
        let conn = self.pool.get().await?;
        let exists = table_exists(
            &*conn,
            &self.dialect,
            &stream.target.schema,
            &stream.target.table,
        )
        .await?;
        if !exists {
            return Err(SinkError::fatal(format!(
                "target table {} does not exist",
                stream.target
            )));
        }

        if self.truncate_on_open && !stream.resumed {
            let sql = self
                .dialect
                .truncate_sql(Some(&stream.target.schema), &stream.target.table);
            conn.execute(&sql, &[]).await?;
            debug!(descriptor = %stream.descriptor_id, target = %stream.target, "target truncated");
        }
        Ok(())
    }

    async fn write_batch(&self, stream: &StreamInfo, batch: &Batch) -> std::result::Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let conn = self.pool.get().await?;
        conn.execute("BEGIN", &[]).await?;

        match self.insert_all(conn.connection(), stream, batch).await {
            Ok(written) => {
                conn.execute("COMMIT", &[]).await?;
                debug!(
                    descriptor = %stream.descriptor_id,
                    batch = batch.sequence,
                    rows = written,
                    "batch inserted"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = conn.execute("ROLLBACK", &[]).await {
                    warn!(descriptor = %stream.descriptor_id, error = %rollback, "rollback failed");
                }
                Err(e.into())
            }
        }
    }
}
