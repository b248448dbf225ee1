//! Batch cursor
//!
//! Drives one [`SourceDescriptor`] through successive bounded reads. A fetch
//! does not move the cursor: the position only advances when the caller
//! [`commit`](BatchCursor::commit)s the batch after the sink accepted it.
//! Anything fetched but not committed is read again by the next fetch, so
//! the cursor position always sits on a delivered batch boundary.

use serde::{Deserialize, Serialize};
use siphon_rdbc::prelude::*;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::descriptor::{OutputTarget, SourceDescriptor, SourceKind};
use crate::error::{ExtractError, Result};
use crate::limiter::BatchLimiter;
use crate::retry::{RetryController, RetryError};

/// Rows handed to the sink in one piece
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Descriptor the rows came from
    pub descriptor_id: String,
    /// Destination of the rows
    pub target: OutputTarget,
    /// 1-based position of this batch within the descriptor
    pub sequence: u32,
    /// Rows in source order
    pub rows: Vec<Row>,
}

impl Batch {
    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch carries no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names, taken from the first row
    pub fn columns(&self) -> Option<&[String]> {
        self.rows.first().map(|r| r.columns())
    }
}

/// Serializable cursor progress
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CursorCheckpoint {
    /// Position after the last committed batch
    pub position: SourceOffset,
    /// Batches committed so far
    pub batches_emitted: u32,
    /// Rows committed so far
    pub rows_emitted: u64,
}

#[derive(Debug)]
struct PendingCommit {
    position: SourceOffset,
    rows: usize,
}

/// Stateful reader for one descriptor
pub struct BatchCursor {
    descriptor: Arc<SourceDescriptor>,
    pool: Arc<dyn ConnectionPool>,
    dialect: PostgresDialect,
    retry: RetryController,
    limiter: BatchLimiter,
    source: Option<SourceQuery>,
    position: SourceOffset,
    pending: Option<PendingCommit>,
    batches_emitted: u32,
    rows_emitted: u64,
    exhausted: bool,
}

impl BatchCursor {
    /// Create a cursor at the start of the source
    pub fn new(
        descriptor: Arc<SourceDescriptor>,
        pool: Arc<dyn ConnectionPool>,
        retry: RetryController,
    ) -> Self {
        let limiter = BatchLimiter::new(descriptor.max_batches);
        Self {
            descriptor,
            pool,
            dialect: PostgresDialect,
            retry,
            limiter,
            source: None,
            position: SourceOffset::Start,
            pending: None,
            batches_emitted: 0,
            rows_emitted: 0,
            exhausted: false,
        }
    }

    /// Continue from a checkpoint instead of the start
    pub fn resume(&mut self, checkpoint: CursorCheckpoint) {
        self.position = checkpoint.position;
        self.batches_emitted = checkpoint.batches_emitted;
        self.rows_emitted = checkpoint.rows_emitted;
        self.pending = None;
        self.exhausted = !self.limiter.permits(self.batches_emitted);
    }

    /// Owning descriptor
    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    /// Position after the last committed batch
    pub fn position(&self) -> &SourceOffset {
        &self.position
    }

    /// Batches committed so far
    pub fn batches_emitted(&self) -> u32 {
        self.batches_emitted
    }

    /// Rows committed so far
    pub fn rows_emitted(&self) -> u64 {
        self.rows_emitted
    }

    /// Whether no further batch will be produced
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Resolved read plan, once opened
    pub fn source_query(&self) -> Option<&SourceQuery> {
        self.source.as_ref()
    }

    /// Snapshot of committed progress
    pub fn checkpoint(&self) -> CursorCheckpoint {
        CursorCheckpoint {
            position: self.position.clone(),
            batches_emitted: self.batches_emitted,
            rows_emitted: self.rows_emitted,
        }
    }

    /// Resolve how the source is paged.
    ///
    /// Table exports use `key_columns` when given, otherwise the primary
    /// key. A table without either is paged by physical row order if
    /// `offset_fallback` allows it. Calling this again is a no-op.
    pub async fn open(&mut self) -> Result<()> {
        if self.source.is_some() {
            return Ok(());
        }

        let source = match &self.descriptor.kind {
            SourceKind::CustomQuery { query, params } => SourceQuery::Custom {
                query: query.clone(),
                params: params.clone(),
            },
            SourceKind::TableExport {
                source_schema,
                source_table,
                where_clause,
                key_columns,
                offset_fallback,
            } => {
                let mode = if key_columns.is_empty() {
                    self.discover_mode(source_schema, source_table, *offset_fallback)
                        .await?
                } else {
                    PageMode::Keyset {
                        columns: key_columns.clone(),
                    }
                };
                SourceQuery::Table {
                    schema: source_schema.clone(),
                    table: source_table.clone(),
                    where_clause: where_clause.clone(),
                    mode,
                }
            }
        };

        debug!(descriptor = %self.descriptor.id, source = ?source, "cursor opened");
        self.source = Some(source);
        Ok(())
    }

    async fn discover_mode(
        &self,
        schema: &str,
        table: &str,
        offset_fallback: bool,
    ) -> Result<PageMode> {
        let pool = &self.pool;
        let dialect = &self.dialect;

        let meta = self
            .retry
            .run("describe_table", move || async move {
                let conn = pool.get().await?;
                describe_table(&*conn, dialect, schema, table).await
            })
            .await
            .map_err(source_error)?
            .ok_or_else(|| {
                ExtractError::Query(Error::TableNotFound {
                    table: format!("{}.{}", schema, table),
                })
            })?;

        let key: Vec<String> = meta
            .primary_key_columns()
            .into_iter()
            .map(str::to_string)
            .collect();
        if !key.is_empty() {
            return Ok(PageMode::Keyset { columns: key });
        }

        if offset_fallback {
            warn!(
                descriptor = %self.descriptor.id,
                table = %meta.qualified_name(),
                "no primary key; paging by physical row order, concurrent writes may skip or repeat rows"
            );
            Ok(PageMode::RowOffset)
        } else {
            Err(ExtractError::Query(Error::schema(format!(
                "table {}.{} has no primary key and no key_columns; offset paging is disabled",
                schema, table
            ))))
        }
    }

    /// Read the next batch.
    ///
    /// Returns `None` once the source is drained or the batch cap is
    /// reached; the cap is checked before any round-trip is made.
    pub async fn fetch_next(&mut self) -> Result<Option<Batch>> {
        if self.exhausted {
            return Ok(None);
        }
        if !self.limiter.permits(self.batches_emitted) {
            info!(descriptor = %self.descriptor.id, batches = self.batches_emitted, "Reached maximum number of batches");
            self.exhausted = true;
            return Ok(None);
        }
        if self.pending.take().is_some() {
            debug!(descriptor = %self.descriptor.id, "discarding uncommitted batch");
        }

        self.open().await?;
        let Some(source) = self.source.as_ref() else {
            return Err(ExtractError::Query(Error::internal("cursor source not resolved")));
        };

        let builder = PageQueryBuilder::new(source, &self.dialect);
        let (sql, params) = builder
            .build_page_query(&self.position, self.descriptor.batch_size)
            .map_err(ExtractError::Query)?;

        let pool = &self.pool;
        let sql_ref = sql.as_str();
        let params_ref = params.as_slice();
        let rows = self
            .retry
            .run("fetch", move || async move {
                let conn = pool.get().await?;
                conn.query(sql_ref, params_ref).await
            })
            .await
            .map_err(source_error)?;

        let position = builder
            .next_offset(&self.position, &rows)
            .map_err(ExtractError::Query)?;
        let sequence = self.batches_emitted + 1;

        debug!(
            descriptor = %self.descriptor.id,
            batch = sequence,
            rows = rows.len(),
            "fetched batch"
        );

        self.pending = Some(PendingCommit {
            position,
            rows: rows.len(),
        });

        Ok(Some(Batch {
            descriptor_id: self.descriptor.id.clone(),
            target: self.descriptor.output.clone(),
            sequence,
            rows,
        }))
    }

    /// Advance past the last fetched batch.
    ///
    /// A short batch (fewer rows than `batch_size`, including an empty one)
    /// ends the source.
    pub fn commit(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        self.position = pending.position;
        self.batches_emitted += 1;
        self.rows_emitted += pending.rows as u64;

        if pending.rows < self.descriptor.batch_size as usize {
            self.exhausted = true;
        } else if !self.limiter.permits(self.batches_emitted) {
            info!(descriptor = %self.descriptor.id, batches = self.batches_emitted, "Reached maximum number of batches");
            self.exhausted = true;
        }
    }
}

fn source_error(err: RetryError<Error>) -> ExtractError {
    match err {
        RetryError::Fatal(source) => ExtractError::Query(source),
        RetryError::Exhausted { attempts, last } => ExtractError::SourceUnavailable {
            attempts,
            source: last,
        },
    }
}
