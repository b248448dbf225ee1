//! Destination sinks
//!
//! A sink receives the batches of every descriptor. Each descriptor forms
//! one stream: `open_stream`, then zero or more `write_batch` calls in
//! sequence order, then `close_stream`. Streams of different descriptors
//! may interleave when descriptors run concurrently, and several streams
//! may share one output target.

mod memory;
mod sql_file;
mod table;

pub use memory::{MemorySink, RecordedBatch};
pub use sql_file::SqlFileSink;
pub use table::TableSink;

use async_trait::async_trait;

use crate::cursor::Batch;
use crate::descriptor::{OutputTarget, SourceDescriptor, SourceKind};
use crate::error::SinkError;

/// Where a stream's rows originate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSource {
    /// A table export
    Table {
        /// Source schema
        schema: String,
        /// Source table
        table: String,
    },
    /// A custom query
    Query {
        /// Statement text as configured
        query: String,
    },
}

/// Per-descriptor context passed to every sink call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Descriptor identifier
    pub descriptor_id: String,
    /// Output target
    pub target: OutputTarget,
    /// Origin of the rows
    pub source: StreamSource,
    /// Whether the stream continues a checkpointed run
    pub resumed: bool,
}

impl StreamInfo {
    /// Stream context for `descriptor`
    pub fn for_descriptor(descriptor: &SourceDescriptor, resumed: bool) -> Self {
        let source = match &descriptor.kind {
            SourceKind::TableExport {
                source_schema,
                source_table,
                ..
            } => StreamSource::Table {
                schema: source_schema.clone(),
                table: source_table.clone(),
            },
            SourceKind::CustomQuery { query, .. } => StreamSource::Query {
                query: query.clone(),
            },
        };
        Self {
            descriptor_id: descriptor.id.clone(),
            target: descriptor.output.clone(),
            source,
            resumed,
        }
    }
}

/// Accepts batches for a target table
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Prepare a stream before its first batch
    async fn open_stream(&self, _stream: &StreamInfo) -> Result<(), SinkError> {
        Ok(())
    }

    /// Persist one batch.
    ///
    /// May be called again with the same batch after a transient error.
    async fn write_batch(&self, stream: &StreamInfo, batch: &Batch) -> Result<(), SinkError>;

    /// Finish a stream; `completed` is false when the descriptor failed or
    /// was cancelled.
    async fn close_stream(&self, _stream: &StreamInfo, _completed: bool) -> Result<(), SinkError> {
        Ok(())
    }
}
