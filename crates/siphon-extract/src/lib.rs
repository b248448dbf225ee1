//! siphon-extract - Batched extraction engine for PostgreSQL
//!
//! Turns a declarative list of tables and custom queries into bounded,
//! retried, resumable reads, and hands every batch to a destination sink.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌───────────────────┐    ┌──────────────────────────┐
//! │ ExtractConfig│───▶│ SourceDescriptor[]│───▶│      DispatchEngine      │
//! └──────────────┘    └───────────────────┘    │  per descriptor:         │
//!                                              │   BatchLimiter           │
//!                                              │   BatchCursor ◀─ Retry ──┼──▶ source pool
//!                                              │   BatchSink   ◀─ Retry   │
//!                                              └────────────┬─────────────┘
//!                                                           ▼
//!                                                       JobReport
//! ```
//!
//! # Library Usage
//!
//! ```rust,ignore
//! use siphon_extract::{DispatchEngine, ExtractConfig, MemorySink};
//!
//! let config = ExtractConfig::from_file("siphon.json")?;
//! let descriptors = config.descriptors()?;
//! let engine = DispatchEngine::new(pool, Arc::new(MemorySink::new()))
//!     .with_retry(config.retry.to_retry_config());
//! let report = engine.run(descriptors).await?;
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Write one .sql file per source into ./backups
//! siphon -c siphon.json run --output-dir backups
//!
//! # Copy into tables of another database
//! siphon -c siphon.json run --sink table --target-url postgres://...
//!
//! # Validate configuration
//! siphon -c siphon.json validate
//! ```

pub mod checkpoint;
pub mod config;
pub mod cursor;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod report;
pub mod retry;
pub mod sink;
pub mod types;

pub use checkpoint::CheckpointStore;
pub use config::ExtractConfig;
pub use cursor::{Batch, BatchCursor, CursorCheckpoint};
pub use descriptor::{OutputTarget, SourceDescriptor, SourceKind};
pub use engine::{DescriptorState, DispatchEngine};
pub use error::{ExtractError, Result, SinkError};
pub use limiter::BatchLimiter;
pub use report::{DescriptorOutcome, DescriptorReport, JobReport, JobTotals};
pub use retry::{RetryConfig, RetryController, RetryError, Transient};
pub use sink::{BatchSink, MemorySink, SqlFileSink, StreamInfo, StreamSource, TableSink};
pub use types::SensitiveString;
