//! Dispatch engine
//!
//! Drives every descriptor from `Pending` through `Running` to a terminal
//! state and collects a [`JobReport`]. A descriptor failure never stops
//! its siblings; only invalid configuration aborts the job, and it does so
//! before the first round-trip.
//!
//! With `concurrency > 1` descriptors run as separate tasks, each with its
//! own cursor and retry controller, reporting back over a channel. The
//! batches of one descriptor are always fetched and written in order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use siphon_rdbc::prelude::ConnectionPool;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::cursor::{BatchCursor, CursorCheckpoint};
use crate::descriptor::SourceDescriptor;
use crate::error::{ExtractError, Result};
use crate::report::{DescriptorOutcome, DescriptorReport, JobReport};
use crate::retry::{RetryConfig, RetryController, RetryError};
use crate::sink::{BatchSink, StreamInfo};

/// Lifecycle of one descriptor within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorState {
    /// Not started
    Pending,
    /// Fetching and writing batches
    Running,
    /// Terminal: drained or capped
    Completed,
    /// Terminal: stopped by an error
    Failed,
    /// Terminal: stopped on request
    Cancelled,
}

impl DescriptorState {
    /// Whether no further transition happens
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn outcome(&self) -> DescriptorOutcome {
        match self {
            Self::Completed => DescriptorOutcome::Completed,
            Self::Cancelled => DescriptorOutcome::Cancelled,
            Self::Pending | Self::Running | Self::Failed => DescriptorOutcome::Failed,
        }
    }
}

/// Shared, task-safe part of the engine
struct Worker {
    pool: Arc<dyn ConnectionPool>,
    sink: Arc<dyn BatchSink>,
    retry: RetryConfig,
    cancel: CancellationToken,
}

/// Runs descriptors against a source pool and a sink
pub struct DispatchEngine {
    pool: Arc<dyn ConnectionPool>,
    sink: Arc<dyn BatchSink>,
    retry: RetryConfig,
    cancel: CancellationToken,
    concurrency: usize,
    checkpoints: CheckpointStore,
}

impl DispatchEngine {
    /// Create an engine reading from `pool` and writing to `sink`
    pub fn new(pool: Arc<dyn ConnectionPool>, sink: Arc<dyn BatchSink>) -> Self {
        Self {
            pool,
            sink,
            retry: RetryConfig::default(),
            cancel: CancellationToken::new(),
            concurrency: 1,
            checkpoints: CheckpointStore::new(),
        }
    }

    /// Retry policy applied to fetches and sink writes
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run up to `n` descriptors at the same time
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Stop between batches when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Resume descriptors found in `store`
    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = store;
        self
    }

    /// Token that cancels this engine's runs
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Extract every descriptor.
    ///
    /// Returns `Err` only for invalid descriptors, before anything is read;
    /// per-descriptor failures are reported in the [`JobReport`].
    pub async fn run(&self, descriptors: Vec<SourceDescriptor>) -> Result<JobReport> {
        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            descriptor.validate()?;
            if !seen.insert(descriptor.id.as_str()) {
                return Err(ExtractError::config(format!(
                    "duplicate descriptor id '{}'",
                    descriptor.id
                )));
            }
        }

        let jobs: Vec<(Arc<SourceDescriptor>, Option<CursorCheckpoint>)> = descriptors
            .into_iter()
            .map(|d| {
                let checkpoint = self.checkpoints.get(&d.id).cloned();
                (Arc::new(d), checkpoint)
            })
            .collect();

        info!(
            "Starting extraction of {} source(s) with {} sink, concurrency {}",
            jobs.len(),
            self.sink.name(),
            self.concurrency
        );

        let worker = Arc::new(Worker {
            pool: self.pool.clone(),
            sink: self.sink.clone(),
            retry: self.retry.clone(),
            cancel: self.cancel.clone(),
        });

        let reports = if self.concurrency <= 1 || jobs.len() <= 1 {
            let mut reports = Vec::with_capacity(jobs.len());
            for (descriptor, checkpoint) in jobs {
                reports.push(worker.drive(descriptor, checkpoint).await);
            }
            reports
        } else {
            self.run_concurrent(worker, jobs).await
        };

        Ok(JobReport::new(reports))
    }

    async fn run_concurrent(
        &self,
        worker: Arc<Worker>,
        jobs: Vec<(Arc<SourceDescriptor>, Option<CursorCheckpoint>)>,
    ) -> Vec<DescriptorReport> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (tx, mut rx) = mpsc::channel(jobs.len());
        let mut slots: Vec<Option<DescriptorReport>> = vec![None; jobs.len()];
        let descriptors: Vec<Arc<SourceDescriptor>> =
            jobs.iter().map(|(d, _)| d.clone()).collect();

        for (idx, (descriptor, checkpoint)) in jobs.into_iter().enumerate() {
            // Permits are taken in order, so descriptors start in configuration order.
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let worker = worker.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let report = worker.drive(descriptor, checkpoint).await;
                drop(permit);
                let _ = tx.send((idx, report)).await;
            });
        }
        drop(tx);

        while let Some((idx, report)) = rx.recv().await {
            slots[idx] = Some(report);
        }

        slots
            .into_iter()
            .zip(descriptors)
            .map(|(slot, descriptor)| {
                slot.unwrap_or_else(|| {
                    error!(descriptor = %descriptor.id, "extraction task ended without a report");
                    DescriptorReport {
                        id: descriptor.id.clone(),
                        target: descriptor.output.clone(),
                        outcome: DescriptorOutcome::Failed,
                        rows: 0,
                        batches: 0,
                        duration_ms: 0,
                        error_kind: Some("internal".into()),
                        error: Some("extraction task panicked".into()),
                        checkpoint: None,
                    }
                })
            })
            .collect()
    }
}

impl Worker {
    async fn drive(
        &self,
        descriptor: Arc<SourceDescriptor>,
        checkpoint: Option<CursorCheckpoint>,
    ) -> DescriptorReport {
        let started = Instant::now();
        let mut state = DescriptorState::Pending;

        let mut cursor = BatchCursor::new(
            descriptor.clone(),
            self.pool.clone(),
            RetryController::new(self.retry.clone()),
        );
        let resumed = match checkpoint {
            Some(cp) => {
                info!(
                    descriptor = %descriptor.id,
                    batches = cp.batches_emitted,
                    rows = cp.rows_emitted,
                    "resuming from checkpoint"
                );
                cursor.resume(cp);
                true
            }
            None => false,
        };
        let stream = StreamInfo::for_descriptor(&descriptor, resumed);

        transition(&descriptor.id, &mut state, DescriptorState::Running);
        info!(descriptor = %descriptor.id, target = %descriptor.output, "Starting backup");

        let mut opened = false;
        let mut result = self.pump(&mut cursor, &stream, &mut opened).await;

        if opened {
            let completed = result.is_ok();
            if let Err(e) = self.sink.close_stream(&stream, completed).await {
                if result.is_ok() {
                    result = Err(ExtractError::Sink(e));
                } else {
                    warn!(descriptor = %descriptor.id, error = %e, "closing stream after failure");
                }
            }
        }

        let (next, error) = match result {
            Ok(()) => (DescriptorState::Completed, None),
            Err(ExtractError::Cancelled) => (DescriptorState::Cancelled, None),
            Err(e) => {
                error!(descriptor = %descriptor.id, kind = e.kind(), error = %e, "extraction failed");
                (DescriptorState::Failed, Some(e))
            }
        };
        transition(&descriptor.id, &mut state, next);

        DescriptorReport {
            id: descriptor.id.clone(),
            target: descriptor.output.clone(),
            outcome: state.outcome(),
            rows: cursor.rows_emitted(),
            batches: cursor.batches_emitted(),
            duration_ms: started.elapsed().as_millis() as u64,
            error_kind: error.as_ref().map(|e| e.kind().to_string()),
            error: error.as_ref().map(|e| e.to_string()),
            checkpoint: (state != DescriptorState::Completed).then(|| cursor.checkpoint()),
        }
    }

    async fn pump(
        &self,
        cursor: &mut BatchCursor,
        stream: &StreamInfo,
        opened: &mut bool,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }
        if cursor.is_exhausted() {
            info!(
                descriptor = %stream.descriptor_id,
                batches = cursor.batches_emitted(),
                "batch cap already reached, nothing to extract"
            );
            return Ok(());
        }

        cursor.open().await?;

        let sink = &*self.sink;
        let writes = RetryController::new(self.retry.clone());
        writes
            .run("open_stream", move || sink.open_stream(stream))
            .await
            .map_err(sink_error)?;
        *opened = true;

        loop {
            if self.cancel.is_cancelled() {
                info!(
                    descriptor = %stream.descriptor_id,
                    batches = cursor.batches_emitted(),
                    "cancellation requested, stopping at batch boundary"
                );
                return Err(ExtractError::Cancelled);
            }

            let Some(batch) = cursor.fetch_next().await? else {
                break;
            };

            let batch_ref = &batch;
            writes
                .run("write_batch", move || sink.write_batch(stream, batch_ref))
                .await
                .map_err(sink_error)?;
            cursor.commit();

            info!(
                "Processed batch {} for {}. Total Data: {}",
                batch.sequence,
                stream.target,
                cursor.rows_emitted()
            );
        }

        info!(
            descriptor = %stream.descriptor_id,
            rows = cursor.rows_emitted(),
            batches = cursor.batches_emitted(),
            "source exhausted"
        );
        Ok(())
    }
}

fn transition(id: &str, state: &mut DescriptorState, next: DescriptorState) {
    debug_assert!(!state.is_terminal(), "{id}: transition out of {state:?}");
    debug!(descriptor = %id, from = ?*state, to = ?next, "state transition");
    *state = next;
}

fn sink_error(err: RetryError<crate::error::SinkError>) -> ExtractError {
    if let RetryError::Exhausted { attempts, .. } = &err {
        warn!(attempts, "sink write retries exhausted");
    }
    ExtractError::Sink(err.into_inner())
}
