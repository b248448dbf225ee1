use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{BatchSink, StreamInfo};
use crate::cursor::Batch;
use crate::error::SinkError;

/// A batch as seen by [`MemorySink`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedBatch {
    /// Descriptor identifier
    pub descriptor_id: String,
    /// The batch
    pub batch: Batch,
}

#[derive(Debug, Default)]
struct State {
    batches: Vec<RecordedBatch>,
    opened: Vec<String>,
    closed: Vec<(String, bool)>,
    failures: VecDeque<SinkError>,
    write_calls: usize,
}

/// Sink that keeps every batch in memory.
///
/// Failures queued with [`fail_next`](MemorySink::fail_next) are returned
/// by the following writes, one per call.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<State>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next write fail with `err`
    pub fn fail_next(&self, err: SinkError) {
        self.lock().failures.push_back(err);
    }

    /// Every accepted batch, in arrival order
    pub fn batches(&self) -> Vec<RecordedBatch> {
        self.lock().batches.clone()
    }

    /// Accepted batches of one descriptor
    pub fn batches_for(&self, descriptor_id: &str) -> Vec<RecordedBatch> {
        self.lock()
            .batches
            .iter()
            .filter(|b| b.descriptor_id == descriptor_id)
            .cloned()
            .collect()
    }

    /// Total accepted rows
    pub fn row_count(&self) -> usize {
        self.lock().batches.iter().map(|b| b.batch.len()).sum()
    }

    /// Descriptors whose stream was opened
    pub fn opened(&self) -> Vec<String> {
        self.lock().opened.clone()
    }

    /// Descriptors whose stream was closed, with the completion flag
    pub fn closed(&self) -> Vec<(String, bool)> {
        self.lock().closed.clone()
    }

    /// Write attempts, including failed ones
    pub fn write_calls(&self) -> usize {
        self.lock().write_calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test thread must not hide the recorded state.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BatchSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open_stream(&self, stream: &StreamInfo) -> Result<(), SinkError> {
        self.lock().opened.push(stream.descriptor_id.clone());
        Ok(())
    }

    async fn write_batch(&self, stream: &StreamInfo, batch: &Batch) -> Result<(), SinkError> {
        let mut state = self.lock();
        state.write_calls += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        state.batches.push(RecordedBatch {
            descriptor_id: stream.descriptor_id.clone(),
            batch: batch.clone(),
        });
        Ok(())
    }

    async fn close_stream(&self, stream: &StreamInfo, completed: bool) -> Result<(), SinkError> {
        self.lock()
            .closed
            .push((stream.descriptor_id.clone(), completed));
        Ok(())
    }
}
