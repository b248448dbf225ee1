//! Job outcome reporting

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::cursor::CursorCheckpoint;
use crate::descriptor::OutputTarget;

/// Terminal state of one descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorOutcome {
    /// Source drained or batch cap reached
    Completed,
    /// Stopped by an error; earlier batches stay delivered
    Failed,
    /// Stopped between batches on request
    Cancelled,
}

/// Result of one descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorReport {
    /// Descriptor identifier
    pub id: String,
    /// Output target
    pub target: OutputTarget,
    /// Terminal state
    pub outcome: DescriptorOutcome,
    /// Rows delivered to the sink
    pub rows: u64,
    /// Batches delivered to the sink
    pub batches: u32,
    /// Wall time in milliseconds
    pub duration_ms: u64,
    /// Error kind, when failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Error message, when failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Progress to resume from, when not completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CursorCheckpoint>,
}

impl DescriptorReport {
    /// Whether some but not all of the source was delivered
    pub fn is_partial(&self) -> bool {
        self.outcome != DescriptorOutcome::Completed && self.batches > 0
    }
}

/// Totals across descriptors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTotals {
    /// Descriptors completed
    pub completed: usize,
    /// Descriptors failed
    pub failed: usize,
    /// Descriptors cancelled
    pub cancelled: usize,
    /// Rows delivered
    pub rows: u64,
    /// Batches delivered
    pub batches: u64,
}

/// Per-descriptor results of a run, in configuration order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    /// One entry per descriptor
    pub descriptors: Vec<DescriptorReport>,
}

impl JobReport {
    /// Build from descriptor reports
    pub fn new(descriptors: Vec<DescriptorReport>) -> Self {
        Self { descriptors }
    }

    /// Aggregate counts
    pub fn totals(&self) -> JobTotals {
        self.descriptors
            .iter()
            .fold(JobTotals::default(), |mut acc, d| {
                match d.outcome {
                    DescriptorOutcome::Completed => acc.completed += 1,
                    DescriptorOutcome::Failed => acc.failed += 1,
                    DescriptorOutcome::Cancelled => acc.cancelled += 1,
                }
                acc.rows += d.rows;
                acc.batches += u64::from(d.batches);
                acc
            })
    }

    /// Whether any descriptor failed
    pub fn has_failures(&self) -> bool {
        self.descriptors
            .iter()
            .any(|d| d.outcome == DescriptorOutcome::Failed)
    }

    /// Report for one descriptor
    pub fn get(&self, id: &str) -> Option<&DescriptorReport> {
        self.descriptors.iter().find(|d| d.id == id)
    }

    /// Emit one line per descriptor and a summary
    pub fn log_summary(&self) {
        for d in &self.descriptors {
            match d.outcome {
                DescriptorOutcome::Completed => info!(
                    descriptor = %d.id,
                    target = %d.target,
                    rows = d.rows,
                    batches = d.batches,
                    duration_ms = d.duration_ms,
                    "completed"
                ),
                DescriptorOutcome::Failed => error!(
                    descriptor = %d.id,
                    target = %d.target,
                    rows = d.rows,
                    batches = d.batches,
                    partial = d.is_partial(),
                    error = d.error.as_deref().unwrap_or(""),
                    "failed"
                ),
                DescriptorOutcome::Cancelled => warn!(
                    descriptor = %d.id,
                    rows = d.rows,
                    batches = d.batches,
                    "cancelled"
                ),
            }
        }

        let totals = self.totals();
        info!(
            "Job finished: {} completed, {} failed, {} cancelled, {} rows in {} batches",
            totals.completed, totals.failed, totals.cancelled, totals.rows, totals.batches
        );
    }
}
