//! Checkpoint file
//!
//! A JSON object mapping descriptor id to [`CursorCheckpoint`]. Written
//! after a run for every descriptor that did not complete; read at start to
//! resume those descriptors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::cursor::CursorCheckpoint;
use crate::error::Result;
use crate::report::{DescriptorOutcome, JobReport};

/// Checkpoints keyed by descriptor id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointStore {
    entries: BTreeMap<String, CursorCheckpoint>,
}

impl CheckpointStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`; a missing file is an empty store
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let entries: BTreeMap<String, CursorCheckpoint> = serde_json::from_slice(&bytes)?;
                debug!(path = %path.display(), entries = entries.len(), "loaded checkpoints");
                Ok(Self { entries })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to `path` atomically through a sibling temp file
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut tmp = PathBuf::from(path);
        tmp.set_extension("tmp");
        let bytes = serde_json::to_vec_pretty(&self.entries)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Checkpoint of `id`
    pub fn get(&self, id: &str) -> Option<&CursorCheckpoint> {
        self.entries.get(id)
    }

    /// Record a checkpoint
    pub fn insert(&mut self, id: impl Into<String>, checkpoint: CursorCheckpoint) {
        self.entries.insert(id.into(), checkpoint);
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fold a finished run in: completed descriptors are dropped so the next
    /// run starts them fresh, the others keep their last committed position.
    pub fn update_from(&mut self, report: &JobReport) {
        for d in &report.descriptors {
            match (&d.outcome, &d.checkpoint) {
                (DescriptorOutcome::Completed, _) => {
                    self.entries.remove(&d.id);
                }
                (_, Some(cp)) => {
                    self.entries.insert(d.id.clone(), cp.clone());
                }
                (_, None) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::OutputTarget;
    use crate::report::DescriptorReport;
    use siphon_rdbc::prelude::SourceOffset;

    fn entry(id: &str, outcome: DescriptorOutcome, cp: Option<CursorCheckpoint>) -> DescriptorReport {
        DescriptorReport {
            id: id.into(),
            target: OutputTarget::new("public", "t"),
            outcome,
            rows: 0,
            batches: 0,
            duration_ms: 0,
            error_kind: None,
            error: None,
            checkpoint: cp,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::load(dir.path().join("absent.json")).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");

        let mut store = CheckpointStore::new();
        store.insert(
            "tables[0]:public.t",
            CursorCheckpoint {
                position: SourceOffset::Rows(200),
                batches_emitted: 2,
                rows_emitted: 200,
            },
        );
        store.save(&path).await.unwrap();

        let loaded = CheckpointStore::load(&path).await.unwrap();
        assert_eq!(loaded, store);
        assert!(!dir.path().join("checkpoints.tmp").exists());
    }

    #[test]
    fn test_update_from_report() {
        let cp = CursorCheckpoint {
            position: SourceOffset::Rows(10),
            batches_emitted: 1,
            rows_emitted: 10,
        };
        let mut store = CheckpointStore::new();
        store.insert("done", cp.clone());

        store.update_from(&JobReport::new(vec![
            entry("done", DescriptorOutcome::Completed, Some(cp.clone())),
            entry("broken", DescriptorOutcome::Failed, Some(cp.clone())),
        ]));

        assert!(store.get("done").is_none());
        assert_eq!(store.get("broken"), Some(&cp));
    }
}
