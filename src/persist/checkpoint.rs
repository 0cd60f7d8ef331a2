use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{RedpilotError, Result};
use crate::graph::GraphState;
use crate::intervention::PendingIntervention;
use crate::operation::OperationStatus;

/// Everything needed to resume inspection of an operation after a crash:
/// both graphs, the operation verdict so far, and any intervention still
/// awaiting a human.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationCheckpoint {
    pub op_id: String,
    pub goal: String,
    pub status: OperationStatus,
    pub graph: GraphState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_intervention: Option<PendingIntervention>,
    /// Highest event sequence number emitted before this checkpoint.
    pub last_event_seq: u64,
    pub saved_at: DateTime<Utc>,
}

/// One JSON document per operation, written crash-consistently: a reader
/// of a partially-written checkpoint sees the previous valid version.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(operations_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: operations_dir.into(),
        }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        self.recover_interrupted_writes().await;
        Ok(())
    }

    pub async fn save(&self, checkpoint: &OperationCheckpoint) -> Result<()> {
        let path = self.checkpoint_path(&checkpoint.op_id);
        let content = serde_json::to_string_pretty(checkpoint)?;
        self.write_atomic(&path, &content).await
    }

    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        let tmp_path = path.with_extension("json.tmp");

        fs::write(&tmp_path, content).await?;

        // Sync before rename so the rename never outruns the data.
        let tmp_path_clone = tmp_path.clone();
        let sync_result = tokio::task::spawn_blocking(move || {
            std::fs::File::open(&tmp_path_clone).and_then(|file| file.sync_all())
        })
        .await;
        match sync_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to sync checkpoint to disk"),
            Err(e) => warn!(error = %e, "checkpoint sync task failed"),
        }

        fs::rename(&tmp_path, path).await?;
        debug!(path = %path.display(), "checkpoint written");
        Ok(())
    }

    async fn recover_interrupted_writes(&self) {
        if let Ok(mut entries) = fs::read_dir(&self.dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    debug!(path = %path.display(), "removing interrupted checkpoint write");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
    }

    pub async fn load(&self, op_id: &str) -> Result<OperationCheckpoint> {
        let path = self.checkpoint_path(op_id);
        if !path.exists() {
            return Err(RedpilotError::OperationNotFound(op_id.to_string()));
        }
        let content = fs::read_to_string(&path).await?;
        let checkpoint: OperationCheckpoint = serde_json::from_str(&content)?;
        Ok(checkpoint)
    }

    pub async fn list(&self) -> Result<Vec<OperationCheckpoint>> {
        let mut checkpoints = Vec::new();
        if !self.dir.exists() {
            return Ok(checkpoints);
        }

        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Ok(content) = fs::read_to_string(&path).await {
                    if let Ok(checkpoint) = serde_json::from_str::<OperationCheckpoint>(&content) {
                        checkpoints.push(checkpoint);
                    }
                }
            }
        }

        checkpoints.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(checkpoints)
    }

    fn checkpoint_path(&self, op_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", op_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphStore;

    fn checkpoint(op_id: &str) -> OperationCheckpoint {
        let store = GraphStore::new("capture the flag");
        OperationCheckpoint {
            op_id: op_id.to_string(),
            goal: "capture the flag".to_string(),
            status: OperationStatus::Running,
            graph: store.snapshot().as_ref().clone(),
            pending_intervention: None,
            last_event_seq: 0,
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.init().await.unwrap();

        let original = checkpoint("op-1");
        store.save(&original).await.unwrap();

        let loaded = store.load("op-1").await.unwrap();
        assert_eq!(loaded.goal, original.goal);
        assert_eq!(loaded.graph, original.graph);
    }

    #[tokio::test]
    async fn interrupted_writes_are_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.init().await.unwrap();
        store.save(&checkpoint("op-1")).await.unwrap();

        // Simulate a crash mid-write.
        let tmp = dir.path().join("op-1.json.tmp");
        fs::write(&tmp, "{ half a docum").await.unwrap();

        let store = CheckpointStore::new(dir.path());
        store.init().await.unwrap();
        assert!(!tmp.exists());
        // The previous valid version is still readable.
        assert!(store.load("op-1").await.is_ok());
    }

    #[tokio::test]
    async fn missing_checkpoint_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.init().await.unwrap();
        assert!(matches!(
            store.load("op-nope").await,
            Err(RedpilotError::OperationNotFound(_))
        ));
    }
}
