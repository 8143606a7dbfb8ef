//! Filesystem state store: append-only event log plus atomic snapshots.
//!
//! Layout under the store root, one directory per run:
//! ```text
//! <root>/<workflow_id>/
//!   events.jsonl    # one TransitionEvent per line, append-only
//!   snapshot.json   # latest WorkflowState, replaced atomically
//!   run.lock        # writer pid, held for the duration of the run
//! ```
//!
//! The snapshot is written to `snapshot.json.tmp` and renamed into place, so
//! a crash mid-write leaves the previous snapshot intact. The event line is
//! appended before the snapshot is replaced: after a crash the snapshot
//! reflects a prefix of the log, never a torn state.

use std::path::{Path, PathBuf};

use gantry_core::store::StateStore;
use gantry_types::error::StoreError;
use gantry_types::event::{TransitionEvent, TransitionKind};
use gantry_types::state::WorkflowState;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const EVENTS_FILE: &str = "events.jsonl";
const SNAPSHOT_FILE: &str = "snapshot.json";
const SNAPSHOT_TMP_FILE: &str = "snapshot.json.tmp";
const LOCK_FILE: &str = "run.lock";

// ---------------------------------------------------------------------------
// FsStateStore
// ---------------------------------------------------------------------------

/// Durable run storage rooted at a directory.
pub struct FsStateStore {
    root: PathBuf,
}

impl FsStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn run_dir(&self, workflow_id: Uuid) -> PathBuf {
        self.root.join(workflow_id.to_string())
    }

    /// Ensure this process holds the run's writer lock.
    ///
    /// The lock file records the writer's pid. Re-entry from the same
    /// process is allowed (resume), and a lock left behind by a dead process
    /// is reclaimed. A lock held by another live process refuses the write.
    async fn ensure_lock(&self, dir: &Path, workflow_id: Uuid) -> Result<(), StoreError> {
        let lock_path = dir.join(LOCK_FILE);
        let pid = std::process::id();
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(pid.to_string().as_bytes()).await?;
                    file.flush().await?;
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = tokio::fs::read_to_string(&lock_path)
                        .await
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match holder {
                        Some(holder_pid) if holder_pid == pid => return Ok(()),
                        Some(holder_pid) if !process_alive(holder_pid) => {
                            tracing::warn!(
                                workflow_id = %workflow_id,
                                stale_pid = holder_pid,
                                "reclaiming stale run lock"
                            );
                            tokio::fs::remove_file(&lock_path).await?;
                            continue;
                        }
                        _ => return Err(StoreError::LockHeld(workflow_id)),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn release_lock(&self, dir: &Path) -> Result<(), StoreError> {
        let lock_path = dir.join(LOCK_FILE);
        match tokio::fs::remove_file(&lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether a pid refers to a live process. On platforms without a procfs
/// the check is conservative and reports the holder as alive.
fn process_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        Path::new(&format!("/proc/{pid}")).exists()
    } else {
        true
    }
}

impl StateStore for FsStateStore {
    async fn append(
        &self,
        event: &TransitionEvent,
        snapshot: &WorkflowState,
    ) -> Result<(), StoreError> {
        let dir = self.run_dir(event.workflow_id);
        tokio::fs::create_dir_all(&dir).await?;
        self.ensure_lock(&dir, event.workflow_id).await?;

        // Event line first, then the snapshot swap.
        let mut line =
            serde_json::to_vec(event).map_err(|e| StoreError::Serialize(e.to_string()))?;
        line.push(b'\n');
        let mut log = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(dir.join(EVENTS_FILE))
            .await?;
        log.write_all(&line).await?;
        log.flush().await?;

        let body = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;
        let tmp = dir.join(SNAPSHOT_TMP_FILE);
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, dir.join(SNAPSHOT_FILE)).await?;

        // A terminal transition ends this writer's claim on the run.
        if matches!(event.kind, TransitionKind::WorkflowFinished { .. }) {
            self.release_lock(&dir).await?;
        }
        Ok(())
    }

    async fn load(&self, workflow_id: Uuid) -> Result<WorkflowState, StoreError> {
        let path = self.run_dir(workflow_id).join(SNAPSHOT_FILE);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(workflow_id));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&body).map_err(|e| StoreError::Corrupt {
            workflow_id,
            detail: format!("snapshot: {e}"),
        })
    }

    async fn events(&self, workflow_id: Uuid) -> Result<Vec<TransitionEvent>, StoreError> {
        let path = self.run_dir(workflow_id).join(EVENTS_FILE);
        let body = match tokio::fs::read_to_string(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(workflow_id));
            }
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for (lineno, line) in body.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: TransitionEvent =
                serde_json::from_str(line).map_err(|e| StoreError::Corrupt {
                    workflow_id,
                    detail: format!("event log line {}: {e}", lineno + 1),
                })?;
            events.push(event);
        }
        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
