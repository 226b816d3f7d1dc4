//! Append-only snapshot store for run states.
//!
//! Every mutation writes a complete new snapshot line (JSON-lines, one file
//! per run) and advances the monotonic sequence number; history is never
//! edited in place. A concurrent reader always observes the last complete
//! snapshot, and a crashed writer is resumed by replaying the log; a
//! trailing partial line from an interrupted write is simply skipped.

use super::{RunState, RunStatus, StackFrame};
use crate::errors::StoreError;
use crate::flow::{Flow, StepRef};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

pub struct RunStateStore {
    /// Snapshot directory; `None` keeps runs in memory only (tests)
    dir: Option<PathBuf>,
    runs: Mutex<HashMap<Uuid, RunState>>,
}

impl RunStateStore {
    /// Store snapshots under the given directory, one JSONL file per run.
    pub fn new(dir: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::SnapshotWriteFailed {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir: Some(dir),
            runs: Mutex::new(HashMap::new()),
        })
    }

    /// Volatile store with no disk backing.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Create a run positioned at the flow's entry node and persist its
    /// first snapshot.
    pub fn create(&self, run_id: Uuid, flow: &Flow) -> Result<RunState, StoreError> {
        let state = RunState::new(run_id, &flow.id, &flow.entry);
        self.persist(state)
    }

    /// Load the last complete snapshot for a run.
    pub fn load(&self, run_id: Uuid) -> Result<RunState, StoreError> {
        if let Some(state) = self.runs.lock().expect("run map poisoned").get(&run_id) {
            return Ok(state.clone());
        }
        let history = self.replay(run_id)?;
        history
            .into_iter()
            .next_back()
            .ok_or(StoreError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Persist a mutated state as a new snapshot: bump the sequence, write
    /// the line, update the cache. This is the single write path.
    pub fn persist(&self, mut state: RunState) -> Result<RunState, StoreError> {
        state.seq += 1;
        state.updated_at = chrono::Utc::now();

        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{}.jsonl", state.run_id));
            let line = serde_json::to_string(&state)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| StoreError::SnapshotWriteFailed {
                    path: path.clone(),
                    source,
                })?;
            writeln!(file, "{line}").map_err(|source| StoreError::SnapshotWriteFailed {
                path,
                source,
            })?;
        }

        self.runs
            .lock()
            .expect("run map poisoned")
            .insert(state.run_id, state.clone());
        Ok(state)
    }

    /// Advance the run to a new position and persist.
    pub fn advance(
        &self,
        run_id: Uuid,
        position: StepRef,
        status: RunStatus,
    ) -> Result<RunState, StoreError> {
        let mut state = self.load(run_id)?;
        state.advance_to(position, status);
        self.persist(state)
    }

    /// Push an interruption frame and persist.
    pub fn push_frame(
        &self,
        run_id: Uuid,
        frame: StackFrame,
        resume_at: StepRef,
    ) -> Result<RunState, StoreError> {
        let mut state = self.load(run_id)?;
        state.push_frame(frame, resume_at);
        self.persist(state)
    }

    /// Pop the newest frame and persist.
    pub fn pop_frame(&self, run_id: Uuid) -> Result<RunState, StoreError> {
        let mut state = self.load(run_id)?;
        state.pop_frame();
        self.persist(state)
    }

    /// Ask the run to stop at its next suspension point. The stacks are
    /// left intact for inspection.
    pub fn request_stop(&self, run_id: Uuid) -> Result<RunState, StoreError> {
        let mut state = self.load(run_id)?;
        state.stop_requested = true;
        self.persist(state)
    }

    /// Ask the run to pause before its next dispatch.
    pub fn request_pause(&self, run_id: Uuid) -> Result<RunState, StoreError> {
        let mut state = self.load(run_id)?;
        state.pause_requested = true;
        self.persist(state)
    }

    /// Clear a pause request so the run can be resumed.
    pub fn clear_pause(&self, run_id: Uuid) -> Result<RunState, StoreError> {
        let mut state = self.load(run_id)?;
        state.pause_requested = false;
        self.persist(state)
    }

    /// Full snapshot history from disk, oldest first. Skips any trailing
    /// partial line.
    pub fn replay(&self, run_id: Uuid) -> Result<Vec<RunState>, StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };
        let path = dir.join(format!("{run_id}.jsonl"));
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content =
            std::fs::read_to_string(&path).map_err(|source| StoreError::SnapshotReadFailed {
                path: path.clone(),
                source,
            })?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str::<RunState>(line).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::test_support::linear_flow;
    use tempfile::tempdir;

    #[test]
    fn test_create_persists_first_snapshot() {
        let dir = tempdir().unwrap();
        let store = RunStateStore::new(dir.path().to_path_buf()).unwrap();
        let flow = linear_flow("delivery");
        let run_id = Uuid::new_v4();

        let state = store.create(run_id, &flow).unwrap();
        assert_eq!(state.seq, 1);
        assert_eq!(state.step, "a");
        assert_eq!(store.load(run_id).unwrap(), state);
    }

    #[test]
    fn test_load_unknown_run() {
        let store = RunStateStore::in_memory();
        let err = store.load(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, StoreError::RunNotFound { .. }));
    }

    #[test]
    fn test_advance_bumps_sequence() {
        let store = RunStateStore::in_memory();
        let flow = linear_flow("delivery");
        let run_id = Uuid::new_v4();
        store.create(run_id, &flow).unwrap();

        let state = store
            .advance(run_id, StepRef::new("delivery", "b"), RunStatus::Running)
            .unwrap();
        assert_eq!(state.seq, 2);
        assert_eq!(state.step, "b");
    }

    #[test]
    fn test_resume_from_disk_after_restart() {
        let dir = tempdir().unwrap();
        let flow = linear_flow("delivery");
        let run_id = Uuid::new_v4();

        {
            let store = RunStateStore::new(dir.path().to_path_buf()).unwrap();
            store.create(run_id, &flow).unwrap();
            store
                .advance(run_id, StepRef::new("delivery", "b"), RunStatus::Running)
                .unwrap();
        }

        // Fresh store instance: only the log remains
        let store = RunStateStore::new(dir.path().to_path_buf()).unwrap();
        let state = store.load(run_id).unwrap();
        assert_eq!(state.step, "b");
        assert_eq!(state.seq, 2);
        assert_eq!(store.replay(run_id).unwrap().len(), 2);
    }

    #[test]
    fn test_idempotent_resume() {
        // Advancing a loaded snapshot and re-persisting equals advancing
        // the in-memory state directly.
        let dir = tempdir().unwrap();
        let store = RunStateStore::new(dir.path().to_path_buf()).unwrap();
        let flow = linear_flow("delivery");
        let run_id = Uuid::new_v4();
        store.create(run_id, &flow).unwrap();

        let mut in_memory = store.load(run_id).unwrap();
        in_memory.advance_to(StepRef::new("delivery", "b"), RunStatus::Running);

        let persisted = store
            .advance(run_id, StepRef::new("delivery", "b"), RunStatus::Running)
            .unwrap();
        let reloaded = store.load(run_id).unwrap();

        assert_eq!(persisted, reloaded);
        assert_eq!(reloaded.flow, in_memory.flow);
        assert_eq!(reloaded.step, in_memory.step);
        assert_eq!(reloaded.status, in_memory.status);
        assert_eq!(reloaded.interruption_stack, in_memory.interruption_stack);
        assert_eq!(reloaded.fingerprints, in_memory.fingerprints);
    }

    #[test]
    fn test_partial_trailing_line_is_skipped() {
        let dir = tempdir().unwrap();
        let store = RunStateStore::new(dir.path().to_path_buf()).unwrap();
        let flow = linear_flow("delivery");
        let run_id = Uuid::new_v4();
        store.create(run_id, &flow).unwrap();

        // Simulate a crash mid-write
        let path = dir.path().join(format!("{run_id}.jsonl"));
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"run_id\": \"trunc").unwrap();
        drop(file);

        let fresh = RunStateStore::new(dir.path().to_path_buf()).unwrap();
        let state = fresh.load(run_id).unwrap();
        assert_eq!(state.seq, 1);
    }

    #[test]
    fn test_stop_request_round_trips() {
        let store = RunStateStore::in_memory();
        let flow = linear_flow("delivery");
        let run_id = Uuid::new_v4();
        store.create(run_id, &flow).unwrap();

        store.request_stop(run_id).unwrap();
        assert!(store.load(run_id).unwrap().stop_requested);
    }

    #[test]
    fn test_pause_request_and_clear() {
        let store = RunStateStore::in_memory();
        let flow = linear_flow("delivery");
        let run_id = Uuid::new_v4();
        store.create(run_id, &flow).unwrap();

        store.request_pause(run_id).unwrap();
        assert!(store.load(run_id).unwrap().pause_requested);
        store.clear_pause(run_id).unwrap();
        assert!(!store.load(run_id).unwrap().pause_requested);
    }

    #[test]
    fn test_push_pop_frame_through_store() {
        let store = RunStateStore::in_memory();
        let flow = linear_flow("delivery");
        let run_id = Uuid::new_v4();
        store.create(run_id, &flow).unwrap();

        let frame = StackFrame {
            interrupted: StepRef::new("delivery", "a"),
            reason: "env_broken".to_string(),
            target: super::super::InjectionTarget::Detour {
                nodes: vec!["b".to_string()],
            },
            pending: vec!["b".to_string()],
            pushed_at: chrono::Utc::now(),
        };
        let state = store
            .push_frame(run_id, frame, StepRef::new("delivery", "b"))
            .unwrap();
        assert_eq!(state.injection_depth(), 1);

        let state = store.pop_frame(run_id).unwrap();
        assert!(state.stacks_balanced());
        assert_eq!(state.seq, 3);
    }
}
