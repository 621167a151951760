//! Typed hand-off between the resolve/run phase and the report phase.
//!
//! A single invocation passes the [`RunContext`] in memory. When the phases
//! are split across processes (`--preprocess` then `--postprocess`) the
//! context is persisted as `__hpo_run_context.json` in the run directory:
//!
//! ```json
//! {
//!   "schema_version": "hpo_run_context_v1",
//!   "event_range_id": "4321-0-27181399-17-1",
//!   "sample_id": "17",
//!   "task_id": 4321,
//!   "panda_id": 27181399,
//!   "created_at": "2024-05-01T10:00:00+00:00"
//! }
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::JobIdentity;
use crate::error::WorkerError;
use crate::event::EventRangeId;
use crate::fsutil::{atomic_write_json_pretty, remove_file_if_exists};

pub const CONTEXT_FILE_NAME: &str = "__hpo_run_context.json";
pub const CONTEXT_SCHEMA_VERSION: &str = "hpo_run_context_v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub schema_version: String,
    pub event_range_id: String,
    pub sample_id: String,
    pub task_id: i64,
    pub panda_id: i64,
    pub created_at: String,
}

impl RunContext {
    pub fn new(event: &EventRangeId, job: JobIdentity) -> Self {
        Self {
            schema_version: CONTEXT_SCHEMA_VERSION.to_string(),
            event_range_id: event.as_str().to_string(),
            sample_id: event.sample_id().to_string(),
            task_id: job.task_id,
            panda_id: job.panda_id,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Location of the persisted context and of the input sample file.
#[derive(Debug, Clone)]
pub struct ContextStore {
    context_path: PathBuf,
    sample_path: PathBuf,
}

impl ContextStore {
    pub fn new(run_dir: &Path, in_sample_file: &str) -> Self {
        Self {
            context_path: run_dir.join(CONTEXT_FILE_NAME),
            sample_path: run_dir.join(in_sample_file),
        }
    }

    pub fn context_path(&self) -> &Path {
        &self.context_path
    }

    pub fn sample_path(&self) -> &Path {
        &self.sample_path
    }

    /// Writes the sample parameters first so a context on disk always has
    /// its input next to it.
    pub fn save(&self, context: &RunContext, parameters: &Value) -> Result<(), WorkerError> {
        atomic_write_json_pretty(&self.sample_path, parameters).map_err(|source| {
            WorkerError::Persist {
                path: self.sample_path.clone(),
                source,
            }
        })?;
        atomic_write_json_pretty(&self.context_path, context).map_err(|source| {
            WorkerError::Persist {
                path: self.context_path.clone(),
                source,
            }
        })?;
        debug!(path = %self.context_path.display(), "run context saved");
        Ok(())
    }

    /// `Ok(None)` means no sample was resolved for this run.
    pub fn load(&self) -> Result<Option<RunContext>, WorkerError> {
        let bytes = match fs::read(&self.context_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(WorkerError::Persist {
                    path: self.context_path.clone(),
                    source,
                })
            }
        };
        let context: RunContext =
            serde_json::from_slice(&bytes).map_err(|e| WorkerError::Persist {
                path: self.context_path.clone(),
                source: e.into(),
            })?;
        if context.schema_version != CONTEXT_SCHEMA_VERSION {
            warn!(
                found = %context.schema_version,
                expected = CONTEXT_SCHEMA_VERSION,
                "run context schema version mismatch"
            );
        }
        Ok(Some(context))
    }

    pub fn clear(&self) -> Result<(), WorkerError> {
        for path in [&self.context_path, &self.sample_path] {
            remove_file_if_exists(path).map_err(|source| WorkerError::Persist {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::scratch_dir;
    use serde_json::json;

    fn job() -> JobIdentity {
        JobIdentity {
            panda_id: 27181399,
            task_id: 4321,
        }
    }

    #[test]
    fn load_without_context_means_no_work() {
        let root = scratch_dir("ctx_missing");
        let store = ContextStore::new(&root, "input_sample.json");
        assert!(store.load().expect("load").is_none());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn saved_context_reloads_with_parameters_beside_it() {
        let root = scratch_dir("ctx_save");
        let store = ContextStore::new(&root, "input_sample.json");
        let event = EventRangeId::parse("4321-0-27181399-17-1").expect("event");
        let context = RunContext::new(&event, job());
        let params = json!({"lr": 0.01, "layers": 3});

        store.save(&context, &params).expect("save");

        let loaded = store.load().expect("load").expect("context present");
        assert_eq!(loaded, context);
        assert_eq!(loaded.sample_id, "17");
        assert_eq!(loaded.schema_version, CONTEXT_SCHEMA_VERSION);
        let on_disk: Value =
            serde_json::from_slice(&fs::read(store.sample_path()).expect("read")).expect("json");
        assert_eq!(on_disk, params);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn clear_removes_both_files() {
        let root = scratch_dir("ctx_clear");
        let store = ContextStore::new(&root, "input_sample.json");
        let event = EventRangeId::parse("a-b-c-9").expect("event");
        store
            .save(&RunContext::new(&event, job()), &json!({}))
            .expect("save");
        store.clear().expect("clear");
        assert!(!store.context_path().exists());
        assert!(!store.sample_path().exists());
        store.clear().expect("clearing twice is fine");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn corrupt_context_is_a_persistence_error() {
        let root = scratch_dir("ctx_corrupt");
        let store = ContextStore::new(&root, "input_sample.json");
        fs::write(store.context_path(), "17,4321").expect("write legacy marker");
        let err = store.load().expect_err("not json");
        assert_eq!(err.exit_code(), crate::error::EC_EVENT);
        let _ = fs::remove_dir_all(root);
    }
}
