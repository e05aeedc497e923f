//! Agent-side apply handler.
//!
//! Keeps the last applied spec in a single JSON file. The first apply
//! adopts the applied deployment name; every later apply must name the
//! same deployment. Writes go to a temporary file in the same directory
//! which is flushed, synced and renamed over the old file, so a reader
//! sees either the previous state or the new one.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::state::{AgentState, ApplySpec};

pub struct ApplyHandler {
    state_path: PathBuf,
    /// Serializes read-check-write across concurrent applies.
    guard: Mutex<()>,
}

impl ApplyHandler {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// The last applied spec, if any.
    pub fn current(&self) -> AgentResult<Option<ApplySpec>> {
        read_spec(&self.state_path)
    }

    /// Applied state in the shape the director queries.
    pub fn state(&self) -> AgentResult<AgentState> {
        self.current()?
            .as_ref()
            .map(AgentState::from)
            .ok_or(AgentError::NotApplied)
    }

    /// Apply `spec`, rejecting a deployment name that differs from the
    /// recorded one. On rejection the state file is untouched.
    pub fn apply(&self, spec: ApplySpec) -> AgentResult<ApplySpec> {
        let _held = self
            .guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(current) = read_spec(&self.state_path)? {
            if current.deployment != spec.deployment {
                warn!(
                    recorded = %current.deployment,
                    requested = %spec.deployment,
                    "rejecting apply for a different deployment"
                );
                return Err(AgentError::DeploymentMismatch {
                    recorded: current.deployment,
                    requested: spec.deployment,
                });
            }
        } else {
            info!(deployment = %spec.deployment, "adopting deployment on first apply");
        }

        write_atomically(&self.state_path, &spec)?;
        debug!(job = %spec.job, index = spec.index, "apply spec persisted");
        Ok(spec)
    }
}

fn read_spec(path: &Path) -> AgentResult<Option<ApplySpec>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_atomically(path: &Path, spec: &ApplySpec) -> AgentResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, spec)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| AgentError::Io(e.error))?;
    Ok(())
}
