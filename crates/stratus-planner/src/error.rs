//! Reconciliation errors.

use thiserror::Error;

use stratus_agent::AgentError;
use stratus_core::ManifestError;
use stratus_state::StateError;

#[derive(Debug, Error)]
pub enum PlanError {
    /// A validation failure detected while binding (missing catalog
    /// record, exhausted network, conflicting reservation, ...).
    #[error("{0}")]
    Director(String),

    #[error("unresolved link '{link}' consumed by job '{consumer}': {reason}")]
    UnresolvedLink {
        consumer: String,
        link: String,
        reason: String,
    },

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("storage error: {0}")]
    Storage(#[from] StateError),

    #[error("timed out waiting for lock '{0}'")]
    LockTimeout(String),

    #[error("invalid manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("state collection worker failed: {0}")]
    Worker(String),
}

impl PlanError {
    pub fn director(msg: impl Into<String>) -> Self {
        Self::Director(msg.into())
    }
}

pub type PlanResult<T> = Result<T, PlanError>;

/// A pipeline failure, attributed to the stage and task it happened in.
#[derive(Debug, Error)]
#[error("stage '{stage}' failed in '{task}': {source}")]
pub struct AssembleError {
    pub stage: String,
    pub task: String,
    #[source]
    pub source: PlanError,
}
