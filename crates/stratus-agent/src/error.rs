//! Agent errors, shared by the director-side client and the agent itself.

use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent {agent_id} unreachable: {reason}")]
    Unreachable { agent_id: String, reason: String },

    #[error("agent {agent_id} timed out after {timeout_ms}ms")]
    Timeout { agent_id: String, timeout_ms: u64 },

    #[error("agent {agent_id} sent an invalid response: {reason}")]
    InvalidResponse { agent_id: String, reason: String },

    #[error("deployment mismatch: agent belongs to '{recorded}', apply names '{requested}'")]
    DeploymentMismatch { recorded: String, requested: String },

    #[error("no state has been applied yet")]
    NotApplied,

    #[error("state file I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}
