//! stratus-agent — the VM agent and the director's view of it.
//!
//! # Components
//!
//! - **`apply`** — agent-side apply handler; adopts a deployment on first
//!   apply, rejects applies for another deployment, persists atomically
//! - **`server`** — axum routes exposing `/state` and `/apply`
//! - **`client`** — director-side [`AgentClient`] used by the state
//!   collector to query applied state with a timeout

pub mod apply;
pub mod client;
pub mod error;
pub mod server;
pub mod state;

pub use apply::ApplyHandler;
pub use client::{AgentClient, AgentStateFuture, HttpAgentClient};
pub use error::{AgentError, AgentResult};
pub use server::build_router;
pub use state::{AgentState, ApplySpec};
