//! Director-side agent client.
//!
//! The reconciliation core only needs one query: "what have you applied?".
//! [`AgentClient`] is the seam; [`HttpAgentClient`] talks HTTP/1 to the
//! agent's `/state` endpoint with a per-call timeout. Failures are not
//! retried here.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use http_body_util::BodyExt;
use tracing::debug;

use stratus_state::VmRecord;

use crate::error::{AgentError, AgentResult};
use crate::state::AgentState;

/// Boxed future alias for agent state queries.
pub type AgentStateFuture<'a> = Pin<Box<dyn Future<Output = AgentResult<AgentState>> + Send + 'a>>;

/// Fetches the live applied state of one VM's agent.
pub trait AgentClient: Send + Sync {
    fn get_state<'a>(&'a self, vm: &'a VmRecord) -> AgentStateFuture<'a>;
}

/// HTTP/1 agent client.
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    timeout: Duration,
}

impl HttpAgentClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl AgentClient for HttpAgentClient {
    fn get_state<'a>(&'a self, vm: &'a VmRecord) -> AgentStateFuture<'a> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, query_state(vm)).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(agent = %vm.agent_id, "agent state query timed out");
                    Err(AgentError::Timeout {
                        agent_id: vm.agent_id.clone(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    })
                }
            }
        })
    }
}

async fn query_state(vm: &VmRecord) -> AgentResult<AgentState> {
    let address = vm.agent_address.as_str();
    let uri = format!("http://{address}/state");
    let unreachable = |reason: String| AgentError::Unreachable {
        agent_id: vm.agent_id.clone(),
        reason,
    };
    let invalid = |reason: String| AgentError::InvalidResponse {
        agent_id: vm.agent_id.clone(),
        reason,
    };

    let stream = tokio::net::TcpStream::connect(address)
        .await
        .map_err(|e| unreachable(e.to_string()))?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| unreachable(e.to_string()))?;

    // Drive the connection in the background; dropped with the query.
    let _conn = ConnectionTask(tokio::spawn(async move {
        let _ = conn.await;
    }));

    let req = http::Request::builder()
        .method("GET")
        .uri(&uri)
        .header("host", address)
        .header("user-agent", "stratus-director/0.1")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .map_err(|e| invalid(e.to_string()))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| unreachable(e.to_string()))?;

    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| unreachable(e.to_string()))?
        .to_bytes();

    if !status.is_success() {
        return Err(invalid(format!(
            "status {status}: {}",
            String::from_utf8_lossy(&body)
        )));
    }

    let state: AgentState = serde_json::from_slice(&body).map_err(|e| invalid(e.to_string()))?;
    debug!(agent = %vm.agent_id, job = %state.job, index = state.index, "agent state received");
    Ok(state)
}

/// Aborts the connection driver when the query finishes or is cancelled,
/// so a timed-out query does not leave the socket open.
struct ConnectionTask(tokio::task::JoinHandle<()>);

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}
