//! Director-side client against a live agent server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use stratus_agent::*;
use stratus_state::VmRecord;

async fn spawn_agent(handler: Arc<ApplyHandler>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, build_router(handler)).await.unwrap();
    });
    address
}

fn vm(address: &str) -> VmRecord {
    VmRecord {
        cid: "vm-1".to_string(),
        deployment: "cf".to_string(),
        agent_id: "agent-1".to_string(),
        agent_address: address.to_string(),
        instance_id: Some("i-1".to_string()),
        created_at: 1000,
    }
}

#[tokio::test]
async fn client_reads_applied_state() {
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(ApplyHandler::new(dir.path().join("state.json")));
    handler
        .apply(ApplySpec {
            deployment: "cf".to_string(),
            job: "router".to_string(),
            index: 1,
            resource_pool: None,
            networks: BTreeMap::from([("private".to_string(), "10.0.0.11".parse().unwrap())]),
            packages: BTreeMap::new(),
            properties: Default::default(),
        })
        .unwrap();

    let address = spawn_agent(handler).await;
    let client = HttpAgentClient::new(Duration::from_secs(2));
    let state = client.get_state(&vm(&address)).await.unwrap();

    assert_eq!(state.job, "router");
    assert_eq!(state.index, 1);
    assert_eq!(state.networks["private"].to_string(), "10.0.0.11");
}

#[tokio::test]
async fn client_reports_unapplied_agent_as_invalid_response() {
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(ApplyHandler::new(dir.path().join("state.json")));
    let address = spawn_agent(handler).await;

    let client = HttpAgentClient::new(Duration::from_secs(2));
    let result = client.get_state(&vm(&address)).await;
    assert!(matches!(result, Err(AgentError::InvalidResponse { .. })));
}
