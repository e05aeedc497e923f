//! Concurrent state collector.
//!
//! Queries the agent of every instance that has a VM, at most
//! `max_threads` at a time. Workers never touch the result map: each one
//! sends `(instance_id, result)` over a channel and a single loop drains
//! the channel into the map. The first failure aborts the remaining
//! workers and no partial map is returned.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use stratus_agent::{AgentClient, AgentResult, AgentState};
use stratus_state::{ExistingInstance, InstanceId};

use crate::error::{PlanError, PlanResult};

pub struct StateCollector {
    client: Arc<dyn AgentClient>,
    max_threads: usize,
}

impl StateCollector {
    pub fn new(client: Arc<dyn AgentClient>, max_threads: usize) -> Self {
        Self {
            client,
            max_threads: max_threads.max(1),
        }
    }

    /// Fetch the applied state of every allocated instance, keyed by
    /// instance id. Unallocated instances are skipped.
    pub async fn collect(
        &self,
        instances: &[ExistingInstance],
    ) -> PlanResult<HashMap<InstanceId, AgentState>> {
        let targets: Vec<_> = instances
            .iter()
            .filter_map(|i| i.vm.clone().map(|vm| (i.id().to_string(), vm)))
            .collect();
        let expected = targets.len();
        debug!(
            instances = instances.len(),
            allocated = expected,
            max_threads = self.max_threads,
            "collecting agent state"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_threads));
        let (tx, mut rx) = mpsc::channel::<(InstanceId, AgentResult<AgentState>)>(expected.max(1));
        let mut workers = JoinSet::new();

        for (instance_id, vm) in targets {
            let client = Arc::clone(&self.client);
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            workers.spawn(async move {
                // Hold the permit for the duration of the remote call.
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let result = client.get_state(&vm).await;
                let _ = tx.send((instance_id, result)).await;
            });
        }
        drop(tx);

        let mut states = HashMap::with_capacity(expected);
        while let Some((instance_id, result)) = rx.recv().await {
            match result {
                Ok(state) => {
                    debug!(instance = %instance_id, job = %state.job, index = state.index, "agent state received");
                    states.insert(instance_id, state);
                }
                Err(e) => {
                    warn!(instance = %instance_id, error = %e, "agent state query failed, aborting collection");
                    workers.abort_all();
                    return Err(PlanError::Agent(e));
                }
            }
        }

        // Every sender is gone; surface panics from workers that never reported.
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    return Err(PlanError::Worker(e.to_string()));
                }
            }
        }
        if states.len() != expected {
            return Err(PlanError::Worker(format!(
                "expected {expected} agent states, received {}",
                states.len()
            )));
        }

        Ok(states)
    }
}
