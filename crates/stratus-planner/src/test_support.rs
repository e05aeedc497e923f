//! Fixtures shared by the step tests.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use stratus_agent::{AgentClient, AgentError, AgentState, AgentStateFuture};
use stratus_core::{DirectorConfig, Manifest};
use stratus_state::{
    InstanceLifecycle, InstanceRecord, JobTemplateRecord, PropertyDefinition, ReleaseRecord,
    StateStore, StemcellRecord, VmRecord,
};

use crate::context::PlanContext;
use crate::plan::DeploymentPlan;

pub const SIMPLE_MANIFEST: &str = r#"
name = "cf"

[[releases]]
name = "cf"
version = "245"

[[stemcells]]
alias = "default"
name = "ubuntu-trusty"
version = "3312"

[[azs]]
name = "z1"

[[azs]]
name = "z2"

[[networks]]
name = "private"
type = "manual"

[networks.subnet]
range_start = "10.0.0.10"
range_end = "10.0.0.50"
gateway = "10.0.0.1"
reserved = ["10.0.0.11"]
static_ips = ["10.0.0.40", "10.0.0.41"]

[[instance_groups]]
name = "nats"
instances = 2
azs = ["z1", "z2"]
stemcell = "default"

[[instance_groups.networks]]
name = "private"
static_ips = ["10.0.0.40", "10.0.0.41"]

[[instance_groups.jobs]]
name = "nats"
release = "cf"

[instance_groups.properties.nats]
user = "admin"

[[instance_groups]]
name = "router"
instances = 2
azs = ["z1"]
stemcell = "default"

[[instance_groups.networks]]
name = "private"

[[instance_groups.jobs]]
name = "gorouter"
release = "cf"

[[instance_groups.jobs.consumes]]
name = "nats"
from = "nats"
properties = ["nats.port"]

[properties.nats]
port = 4222
"#;

/// Legacy layout: stemcells come from resource pools.
pub const POOL_MANIFEST: &str = r#"
name = "cf"

[[releases]]
name = "cf"
version = "245"

[[resource_pools]]
name = "small"
size = 2
stemcell = { name = "ubuntu-trusty", version = "3312" }
cloud_properties = { instance_type = "m3.medium" }

[[azs]]
name = "z1"

[[networks]]
name = "private"
type = "manual"
subnet = { range_start = "10.0.0.10", range_end = "10.0.0.20", static_ips = ["10.0.0.19", "10.0.0.20"] }

[[networks]]
name = "public"
type = "dynamic"

[[instance_groups]]
name = "router"
instances = 2
azs = ["z1"]
resource_pool = "small"
networks = [{ name = "private", static_ips = ["10.0.0.19", "10.0.0.20"] }, { name = "public" }]
jobs = [{ name = "gorouter", release = "cf" }]
"#;

pub fn config() -> DirectorConfig {
    DirectorConfig {
        max_threads: 4,
        lock_timeout_secs: 0,
        lock_retry_ms: 5,
        ..DirectorConfig::default()
    }
}

pub fn context(manifest: &str) -> PlanContext {
    let manifest: Manifest = toml::from_str(manifest).unwrap();
    let plan = DeploymentPlan::new(manifest, None).unwrap();
    PlanContext::new(plan, StateStore::open_in_memory().unwrap(), config(), "deploy-1")
}

fn property(default: Option<serde_json::Value>) -> PropertyDefinition {
    PropertyDefinition {
        default,
        description: None,
    }
}

pub fn release() -> ReleaseRecord {
    ReleaseRecord {
        name: "cf".to_string(),
        version: "245".to_string(),
        jobs: vec![
            JobTemplateRecord {
                name: "nats".to_string(),
                properties: BTreeMap::from([
                    ("nats.port".to_string(), property(None)),
                    ("nats.user".to_string(), property(None)),
                    (
                        "nats.max_payload".to_string(),
                        property(Some(serde_json::json!(1048576))),
                    ),
                ]),
                provides: vec!["nats".to_string()],
            },
            JobTemplateRecord {
                name: "gorouter".to_string(),
                properties: BTreeMap::from([(
                    "router.port".to_string(),
                    property(Some(serde_json::json!(80))),
                )]),
                provides: vec![],
            },
        ],
    }
}

pub fn stemcell() -> StemcellRecord {
    StemcellRecord {
        name: "ubuntu-trusty".to_string(),
        version: "3312".to_string(),
        cid: "ami-3312".to_string(),
    }
}

/// Persist an instance, optionally with a VM, and return its record.
pub fn seed_instance(
    store: &StateStore,
    id: &str,
    job: &str,
    index: u32,
    az: Option<&str>,
    with_vm: bool,
) -> InstanceRecord {
    let vm_cid = with_vm.then(|| format!("vm-{id}"));
    let record = InstanceRecord {
        id: id.to_string(),
        deployment: "cf".to_string(),
        job: job.to_string(),
        index,
        az: az.map(str::to_string),
        vm_cid: vm_cid.clone(),
        state: InstanceLifecycle::Started,
    };
    store.put_instance(&record).unwrap();
    if let Some(cid) = vm_cid {
        store
            .put_vm(&VmRecord {
                cid,
                deployment: "cf".to_string(),
                agent_id: format!("agent-{id}"),
                agent_address: "127.0.0.1:1".to_string(),
                instance_id: Some(id.to_string()),
                created_at: 1000,
            })
            .unwrap();
    }
    record
}

/// Agents answering from a fixed table keyed by VM cid. Unknown VMs are unreachable.
#[derive(Default)]
pub struct StaticAgents {
    pub states: HashMap<String, AgentState>,
}

impl StaticAgents {
    pub fn with(mut self, cid: &str, job: &str, index: u32, ip: Option<&str>) -> Self {
        let networks = ip
            .map(|ip| {
                BTreeMap::from([("private".to_string(), ip.parse::<Ipv4Addr>().unwrap())])
            })
            .unwrap_or_default();
        self.states.insert(
            cid.to_string(),
            AgentState {
                job: job.to_string(),
                index,
                networks,
            },
        );
        self
    }
}

impl AgentClient for StaticAgents {
    fn get_state<'a>(&'a self, vm: &'a VmRecord) -> AgentStateFuture<'a> {
        Box::pin(async move {
            self.states
                .get(&vm.cid)
                .cloned()
                .ok_or_else(|| AgentError::Unreachable {
                    agent_id: vm.agent_id.clone(),
                    reason: "connection refused".to_string(),
                })
        })
    }
}
