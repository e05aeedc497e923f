//! End-to-end runs of the assembler against an in-memory store.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use stratus_agent::{
    AgentClient, AgentError, AgentState, AgentStateFuture, ApplyHandler, ApplySpec,
    HttpAgentClient, build_router,
};
use stratus_core::{DirectorConfig, Manifest};
use stratus_planner::*;
use stratus_state::*;

const MANIFEST: &str = r#"
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

[[networks]]
name = "private"
type = "manual"
subnet = { range_start = "10.0.0.10", range_end = "10.0.0.50", static_ips = ["10.0.0.40", "10.0.0.41"] }

[[instance_groups]]
name = "nats"
instances = 2
azs = ["z1"]
stemcell = "default"
networks = [{ name = "private", static_ips = ["10.0.0.40", "10.0.0.41"] }]
jobs = [{ name = "nats", release = "cf" }]

[[instance_groups]]
name = "router"
instances = 2
azs = ["z1"]
stemcell = "default"
networks = [{ name = "private" }]

[[instance_groups.jobs]]
name = "gorouter"
release = "cf"
consumes = [{ name = "nats", from = "nats", properties = ["nats.port"] }]

[properties.nats]
port = 4222
"#;

fn config() -> DirectorConfig {
    DirectorConfig {
        max_threads: 4,
        lock_timeout_secs: 1,
        lock_retry_ms: 10,
        ..DirectorConfig::default()
    }
}

fn seeded_store() -> StateStore {
    let store = StateStore::open_in_memory().unwrap();
    store
        .put_release(&ReleaseRecord {
            name: "cf".to_string(),
            version: "245".to_string(),
            jobs: vec![
                JobTemplateRecord {
                    name: "nats".to_string(),
                    properties: BTreeMap::from([(
                        "nats.port".to_string(),
                        PropertyDefinition::default(),
                    )]),
                    provides: vec!["nats".to_string()],
                },
                JobTemplateRecord {
                    name: "gorouter".to_string(),
                    properties: BTreeMap::new(),
                    provides: vec![],
                },
            ],
        })
        .unwrap();
    store
        .put_stemcell(&StemcellRecord {
            name: "ubuntu-trusty".to_string(),
            version: "3312".to_string(),
            cid: "ami-3312".to_string(),
        })
        .unwrap();
    store
}

fn seed_instance(store: &StateStore, id: &str, job: &str, index: u32, agent_address: &str) {
    let cid = format!("vm-{id}");
    store
        .put_instance(&InstanceRecord {
            id: id.to_string(),
            deployment: "cf".to_string(),
            job: job.to_string(),
            index,
            az: Some("z1".to_string()),
            vm_cid: Some(cid.clone()),
            state: InstanceLifecycle::Started,
        })
        .unwrap();
    store
        .put_vm(&VmRecord {
            cid,
            deployment: "cf".to_string(),
            agent_id: format!("agent-{id}"),
            agent_address: agent_address.to_string(),
            instance_id: Some(id.to_string()),
            created_at: 1000,
        })
        .unwrap();
}

fn context(manifest: &str, store: StateStore) -> PlanContext {
    let manifest: Manifest = toml::from_str(manifest).unwrap();
    let plan = DeploymentPlan::new(manifest, None).unwrap();
    PlanContext::new(plan, store, config(), "deploy-test")
}

fn assembler(store: &StateStore, agents: Arc<dyn AgentClient>, events: Arc<RecordingEventLog>) -> Assembler {
    let dns = Arc::new(StoreDnsManager::new(store.clone(), "stratus"));
    Assembler::new(agents, dns, &config()).with_event_log(events)
}

/// Agents answering from a table keyed by agent address.
#[derive(Default)]
struct FixedAgents {
    states: HashMap<String, AgentState>,
}

impl FixedAgents {
    fn with(mut self, address: &str, job: &str, index: u32, ip: &str) -> Self {
        self.states.insert(
            address.to_string(),
            AgentState {
                job: job.to_string(),
                index,
                networks: BTreeMap::from([("private".to_string(), ip.parse().unwrap())]),
            },
        );
        self
    }
}

impl AgentClient for FixedAgents {
    fn get_state<'a>(&'a self, vm: &'a VmRecord) -> AgentStateFuture<'a> {
        Box::pin(async move {
            self.states
                .get(&vm.agent_address)
                .cloned()
                .ok_or_else(|| AgentError::Unreachable {
                    agent_id: vm.agent_id.clone(),
                    reason: "connection refused".to_string(),
                })
        })
    }
}

/// Start a real agent that has already applied `job/index` at `ip`.
async fn spawn_agent(dir: &std::path::Path, job: &str, index: u32, ip: &str) -> String {
    let handler = Arc::new(ApplyHandler::new(dir.join(format!("{job}-{index}.json"))));
    handler
        .apply(ApplySpec {
            deployment: "cf".to_string(),
            job: job.to_string(),
            index,
            resource_pool: None,
            networks: BTreeMap::from([("private".to_string(), ip.parse().unwrap())]),
            packages: BTreeMap::new(),
            properties: Default::default(),
        })
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, build_router(handler)).await.unwrap();
    });
    address
}

fn transitions(summary: &PlanSummary, group: &str) -> Vec<Transition> {
    summary
        .groups
        .iter()
        .find(|g| g.name == group)
        .map(|g| g.instances.iter().map(|i| i.transition).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn fresh_deploy_creates_everything_and_resolves_links() {
    let store = seeded_store();
    let events = RecordingEventLog::new();
    let assembler = assembler(&store, Arc::new(FixedAgents::default()), events.clone());
    let mut ctx = context(MANIFEST, store.clone());

    assembler.bind_models(&mut ctx).await.unwrap();

    let summary = ctx.summary();
    assert_eq!(transitions(&summary, "nats"), vec![Transition::Create; 2]);
    assert_eq!(transitions(&summary, "router"), vec![Transition::Create; 2]);
    assert!(summary.obsolete.is_empty());

    let router = ctx.plan.group("router").unwrap();
    let link = &router.templates[0].links["nats"];
    let addresses: Vec<Option<Ipv4Addr>> = link.instances.iter().map(|i| i.address).collect();
    assert_eq!(
        addresses,
        vec![Some("10.0.0.40".parse().unwrap()), Some("10.0.0.41".parse().unwrap())]
    );
    assert_eq!(link.properties["nats.port"], 4222);

    let stages: Vec<String> = events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            StageEvent::StageStarted { stage, .. } => Some(stage),
            _ => None,
        })
        .collect();
    assert_eq!(stages, assembler.stages());
    assert!(store.get_dns_record("1.router.private.cf.stratus").unwrap().is_some());
}

#[tokio::test]
async fn redeploy_against_live_agents() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store();
    let nats = spawn_agent(dir.path(), "nats", 0, "10.0.0.40").await;
    let router = spawn_agent(dir.path(), "router", 0, "10.0.0.20").await;
    let uaa = spawn_agent(dir.path(), "uaa", 0, "10.0.0.30").await;
    seed_instance(&store, "i-nats-0", "nats", 0, &nats);
    seed_instance(&store, "i-router-0", "router", 0, &router);
    seed_instance(&store, "i-uaa-0", "uaa", 0, &uaa);
    store
        .put_vm(&VmRecord {
            cid: "vm-orphan".to_string(),
            deployment: "cf".to_string(),
            agent_id: "agent-orphan".to_string(),
            agent_address: "127.0.0.1:1".to_string(),
            instance_id: None,
            created_at: 1000,
        })
        .unwrap();

    let client = Arc::new(HttpAgentClient::new(Duration::from_secs(2)));
    let assembler = assembler(&store, client, RecordingEventLog::new());
    let mut ctx = context(MANIFEST, store.clone());
    assembler.bind_models(&mut ctx).await.unwrap();

    let summary = ctx.summary();
    assert_eq!(
        transitions(&summary, "nats"),
        vec![Transition::KeepAndUpdate, Transition::Create]
    );
    assert_eq!(
        transitions(&summary, "router"),
        vec![Transition::KeepAndUpdate, Transition::Create]
    );

    let router_group = ctx.plan.group("router").unwrap();
    assert_eq!(
        router_group.instance_plans[0].network_settings["private"],
        Some("10.0.0.20".parse().unwrap())
    );
    // The address still held by the obsolete instance is not handed out.
    assert_ne!(
        router_group.instance_plans[1].network_settings["private"],
        Some("10.0.0.30".parse().unwrap())
    );

    assert_eq!(summary.obsolete.len(), 1);
    assert_eq!(summary.obsolete[0].instance_id.as_deref(), Some("i-uaa-0"));
    assert_eq!(summary.vms_to_delete, vec!["vm-orphan".to_string()]);
    // Queuing the orphan leaves the obsolete instance's address reserved.
    assert_eq!(
        ctx.reservations.owner("private", "10.0.0.30".parse().unwrap()),
        Some("i-uaa-0")
    );
}

#[tokio::test]
async fn unreachable_agent_stops_the_pipeline_before_planning() {
    let store = seeded_store();
    seed_instance(&store, "i-router-0", "router", 0, "10.0.0.20:6868");
    seed_instance(&store, "i-router-1", "router", 1, "10.0.0.21:6868");
    let agents = FixedAgents::default().with("10.0.0.20:6868", "router", 0, "10.0.0.20");

    let events = RecordingEventLog::new();
    let assembler = assembler(&store, Arc::new(agents), events.clone());
    let mut ctx = context(MANIFEST, store);

    let err = assembler.bind_models(&mut ctx).await.unwrap_err();
    assert_eq!(err.stage, "Binding existing deployment");
    assert_eq!(err.task, "collect_agent_state");
    assert!(matches!(err.source, PlanError::Agent(AgentError::Unreachable { .. })));

    assert!(ctx.agent_states.is_empty());
    assert!(ctx.plan.groups.iter().all(|g| g.instance_plans.is_empty()));
    let planning_started = events.events().iter().any(|e| {
        matches!(e, StageEvent::TaskStarted { task, .. } if task == "plan_instances")
    });
    assert!(!planning_started);
}

#[tokio::test]
async fn scale_to_zero_obsoletes_every_instance() {
    let store = seeded_store();
    seed_instance(&store, "i-router-0", "router", 0, "10.0.0.20:6868");
    seed_instance(&store, "i-router-1", "router", 1, "10.0.0.21:6868");
    let agents = FixedAgents::default()
        .with("10.0.0.20:6868", "router", 0, "10.0.0.20")
        .with("10.0.0.21:6868", "router", 1, "10.0.0.21");

    let manifest = MANIFEST.replace(
        "name = \"router\"\ninstances = 2",
        "name = \"router\"\ninstances = 0",
    );
    let assembler = assembler(&store, Arc::new(agents), RecordingEventLog::new());
    let mut ctx = context(&manifest, store);
    assembler.bind_models(&mut ctx).await.unwrap();

    let summary = ctx.summary();
    assert!(transitions(&summary, "router").is_empty());
    assert_eq!(summary.obsolete.len(), 2);
    assert!(summary.obsolete.iter().all(|i| i.transition == Transition::Obsolete));
}

#[tokio::test]
async fn rebinding_the_same_state_gives_the_same_plan() {
    let store = seeded_store();
    seed_instance(&store, "i-router-0", "router", 0, "10.0.0.20:6868");
    let agents: Arc<dyn AgentClient> =
        Arc::new(FixedAgents::default().with("10.0.0.20:6868", "router", 0, "10.0.0.20"));

    let mut first = context(MANIFEST, store.clone());
    assembler(&store, Arc::clone(&agents), RecordingEventLog::new())
        .bind_models(&mut first)
        .await
        .unwrap();
    let mut second = context(MANIFEST, store.clone());
    assembler(&store, agents, RecordingEventLog::new())
        .bind_models(&mut second)
        .await
        .unwrap();

    assert_eq!(
        serde_json::to_value(first.summary()).unwrap(),
        serde_json::to_value(second.summary()).unwrap()
    );
    assert!(store.get_lock("lock:release:cf").unwrap().is_none());
}

#[tokio::test]
async fn links_are_tracked_per_group() {
    let store = seeded_store();
    let events = RecordingEventLog::new();
    let assembler = assembler(&store, Arc::new(FixedAgents::default()), events.clone());
    let mut ctx = context(MANIFEST, store);

    assembler.bind_models(&mut ctx).await.unwrap();

    let recorded = events.events();
    let tasks: Vec<String> = recorded
        .iter()
        .filter_map(|e| match e {
            StageEvent::TaskStarted { stage, task } if stage == "Binding links" => {
                Some(task.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(tasks, vec!["nats".to_string(), "router".to_string()]);
    assert!(recorded.contains(&StageEvent::StageStarted {
        stage: "Binding links".to_string(),
        total_tasks: 2,
    }));
}

#[tokio::test]
async fn unresolved_link_is_reported_against_its_group() {
    let store = seeded_store();
    let events = RecordingEventLog::new();
    let assembler = assembler(&store, Arc::new(FixedAgents::default()), events.clone());
    let manifest = MANIFEST.replace("properties = [\"nats.port\"]", "properties = [\"nats.missing\"]");
    let mut ctx = context(&manifest, store);

    let err = assembler.bind_models(&mut ctx).await.unwrap_err();
    assert_eq!(err.stage, "Binding links");
    assert_eq!(err.task, "router");
    assert!(matches!(err.source, PlanError::UnresolvedLink { ref link, .. } if link == "nats"));

    let failed: Vec<String> = events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            StageEvent::TaskFailed { task, .. } => Some(task),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec!["router".to_string()]);
}

#[tokio::test]
async fn deploy_leaves_records_of_a_prefixed_deployment_alone() {
    let store = seeded_store();
    store
        .put_instance(&InstanceRecord {
            id: "i-prod".to_string(),
            deployment: "cf:prod".to_string(),
            job: "router".to_string(),
            index: 0,
            az: Some("z1".to_string()),
            vm_cid: None,
            state: InstanceLifecycle::Started,
        })
        .unwrap();
    store
        .put_vm(&VmRecord {
            cid: "vm-prod-2".to_string(),
            deployment: "cf:prod".to_string(),
            agent_id: "agent-prod-2".to_string(),
            agent_address: "127.0.0.1:1".to_string(),
            instance_id: None,
            created_at: 1000,
        })
        .unwrap();

    let assembler = assembler(&store, Arc::new(FixedAgents::default()), RecordingEventLog::new());
    let mut ctx = context(MANIFEST, store.clone());
    assembler.bind_models(&mut ctx).await.unwrap();

    let summary = ctx.summary();
    assert!(ctx.existing.is_empty());
    assert!(summary.obsolete.is_empty());
    assert!(summary.vms_to_delete.is_empty());
    assert_eq!(transitions(&summary, "router"), vec![Transition::Create; 2]);
    assert_eq!(store.load_instances("cf:prod").unwrap().len(), 1);
}
