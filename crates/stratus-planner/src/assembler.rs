//! The assembler: a fixed, ordered pipeline of reconciliation steps.
//!
//! Each phase is a named stage in the event log and each step a task in
//! it. Per-group phases report one task per instance group. The first
//! failing task stops the pipeline; nothing after it runs.

use std::sync::Arc;

use tracing::info;

use stratus_agent::AgentClient;
use stratus_core::DirectorConfig;

use crate::collector::StateCollector;
use crate::context::PlanContext;
use crate::dns::DnsManager;
use crate::error::{AssembleError, PlanError};
use crate::stage::{EventLog, TracingEventLog, track};
use crate::steps::*;

enum Tasks {
    Steps(Vec<Box<dyn ReconciliationStep>>),
    PerGroup(Box<dyn GroupStep>),
}

struct Phase {
    stage: &'static str,
    tasks: Tasks,
}

impl Phase {
    fn single(stage: &'static str, step: impl ReconciliationStep + 'static) -> Self {
        Self {
            stage,
            tasks: Tasks::Steps(vec![Box::new(step)]),
        }
    }

    fn per_group(stage: &'static str, step: impl GroupStep + 'static) -> Self {
        Self {
            stage,
            tasks: Tasks::PerGroup(Box::new(step)),
        }
    }
}

pub struct Assembler {
    phases: Vec<Phase>,
    events: Arc<dyn EventLog>,
}

impl Assembler {
    pub fn new(
        agents: Arc<dyn AgentClient>,
        dns: Arc<dyn DnsManager>,
        config: &DirectorConfig,
    ) -> Self {
        let collector = StateCollector::new(agents, config.max_threads);
        let phases = vec![
            Phase::single("Binding releases", BindReleases),
            Phase {
                stage: "Binding existing deployment",
                tasks: Tasks::Steps(vec![
                    Box::new(LoadExistingState),
                    Box::new(MigrateLegacyDns::new(Arc::clone(&dns))),
                    Box::new(BindRenames),
                    Box::new(CollectAgentState::new(collector)),
                    Box::new(PlanInstances),
                    Box::new(ReserveIps),
                    Box::new(MarkObsolete),
                    Box::new(MarkUnknownVmsForDeletion),
                ]),
            },
            Phase::single("Binding stemcells", BindStemcells),
            Phase::single("Binding templates", BindTemplates),
            Phase::single("Binding properties", BindProperties),
            Phase::single("Binding unallocated VMs", BindUnallocatedVms),
            Phase::single("Binding instance networks", BindInstanceNetworks),
            Phase::single("Binding DNS", BindDns::new(dns)),
            Phase::per_group("Binding links", BindLinks),
        ];
        Self {
            phases,
            events: Arc::new(TracingEventLog),
        }
    }

    pub fn with_event_log(mut self, events: Arc<dyn EventLog>) -> Self {
        self.events = events;
        self
    }

    /// Stage names in execution order.
    pub fn stages(&self) -> Vec<&'static str> {
        self.phases.iter().map(|p| p.stage).collect()
    }

    /// Run every phase against `ctx`.
    pub async fn bind_models(&self, ctx: &mut PlanContext) -> Result<(), AssembleError> {
        info!(deployment = %ctx.plan.name, "binding deployment");
        for phase in &self.phases {
            let failed = |task: &str, source: PlanError| AssembleError {
                stage: phase.stage.to_string(),
                task: task.to_string(),
                source,
            };
            match &phase.tasks {
                Tasks::Steps(steps) => {
                    self.events.stage_started(phase.stage, steps.len());
                    for step in steps {
                        track(self.events.as_ref(), phase.stage, step.name(), step.run(ctx))
                            .await
                            .map_err(|source| failed(step.name(), source))?;
                    }
                }
                Tasks::PerGroup(step) => {
                    let groups: Vec<String> =
                        ctx.plan.groups.iter().map(|g| g.name().to_string()).collect();
                    self.events.stage_started(phase.stage, groups.len());
                    for group in &groups {
                        track(self.events.as_ref(), phase.stage, group, step.run(ctx, group))
                            .await
                            .map_err(|source| failed(group, source))?;
                    }
                }
            }
        }
        info!(deployment = %ctx.plan.name, "deployment bound");
        Ok(())
    }
}
