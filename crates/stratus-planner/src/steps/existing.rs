//! Sub-steps binding the existing deployment to the desired plan.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use stratus_core::NetworkType;

use crate::collector::StateCollector;
use crate::context::{PlanContext, VmDeletion};
use crate::dns::DnsManager;
use crate::error::PlanError;
use crate::instance_plan::{assign_desired_instances, plan_job_instances, plan_obsolete_jobs};
use crate::migrator::JobMigrator;
use crate::steps::{ReconciliationStep, StepFuture};

/// Load persisted instances with their VMs and disks.
pub struct LoadExistingState;

impl ReconciliationStep for LoadExistingState {
    fn name(&self) -> &'static str {
        "load_existing_state"
    }

    fn run<'a>(&'a self, ctx: &'a mut PlanContext) -> StepFuture<'a> {
        Box::pin(async move {
            ctx.existing = ctx.store.load_instances(&ctx.plan.name)?;
            info!(deployment = %ctx.plan.name, instances = ctx.existing.len(), "existing state loaded");
            Ok(())
        })
    }
}

pub struct MigrateLegacyDns {
    dns: Arc<dyn DnsManager>,
}

impl MigrateLegacyDns {
    pub fn new(dns: Arc<dyn DnsManager>) -> Self {
        Self { dns }
    }
}

impl ReconciliationStep for MigrateLegacyDns {
    fn name(&self) -> &'static str {
        "migrate_legacy_dns"
    }

    fn run<'a>(&'a self, ctx: &'a mut PlanContext) -> StepFuture<'a> {
        Box::pin(async move {
            let mut migrated = 0;
            for instance in &ctx.existing {
                migrated += self.dns.migrate_legacy_records(instance)?;
            }
            if migrated > 0 {
                info!(records = migrated, domain = %self.dns.domain(), "legacy dns records migrated");
            }
            Ok(())
        })
    }
}

/// Check a requested rename against the manifest.
pub struct BindRenames;

impl ReconciliationStep for BindRenames {
    fn name(&self) -> &'static str {
        "bind_renames"
    }

    fn run<'a>(&'a self, ctx: &'a mut PlanContext) -> StepFuture<'a> {
        Box::pin(async move {
            let Some(rename) = &ctx.plan.rename else {
                return Ok(());
            };
            if ctx.plan.group(&rename.old_name).is_some() {
                return Err(PlanError::director(format!(
                    "cannot rename '{}' to '{}': '{}' is still in the manifest",
                    rename.old_name, rename.new_name, rename.old_name
                )));
            }
            if ctx.plan.group(&rename.new_name).is_none() {
                return Err(PlanError::director(format!(
                    "cannot rename '{}' to '{}': '{}' is not in the manifest",
                    rename.old_name, rename.new_name, rename.new_name
                )));
            }
            let affected = ctx
                .existing
                .iter()
                .filter(|e| e.job() == rename.old_name)
                .count();
            if affected == 0 {
                warn!(old = %rename.old_name, new = %rename.new_name, "rename matches no existing instances");
            } else {
                info!(old = %rename.old_name, new = %rename.new_name, instances = affected, "rename bound");
            }
            Ok(())
        })
    }
}

/// Ask every allocated instance's agent what it has applied.
pub struct CollectAgentState {
    collector: StateCollector,
}

impl CollectAgentState {
    pub fn new(collector: StateCollector) -> Self {
        Self { collector }
    }
}

impl ReconciliationStep for CollectAgentState {
    fn name(&self) -> &'static str {
        "collect_agent_state"
    }

    fn run<'a>(&'a self, ctx: &'a mut PlanContext) -> StepFuture<'a> {
        Box::pin(async move {
            ctx.agent_states = self.collector.collect(&ctx.existing).await?;
            for instance in &ctx.existing {
                let Some(state) = ctx.agent_states.get(instance.id()) else {
                    continue;
                };
                if state.job != instance.job() || state.index != instance.index() {
                    debug!(
                        instance = %instance.id(),
                        recorded = %format!("{}/{}", instance.job(), instance.index()),
                        reported = %format!("{}/{}", state.job, state.index),
                        "agent reports a different job or index"
                    );
                }
            }
            Ok(())
        })
    }
}

/// Build instance plans for every desired group.
pub struct PlanInstances;

impl ReconciliationStep for PlanInstances {
    fn name(&self) -> &'static str {
        "plan_instances"
    }

    fn run<'a>(&'a self, ctx: &'a mut PlanContext) -> StepFuture<'a> {
        Box::pin(async move {
            let migrator = JobMigrator::new(&ctx.existing, ctx.plan.rename.as_ref());
            let mut claimed = HashSet::new();
            for group in ctx.plan.groups.iter_mut() {
                let matched = migrator.find_existing_instances_with_azs(&group.spec, &mut claimed);
                let desired = assign_desired_instances(&group.spec, &matched);
                group.instance_plans = plan_job_instances(&desired, matched, &ctx.agent_states);
                debug!(
                    group = %group.name(),
                    desired = desired.len(),
                    plans = group.instance_plans.len(),
                    "instances planned"
                );
            }
            Ok(())
        })
    }
}

/// Reserve every address agents report on manual networks, so nothing in
/// use is handed out again.
pub struct ReserveIps;

impl ReconciliationStep for ReserveIps {
    fn name(&self) -> &'static str {
        "reserve_ips"
    }

    fn run<'a>(&'a self, ctx: &'a mut PlanContext) -> StepFuture<'a> {
        Box::pin(async move {
            for instance in &ctx.existing {
                let Some(state) = ctx.agent_states.get(instance.id()) else {
                    continue;
                };
                for (network_name, ip) in &state.networks {
                    let Some(network) = ctx.plan.manifest.network(network_name) else {
                        debug!(instance = %instance.id(), network = %network_name, "network no longer in manifest");
                        continue;
                    };
                    if network.kind != NetworkType::Manual {
                        continue;
                    }
                    let in_range = network.subnet.as_ref().is_some_and(|s| s.contains(*ip));
                    if !in_range {
                        warn!(instance = %instance.id(), network = %network_name, %ip, "reported address outside subnet, not reserved");
                        continue;
                    }
                    ctx.reservations.reserve(network_name, *ip, instance.id())?;
                }
            }
            Ok(())
        })
    }
}

/// Existing instances no group claimed.
pub struct MarkObsolete;

impl ReconciliationStep for MarkObsolete {
    fn name(&self) -> &'static str {
        "mark_obsolete"
    }

    fn run<'a>(&'a self, ctx: &'a mut PlanContext) -> StepFuture<'a> {
        Box::pin(async move {
            ctx.obsolete = plan_obsolete_jobs(&ctx.plan.groups, &ctx.existing);
            if !ctx.obsolete.is_empty() {
                info!(count = ctx.obsolete.len(), "obsolete instances marked");
            }
            Ok(())
        })
    }
}

/// Queue VMs no instance owns for deletion. They never held a reservation,
/// so no address is released.
pub struct MarkUnknownVmsForDeletion;

impl ReconciliationStep for MarkUnknownVmsForDeletion {
    fn name(&self) -> &'static str {
        "mark_unknown_vms_for_deletion"
    }

    fn run<'a>(&'a self, ctx: &'a mut PlanContext) -> StepFuture<'a> {
        Box::pin(async move {
            for vm in ctx.store.load_orphan_vms(&ctx.plan.name)? {
                if ctx.unneeded_vms.iter().any(|d| d.vm.cid == vm.cid) {
                    continue;
                }
                info!(vm = %vm.cid, "unknown vm queued for deletion");
                ctx.unneeded_vms.push(VmDeletion { vm });
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_state::VmRecord;

    use crate::instance_plan::Transition;
    use crate::plan::Rename;
    use crate::test_support::{SIMPLE_MANIFEST, StaticAgents, context, seed_instance};

    fn collector(agents: StaticAgents) -> CollectAgentState {
        CollectAgentState::new(StateCollector::new(Arc::new(agents), 4))
    }

    #[tokio::test]
    async fn orphan_vm_queued_once_without_ip_release() {
        let mut ctx = context(SIMPLE_MANIFEST);
        seed_instance(&ctx.store, "i-1", "nats", 0, Some("z1"), true);
        ctx.store
            .put_vm(&VmRecord {
                cid: "vm-orphan".to_string(),
                deployment: "cf".to_string(),
                agent_id: "agent-orphan".to_string(),
                agent_address: "127.0.0.1:1".to_string(),
                instance_id: None,
                created_at: 1000,
            })
            .unwrap();
        ctx.reservations
            .reserve("private", "10.0.0.20".parse().unwrap(), "i-1")
            .unwrap();

        MarkUnknownVmsForDeletion.run(&mut ctx).await.unwrap();
        MarkUnknownVmsForDeletion.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.unneeded_vms.len(), 1);
        assert_eq!(ctx.unneeded_vms[0].vm.cid, "vm-orphan");
        assert_eq!(ctx.reservations.count("private"), 1);
    }

    #[tokio::test]
    async fn reported_addresses_are_reserved_for_their_instance() {
        let mut ctx = context(SIMPLE_MANIFEST);
        seed_instance(&ctx.store, "i-1", "router", 0, Some("z1"), true);
        seed_instance(&ctx.store, "i-2", "router", 1, Some("z1"), true);
        let agents = StaticAgents::default()
            .with("vm-i-1", "router", 0, Some("10.0.0.20"))
            .with("vm-i-2", "router", 1, Some("192.168.0.1"));

        LoadExistingState.run(&mut ctx).await.unwrap();
        collector(agents).run(&mut ctx).await.unwrap();
        ReserveIps.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.reservations.owner("private", "10.0.0.20".parse().unwrap()), Some("i-1"));
        // Outside the subnet: left alone.
        assert_eq!(ctx.reservations.count("private"), 1);
    }

    #[tokio::test]
    async fn duplicate_reported_address_is_a_director_error() {
        let mut ctx = context(SIMPLE_MANIFEST);
        seed_instance(&ctx.store, "i-1", "router", 0, Some("z1"), true);
        seed_instance(&ctx.store, "i-2", "router", 1, Some("z1"), true);
        let agents = StaticAgents::default()
            .with("vm-i-1", "router", 0, Some("10.0.0.20"))
            .with("vm-i-2", "router", 1, Some("10.0.0.20"));

        LoadExistingState.run(&mut ctx).await.unwrap();
        collector(agents).run(&mut ctx).await.unwrap();
        assert!(matches!(
            ReserveIps.run(&mut ctx).await,
            Err(PlanError::Director(_))
        ));
    }

    #[tokio::test]
    async fn rename_keeps_instances_under_new_group() {
        let mut ctx = context(&SIMPLE_MANIFEST.replace("\"router\"", "\"edge\""));
        ctx.plan.rename = Some(Rename {
            old_name: "router".to_string(),
            new_name: "edge".to_string(),
        });
        seed_instance(&ctx.store, "i-1", "router", 0, Some("z1"), true);
        seed_instance(&ctx.store, "i-2", "router", 1, Some("z1"), true);
        let agents = StaticAgents::default()
            .with("vm-i-1", "router", 0, Some("10.0.0.20"))
            .with("vm-i-2", "router", 1, Some("10.0.0.21"));

        LoadExistingState.run(&mut ctx).await.unwrap();
        BindRenames.run(&mut ctx).await.unwrap();
        collector(agents).run(&mut ctx).await.unwrap();
        PlanInstances.run(&mut ctx).await.unwrap();
        MarkObsolete.run(&mut ctx).await.unwrap();

        let edge = ctx.plan.group("edge").unwrap();
        assert_eq!(edge.instance_plans.len(), 2);
        assert!(
            edge.instance_plans
                .iter()
                .all(|p| p.transition() == Transition::KeepAndUpdate
                    && p.renamed_from.as_deref() == Some("router"))
        );
        assert!(ctx.obsolete.is_empty());
    }

    #[tokio::test]
    async fn rename_of_group_still_in_manifest_is_rejected() {
        let mut ctx = context(SIMPLE_MANIFEST);
        ctx.plan.rename = Some(Rename {
            old_name: "router".to_string(),
            new_name: "nats".to_string(),
        });
        assert!(matches!(
            BindRenames.run(&mut ctx).await,
            Err(PlanError::Director(_))
        ));
    }

    #[tokio::test]
    async fn planning_marks_removed_groups_obsolete() {
        let mut ctx = context(SIMPLE_MANIFEST);
        seed_instance(&ctx.store, "i-1", "router", 0, Some("z1"), true);
        seed_instance(&ctx.store, "i-9", "uaa", 0, Some("z1"), false);
        let agents = StaticAgents::default().with("vm-i-1", "router", 0, Some("10.0.0.20"));

        LoadExistingState.run(&mut ctx).await.unwrap();
        collector(agents).run(&mut ctx).await.unwrap();
        PlanInstances.run(&mut ctx).await.unwrap();
        MarkObsolete.run(&mut ctx).await.unwrap();

        let router = ctx.plan.group("router").unwrap();
        let transitions: Vec<_> = router.instance_plans.iter().map(|p| p.transition()).collect();
        assert_eq!(transitions, vec![Transition::KeepAndUpdate, Transition::Create]);
        assert!(router.instance_plans[0].agent_state.is_some());

        assert_eq!(ctx.obsolete.len(), 1);
        assert_eq!(ctx.obsolete[0].instance_id(), Some("i-9"));
    }
}
