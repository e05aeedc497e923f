//! VM placeholders, network settings and DNS records for planned instances.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use stratus_core::{Manifest, NetworkType, Properties, StemcellRef};

use crate::context::PlanContext;
use crate::dns::{DnsManager, record_name};
use crate::error::{PlanError, PlanResult};
use crate::instance_plan::VmPlaceholder;
use crate::plan::InstanceGroup;
use crate::steps::{ReconciliationStep, StepFuture};

/// Where a group's new VMs come from.
struct VmSource {
    resource_pool: Option<String>,
    stemcell: StemcellRef,
    cloud_properties: Properties,
}

fn vm_source(manifest: &Manifest, group: &InstanceGroup) -> PlanResult<VmSource> {
    match (&group.spec.resource_pool, &group.spec.stemcell) {
        (Some(pool_name), _) => {
            let pool = manifest.resource_pool(pool_name).ok_or_else(|| {
                PlanError::director(format!(
                    "instance group '{}' references unknown resource pool '{pool_name}'",
                    group.name()
                ))
            })?;
            Ok(VmSource {
                resource_pool: Some(pool.name.clone()),
                stemcell: pool.stemcell.clone(),
                cloud_properties: pool.cloud_properties.clone(),
            })
        }
        (None, Some(alias)) => {
            let stemcell = manifest.stemcell(alias).ok_or_else(|| {
                PlanError::director(format!(
                    "instance group '{}' references unknown stemcell '{alias}'",
                    group.name()
                ))
            })?;
            Ok(VmSource {
                resource_pool: None,
                stemcell: stemcell.stemcell_ref(),
                cloud_properties: Properties::new(),
            })
        }
        (None, None) => Err(PlanError::director(format!(
            "instance group '{}' has no stemcell",
            group.name()
        ))),
    }
}

/// Give every plan that needs a new VM a placeholder in its pool and AZ.
pub struct BindUnallocatedVms;

impl ReconciliationStep for BindUnallocatedVms {
    fn name(&self) -> &'static str {
        "bind_unallocated_vms"
    }

    fn run<'a>(&'a self, ctx: &'a mut PlanContext) -> StepFuture<'a> {
        Box::pin(async move {
            let manifest = &ctx.plan.manifest;
            let mut pool_usage: BTreeMap<String, u32> = BTreeMap::new();
            let mut placeholders = 0;

            for group in ctx.plan.groups.iter_mut() {
                let source = vm_source(manifest, group)?;
                let key = source
                    .resource_pool
                    .clone()
                    .or_else(|| group.spec.stemcell.clone())
                    .unwrap_or_default();
                if !ctx.bound_stemcells.contains_key(&key) {
                    return Err(PlanError::director(format!(
                        "stemcell '{}/{}' is not bound for instance group '{}'",
                        source.stemcell.name,
                        source.stemcell.version,
                        group.name()
                    )));
                }

                if let Some(pool) = &source.resource_pool {
                    *pool_usage.entry(pool.clone()).or_default() += group.active_plans().count() as u32;
                }

                for plan in group.instance_plans.iter_mut() {
                    if !plan.needs_new_vm() {
                        plan.vm = None;
                        continue;
                    }
                    let az = plan.az().map(str::to_string);
                    let mut cloud_properties = az
                        .as_deref()
                        .and_then(|name| manifest.azs.iter().find(|a| a.name == name))
                        .map(|a| a.cloud_properties.clone())
                        .unwrap_or_default();
                    cloud_properties.extend(source.cloud_properties.clone());
                    plan.vm = Some(VmPlaceholder {
                        resource_pool: source.resource_pool.clone(),
                        stemcell: source.stemcell.clone(),
                        az,
                        cloud_properties,
                    });
                    placeholders += 1;
                }
            }

            for (pool_name, used) in &pool_usage {
                let size = manifest.resource_pool(pool_name).and_then(|p| p.size);
                if let Some(size) = size {
                    if *used > size {
                        return Err(PlanError::director(format!(
                            "resource pool '{pool_name}' is not big enough: {used} VMs needed, capacity is {size}"
                        )));
                    }
                }
            }

            info!(placeholders, "unallocated vms bound");
            Ok(())
        })
    }
}

/// Settle every planned instance's address on each of its networks.
///
/// Manual networks: the group's static IP for the index, else the address
/// the instance already holds, else the next free address in the subnet.
/// Dynamic networks: whatever the agent reports, if anything.
pub struct BindInstanceNetworks;

impl ReconciliationStep for BindInstanceNetworks {
    fn name(&self) -> &'static str {
        "bind_instance_networks"
    }

    fn run<'a>(&'a self, ctx: &'a mut PlanContext) -> StepFuture<'a> {
        Box::pin(async move {
            let manifest = &ctx.plan.manifest;
            for group in ctx.plan.groups.iter_mut() {
                let InstanceGroup {
                    spec,
                    instance_plans,
                    ..
                } = group;

                for plan in instance_plans.iter_mut() {
                    plan.network_settings.clear();
                    let owner = plan.owner_key();

                    for binding in &spec.networks {
                        let network = manifest.network(&binding.name).ok_or_else(|| {
                            PlanError::director(format!(
                                "instance group '{}' references unknown network '{}'",
                                spec.name, binding.name
                            ))
                        })?;

                        let address = match (network.kind, &network.subnet) {
                            (NetworkType::Dynamic, _) => plan.reported_address(&network.name),
                            (NetworkType::Manual, None) => {
                                return Err(PlanError::director(format!(
                                    "manual network '{}' has no subnet",
                                    network.name
                                )));
                            }
                            (NetworkType::Manual, Some(subnet)) => {
                                let static_ip = binding.static_ips.get(plan.index() as usize).copied();
                                let held = ctx
                                    .reservations
                                    .held_by(&network.name, &owner)
                                    .filter(|ip| !subnet.static_ips.contains(ip));
                                let ip = match (static_ip, held) {
                                    (Some(ip), _) => {
                                        ctx.reservations.reserve(&network.name, ip, &owner)?;
                                        ip
                                    }
                                    (None, Some(ip)) => ip,
                                    (None, None) => {
                                        ctx.reservations.allocate(&network.name, subnet, &owner)?
                                    }
                                };
                                Some(ip)
                            }
                        };

                        debug!(
                            group = %spec.name,
                            index = plan.index(),
                            network = %network.name,
                            address = ?address,
                            "network bound"
                        );
                        plan.network_settings.insert(network.name.clone(), address);
                    }
                }
            }
            Ok(())
        })
    }
}

/// Point each planned instance's DNS records at its addresses.
pub struct BindDns {
    dns: Arc<dyn DnsManager>,
}

impl BindDns {
    pub fn new(dns: Arc<dyn DnsManager>) -> Self {
        Self { dns }
    }
}

impl ReconciliationStep for BindDns {
    fn name(&self) -> &'static str {
        "bind_dns"
    }

    fn run<'a>(&'a self, ctx: &'a mut PlanContext) -> StepFuture<'a> {
        Box::pin(async move {
            self.dns.configure_nameserver()?;

            let mut records = 0;
            for group in &ctx.plan.groups {
                for plan in group.active_plans() {
                    for (network, address) in &plan.network_settings {
                        let Some(address) = address else { continue };
                        let name = record_name(
                            plan.index(),
                            group.name(),
                            network,
                            &ctx.plan.name,
                            self.dns.domain(),
                        );
                        self.dns
                            .update_instance_record(&name, *address, plan.instance_id())?;
                        records += 1;
                    }
                }
            }
            info!(records, "dns records bound");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use crate::collector::StateCollector;
    use crate::dns::StoreDnsManager;
    use crate::instance_plan::Transition;
    use crate::steps::{
        BindReleases, BindStemcells, CollectAgentState, LoadExistingState, PlanInstances, ReserveIps,
    };
    use crate::test_support::{
        POOL_MANIFEST, SIMPLE_MANIFEST, StaticAgents, context, release, seed_instance, stemcell,
    };

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    /// Run the pipeline up to and including stemcell binding.
    async fn prepared(
        manifest: &str,
        seed: impl FnOnce(&stratus_state::StateStore),
        agents: StaticAgents,
    ) -> PlanContext {
        let mut ctx = context(manifest);
        ctx.store.put_release(&release()).unwrap();
        ctx.store.put_stemcell(&stemcell()).unwrap();
        seed(&ctx.store);

        BindReleases.run(&mut ctx).await.unwrap();
        LoadExistingState.run(&mut ctx).await.unwrap();
        CollectAgentState::new(StateCollector::new(Arc::new(agents), 4))
            .run(&mut ctx)
            .await
            .unwrap();
        PlanInstances.run(&mut ctx).await.unwrap();
        ReserveIps.run(&mut ctx).await.unwrap();
        BindStemcells.run(&mut ctx).await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn placeholders_only_for_new_vms() {
        let mut ctx = prepared(
            SIMPLE_MANIFEST,
            |store| {
                seed_instance(store, "i-1", "router", 0, Some("z1"), true);
            },
            StaticAgents::default().with("vm-i-1", "router", 0, Some("10.0.0.20")),
        )
        .await;

        BindUnallocatedVms.run(&mut ctx).await.unwrap();

        let router = ctx.plan.group("router").unwrap();
        assert_eq!(router.instance_plans[0].transition(), Transition::KeepAndUpdate);
        assert!(router.instance_plans[0].vm.is_none());
        let vm = router.instance_plans[1].vm.as_ref().unwrap();
        assert_eq!(vm.stemcell.name, "ubuntu-trusty");
        assert_eq!(vm.az.as_deref(), Some("z1"));
        assert_eq!(ctx.summary().groups[0].instances.iter().filter(|i| i.needs_vm).count(), 2);
    }

    #[tokio::test]
    async fn pool_placeholders_carry_cloud_properties() {
        let mut ctx = prepared(POOL_MANIFEST, |_| {}, StaticAgents::default()).await;
        BindUnallocatedVms.run(&mut ctx).await.unwrap();

        let vm = ctx.plan.groups[0].instance_plans[0].vm.as_ref().unwrap();
        assert_eq!(vm.resource_pool.as_deref(), Some("small"));
        assert_eq!(vm.cloud_properties["instance_type"], "m3.medium");
    }

    #[tokio::test]
    async fn oversubscribed_pool_is_rejected() {
        let manifest = POOL_MANIFEST.replace("size = 2", "size = 1");
        let mut ctx = prepared(&manifest, |_| {}, StaticAgents::default()).await;

        let err = BindUnallocatedVms.run(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("resource pool 'small' is not big enough"));
    }

    #[tokio::test]
    async fn addresses_follow_static_then_kept_then_allocated() {
        let mut ctx = prepared(
            SIMPLE_MANIFEST,
            |store| {
                seed_instance(store, "i-1", "router", 0, Some("z1"), true);
            },
            StaticAgents::default().with("vm-i-1", "router", 0, Some("10.0.0.20")),
        )
        .await;

        BindInstanceNetworks.run(&mut ctx).await.unwrap();
        // Re-running keeps the same answers.
        BindInstanceNetworks.run(&mut ctx).await.unwrap();

        let nats = ctx.plan.group("nats").unwrap();
        assert_eq!(nats.instance_plans[0].network_settings["private"], Some(ip("10.0.0.40")));
        assert_eq!(nats.instance_plans[1].network_settings["private"], Some(ip("10.0.0.41")));

        let router = ctx.plan.group("router").unwrap();
        assert_eq!(router.instance_plans[0].network_settings["private"], Some(ip("10.0.0.20")));
        // First free: .10 is the range start, .11 is reserved.
        assert_eq!(router.instance_plans[1].network_settings["private"], Some(ip("10.0.0.10")));
    }

    #[tokio::test]
    async fn dynamic_networks_take_the_reported_address_only() {
        let mut ctx = prepared(POOL_MANIFEST, |_| {}, StaticAgents::default()).await;
        BindInstanceNetworks.run(&mut ctx).await.unwrap();

        let plan = &ctx.plan.groups[0].instance_plans[0];
        assert_eq!(plan.network_settings["private"], Some(ip("10.0.0.19")));
        assert_eq!(plan.network_settings["public"], None);
    }

    #[tokio::test]
    async fn dns_records_written_for_bound_addresses() {
        let mut ctx = prepared(SIMPLE_MANIFEST, |_| {}, StaticAgents::default()).await;
        BindInstanceNetworks.run(&mut ctx).await.unwrap();

        let dns = Arc::new(StoreDnsManager::new(ctx.store.clone(), "stratus"));
        BindDns::new(dns).run(&mut ctx).await.unwrap();

        let record = ctx
            .store
            .get_dns_record("0.nats.private.cf.stratus")
            .unwrap()
            .unwrap();
        assert_eq!(record.address, "10.0.0.40");
        assert_eq!(ctx.store.list_dns_records().unwrap().len(), 4);
    }
}
