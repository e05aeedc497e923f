//! Mutable state threaded through the reconciliation pipeline.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use serde::Serialize;

use stratus_agent::AgentState;
use stratus_core::{DirectorConfig, ReleaseRef, StemcellRef};
use stratus_state::{ExistingInstance, InstanceId, ReleaseRecord, StateStore, StemcellRecord, VmRecord};

use crate::instance_plan::{InstancePlan, Transition};
use crate::network::IpReservations;
use crate::plan::DeploymentPlan;

/// A VM no instance owns, queued for deletion by the lifecycle manager.
/// Such VMs hold no IP reservation, so deleting one releases no address.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VmDeletion {
    pub vm: VmRecord,
}

pub struct PlanContext {
    pub plan: DeploymentPlan,
    pub store: StateStore,
    pub config: DirectorConfig,
    /// Lock owner identity for this deploy.
    pub owner: String,
    pub existing: Vec<ExistingInstance>,
    pub agent_states: HashMap<InstanceId, AgentState>,
    pub obsolete: Vec<InstancePlan>,
    pub unneeded_vms: Vec<VmDeletion>,
    pub reservations: IpReservations,
    pub bound_releases: Vec<ReleaseRecord>,
    /// Keyed by stemcell alias, or by resource pool name for pool manifests.
    pub bound_stemcells: BTreeMap<String, StemcellRecord>,
}

impl PlanContext {
    pub fn new(
        plan: DeploymentPlan,
        store: StateStore,
        config: DirectorConfig,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            plan,
            store,
            config,
            owner: owner.into(),
            existing: Vec::new(),
            agent_states: HashMap::new(),
            obsolete: Vec::new(),
            unneeded_vms: Vec::new(),
            reservations: IpReservations::new(),
            bound_releases: Vec::new(),
            bound_stemcells: BTreeMap::new(),
        }
    }

    pub fn release(&self, name: &str) -> Option<&ReleaseRecord> {
        self.bound_releases.iter().find(|r| r.name == name)
    }

    pub fn summary(&self) -> PlanSummary {
        let groups = self
            .plan
            .groups
            .iter()
            .map(|g| GroupSummary {
                name: g.name().to_string(),
                templates: g.templates.iter().map(|t| t.name.clone()).collect(),
                instances: g.instance_plans.iter().map(InstanceSummary::from).collect(),
            })
            .collect();

        PlanSummary {
            deployment: self.plan.name.clone(),
            releases: self
                .bound_releases
                .iter()
                .map(|r| ReleaseRef {
                    name: r.name.clone(),
                    version: r.version.clone(),
                })
                .collect(),
            stemcells: self
                .bound_stemcells
                .values()
                .map(|s| StemcellRef {
                    name: s.name.clone(),
                    version: s.version.clone(),
                })
                .collect(),
            groups,
            obsolete: self.obsolete.iter().map(InstanceSummary::from).collect(),
            vms_to_delete: self.unneeded_vms.iter().map(|d| d.vm.cid.clone()).collect(),
        }
    }
}

/// What the pipeline decided, in a form fit for printing.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub deployment: String,
    pub releases: Vec<ReleaseRef>,
    pub stemcells: Vec<StemcellRef>,
    pub groups: Vec<GroupSummary>,
    pub obsolete: Vec<InstanceSummary>,
    pub vms_to_delete: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub name: String,
    pub templates: Vec<String>,
    pub instances: Vec<InstanceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub index: u32,
    pub az: Option<String>,
    pub transition: Transition,
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
    pub networks: BTreeMap<String, Option<Ipv4Addr>>,
    pub needs_vm: bool,
}

impl From<&InstancePlan> for InstanceSummary {
    fn from(plan: &InstancePlan) -> Self {
        Self {
            index: plan.index(),
            az: plan.az().map(str::to_string),
            transition: plan.transition(),
            instance_id: plan.instance_id().map(str::to_string),
            renamed_from: plan.renamed_from.clone(),
            networks: plan.network_settings.clone(),
            needs_vm: plan.vm.is_some(),
        }
    }
}
