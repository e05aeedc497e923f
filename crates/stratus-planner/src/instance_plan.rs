//! Instance planner — the reconciliation decision per instance slot.
//!
//! Desired slots are paired with existing instances by index. A pair in
//! the same availability zone is kept and updated; a pair whose zone
//! differs is recreated in the new zone; a desired slot with no existing
//! instance is created. Existing instances no group claims are obsolete.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;

use serde::Serialize;
use tracing::debug;

use stratus_agent::AgentState;
use stratus_core::{InstanceGroupSpec, Properties, StemcellRef};
use stratus_state::{ExistingInstance, InstanceId, PersistentDiskRecord};

use crate::migrator::ExistingWithAz;
use crate::plan::InstanceGroup;

/// One logical slot of an instance group for this deploy.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DesiredInstance {
    pub group: String,
    pub index: u32,
    pub az: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Create,
    KeepAndUpdate,
    RecreateOnAzChange,
    Obsolete,
}

/// A VM to be created by the lifecycle manager.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VmPlaceholder {
    pub resource_pool: Option<String>,
    pub stemcell: StemcellRef,
    pub az: Option<String>,
    pub cloud_properties: Properties,
}

/// The decision for one slot. Desired and existing are never both absent:
/// the constructors are the only way to build a plan.
#[derive(Debug, Clone, Serialize)]
pub struct InstancePlan {
    desired: Option<DesiredInstance>,
    existing: Option<ExistingInstance>,
    transition: Transition,
    /// Live state reported by the agent of the existing VM.
    pub agent_state: Option<AgentState>,
    /// Job name the existing instance was recorded under, when matched by rename.
    pub renamed_from: Option<String>,
    /// Network name → assigned address. `None` on dynamic networks until
    /// the infrastructure assigns one.
    pub network_settings: BTreeMap<String, Option<Ipv4Addr>>,
    pub vm: Option<VmPlaceholder>,
}

impl InstancePlan {
    fn new(
        desired: Option<DesiredInstance>,
        existing: Option<ExistingInstance>,
        transition: Transition,
    ) -> Self {
        Self {
            desired,
            existing,
            transition,
            agent_state: None,
            renamed_from: None,
            network_settings: BTreeMap::new(),
            vm: None,
        }
    }

    pub fn create(desired: DesiredInstance) -> Self {
        Self::new(Some(desired), None, Transition::Create)
    }

    pub fn keep(desired: DesiredInstance, existing: ExistingInstance) -> Self {
        Self::new(Some(desired), Some(existing), Transition::KeepAndUpdate)
    }

    pub fn recreate(desired: DesiredInstance, existing: ExistingInstance) -> Self {
        Self::new(Some(desired), Some(existing), Transition::RecreateOnAzChange)
    }

    pub fn obsolete(existing: ExistingInstance) -> Self {
        Self::new(None, Some(existing), Transition::Obsolete)
    }

    pub fn desired(&self) -> Option<&DesiredInstance> {
        self.desired.as_ref()
    }

    pub fn existing(&self) -> Option<&ExistingInstance> {
        self.existing.as_ref()
    }

    pub fn transition(&self) -> Transition {
        self.transition
    }

    pub fn is_obsolete(&self) -> bool {
        self.transition == Transition::Obsolete
    }

    /// Whether the lifecycle manager has to create a VM for this plan.
    pub fn needs_new_vm(&self) -> bool {
        matches!(
            self.transition,
            Transition::Create | Transition::RecreateOnAzChange
        ) || (self.transition == Transition::KeepAndUpdate
            && self.existing.as_ref().is_some_and(|e| e.is_unallocated()))
    }

    /// Index of the slot: the desired index, or the existing one for obsolete plans.
    pub fn index(&self) -> u32 {
        self.desired
            .as_ref()
            .map(|d| d.index)
            .or_else(|| self.existing.as_ref().map(|e| e.index()))
            .unwrap_or_default()
    }

    pub fn az(&self) -> Option<&str> {
        match (&self.desired, &self.existing) {
            (Some(d), _) => d.az.as_deref(),
            (None, Some(e)) => e.az.as_deref(),
            (None, None) => None,
        }
    }

    /// Stable owner key for reservations and DNS: the instance id once
    /// one exists, `group/index` before that.
    pub fn owner_key(&self) -> String {
        match (&self.existing, &self.desired) {
            (Some(e), _) => e.id().to_string(),
            (None, Some(d)) => format!("{}/{}", d.group, d.index),
            (None, None) => String::new(),
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.existing.as_ref().map(|e| e.id())
    }

    /// Disks carried into the new state (none for brand-new instances).
    pub fn persistent_disks(&self) -> &[PersistentDiskRecord] {
        self.existing
            .as_ref()
            .map(|e| e.disks.as_slice())
            .unwrap_or_default()
    }

    /// Address the agent reports on `network`, if any.
    pub fn reported_address(&self, network: &str) -> Option<Ipv4Addr> {
        self.agent_state
            .as_ref()
            .and_then(|s| s.networks.get(network).copied())
    }
}

/// Choose the AZ for every desired index of `group`.
///
/// An index whose existing instance already sits in one of the group's
/// zones stays there. Remaining indices go to the zone with the fewest
/// assignments so far; declaration order breaks ties.
pub fn assign_desired_instances(
    group: &InstanceGroupSpec,
    existing: &[ExistingWithAz],
) -> Vec<DesiredInstance> {
    let count = group.instances;
    if group.azs.is_empty() {
        return (0..count)
            .map(|index| DesiredInstance {
                group: group.name.clone(),
                index,
                az: None,
            })
            .collect();
    }

    let mut load: Vec<(String, u32)> = group.azs.iter().map(|az| (az.clone(), 0)).collect();
    let mut assigned: BTreeMap<u32, String> = BTreeMap::new();

    for candidate in existing.iter().filter(|e| e.index < count) {
        let Some(az) = &candidate.az else { continue };
        if let Some(slot) = load.iter_mut().find(|(name, _)| name == az) {
            if assigned.insert(candidate.index, az.clone()).is_none() {
                slot.1 += 1;
            }
        }
    }

    (0..count)
        .map(|index| {
            let az = match assigned.get(&index) {
                Some(az) => Some(az.clone()),
                None => load.iter_mut().min_by_key(|(_, n)| *n).map(|slot| {
                    slot.1 += 1;
                    slot.0.clone()
                }),
            };
            DesiredInstance {
                group: group.name.clone(),
                index,
                az,
            }
        })
        .collect()
}

/// Pair desired slots with existing instances for one group.
///
/// Plans come back in desired-index order; that order drives
/// provisioning. Existing instances left unpaired are not returned; they
/// surface in [`plan_obsolete_jobs`].
pub fn plan_job_instances(
    desired: &[DesiredInstance],
    existing: Vec<ExistingWithAz>,
    agent_states: &HashMap<InstanceId, AgentState>,
) -> Vec<InstancePlan> {
    let mut by_index: BTreeMap<u32, ExistingWithAz> = BTreeMap::new();
    for candidate in existing {
        by_index.entry(candidate.index).or_insert(candidate);
    }

    let mut ordered: Vec<&DesiredInstance> = desired.iter().collect();
    ordered.sort_by_key(|d| d.index);

    ordered
        .into_iter()
        .map(|slot| match by_index.remove(&slot.index) {
            Some(matched) => {
                let state = agent_states.get(matched.instance.id()).cloned();
                let mut plan = if matched.az == slot.az {
                    InstancePlan::keep(slot.clone(), matched.instance)
                } else {
                    debug!(
                        group = %slot.group,
                        index = slot.index,
                        from = ?matched.az,
                        to = ?slot.az,
                        "availability zone changed, recreating"
                    );
                    InstancePlan::recreate(slot.clone(), matched.instance)
                };
                plan.agent_state = state;
                plan.renamed_from = matched.renamed_from;
                plan
            }
            None => InstancePlan::create(slot.clone()),
        })
        .collect()
}

/// Every existing instance that no group's plans claim becomes obsolete.
pub fn plan_obsolete_jobs(
    groups: &[InstanceGroup],
    all_existing: &[ExistingInstance],
) -> Vec<InstancePlan> {
    let claimed: HashSet<&str> = groups
        .iter()
        .flat_map(|g| g.instance_plans.iter())
        .filter(|p| !p.is_obsolete())
        .filter_map(|p| p.instance_id())
        .collect();

    all_existing
        .iter()
        .filter(|e| !claimed.contains(e.id()))
        .cloned()
        .map(InstancePlan::obsolete)
        .collect()
}
