//! Existing-state repository.
//!
//! Read-only joins over the instance, VM and disk tables that give the
//! reconciliation core its view of what is already deployed. Nothing here
//! writes; datastore failures propagate unchanged.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StateResult;
use crate::store::StateStore;
use crate::types::*;

/// One persisted instance with its VM (if allocated), recorded AZ and
/// persistent disks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExistingInstance {
    pub model: InstanceRecord,
    pub vm: Option<VmRecord>,
    pub az: Option<String>,
    pub disks: Vec<PersistentDiskRecord>,
}

impl ExistingInstance {
    pub fn id(&self) -> &str {
        &self.model.id
    }

    pub fn job(&self) -> &str {
        &self.model.job
    }

    pub fn index(&self) -> u32 {
        self.model.index
    }

    /// An instance without a VM has no live agent to ask.
    pub fn is_unallocated(&self) -> bool {
        self.vm.is_none()
    }
}

impl StateStore {
    /// Every instance of `deployment`, ordered by `(job, index)`.
    pub fn load_instances(&self, deployment: &str) -> StateResult<Vec<ExistingInstance>> {
        let vms: HashMap<Cid, VmRecord> = self
            .list_vms(deployment)?
            .into_iter()
            .map(|vm| (vm.cid.clone(), vm))
            .collect();

        let mut instances = Vec::new();
        for model in self.list_instances(deployment)? {
            let vm = model.vm_cid.as_ref().and_then(|cid| vms.get(cid)).cloned();
            let disks = self.list_disks_for_instance(deployment, &model.id)?;
            instances.push(ExistingInstance {
                az: model.az.clone(),
                model,
                vm,
                disks,
            });
        }
        instances.sort_by(|a, b| (a.job(), a.index()).cmp(&(b.job(), b.index())));

        debug!(%deployment, count = instances.len(), "existing instances loaded");
        Ok(instances)
    }

    /// VMs that no instance record claims: no owner, a missing owner, or
    /// an owner that points at a different VM.
    pub fn load_orphan_vms(&self, deployment: &str) -> StateResult<Vec<VmRecord>> {
        let instances: HashMap<InstanceId, InstanceRecord> = self
            .list_instances(deployment)?
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect();

        let orphans: Vec<VmRecord> = self
            .list_vms(deployment)?
            .into_iter()
            .filter(|vm| {
                let owner = vm.instance_id.as_ref().and_then(|id| instances.get(id));
                match owner {
                    Some(instance) => instance.vm_cid.as_deref() != Some(vm.cid.as_str()),
                    None => true,
                }
            })
            .collect();

        debug!(%deployment, count = orphans.len(), "orphan vms loaded");
        Ok(orphans)
    }
}
