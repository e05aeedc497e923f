//! The desired-state deployment plan.
//!
//! Built once per deploy from a validated [`Manifest`]. Binding phases
//! attach templates, properties, instance plans and resolved links to
//! each [`InstanceGroup`] in place.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use stratus_core::{InstanceGroupSpec, LinkConsumer, Manifest, ManifestError, Properties, ReleaseRef};
use stratus_state::JobTemplateRecord;

use crate::instance_plan::InstancePlan;
use crate::links::ResolvedLink;

/// A job rename requested for this deploy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rename {
    pub old_name: String,
    pub new_name: String,
}

impl std::str::FromStr for Rename {
    type Err = String;

    /// Parses `old:new`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((old, new)) if !old.is_empty() && !new.is_empty() => Ok(Self {
                old_name: old.to_string(),
                new_name: new.to_string(),
            }),
            _ => Err(format!("expected OLD:NEW, got '{s}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    pub name: String,
    pub manifest: Manifest,
    pub groups: Vec<InstanceGroup>,
    pub rename: Option<Rename>,
}

impl DeploymentPlan {
    pub fn new(manifest: Manifest, rename: Option<Rename>) -> Result<Self, ManifestError> {
        manifest.validate()?;
        let groups = manifest
            .instance_groups
            .iter()
            .cloned()
            .map(InstanceGroup::new)
            .collect();
        Ok(Self {
            name: manifest.name.clone(),
            manifest,
            groups,
            rename,
        })
    }

    pub fn rename_in_progress(&self) -> bool {
        self.rename.is_some()
    }

    pub fn group(&self, name: &str) -> Option<&InstanceGroup> {
        self.groups.iter().find(|g| g.name() == name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut InstanceGroup> {
        self.groups.iter_mut().find(|g| g.name() == name)
    }

    /// Legacy layout: stemcells come from resource pools.
    pub fn uses_resource_pools(&self) -> bool {
        !self.manifest.resource_pools.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct InstanceGroup {
    pub spec: InstanceGroupSpec,
    pub templates: Vec<BoundTemplate>,
    pub instance_plans: Vec<InstancePlan>,
}

impl InstanceGroup {
    pub fn new(spec: InstanceGroupSpec) -> Self {
        Self {
            spec,
            templates: Vec::new(),
            instance_plans: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Plans that leave an instance running after this deploy.
    pub fn active_plans(&self) -> impl Iterator<Item = &InstancePlan> {
        self.instance_plans.iter().filter(|p| !p.is_obsolete())
    }

    /// The network an instance's primary address comes from.
    pub fn default_network(&self) -> Option<&str> {
        self.spec.networks.first().map(|n| n.name.as_str())
    }
}

/// A job template from a release, bound to an instance group.
#[derive(Debug, Clone, Serialize)]
pub struct BoundTemplate {
    pub name: String,
    pub release: ReleaseRef,
    #[serde(skip)]
    pub definition: JobTemplateRecord,
    pub consumes: Vec<LinkConsumer>,
    /// Resolved property tree (nested objects, not dotted keys).
    pub properties: Properties,
    pub links: BTreeMap<String, ResolvedLink>,
}

impl BoundTemplate {
    pub fn provides(&self, link: &str) -> bool {
        self.definition.provides.iter().any(|p| p == link)
    }
}
