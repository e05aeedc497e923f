//! Links resolver.
//!
//! A consumed link names a provider group (`from`) and the link a job in
//! that group provides. Resolution records the provider's active instances
//! with their primary addresses plus the provider properties the consumer
//! asked for. Runs after templates, properties and networks are bound.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use stratus_core::LinkConsumer;

use crate::error::{PlanError, PlanResult};
use crate::plan::{DeploymentPlan, InstanceGroup};
use crate::properties;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LinkInstance {
    pub index: u32,
    pub az: Option<String>,
    pub address: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResolvedLink {
    pub name: String,
    pub from: String,
    pub instances: Vec<LinkInstance>,
    /// Requested provider properties, keyed by dotted name.
    pub properties: BTreeMap<String, Value>,
}

/// Resolve every link consumed by the templates of `group_name`.
pub fn resolve(plan: &mut DeploymentPlan, group_name: &str) -> PlanResult<()> {
    let Some(group) = plan.group(group_name) else {
        return Err(PlanError::director(format!(
            "instance group '{group_name}' is not part of deployment '{}'",
            plan.name
        )));
    };

    let mut resolved = Vec::new();
    for (position, template) in group.templates.iter().enumerate() {
        for consumer in &template.consumes {
            match resolve_one(plan, consumer) {
                Ok(link) => {
                    debug!(
                        group = %group_name,
                        job = %template.name,
                        link = %link.name,
                        provider = %link.from,
                        instances = link.instances.len(),
                        "link resolved"
                    );
                    resolved.push((position, link));
                }
                Err(reason) if consumer.optional => {
                    warn!(
                        group = %group_name,
                        job = %template.name,
                        link = %consumer.name,
                        %reason,
                        "optional link not resolved, skipping"
                    );
                }
                Err(reason) => {
                    return Err(PlanError::UnresolvedLink {
                        consumer: template.name.clone(),
                        link: consumer.name.clone(),
                        reason,
                    });
                }
            }
        }
    }

    if let Some(group) = plan.group_mut(group_name) {
        for (position, link) in resolved {
            if let Some(template) = group.templates.get_mut(position) {
                template.links.insert(link.name.clone(), link);
            }
        }
    }
    Ok(())
}

fn resolve_one(plan: &DeploymentPlan, consumer: &LinkConsumer) -> Result<ResolvedLink, String> {
    let provider_group = plan
        .group(&consumer.from)
        .ok_or_else(|| format!("provider instance group '{}' not found", consumer.from))?;
    let provider = provider_group
        .templates
        .iter()
        .find(|t| t.provides(&consumer.name))
        .ok_or_else(|| {
            format!(
                "no job in instance group '{}' provides link '{}'",
                consumer.from, consumer.name
            )
        })?;

    let mut properties = BTreeMap::new();
    for path in &consumer.properties {
        let value = properties::lookup(&provider.properties, path).ok_or_else(|| {
            format!(
                "property '{path}' is not set on job '{}' in '{}'",
                provider.name, consumer.from
            )
        })?;
        properties.insert(path.clone(), value.clone());
    }

    Ok(ResolvedLink {
        name: consumer.name.clone(),
        from: consumer.from.clone(),
        instances: link_instances(provider_group),
        properties,
    })
}

fn link_instances(group: &InstanceGroup) -> Vec<LinkInstance> {
    let network = group.default_network();
    group
        .active_plans()
        .map(|plan| LinkInstance {
            index: plan.index(),
            az: plan.az().map(str::to_string),
            address: network.and_then(|net| {
                plan.network_settings
                    .get(net)
                    .copied()
                    .flatten()
                    .or_else(|| plan.reported_address(net))
            }),
        })
        .collect()
}
