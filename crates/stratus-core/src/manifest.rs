//! Deployment manifest schema and validation.
//!
//! Manifests are TOML. A manifest describes either the legacy
//! resource-pool layout (every instance group names a pool, every pool
//! names a stemcell) or the pool-less layout (top-level stemcells
//! referenced by alias). The two shapes never mix.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::ManifestError;

/// Free-form property tree (`properties`, `cloud_properties`).
pub type Properties = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub releases: Vec<ReleaseRef>,
    #[serde(default)]
    pub stemcells: Vec<StemcellAlias>,
    #[serde(default)]
    pub resource_pools: Vec<ResourcePoolSpec>,
    #[serde(default)]
    pub azs: Vec<AzSpec>,
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
    #[serde(default)]
    pub instance_groups: Vec<InstanceGroupSpec>,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ReleaseRef {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct StemcellRef {
    pub name: String,
    pub version: String,
}

/// A top-level stemcell, referenced from instance groups by `alias`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StemcellAlias {
    pub alias: String,
    pub name: String,
    pub version: String,
}

impl StemcellAlias {
    pub fn stemcell_ref(&self) -> StemcellRef {
        StemcellRef {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcePoolSpec {
    pub name: String,
    pub stemcell: StemcellRef,
    /// Maximum number of VMs in the pool. Unbounded when absent.
    #[serde(default)]
    pub size: Option<u32>,
    #[serde(default)]
    pub cloud_properties: Properties,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AzSpec {
    pub name: String,
    #[serde(default)]
    pub cloud_properties: Properties,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// Director-managed addresses from a declared range.
    Manual,
    /// Addresses assigned by the infrastructure, reported by the agent.
    Dynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NetworkType,
    #[serde(default)]
    pub subnet: Option<SubnetSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubnetSpec {
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    /// Addresses the director must never hand out.
    #[serde(default)]
    pub reserved: Vec<Ipv4Addr>,
    /// Addresses only handed out when an instance group asks for them.
    #[serde(default)]
    pub static_ips: Vec<Ipv4Addr>,
}

impl SubnetSpec {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        ip >= self.range_start && ip <= self.range_end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceGroupSpec {
    pub name: String,
    pub instances: u32,
    #[serde(default)]
    pub azs: Vec<String>,
    #[serde(default)]
    pub resource_pool: Option<String>,
    /// Stemcell alias (pool-less manifests only).
    #[serde(default)]
    pub stemcell: Option<String>,
    #[serde(default)]
    pub networks: Vec<GroupNetwork>,
    #[serde(default)]
    pub jobs: Vec<JobRef>,
    #[serde(default)]
    pub properties: Properties,
    /// Persistent disk size in MB.
    #[serde(default)]
    pub persistent_disk: Option<u64>,
    /// Legacy jobs whose instances this group absorbs.
    #[serde(default)]
    pub migrated_from: Vec<MigratedFrom>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupNetwork {
    pub name: String,
    /// One address per instance index, in index order.
    #[serde(default)]
    pub static_ips: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRef {
    pub name: String,
    pub release: String,
    #[serde(default)]
    pub consumes: Vec<LinkConsumer>,
}

/// A link consumed by a job: read `properties` from the job in group
/// `from` that provides link `name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConsumer {
    pub name: String,
    pub from: String,
    #[serde(default)]
    pub properties: Vec<String>,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigratedFrom {
    pub name: String,
    #[serde(default)]
    pub az: Option<String>,
}

impl Manifest {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest: Manifest = toml::from_str(&content)?;
        Ok(manifest)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn network(&self, name: &str) -> Option<&NetworkSpec> {
        self.networks.iter().find(|n| n.name == name)
    }

    pub fn resource_pool(&self, name: &str) -> Option<&ResourcePoolSpec> {
        self.resource_pools.iter().find(|p| p.name == name)
    }

    pub fn stemcell(&self, alias: &str) -> Option<&StemcellAlias> {
        self.stemcells.iter().find(|s| s.alias == alias)
    }

    /// Check cross references before any binding work starts.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.name.trim().is_empty() {
            return Err(ManifestError::EmptyName);
        }
        if self.name.contains(':') {
            return Err(ManifestError::InvalidName(self.name.clone()));
        }
        if !self.resource_pools.is_empty() && !self.stemcells.is_empty() {
            return Err(ManifestError::MixedStemcellShapes);
        }
        for network in &self.networks {
            if network.kind == NetworkType::Manual && network.subnet.is_none() {
                return Err(ManifestError::MissingSubnet(network.name.clone()));
            }
        }

        let azs: HashSet<&str> = self.azs.iter().map(|a| a.name.as_str()).collect();
        let releases: HashSet<&str> = self.releases.iter().map(|r| r.name.as_str()).collect();
        let mut seen = HashSet::new();

        for group in &self.instance_groups {
            if !seen.insert(group.name.as_str()) {
                return Err(ManifestError::DuplicateGroup(group.name.clone()));
            }

            for az in group
                .azs
                .iter()
                .chain(group.migrated_from.iter().filter_map(|m| m.az.as_ref()))
            {
                if !azs.contains(az.as_str()) {
                    return Err(ManifestError::UnknownAz {
                        group: group.name.clone(),
                        az: az.clone(),
                    });
                }
            }

            match (&group.resource_pool, &group.stemcell) {
                (Some(pool), _) if self.resource_pool(pool).is_none() => {
                    return Err(ManifestError::UnknownResourcePool {
                        group: group.name.clone(),
                        pool: pool.clone(),
                    });
                }
                (None, Some(alias)) if self.stemcell(alias).is_none() => {
                    return Err(ManifestError::UnknownStemcell {
                        group: group.name.clone(),
                        alias: alias.clone(),
                    });
                }
                (None, None) => {
                    return Err(ManifestError::MissingStemcell {
                        group: group.name.clone(),
                    });
                }
                _ => {}
            }

            if group.networks.is_empty() {
                return Err(ManifestError::NoNetworks {
                    group: group.name.clone(),
                });
            }
            for binding in &group.networks {
                let network = self.network(&binding.name).ok_or_else(|| {
                    ManifestError::UnknownNetwork {
                        group: group.name.clone(),
                        network: binding.name.clone(),
                    }
                })?;
                self.validate_static_ips(group, binding, network)?;
            }

            for job in &group.jobs {
                if !releases.contains(job.release.as_str()) {
                    return Err(ManifestError::UnknownRelease {
                        group: group.name.clone(),
                        job: job.name.clone(),
                        release: job.release.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_static_ips(
        &self,
        group: &InstanceGroupSpec,
        binding: &GroupNetwork,
        network: &NetworkSpec,
    ) -> Result<(), ManifestError> {
        if binding.static_ips.is_empty() {
            return Ok(());
        }
        if binding.static_ips.len() != group.instances as usize {
            return Err(ManifestError::StaticIpCount {
                group: group.name.clone(),
                network: binding.name.clone(),
                expected: group.instances,
                got: binding.static_ips.len(),
            });
        }
        let declared = network
            .subnet
            .as_ref()
            .map(|s| s.static_ips.as_slice())
            .unwrap_or_default();
        for ip in &binding.static_ips {
            if !declared.contains(ip) {
                return Err(ManifestError::StaticIpNotInNetwork {
                    group: group.name.clone(),
                    network: binding.name.clone(),
                    ip: ip.to_string(),
                });
            }
        }
        Ok(())
    }
}
