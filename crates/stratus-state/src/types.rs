//! Persisted director records.
//!
//! These are the rows the reconciliation core reads and later lifecycle
//! phases write. All of them are JSON-serialized into redb tables.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use stratus_core::{ReleaseRef, StemcellRef};

/// Unique identifier of an instance record.
pub type InstanceId = String;

/// Infrastructure identifier of a VM or disk.
pub type Cid = String;

// ── Deployment ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub name: String,
    /// Release versions bound by the last deploy.
    #[serde(default)]
    pub releases: Vec<ReleaseRef>,
    /// Stemcells bound by the last deploy.
    #[serde(default)]
    pub stemcells: Vec<StemcellRef>,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Instance ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub deployment: String,
    pub job: String,
    pub index: u32,
    /// Absent for instances created before availability zones existed.
    #[serde(default)]
    pub az: Option<String>,
    /// Absent when the instance is unallocated.
    #[serde(default)]
    pub vm_cid: Option<Cid>,
    pub state: InstanceLifecycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceLifecycle {
    Started,
    Stopped,
    Detached,
}

// ── VM ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmRecord {
    pub cid: Cid,
    pub deployment: String,
    pub agent_id: String,
    /// `host:port` of the agent's HTTP endpoint.
    pub agent_address: String,
    /// Owning instance. `None` for VMs left behind by a failed deploy.
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    pub created_at: u64,
}

// ── Persistent disk ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistentDiskRecord {
    pub cid: Cid,
    pub deployment: String,
    pub instance_id: InstanceId,
    pub size_mb: u64,
    pub active: bool,
}

// ── Catalog ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StemcellRecord {
    pub name: String,
    pub version: String,
    /// Image identifier in the infrastructure.
    pub cid: Cid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseRecord {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub jobs: Vec<JobTemplateRecord>,
}

/// A job template shipped inside a release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobTemplateRecord {
    pub name: String,
    /// Property definitions keyed by dotted name (`nats.port`).
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDefinition>,
    /// Names of the links this job provides.
    #[serde(default)]
    pub provides: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PropertyDefinition {
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

// ── DNS ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DnsRecord {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    pub updated_at: u64,
}

// ── Locks ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockRecord {
    pub name: String,
    pub owner: String,
    /// Unix seconds after which the lock may be taken over.
    pub expires_at: u64,
}

impl InstanceRecord {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.deployment, self.id)
    }
}

impl VmRecord {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.deployment, self.cid)
    }
}

impl PersistentDiskRecord {
    pub fn table_key(&self) -> String {
        format!("{}:{}:{}", self.deployment, self.instance_id, self.cid)
    }
}

impl StemcellRecord {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

impl ReleaseRecord {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }

    pub fn job(&self, name: &str) -> Option<&JobTemplateRecord> {
        self.jobs.iter().find(|j| j.name == name)
    }
}
