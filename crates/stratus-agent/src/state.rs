//! Wire documents exchanged between the director and an agent.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// What an agent reports as currently applied. Unknown fields sent by
/// newer agents are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentState {
    pub job: String,
    pub index: u32,
    /// Network name → address the VM actually holds.
    #[serde(default)]
    pub networks: BTreeMap<String, Ipv4Addr>,
}

/// The apply document the director sends to a VM's agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplySpec {
    pub deployment: String,
    pub job: String,
    pub index: u32,
    #[serde(default)]
    pub resource_pool: Option<String>,
    #[serde(default)]
    pub networks: BTreeMap<String, Ipv4Addr>,
    /// Package name → version.
    #[serde(default)]
    pub packages: BTreeMap<String, String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl From<&ApplySpec> for AgentState {
    fn from(spec: &ApplySpec) -> Self {
        Self {
            job: spec.job.clone(),
            index: spec.index,
            networks: spec.networks.clone(),
        }
    }
}
