//! Manifest validation errors.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("deployment name must not be empty")]
    EmptyName,

    #[error("deployment name '{0}' must not contain ':'")]
    InvalidName(String),

    #[error("instance group '{0}' is declared more than once")]
    DuplicateGroup(String),

    #[error("instance group '{group}' references unknown availability zone '{az}'")]
    UnknownAz { group: String, az: String },

    #[error("instance group '{group}' references unknown network '{network}'")]
    UnknownNetwork { group: String, network: String },

    #[error("instance group '{group}' must declare at least one network")]
    NoNetworks { group: String },

    #[error("instance group '{group}' references unknown resource pool '{pool}'")]
    UnknownResourcePool { group: String, pool: String },

    #[error("instance group '{group}' references unknown stemcell alias '{alias}'")]
    UnknownStemcell { group: String, alias: String },

    #[error("instance group '{group}' has neither a resource pool nor a stemcell")]
    MissingStemcell { group: String },

    #[error("resource pools and top-level stemcells cannot be declared together")]
    MixedStemcellShapes,

    #[error("job '{job}' in instance group '{group}' references undeclared release '{release}'")]
    UnknownRelease {
        group: String,
        job: String,
        release: String,
    },

    #[error("manual network '{0}' must declare a subnet")]
    MissingSubnet(String),

    #[error(
        "instance group '{group}' declares {got} static IPs on network '{network}', expected {expected}"
    )]
    StaticIpCount {
        group: String,
        network: String,
        expected: u32,
        got: usize,
    },

    #[error("static IP {ip} of instance group '{group}' is not a static IP of network '{network}'")]
    StaticIpNotInNetwork {
        group: String,
        network: String,
        ip: String,
    },
}
