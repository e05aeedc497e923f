//! redb table definitions.
//!
//! Keys are `&str`, values are JSON-serialized records. Records scoped to
//! a deployment use a `{deployment}:` key prefix so a prefix scan yields
//! one deployment's rows.

use redb::TableDefinition;

/// Deployment records keyed by `{name}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Instance records keyed by `{deployment}:{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// VM records keyed by `{deployment}:{vm_cid}`.
pub const VMS: TableDefinition<&str, &[u8]> = TableDefinition::new("vms");

/// Persistent disks keyed by `{deployment}:{instance_id}:{disk_cid}`.
pub const PERSISTENT_DISKS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("persistent_disks");

/// Uploaded stemcells keyed by `{name}/{version}`.
pub const STEMCELLS: TableDefinition<&str, &[u8]> = TableDefinition::new("stemcells");

/// Uploaded releases keyed by `{name}/{version}`.
pub const RELEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("releases");

/// DNS A records keyed by fully-qualified name.
pub const DNS_RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("dns_records");

/// Advisory locks keyed by lock name.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");
