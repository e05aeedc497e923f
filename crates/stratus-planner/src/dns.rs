//! DNS manager.
//!
//! Instance records are named `<index>.<job>.<network>.<deployment>.<domain>`.
//! Records written before the domain suffix existed are migrated in place.

use std::net::Ipv4Addr;

use tracing::{debug, info};

use stratus_state::{DnsRecord, ExistingInstance, StateStore};

use crate::epoch_secs;
use crate::error::PlanResult;

pub trait DnsManager: Send + Sync {
    /// Make sure the nameserver record for the domain exists.
    fn configure_nameserver(&self) -> PlanResult<()>;

    /// Rewrite records of `instance` that lack the domain suffix.
    /// Returns how many records were migrated.
    fn migrate_legacy_records(&self, instance: &ExistingInstance) -> PlanResult<usize>;

    fn update_instance_record(
        &self,
        name: &str,
        address: Ipv4Addr,
        instance_id: Option<&str>,
    ) -> PlanResult<()>;

    fn domain(&self) -> &str;
}

/// Canonical record name for one instance on one network.
pub fn record_name(index: u32, job: &str, network: &str, deployment: &str, domain: &str) -> String {
    format!(
        "{index}.{}.{}.{}.{domain}",
        canonical(job),
        canonical(network),
        canonical(deployment)
    )
}

fn canonical(label: &str) -> String {
    label.to_lowercase().replace('_', "-")
}

/// DNS records kept in the director's state store.
pub struct StoreDnsManager {
    store: StateStore,
    domain: String,
    nameserver: Option<Ipv4Addr>,
}

impl StoreDnsManager {
    pub fn new(store: StateStore, domain: impl Into<String>) -> Self {
        Self {
            store,
            domain: domain.into(),
            nameserver: None,
        }
    }

    pub fn with_nameserver(mut self, address: Ipv4Addr) -> Self {
        self.nameserver = Some(address);
        self
    }

    fn suffix(&self) -> String {
        format!(".{}", self.domain)
    }
}

impl DnsManager for StoreDnsManager {
    fn configure_nameserver(&self) -> PlanResult<()> {
        let Some(address) = self.nameserver else {
            debug!(domain = %self.domain, "no nameserver address configured");
            return Ok(());
        };
        let name = format!("ns.{}", self.domain);
        if let Some(existing) = self.store.get_dns_record(&name)? {
            if existing.address == address.to_string() {
                return Ok(());
            }
        }
        self.store.put_dns_record(&DnsRecord {
            name: name.clone(),
            address: address.to_string(),
            instance_id: None,
            updated_at: epoch_secs(),
        })?;
        info!(%name, %address, "nameserver record configured");
        Ok(())
    }

    fn migrate_legacy_records(&self, instance: &ExistingInstance) -> PlanResult<usize> {
        let suffix = self.suffix();
        let mut migrated = 0;
        for record in self.store.list_dns_records()? {
            if record.instance_id.as_deref() != Some(instance.id()) || record.name.ends_with(&suffix)
            {
                continue;
            }
            let renamed = DnsRecord {
                name: format!("{}{suffix}", record.name),
                updated_at: epoch_secs(),
                ..record.clone()
            };
            self.store.put_dns_record(&renamed)?;
            self.store.delete_dns_record(&record.name)?;
            debug!(from = %record.name, to = %renamed.name, "legacy dns record migrated");
            migrated += 1;
        }
        Ok(migrated)
    }

    fn update_instance_record(
        &self,
        name: &str,
        address: Ipv4Addr,
        instance_id: Option<&str>,
    ) -> PlanResult<()> {
        let current = self.store.get_dns_record(name)?;
        let unchanged = current.as_ref().is_some_and(|r| {
            r.address == address.to_string() && r.instance_id.as_deref() == instance_id
        });
        if unchanged {
            return Ok(());
        }
        self.store.put_dns_record(&DnsRecord {
            name: name.to_string(),
            address: address.to_string(),
            instance_id: instance_id.map(str::to_string),
            updated_at: epoch_secs(),
        })?;
        debug!(%name, %address, "dns record updated");
        Ok(())
    }

    fn domain(&self) -> &str {
        &self.domain
    }
}
