//! StateStore — redb-backed persistence for the director.
//!
//! Typed load/save operations over deployments, instances, VMs,
//! persistent disks, catalog records (stemcells, releases), DNS records
//! and advisory locks. Values are JSON in `&[u8]` columns. Both on-disk
//! and in-memory backends are supported; the latter for tests.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe datastore backed by redb. Cheap to clone.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [
            DEPLOYMENTS,
            INSTANCES,
            VMS,
            PERSISTENT_DISKS,
            STEMCELLS,
            RELEASES,
            DNS_RECORDS,
            LOCKS,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic row access ─────────────────────────────────────────

    fn put_row<T: Serialize>(&self, table: Table, key: &str, row: &T) -> StateResult<()> {
        let value = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_row<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let row = match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            ),
            None => None,
        };
        Ok(row)
    }

    /// All rows whose key starts with `prefix`, in key order.
    fn list_rows<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut rows = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                rows.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
            }
        }
        Ok(rows)
    }

    fn delete_row(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn put_deployment(&self, record: &DeploymentRecord) -> StateResult<()> {
        self.put_row(DEPLOYMENTS, &record.name, record)?;
        debug!(deployment = %record.name, "deployment stored");
        Ok(())
    }

    pub fn get_deployment(&self, name: &str) -> StateResult<Option<DeploymentRecord>> {
        self.get_row(DEPLOYMENTS, name)
    }

    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        self.list_rows(DEPLOYMENTS, "")
    }

    // ── Instances ──────────────────────────────────────────────────

    pub fn put_instance(&self, record: &InstanceRecord) -> StateResult<()> {
        self.put_row(INSTANCES, &record.table_key(), record)
    }

    pub fn get_instance(&self, deployment: &str, id: &str) -> StateResult<Option<InstanceRecord>> {
        self.get_row(INSTANCES, &format!("{deployment}:{id}"))
    }

    pub fn list_instances(&self, deployment: &str) -> StateResult<Vec<InstanceRecord>> {
        // The key prefix alone would also match `{deployment}:...` names.
        let mut rows: Vec<InstanceRecord> = self.list_rows(INSTANCES, &format!("{deployment}:"))?;
        rows.retain(|r| r.deployment == deployment);
        Ok(rows)
    }

    pub fn delete_instance(&self, deployment: &str, id: &str) -> StateResult<bool> {
        self.delete_row(INSTANCES, &format!("{deployment}:{id}"))
    }

    // ── VMs ────────────────────────────────────────────────────────

    pub fn put_vm(&self, record: &VmRecord) -> StateResult<()> {
        self.put_row(VMS, &record.table_key(), record)
    }

    pub fn get_vm(&self, deployment: &str, cid: &str) -> StateResult<Option<VmRecord>> {
        self.get_row(VMS, &format!("{deployment}:{cid}"))
    }

    pub fn list_vms(&self, deployment: &str) -> StateResult<Vec<VmRecord>> {
        let mut rows: Vec<VmRecord> = self.list_rows(VMS, &format!("{deployment}:"))?;
        rows.retain(|r| r.deployment == deployment);
        Ok(rows)
    }

    pub fn delete_vm(&self, deployment: &str, cid: &str) -> StateResult<bool> {
        self.delete_row(VMS, &format!("{deployment}:{cid}"))
    }

    // ── Persistent disks ───────────────────────────────────────────

    pub fn put_disk(&self, record: &PersistentDiskRecord) -> StateResult<()> {
        self.put_row(PERSISTENT_DISKS, &record.table_key(), record)
    }

    pub fn list_disks_for_instance(
        &self,
        deployment: &str,
        instance_id: &str,
    ) -> StateResult<Vec<PersistentDiskRecord>> {
        let mut rows: Vec<PersistentDiskRecord> =
            self.list_rows(PERSISTENT_DISKS, &format!("{deployment}:{instance_id}:"))?;
        rows.retain(|r| r.deployment == deployment && r.instance_id == instance_id);
        Ok(rows)
    }

    // ── Stemcells ──────────────────────────────────────────────────

    pub fn put_stemcell(&self, record: &StemcellRecord) -> StateResult<()> {
        self.put_row(STEMCELLS, &record.table_key(), record)
    }

    pub fn get_stemcell(&self, name: &str, version: &str) -> StateResult<Option<StemcellRecord>> {
        self.get_row(STEMCELLS, &format!("{name}/{version}"))
    }

    // ── Releases ───────────────────────────────────────────────────

    pub fn put_release(&self, record: &ReleaseRecord) -> StateResult<()> {
        self.put_row(RELEASES, &record.table_key(), record)
    }

    pub fn get_release(&self, name: &str, version: &str) -> StateResult<Option<ReleaseRecord>> {
        self.get_row(RELEASES, &format!("{name}/{version}"))
    }

    // ── DNS ────────────────────────────────────────────────────────

    pub fn put_dns_record(&self, record: &DnsRecord) -> StateResult<()> {
        self.put_row(DNS_RECORDS, &record.name, record)
    }

    pub fn get_dns_record(&self, name: &str) -> StateResult<Option<DnsRecord>> {
        self.get_row(DNS_RECORDS, name)
    }

    pub fn list_dns_records(&self) -> StateResult<Vec<DnsRecord>> {
        self.list_rows(DNS_RECORDS, "")
    }

    pub fn delete_dns_record(&self, name: &str) -> StateResult<bool> {
        self.delete_row(DNS_RECORDS, name)
    }

    // ── Locks ──────────────────────────────────────────────────────

    /// Take the named lock for `owner` unless another owner holds an
    /// unexpired lease. Check and insert happen in one write transaction,
    /// so two contenders can never both succeed.
    pub fn try_acquire_lock(
        &self,
        name: &str,
        owner: &str,
        ttl_secs: u64,
        now: u64,
    ) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let acquired;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let held_elsewhere = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => {
                    let lock: LockRecord = serde_json::from_slice(guard.value())
                        .map_err(map_err!(Deserialize))?;
                    lock.owner != owner && lock.expires_at > now
                }
                None => false,
            };
            acquired = !held_elsewhere;
            if acquired {
                let lock = LockRecord {
                    name: name.to_string(),
                    owner: owner.to_string(),
                    expires_at: now + ttl_secs,
                };
                let value = serde_json::to_vec(&lock).map_err(map_err!(Serialize))?;
                table
                    .insert(name, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(lock = %name, %owner, acquired, "lock acquisition attempted");
        Ok(acquired)
    }

    /// Release the named lock if `owner` holds it. Returns true if removed.
    pub fn release_lock(&self, name: &str, owner: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let owned = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => {
                    let lock: LockRecord = serde_json::from_slice(guard.value())
                        .map_err(map_err!(Deserialize))?;
                    lock.owner == owner
                }
                None => false,
            };
            released = owned && table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(released)
    }

    pub fn get_lock(&self, name: &str) -> StateResult<Option<LockRecord>> {
        self.get_row(LOCKS, name)
    }
}
