//! Store collaborator: CRUD over records and groups
//!
//! The trait is the integration seam for persistent backends; the crate
//! ships an in-memory implementation used by the service and by tests.
//! A store handle is constructed once and passed into each component.

use crate::model::{MeasuredState, ServerGroup, ServerRecord};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// CRUD and query interface over server records and groups.
#[async_trait]
pub trait Store: Send + Sync {
    // Groups
    async fn insert_group(&self, group: ServerGroup) -> Result<()>;
    async fn get_group(&self, id: Uuid) -> Result<Option<ServerGroup>>;
    async fn update_group(&self, group: ServerGroup) -> Result<()>;
    /// Deletes the group and cascades deletion of its records.
    async fn delete_group(&self, id: Uuid) -> Result<()>;
    async fn all_groups(&self) -> Result<Vec<ServerGroup>>;
    async fn groups_with_auto_update(&self) -> Result<Vec<ServerGroup>>;

    // Records
    async fn insert_record(&self, record: ServerRecord) -> Result<()>;
    async fn get_record(&self, id: Uuid) -> Result<Option<ServerRecord>>;
    async fn update_record(&self, record: ServerRecord) -> Result<()>;
    async fn delete_record(&self, id: Uuid) -> Result<()>;
    async fn all_records(&self) -> Result<Vec<ServerRecord>>;
    async fn records_in_group(&self, group_id: Uuid) -> Result<Vec<ServerRecord>>;
    /// All records ordered by (smoothed ping ascending, name ascending).
    /// Never-probed records (ping sentinel 0) sort last, not first.
    async fn records_by_ping(&self) -> Result<Vec<ServerRecord>>;

    /// Replace every record of a group in one indivisible step.
    async fn replace_group_records(&self, group_id: Uuid, records: Vec<ServerRecord>) -> Result<()>;

    /// Write back probe results for one record.
    async fn update_measured(&self, id: Uuid, measured: MeasuredState) -> Result<()>;

    /// Apply refresh bookkeeping to the stored group in one step, keyed by
    /// id so a caller's stale group snapshot never overwrites concurrent
    /// edits. Returns the group as stored afterwards.
    async fn mark_group_result(
        &self,
        id: Uuid,
        result: std::result::Result<DateTime<Utc>, String>,
        stale_after: u32,
    ) -> Result<ServerGroup>;
}

/// Shared store handle
pub type StoreHandle = Arc<dyn Store>;

#[derive(Default)]
struct Inner {
    groups: HashMap<Uuid, ServerGroup>,
    records: HashMap<Uuid, ServerRecord>,
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle() -> StoreHandle {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_group(&self, group: ServerGroup) -> Result<()> {
        let mut inner = self.inner.write();
        if inner
            .groups
            .values()
            .any(|g| g.name == group.name && g.id != group.id)
        {
            return Err(Error::conflict(format!(
                "group name '{}' already exists",
                group.name
            )));
        }
        inner.groups.insert(group.id, group);
        Ok(())
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<ServerGroup>> {
        Ok(self.inner.read().groups.get(&id).cloned())
    }

    async fn update_group(&self, group: ServerGroup) -> Result<()> {
        let mut inner = self.inner.write();
        if inner
            .groups
            .values()
            .any(|g| g.name == group.name && g.id != group.id)
        {
            return Err(Error::conflict(format!(
                "group name '{}' already exists",
                group.name
            )));
        }
        if !inner.groups.contains_key(&group.id) {
            return Err(Error::store(format!("no such group: {}", group.id)));
        }
        inner.groups.insert(group.id, group);
        Ok(())
    }

    async fn delete_group(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write();
        inner.groups.remove(&id);
        inner.records.retain(|_, r| r.group_id != id);
        Ok(())
    }

    async fn all_groups(&self) -> Result<Vec<ServerGroup>> {
        let mut groups: Vec<_> = self.inner.read().groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn groups_with_auto_update(&self) -> Result<Vec<ServerGroup>> {
        let mut groups: Vec<_> = self
            .inner
            .read()
            .groups
            .values()
            .filter(|g| g.auto_update && g.subscription_url.is_some())
            .cloned()
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn insert_record(&self, record: ServerRecord) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.groups.contains_key(&record.group_id) {
            return Err(Error::store(format!(
                "record {} references unknown group {}",
                record.id, record.group_id
            )));
        }
        inner.records.insert(record.id, record);
        Ok(())
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<ServerRecord>> {
        Ok(self.inner.read().records.get(&id).cloned())
    }

    async fn update_record(&self, record: ServerRecord) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.records.contains_key(&record.id) {
            return Err(Error::store(format!("no such record: {}", record.id)));
        }
        inner.records.insert(record.id, record);
        Ok(())
    }

    async fn delete_record(&self, id: Uuid) -> Result<()> {
        self.inner.write().records.remove(&id);
        Ok(())
    }

    async fn all_records(&self) -> Result<Vec<ServerRecord>> {
        Ok(self.inner.read().records.values().cloned().collect())
    }

    async fn records_in_group(&self, group_id: Uuid) -> Result<Vec<ServerRecord>> {
        Ok(self
            .inner
            .read()
            .records
            .values()
            .filter(|r| r.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn records_by_ping(&self) -> Result<Vec<ServerRecord>> {
        let mut records: Vec<_> = self.inner.read().records.values().cloned().collect();
        records.sort_by(|a, b| {
            let pa = ping_sort_key(a);
            let pb = ping_sort_key(b);
            pa.cmp(&pb).then_with(|| a.name.cmp(&b.name))
        });
        Ok(records)
    }

    async fn replace_group_records(&self, group_id: Uuid, records: Vec<ServerRecord>) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.groups.contains_key(&group_id) {
            return Err(Error::store(format!("no such group: {}", group_id)));
        }
        inner.records.retain(|_, r| r.group_id != group_id);
        for mut record in records {
            record.group_id = group_id;
            inner.records.insert(record.id, record);
        }
        Ok(())
    }

    async fn update_measured(&self, id: Uuid, measured: MeasuredState) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.records.get_mut(&id) {
            Some(r) => {
                r.measured = measured;
                Ok(())
            }
            None => Err(Error::store(format!("no such record: {}", id))),
        }
    }

    async fn mark_group_result(
        &self,
        id: Uuid,
        result: std::result::Result<DateTime<Utc>, String>,
        stale_after: u32,
    ) -> Result<ServerGroup> {
        let mut inner = self.inner.write();
        let group = inner
            .groups
            .get_mut(&id)
            .ok_or_else(|| Error::store(format!("no such group: {}", id)))?;
        match result {
            Ok(at) => {
                group.last_update_at = Some(at);
                group.consecutive_failures = 0;
                group.last_error = None;
                group.stale = false;
            }
            Err(msg) => {
                group.consecutive_failures = group.consecutive_failures.saturating_add(1);
                group.last_error = Some(msg);
                if group.consecutive_failures >= stale_after {
                    group.stale = true;
                }
            }
        }
        Ok(group.clone())
    }
}

/// Sort key pushing the never-probed sentinel (0) past real measurements.
fn ping_sort_key(r: &ServerRecord) -> u32 {
    if r.measured.sample_count == 0 {
        u32::MAX
    } else {
        r.measured.smoothed_ping_ms
    }
}
