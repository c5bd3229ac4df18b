// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;
use patch_dispatcher::store::{LockStore, StoreError};
use patch_dispatcher_types::descriptor::TargetType;
use patch_dispatcher_types::fabric::{
    ClusterId, ClusterRow, FabricId, FabricLockRequest, FabricLockState,
    FabricRow,
};
use patch_dispatcher_types::request::{
    ActiveOperationRow, ChildError, ChildRequestRow, PatchListRow,
    RequestStatus,
};
use patch_dispatcher_types::{ChildRequestUuid, MasterJobUuid};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug)]
struct RegistryEntry {
    value: String,
    owner: MasterJobUuid,
    worker: String,
}

/// A child request row that turns into `finished` after `running_polls`
/// more reads.
#[derive(Clone, Debug)]
struct ScriptedChild {
    current: ChildRequestRow,
    finished: Option<(u32, ChildRequestRow)>,
}

#[derive(Debug, Default)]
struct Inner {
    unavailable: bool,
    registry: BTreeMap<String, RegistryEntry>,
    registry_writes: usize,
    fabrics: BTreeMap<FabricId, FabricRow>,
    fabric_switches: BTreeMap<FabricId, Vec<String>>,
    next_fabric_id: i64,
    clusters: BTreeMap<String, ClusterRow>,
    next_cluster_id: i64,
    active_operations: Vec<ActiveOperationRow>,
    children: BTreeMap<ChildRequestUuid, ScriptedChild>,
    patch_list: Vec<PatchListRow>,
    reports: BTreeMap<ChildRequestUuid, ChildError>,
    job_status: BTreeMap<MasterJobUuid, Vec<String>>,
    lock_history: Vec<(FabricId, FabricLockState)>,
}

/// An in-memory [`LockStore`].
///
/// Every operation holds one mutex for its whole duration, which makes the
/// registry and fabric lock operations atomic the way a real store must.
#[derive(Clone, Debug, Default)]
pub struct MemoryLockStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(
        &self,
        f: impl FnOnce(&mut Inner) -> T,
    ) -> Result<T, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(StoreError::Unavailable(anyhow::anyhow!(
                "store marked unavailable by test"
            )));
        }
        Ok(f(&mut *inner))
    }

    /// Makes every later call fail, or succeed again.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unwrap().unavailable = unavailable;
    }

    /// Writes a registry entry as another master job would.
    pub fn seed_registry_entry(&self, key: &str, owner: MasterJobUuid) {
        self.inner.lock().unwrap().registry.insert(
            key.to_string(),
            RegistryEntry {
                value: "True".to_string(),
                owner,
                worker: "other".to_string(),
            },
        );
    }

    /// The value, owner and worker of a registry entry.
    pub fn registry_entry(
        &self,
        key: &str,
    ) -> Option<(String, MasterJobUuid, String)> {
        self.inner
            .lock()
            .unwrap()
            .registry
            .get(key)
            .map(|e| (e.value.clone(), e.owner, e.worker.clone()))
    }

    /// Registry writes made through [`LockStore::set_registry_entry`].
    pub fn registry_writes(&self) -> usize {
        self.inner.lock().unwrap().registry_writes
    }

    pub fn fabrics(&self) -> Vec<FabricRow> {
        self.inner.lock().unwrap().fabrics.values().cloned().collect()
    }

    pub fn fabric(&self, id: FabricId) -> Option<FabricRow> {
        self.inner.lock().unwrap().fabrics.get(&id).cloned()
    }

    pub fn fabric_switches(&self, id: FabricId) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .fabric_switches
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Overwrites a fabric's lock bookkeeping, e.g. to leave a lock behind.
    pub fn set_fabric_lock(&self, id: FabricId, lock: FabricLockState) {
        if let Some(row) = self.inner.lock().unwrap().fabrics.get_mut(&id) {
            row.lock = lock;
        }
    }

    pub fn cluster(&self, name: &str) -> Option<ClusterRow> {
        self.inner.lock().unwrap().clusters.get(name).cloned()
    }

    pub fn all_active_operations(&self) -> Vec<ActiveOperationRow> {
        self.inner.lock().unwrap().active_operations.clone()
    }

    pub fn insert_active_operation(&self, row: ActiveOperationRow) {
        self.inner.lock().unwrap().active_operations.push(row);
    }

    /// Every fabric lock state reached through a granted lock or unlock.
    pub fn lock_history(&self) -> Vec<(FabricId, FabricLockState)> {
        self.inner.lock().unwrap().lock_history.clone()
    }

    pub fn patch_list(&self, job: MasterJobUuid) -> Vec<PatchListRow> {
        self.inner
            .lock()
            .unwrap()
            .patch_list
            .iter()
            .filter(|row| row.master_job == job)
            .cloned()
            .collect()
    }

    /// Attaches a final report to a child's request list row, as a worker
    /// does when it finishes. Rows recorded later pick it up too.
    pub fn set_report(&self, correlation_id: ChildRequestUuid, report: ChildError) {
        let mut inner = self.inner.lock().unwrap();
        for row in &mut inner.patch_list {
            if row.correlation_id == correlation_id {
                row.report = Some(report.clone());
            }
        }
        inner.reports.insert(correlation_id, report);
    }

    /// Progress strings published for `job`, oldest first.
    pub fn job_statuses(&self, job: MasterJobUuid) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .job_status
            .get(&job)
            .cloned()
            .unwrap_or_default()
    }

    /// Records a child request the way a worker does. After `running_polls`
    /// reads the row reports `finished`; `None` leaves it running.
    pub fn script_child(
        &self,
        current: ChildRequestRow,
        finished: Option<(u32, ChildRequestRow)>,
    ) {
        self.inner
            .lock()
            .unwrap()
            .children
            .insert(current.correlation_id, ScriptedChild { current, finished });
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn check_registry_entry(&self, key: &str) -> Result<bool, StoreError> {
        self.with(|inner| inner.registry.contains_key(key))
    }

    async fn set_registry_entry(
        &self,
        key: &str,
        value: &str,
        owner: MasterJobUuid,
        worker: &str,
    ) -> Result<bool, StoreError> {
        self.with(|inner| {
            if inner.registry.contains_key(key) {
                return false;
            }
            inner.registry_writes += 1;
            inner.registry.insert(
                key.to_string(),
                RegistryEntry {
                    value: value.to_string(),
                    owner,
                    worker: worker.to_string(),
                },
            );
            true
        })
    }

    async fn delete_registry_entry(&self, key: &str) -> Result<(), StoreError> {
        self.with(|inner| {
            inner.registry.remove(key);
        })
    }

    async fn fabric_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<FabricRow>, StoreError> {
        self.with(|inner| {
            inner.fabrics.values().find(|row| row.hash == hash).cloned()
        })
    }

    async fn fabric_by_id(
        &self,
        id: FabricId,
    ) -> Result<Option<FabricRow>, StoreError> {
        self.with(|inner| inner.fabrics.get(&id).cloned())
    }

    async fn fabric_for_switches(
        &self,
        switches: &[String],
    ) -> Result<Option<FabricId>, StoreError> {
        self.with(|inner| {
            inner
                .fabric_switches
                .iter()
                .find(|(_, known)| known.iter().any(|k| switches.contains(k)))
                .map(|(id, _)| *id)
        })
    }

    async fn set_fabric_entry(
        &self,
        hash: &str,
    ) -> Result<Option<FabricRow>, StoreError> {
        self.with(|inner| {
            inner.next_fabric_id += 1;
            let row = FabricRow {
                id: FabricId(inner.next_fabric_id),
                hash: hash.to_string(),
                do_switch: false,
                lock: FabricLockState::default(),
            };
            inner.fabrics.insert(row.id, row.clone());
            Some(row)
        })
    }

    async fn set_fabric_do_switch(
        &self,
        id: FabricId,
        do_switch: bool,
    ) -> Result<(), StoreError> {
        self.with(|inner| {
            inner.fabrics.get_mut(&id).map(|row| row.do_switch = do_switch)
        })?
        .ok_or(StoreError::NoSuchFabric(id))
    }

    async fn manage_fabric_lock(
        &self,
        id: FabricId,
        cluster: ClusterId,
        request: FabricLockRequest,
    ) -> Result<bool, StoreError> {
        self.with(|inner| {
            let row = inner.fabrics.get_mut(&id)?;
            let granted = row.lock.apply(cluster, request);
            if granted {
                let state = row.lock.clone();
                inner.lock_history.push((id, state));
            }
            Some(granted)
        })?
        .ok_or(StoreError::NoSuchFabric(id))
    }

    async fn reset_fabric_entry(&self, id: FabricId) -> Result<(), StoreError> {
        self.with(|inner| {
            inner.fabrics.get_mut(&id).map(|row| {
                row.do_switch = false;
                row.lock = FabricLockState::default();
            })
        })?
        .ok_or(StoreError::NoSuchFabric(id))
    }

    async fn list_fabric_switches(
        &self,
        id: FabricId,
    ) -> Result<Vec<String>, StoreError> {
        self.with(|inner| {
            inner.fabric_switches.get(&id).cloned().unwrap_or_default()
        })
    }

    async fn add_fabric_switch(
        &self,
        id: FabricId,
        hostname: &str,
    ) -> Result<(), StoreError> {
        self.with(|inner| {
            inner
                .fabric_switches
                .entry(id)
                .or_default()
                .push(hostname.to_string())
        })
    }

    async fn cleanup_switch_fabric_tables(&self) -> Result<(), StoreError> {
        self.with(|inner| {
            inner.fabrics.clear();
            inner.fabric_switches.clear();
            inner.clusters.clear();
        })
    }

    async fn cluster_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ClusterRow>, StoreError> {
        self.with(|inner| inner.clusters.get(name).cloned())
    }

    async fn set_cluster_entry(
        &self,
        name: &str,
        fabric: FabricId,
    ) -> Result<(), StoreError> {
        self.with(|inner| {
            if inner.clusters.contains_key(name) {
                return;
            }
            inner.next_cluster_id += 1;
            let row = ClusterRow {
                id: ClusterId(inner.next_cluster_id),
                name: name.to_string(),
                fabric_id: fabric,
            };
            inner.clusters.insert(name.to_string(), row);
        })
    }

    async fn active_operations(
        &self,
        cluster_name: &str,
    ) -> Result<Vec<ActiveOperationRow>, StoreError> {
        self.with(|inner| {
            inner
                .active_operations
                .iter()
                .filter(|row| row.cluster_name == cluster_name)
                .cloned()
                .collect()
        })
    }

    async fn set_active_operation(
        &self,
        row: &ActiveOperationRow,
    ) -> Result<(), StoreError> {
        self.with(|inner| inner.active_operations.push(row.clone()))
    }

    async fn delete_active_operation(
        &self,
        cluster_name: &str,
        target: TargetType,
    ) -> Result<(), StoreError> {
        self.with(|inner| {
            inner.active_operations.retain(|row| {
                row.cluster_name != cluster_name || row.target_type != target
            })
        })
    }

    async fn delete_active_operations_for_job(
        &self,
        job: MasterJobUuid,
    ) -> Result<(), StoreError> {
        self.with(|inner| {
            inner.active_operations.retain(|row| row.master_job != job)
        })
    }

    async fn insert_child_request(
        &self,
        job: MasterJobUuid,
        correlation_id: ChildRequestUuid,
        status: RequestStatus,
    ) -> Result<(), StoreError> {
        self.with(|inner| {
            let report = inner.reports.get(&correlation_id).cloned();
            inner.patch_list.push(PatchListRow {
                master_job: job,
                correlation_id,
                status,
                report,
                error: None,
            })
        })
    }

    async fn update_child_request_status(
        &self,
        job: MasterJobUuid,
        correlation_id: ChildRequestUuid,
        status: RequestStatus,
    ) -> Result<(), StoreError> {
        self.with(|inner| {
            for row in &mut inner.patch_list {
                if row.master_job == job && row.correlation_id == correlation_id
                {
                    row.status = status.clone();
                }
            }
        })
    }

    async fn update_child_request_error(
        &self,
        job: MasterJobUuid,
        correlation_id: ChildRequestUuid,
        error: &ChildError,
    ) -> Result<(), StoreError> {
        self.with(|inner| {
            for row in &mut inner.patch_list {
                if row.master_job == job && row.correlation_id == correlation_id
                {
                    row.error = Some(error.clone());
                }
            }
        })
    }

    async fn child_request(
        &self,
        correlation_id: ChildRequestUuid,
    ) -> Result<Option<ChildRequestRow>, StoreError> {
        self.with(|inner| {
            let child = inner.children.get_mut(&correlation_id)?;
            match child.finished.take() {
                Some((0, finished)) => child.current = finished,
                Some((polls, finished)) => {
                    child.finished = Some((polls - 1, finished))
                }
                None => {}
            }
            Some(child.current.clone())
        })
    }

    async fn list_child_requests(
        &self,
        job: MasterJobUuid,
    ) -> Result<Vec<PatchListRow>, StoreError> {
        self.with(|inner| {
            inner
                .patch_list
                .iter()
                .filter(|row| row.master_job == job)
                .cloned()
                .collect()
        })
    }

    async fn update_job_status(
        &self,
        job: MasterJobUuid,
        status: &str,
    ) -> Result<(), StoreError> {
        self.with(|inner| {
            inner.job_status.entry(job).or_default().push(status.to_string())
        })
    }
}
