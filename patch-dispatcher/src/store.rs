// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the persistent lock store shared by every master job.

use async_trait::async_trait;
use patch_dispatcher_types::descriptor::TargetType;
use patch_dispatcher_types::fabric::{
    ClusterId, ClusterRow, FabricId, FabricLockRequest, FabricRow,
};
use patch_dispatcher_types::request::{
    ActiveOperationRow, ChildError, ChildRequestRow, PatchListRow,
    RequestStatus,
};
use patch_dispatcher_types::{ChildRequestUuid, MasterJobUuid};
use thiserror::Error;

/// A failure of the store itself. Contention is never reported this way;
/// it shows up as `false` or `None` results.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lock store unavailable")]
    Unavailable(#[source] anyhow::Error),
    #[error("lock store has no fabric {0}")]
    NoSuchFabric(FabricId),
    #[error("lock store row for {what} is inconsistent: {reason}")]
    Inconsistent { what: String, reason: String },
}

/// Persistent registry, fabric/cluster tables, active-operation table and
/// request tables.
///
/// Several master jobs may share one store from different processes.
/// [`LockStore::set_registry_entry`] and [`LockStore::manage_fabric_lock`]
/// must each be atomic with respect to other callers.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn check_registry_entry(&self, key: &str) -> Result<bool, StoreError>;

    /// Creates `key` if it does not exist. Returns false if another owner
    /// already holds it.
    async fn set_registry_entry(
        &self,
        key: &str,
        value: &str,
        owner: MasterJobUuid,
        worker: &str,
    ) -> Result<bool, StoreError>;

    async fn delete_registry_entry(&self, key: &str) -> Result<(), StoreError>;

    async fn fabric_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<FabricRow>, StoreError>;

    async fn fabric_by_id(
        &self,
        id: FabricId,
    ) -> Result<Option<FabricRow>, StoreError>;

    /// Finds a fabric already holding any of `switches`.
    async fn fabric_for_switches(
        &self,
        switches: &[String],
    ) -> Result<Option<FabricId>, StoreError>;

    /// Creates a fabric row for `hash`. `None` if the store refused it.
    async fn set_fabric_entry(
        &self,
        hash: &str,
    ) -> Result<Option<FabricRow>, StoreError>;

    async fn set_fabric_do_switch(
        &self,
        id: FabricId,
        do_switch: bool,
    ) -> Result<(), StoreError>;

    /// Applies a lock or unlock for `cluster` atomically, following
    /// [`patch_dispatcher_types::fabric::FabricLockState::apply`]. Returns
    /// false if it was refused.
    async fn manage_fabric_lock(
        &self,
        id: FabricId,
        cluster: ClusterId,
        request: FabricLockRequest,
    ) -> Result<bool, StoreError>;

    /// Clears switch work and every lock recorded for a fabric.
    async fn reset_fabric_entry(&self, id: FabricId) -> Result<(), StoreError>;

    async fn list_fabric_switches(
        &self,
        id: FabricId,
    ) -> Result<Vec<String>, StoreError>;

    async fn add_fabric_switch(
        &self,
        id: FabricId,
        hostname: &str,
    ) -> Result<(), StoreError>;

    /// Drops every fabric, fabric switch and cluster row.
    async fn cleanup_switch_fabric_tables(&self) -> Result<(), StoreError>;

    async fn cluster_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ClusterRow>, StoreError>;

    async fn set_cluster_entry(
        &self,
        name: &str,
        fabric: FabricId,
    ) -> Result<(), StoreError>;

    async fn active_operations(
        &self,
        cluster_name: &str,
    ) -> Result<Vec<ActiveOperationRow>, StoreError>;

    async fn set_active_operation(
        &self,
        row: &ActiveOperationRow,
    ) -> Result<(), StoreError>;

    async fn delete_active_operation(
        &self,
        cluster_name: &str,
        target: TargetType,
    ) -> Result<(), StoreError>;

    async fn delete_active_operations_for_job(
        &self,
        job: MasterJobUuid,
    ) -> Result<(), StoreError>;

    async fn insert_child_request(
        &self,
        job: MasterJobUuid,
        correlation_id: ChildRequestUuid,
        status: RequestStatus,
    ) -> Result<(), StoreError>;

    async fn update_child_request_status(
        &self,
        job: MasterJobUuid,
        correlation_id: ChildRequestUuid,
        status: RequestStatus,
    ) -> Result<(), StoreError>;

    async fn update_child_request_error(
        &self,
        job: MasterJobUuid,
        correlation_id: ChildRequestUuid,
        error: &ChildError,
    ) -> Result<(), StoreError>;

    /// The worker's view of a child request.
    async fn child_request(
        &self,
        correlation_id: ChildRequestUuid,
    ) -> Result<Option<ChildRequestRow>, StoreError>;

    async fn list_child_requests(
        &self,
        job: MasterJobUuid,
    ) -> Result<Vec<PatchListRow>, StoreError>;

    /// Publishes the progress string of a reporting master job.
    async fn update_job_status(
        &self,
        job: MasterJobUuid,
        status: &str,
    ) -> Result<(), StoreError>;
}
