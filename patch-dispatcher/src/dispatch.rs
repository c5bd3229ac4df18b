// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hands units of work to the worker, one cluster half at a time.
//!
//! Each cluster's request is split into a non-switch half, dispatched as soon
//! as its fabric allows it, and a switch half, dispatched once per fabric
//! after the non-switch work on that fabric has drained. With fabric locking
//! enabled the two halves never hold the same fabric at once.

use crate::config::DispatchConfig;
use crate::log_area::LogArea;
use crate::registry::Fabric;
use crate::run::{ChildWorkUnit, DispatcherRun};
use crate::store::{LockStore, StoreError};
use crate::worker::{PatchWorker, WorkerRequest, WorkerResponse};
use patch_dispatcher_types::compat::is_compatible;
use patch_dispatcher_types::fabric::{
    ClusterId, FabricId, FabricLockRequest, LockKind, LockedFor,
};
use patch_dispatcher_types::request::{
    ActiveOperationRow, RequestStatus, NEVER_STARTED_ERROR,
    WORKER_ERROR_UNDEF,
};
use patch_dispatcher_types::ChildRequestUuid;
use slog::{debug, error, info, o, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::sync::Arc;

const BUSY_CLUSTER_DETAIL: &str =
    "Can not run multiple patch operations on same cluster";

/// What became of one dispatch attempt.
#[derive(Debug)]
pub enum DispatchResult {
    /// The worker has the unit. Its status may already be terminal if the
    /// worker refused it.
    Dispatched(ChildWorkUnit),
    /// The cluster has no work of the requested kind.
    NothingToDo,
    /// The fabric lock is held elsewhere; try again later.
    LockNotAcquired,
    /// Another operation is running on the cluster. The unit never started.
    Rejected(ChildWorkUnit),
}

/// Number of units a run will dispatch.
///
/// Returns zero when some fabric is already busy with work that conflicts
/// with a cluster in this run. The count stops at the first cluster with
/// switch work on a fabric flagged for it; clusters after that one are not
/// counted. A cluster adds a unit of its own only when it targets cells,
/// hypervisor hosts or guests.
pub fn count_expected_units(fabrics: &[Fabric], fabric_locking: bool) -> usize {
    if !fabric_locking {
        return 1;
    }
    let mut count = 0;
    for fabric in fabrics {
        let lock = &fabric.row.lock;
        for cluster in &fabric.clusters {
            let switch_work = cluster.call.targets_switch();
            if lock.is_busy()
                && ((fabric.row.do_switch
                    && lock.locked_for == LockedFor::Switch)
                    || (lock.locked_for == LockedFor::NonSwitch
                        && switch_work))
            {
                return count;
            }
            if fabric.row.do_switch && switch_work {
                return count + 1;
            }
            if cluster.call.targets_node() {
                count += 1;
            }
        }
    }
    count
}

pub struct DispatchCoordinator {
    log: Logger,
    store: Arc<dyn LockStore>,
    worker: Arc<dyn PatchWorker>,
    log_area: Arc<dyn LogArea>,
    config: DispatchConfig,
}

impl DispatchCoordinator {
    pub fn new(
        log: &Logger,
        store: Arc<dyn LockStore>,
        worker: Arc<dyn PatchWorker>,
        log_area: Arc<dyn LogArea>,
        config: DispatchConfig,
    ) -> Self {
        let log = log.new(o!("component" => "DispatchCoordinator"));
        DispatchCoordinator { log, store, worker, log_area, config }
    }

    pub fn expected_count(&self, fabrics: &[Fabric]) -> usize {
        let count = count_expected_units(fabrics, self.config.fabric_locking);
        if !self.config.fabric_locking {
            info!(
                self.log,
                "fabric locking disabled; the request goes out as one unit"
            );
        } else if count == 0 {
            error!(
                self.log,
                "switch and non-switch work cannot run at the same time on a \
                 shared fabric"
            );
        } else {
            info!(self.log, "expected units"; "count" => count);
        }
        count
    }

    /// Dispatches the non-switch half of every cluster, up to the run's
    /// expected count.
    pub async fn send_initial_wave(
        &self,
        run: &mut DispatcherRun,
    ) -> Result<(), StoreError> {
        let clusters: Vec<(FabricId, ClusterId)> = run
            .fabrics
            .iter()
            .flat_map(|f| f.clusters.iter().map(move |c| (f.id(), c.id)))
            .collect();
        for (fabric_id, cluster_id) in clusters {
            if run.sent() >= run.expected {
                warn!(
                    self.log,
                    "expected unit count reached; not dispatching cluster";
                    "fabric_id" => fabric_id.0,
                    "cluster_id" => cluster_id.0,
                );
                continue;
            }
            self.send(run, fabric_id, cluster_id, true).await?;
        }
        Ok(())
    }

    /// Dispatches one half of a cluster's work and files the result in `run`.
    pub async fn send(
        &self,
        run: &mut DispatcherRun,
        fabric_id: FabricId,
        cluster_id: ClusterId,
        non_switch: bool,
    ) -> Result<(), StoreError> {
        match self.dispatch(run, fabric_id, cluster_id, non_switch).await? {
            DispatchResult::Dispatched(unit) | DispatchResult::Rejected(unit) => {
                run.record(unit)
            }
            DispatchResult::LockNotAcquired if non_switch => {
                if !run.deferred.contains(&(fabric_id, cluster_id)) {
                    run.deferred.push((fabric_id, cluster_id));
                }
            }
            DispatchResult::LockNotAcquired | DispatchResult::NothingToDo => {}
        }
        Ok(())
    }

    pub async fn dispatch(
        &self,
        run: &mut DispatcherRun,
        fabric_id: FabricId,
        cluster_id: ClusterId,
        non_switch: bool,
    ) -> Result<DispatchResult, StoreError> {
        let Some(cluster) = run.cluster(fabric_id, cluster_id).cloned() else {
            warn!(
                self.log,
                "cluster not part of this run";
                "fabric_id" => fabric_id.0,
                "cluster_id" => cluster_id.0,
            );
            return Ok(DispatchResult::NothingToDo);
        };
        let Some(call) = cluster.call.filtered(non_switch) else {
            return Ok(DispatchResult::NothingToDo);
        };
        let log = self.log.new(o!(
            "master_job" => run.job.id().to_string(),
            "cluster" => cluster.name.clone(),
            "fabric_id" => fabric_id.0,
            "non_switch" => non_switch,
        ));
        let primary_target = call.target_types[0];
        let category = call.patch_category();

        let mut take_lock = self.config.fabric_locking;
        if self.config.fabric_locking && call.targets_cluster_visible() {
            let running = self.store.active_operations(&cluster.name).await?;
            match running.as_slice() {
                [] => {}
                [row]
                    if is_compatible(
                        row,
                        primary_target,
                        call.operation,
                        category,
                    ) =>
                {
                    info!(
                        log,
                        "compatible operation in progress; not taking the \
                         fabric lock";
                        "running_target" => %row.target_type,
                        "running_operation" => %row.operation,
                    );
                    take_lock = false;
                }
                rows => {
                    warn!(
                        log,
                        "cluster already has an operation in progress";
                        "running" => rows.len(),
                    );
                    return Ok(DispatchResult::Rejected(
                        ChildWorkUnit::never_started(
                            &cluster,
                            call,
                            non_switch,
                            BUSY_CLUSTER_DETAIL,
                        ),
                    ));
                }
            }
        } else if !self.config.fabric_locking {
            debug!(log, "resetting fabric lock state");
            self.store.reset_fabric_entry(fabric_id).await?;
            self.reload_fabric(run, fabric_id).await?;
        } else {
            // The row may carry another job's lock, so it is only reloaded.
            self.reload_fabric(run, fabric_id).await?;
        }

        let mut lock_acquired = false;
        if take_lock {
            let request =
                FabricLockRequest::Lock { kind: LockKind::for_work(non_switch) };
            let locked = self
                .store
                .manage_fabric_lock(fabric_id, cluster.id, request)
                .await?;
            self.reload_fabric(run, fabric_id).await?;
            if !locked {
                warn!(log, "fabric lock not available; will retry later");
                return Ok(DispatchResult::LockNotAcquired);
            }
            lock_acquired = true;
        }

        let master_job = run.job.id();
        self.store
            .set_active_operation(&ActiveOperationRow {
                cluster_name: cluster.name.clone(),
                master_job,
                target_type: primary_target,
                patch_category: category,
                operation: call.operation,
                style: call.style,
            })
            .await?;

        let request = WorkerRequest {
            master_job,
            fabric_id,
            cluster_id: cluster.id,
            cluster_name: cluster.name.clone(),
            call: call.clone(),
        };
        let response = match self.worker.submit(&request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    log,
                    "failed to submit work to the worker";
                    "error" => InlineErrorChain::new(&err),
                );
                WorkerResponse {
                    status: RequestStatus::Done,
                    correlation_id: ChildRequestUuid::nil(),
                    error: Some(NEVER_STARTED_ERROR.to_string()),
                    error_detail: Some(InlineErrorChain::new(&err).to_string()),
                }
            }
        };
        let correlation_id = response.correlation_id;
        let log = log.new(o!("child_request" => correlation_id.to_string()));

        let failed = response
            .error
            .as_deref()
            .is_some_and(|error| error != WORKER_ERROR_UNDEF);
        let mut status = response.status;
        if failed {
            warn!(
                log,
                "worker reported an error; undoing dispatch";
                "error" => response.error.as_deref().unwrap_or(""),
            );
            if !non_switch {
                self.store.set_fabric_do_switch(fabric_id, false).await?;
            }
            if lock_acquired {
                self.store
                    .manage_fabric_lock(
                        fabric_id,
                        cluster.id,
                        FabricLockRequest::Unlock,
                    )
                    .await?;
                lock_acquired = false;
            }
            self.store
                .delete_active_operation(&cluster.name, primary_target)
                .await?;
            self.reload_fabric(run, fabric_id).await?;
            if correlation_id.is_nil() {
                status = RequestStatus::Done;
            }
        }

        self.store
            .insert_child_request(master_job, correlation_id, RequestStatus::Undef)
            .await?;

        let (error, error_detail) = match response.error {
            None => {
                if let Err(err) =
                    self.log_area.link_worker_log(&run.job_dir, correlation_id)
                {
                    warn!(
                        log,
                        "failed to link worker log";
                        "error" => InlineErrorChain::new(&err),
                    );
                }
                (WORKER_ERROR_UNDEF.to_string(), WORKER_ERROR_UNDEF.to_string())
            }
            Some(error) => (error, response.error_detail.unwrap_or_default()),
        };
        info!(log, "dispatched unit"; "status" => %status, "lock" => lock_acquired);

        Ok(DispatchResult::Dispatched(ChildWorkUnit {
            correlation_id,
            status,
            error,
            error_detail,
            fabric_id,
            cluster_id: cluster.id,
            cluster_name: cluster.name,
            non_switch,
            lock_acquired,
            primary_target,
            call,
        }))
    }

    /// Replaces this run's copy of a fabric row with the stored one.
    pub async fn reload_fabric(
        &self,
        run: &mut DispatcherRun,
        id: FabricId,
    ) -> Result<(), StoreError> {
        let row =
            self.store.fabric_by_id(id).await?.ok_or(StoreError::NoSuchFabric(id))?;
        if let Some(fabric) = run.fabric_mut(id) {
            fabric.row = row;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::Cluster;
    use patch_dispatcher_types::descriptor::{
        BackupMode, CallDescriptor, ClusterRef, Operation, OperationStyle,
        PatchFiles, PayloadType, TargetEnv, TargetType,
    };
    use patch_dispatcher_types::fabric::{FabricLockState, FabricRow};

    fn call(targets: &[TargetType]) -> CallDescriptor {
        CallDescriptor {
            operation: Operation::Patch,
            payload: PayloadType::Release,
            style: OperationStyle::Rolling,
            backup_mode: BackupMode::Unspecified,
            target_types: targets.to_vec(),
            target_version: "24.1.2.0.0.250212".to_string(),
            enable_plugins: false,
            plugin_types: None,
            retry: false,
            request_id: "r".to_string(),
            additional_options: Default::default(),
            compute_node_list: Vec::new(),
            storage_node_list: Vec::new(),
            download_files: Vec::new(),
            patch_files: PatchFiles::default(),
            cluster: ClusterRef {
                topology: "t".to_string(),
                target_env: TargetEnv::Test,
                rack_name: "r".to_string(),
            },
        }
    }

    fn fabric(
        id: i64,
        do_switch: bool,
        lock: FabricLockState,
        clusters: Vec<(i64, Vec<TargetType>)>,
    ) -> Fabric {
        Fabric {
            row: FabricRow {
                id: FabricId(id),
                hash: format!("hash-{id}"),
                do_switch,
                lock,
            },
            switches: Vec::new(),
            clusters: clusters
                .into_iter()
                .map(|(cid, targets)| Cluster {
                    id: ClusterId(cid),
                    name: format!("cluster-{cid}"),
                    fabric_id: FabricId(id),
                    call: call(&targets),
                    switches: Vec::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn one_unit_without_fabric_locking() {
        let fabrics = vec![fabric(
            1,
            true,
            FabricLockState::default(),
            vec![(1, vec![TargetType::Dom0]), (2, vec![TargetType::IbSwitch])],
        )];
        assert_eq!(count_expected_units(&fabrics, false), 1);
    }

    #[test]
    fn non_switch_units_per_cluster() {
        let fabrics = vec![
            fabric(
                1,
                false,
                FabricLockState::default(),
                vec![
                    (1, vec![TargetType::Dom0, TargetType::Domu]),
                    (2, vec![TargetType::Cell]),
                ],
            ),
            fabric(
                2,
                false,
                FabricLockState::default(),
                vec![(3, vec![TargetType::Domu])],
            ),
        ];
        assert_eq!(count_expected_units(&fabrics, true), 3);
    }

    #[test]
    fn guest_plugins_alone_add_no_unit() {
        let fabrics = vec![fabric(
            1,
            false,
            FabricLockState::default(),
            vec![
                (1, vec![TargetType::Dom0Domu]),
                (2, vec![TargetType::Dom0, TargetType::Dom0Domu]),
            ],
        )];
        assert_eq!(count_expected_units(&fabrics, true), 1);
    }

    #[test]
    fn switch_work_stops_the_count() {
        // The switch cluster on the first fabric ends counting, so the
        // second fabric's non-switch work is not included.
        let fabrics = vec![
            fabric(
                1,
                true,
                FabricLockState::default(),
                vec![
                    (1, vec![TargetType::Cell]),
                    (2, vec![TargetType::Cell, TargetType::IbSwitch]),
                    (3, vec![TargetType::Domu]),
                ],
            ),
            fabric(
                2,
                false,
                FabricLockState::default(),
                vec![(4, vec![TargetType::Dom0])],
            ),
        ];
        assert_eq!(count_expected_units(&fabrics, true), 2);
    }

    #[test]
    fn conflicting_busy_fabric_refuses() {
        let mut held = FabricLockState::default();
        assert!(held.try_lock(ClusterId(9), LockKind::NonSwitch));
        let fabrics = vec![fabric(
            1,
            true,
            held.clone(),
            vec![(1, vec![TargetType::RoceSwitch])],
        )];
        assert_eq!(count_expected_units(&fabrics, true), 0);

        // Non-switch work can share a fabric with other non-switch work.
        let fabrics =
            vec![fabric(1, false, held, vec![(1, vec![TargetType::Domu])])];
        assert_eq!(count_expected_units(&fabrics, true), 1);

        let mut switch_held = FabricLockState::default();
        assert!(switch_held.try_lock(ClusterId(9), LockKind::Switch));
        let fabrics = vec![fabric(
            1,
            true,
            switch_held,
            vec![(1, vec![TargetType::Cell])],
        )];
        assert_eq!(count_expected_units(&fabrics, true), 0);
    }
}
