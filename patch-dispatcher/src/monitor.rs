// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives a run from its first dispatch wave to a verdict.
//!
//! The worker has no way to push status to us, so the monitor polls the lock
//! store on a fixed tick. Each tick it hands out whatever work became
//! dispatchable, refreshes every pending unit, and publishes progress. It
//! stops once every expected unit is done, the run times out, or it is
//! cancelled.

use crate::config::MonitorConfig;
use crate::dispatch::DispatchCoordinator;
use crate::outcome::Verdict;
use crate::run::{ChildWorkUnit, DispatcherRun};
use crate::store::{LockStore, StoreError};
use patch_dispatcher_types::descriptor::{
    CallDescriptor, Operation, OperationStyle, TargetType,
};
use patch_dispatcher_types::fabric::{ClusterId, FabricId, FabricLockRequest};
use patch_dispatcher_types::request::{
    PatchListRow, RequestStatus, WORKER_ERROR_NONE, WORKER_ERROR_UNDEF,
    WORKER_NO_ACTION_REQUIRED,
};
use patch_dispatcher_types::{ChildRequestUuid, ResultCode};
use slog::{debug, error, info, o, warn, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const TIMEOUT_SUGGESTION: &str = "Patch request monitor timed out. Admin \
                                  should check for individual requests status.";
const CANCELLED_SUGGESTION: &str =
    "Patch request monitor was cancelled before all requests finished.";
const ONE_OR_MORE_FAILED: &str =
    "Dispatcher - One or more individual patch requests failed.";
const DID_NOT_START: &str = "Dispatcher - Patch operation did not start";
const NO_ACTION_REQUIRED: &str = "Dispatcher - No Action Required.";

/// How long the monitor waits for the run's work before giving up.
///
/// Rolling cell patches and rollbacks take longer the more storage nodes
/// they cover, so their budget is scaled by node count. The longest budget
/// over all calls wins.
pub fn run_timeout(config: &MonitorConfig, calls: &[CallDescriptor]) -> Duration {
    calls
        .iter()
        .map(|call| {
            let cells = call.storage_node_list.len();
            let scaled = call.targets(TargetType::Cell)
                && matches!(
                    call.style,
                    OperationStyle::Rolling | OperationStyle::Auto
                )
                && matches!(call.operation, Operation::Patch | Operation::Rollback);
            let multiplier = if !scaled {
                1
            } else if cells >= config.cell_large_threshold {
                config.cell_large_multiplier
            } else if cells >= config.cell_medium_threshold {
                config.cell_medium_multiplier
            } else {
                1
            };
            config.operation_timeout * multiplier + config.timeout_margin
        })
        .max()
        .unwrap_or(config.operation_timeout + config.timeout_margin)
}

pub struct RequestMonitor {
    log: Logger,
    store: Arc<dyn LockStore>,
    coordinator: Arc<DispatchCoordinator>,
    config: MonitorConfig,
    cancel: CancellationToken,
}

impl RequestMonitor {
    pub fn new(
        log: &Logger,
        store: Arc<dyn LockStore>,
        coordinator: Arc<DispatchCoordinator>,
        config: MonitorConfig,
        cancel: CancellationToken,
    ) -> Self {
        let log = log.new(o!("component" => "RequestMonitor"));
        RequestMonitor { log, store, coordinator, config, cancel }
    }

    /// Runs the monitor loop to a verdict.
    ///
    /// Only a failure of the lock store itself is an `Err`. Locks held by
    /// work still pending at a timeout are left in place; a later run's
    /// stuck-lock detection releases them.
    pub async fn monitor(
        &self,
        run: &mut DispatcherRun,
    ) -> Result<Verdict, StoreError> {
        let log = self.log.new(o!("master_job" => run.job.id().to_string()));
        let timeout = run_timeout(&self.config, &run.calls);
        info!(
            log,
            "starting patch request monitor";
            "expected" => run.expected,
            "timeout" => ?timeout,
        );

        let start = Instant::now();
        let mut ticks: u32 = 0;
        loop {
            if run.sent() < run.expected {
                self.send_pending_work(&log, run).await?;
            }
            self.poll(&log, run).await?;
            self.publish_progress(&log, run).await?;

            if ticks == 0 {
                for unit in &run.pending {
                    info!(
                        log,
                        "child request in progress";
                        "child_request" => %unit.correlation_id,
                        "cluster" => &unit.cluster_name,
                    );
                }
            }
            if ticks % self.config.status_log_every_ticks.max(1) == 0 {
                info!(
                    log,
                    "monitor status";
                    "done" => run.done.len(),
                    "pending" => run.pending.len(),
                    "expected" => run.expected,
                );
            }

            if run.is_complete() {
                self.dump(&log, run);
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!(log, "patch request monitor cancelled");
                    self.dump(&log, run);
                    return Ok(Verdict::new(
                        ResultCode::MonitorException,
                        CANCELLED_SUGGESTION,
                    ));
                }
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }
            ticks = ticks.wrapping_add(1);

            if start.elapsed() >= timeout {
                error!(
                    log,
                    "patch request monitor timed out";
                    "elapsed" => ?start.elapsed(),
                );
                self.dump(&log, run);
                return Ok(Verdict::new(
                    ResultCode::RequestTimeout,
                    TIMEOUT_SUGGESTION,
                ));
            }
        }

        self.store.delete_active_operations_for_job(run.job.id()).await?;
        self.aggregate(&log, run).await
    }

    /// Hands out work that became dispatchable since the last tick: deferred
    /// non-switch work first, then switch work for idle fabrics.
    async fn send_pending_work(
        &self,
        log: &Logger,
        run: &mut DispatcherRun,
    ) -> Result<(), StoreError> {
        let ids: Vec<FabricId> = run.fabrics.iter().map(|f| f.id()).collect();
        for id in &ids {
            self.coordinator.reload_fabric(run, *id).await?;
        }

        for (fabric_id, cluster_id) in std::mem::take(&mut run.deferred) {
            if run.sent() >= run.expected {
                break;
            }
            debug!(
                log,
                "retrying deferred work";
                "fabric_id" => fabric_id.0,
                "cluster_id" => cluster_id.0,
            );
            self.coordinator.send(run, fabric_id, cluster_id, true).await?;
        }

        for id in ids {
            if run.sent() >= run.expected {
                break;
            }
            let Some(cluster) = self.switch_candidate(run, id) else {
                continue;
            };
            let (cluster_id, name) = cluster;
            self.wait_for_cluster_registry(log, &name).await?;
            info!(
                log,
                "dispatching switch work";
                "fabric_id" => id.0,
                "cluster" => &name,
            );
            self.coordinator.send(run, id, cluster_id, false).await?;
        }
        Ok(())
    }

    /// The cluster to send a fabric's switch work through, if the fabric is
    /// ready for it.
    fn switch_candidate(
        &self,
        run: &DispatcherRun,
        id: FabricId,
    ) -> Option<(ClusterId, String)> {
        let fabric = run.fabric(id)?;
        if run.fabric_has_pending(id)
            || fabric.row.lock.lock_count != 0
            || !fabric.row.do_switch
            || run.switch_sent(id)
            || run.deferred.iter().any(|(f, _)| *f == id)
        {
            return None;
        }
        fabric.first_switch_cluster().map(|c| (c.id, c.name.clone()))
    }

    /// Gives a cluster's registry entry a few chances to go away. An entry
    /// may outlive the fabric lock it belonged to for a short while.
    async fn wait_for_cluster_registry(
        &self,
        log: &Logger,
        cluster: &str,
    ) -> Result<(), StoreError> {
        for attempt in 1..=self.config.stuck_cluster_retries {
            if !self.store.check_registry_entry(cluster).await? {
                return Ok(());
            }
            info!(
                log,
                "cluster is busy; retrying";
                "cluster" => cluster,
                "attempt" => attempt,
                "delay" => ?self.config.stuck_cluster_retry_delay,
            );
            tokio::time::sleep(self.config.stuck_cluster_retry_delay).await;
        }
        Ok(())
    }

    /// Refreshes every pending unit from the store and files the finished
    /// ones under `done`.
    async fn poll(
        &self,
        log: &Logger,
        run: &mut DispatcherRun,
    ) -> Result<(), StoreError> {
        let job = run.job.id();
        let listed: BTreeMap<ChildRequestUuid, RequestStatus> = self
            .store
            .list_child_requests(job)
            .await?
            .into_iter()
            .map(|row| (row.correlation_id, row.status))
            .collect();

        for mut unit in std::mem::take(&mut run.pending) {
            if !unit.correlation_id.is_nil() {
                if let Some(row) =
                    self.store.child_request(unit.correlation_id).await?
                {
                    unit.status = row.status;
                    unit.error = row.error;
                    unit.error_detail = row.error_detail;
                }
            }

            let finished = unit.status.is_done();
            if finished && !unit.correlation_id.is_nil() {
                self.clear_stuck_lock(log, run, &unit).await?;
            }

            let status = list_status(log, &unit);
            if listed.get(&unit.correlation_id).is_some_and(|s| *s != status) {
                self.store
                    .update_child_request_status(job, unit.correlation_id, status)
                    .await?;
            }

            if finished {
                debug!(
                    log,
                    "child request finished";
                    "child_request" => %unit.correlation_id,
                    "cluster" => &unit.cluster_name,
                    "error" => &unit.error,
                );
                run.done.push(unit);
            } else {
                run.pending.push(unit);
            }
        }
        Ok(())
    }

    /// Releases what a finished unit left behind if its fabric still lists
    /// its cluster as busy.
    async fn clear_stuck_lock(
        &self,
        log: &Logger,
        run: &mut DispatcherRun,
        unit: &ChildWorkUnit,
    ) -> Result<(), StoreError> {
        self.coordinator.reload_fabric(run, unit.fabric_id).await?;
        let stuck = run
            .fabric(unit.fabric_id)
            .is_some_and(|fabric| fabric.holds(unit.cluster_id));
        if !stuck {
            return Ok(());
        }
        warn!(
            log,
            "fabric lock outlived its request; cleaning it up";
            "fabric_id" => unit.fabric_id.0,
            "cluster" => &unit.cluster_name,
        );
        if !unit.non_switch {
            self.store.set_fabric_do_switch(unit.fabric_id, false).await?;
        }
        if unit.lock_acquired {
            self.store
                .manage_fabric_lock(
                    unit.fabric_id,
                    unit.cluster_id,
                    FabricLockRequest::Unlock,
                )
                .await?;
        } else {
            warn!(
                log,
                "not releasing fabric lock this request did not take";
                "cluster" => &unit.cluster_name,
            );
        }
        self.store
            .delete_active_operation(&unit.cluster_name, unit.primary_target)
            .await?;
        self.coordinator.reload_fabric(run, unit.fabric_id).await
    }

    async fn publish_progress(
        &self,
        log: &Logger,
        run: &mut DispatcherRun,
    ) -> Result<(), StoreError> {
        let (pending, done, expected) =
            (run.pending.len(), run.done.len(), run.expected);
        let job = run.job.id();
        let reporting = run.job.is_reporting();
        let status = run.job.monitor_progress(pending, done, expected);
        if reporting {
            self.store.update_job_status(job, status).await?;
        } else {
            debug!(log, "progress"; "status" => status);
        }
        Ok(())
    }

    fn dump(&self, log: &Logger, run: &DispatcherRun) {
        for (state, unit) in run
            .done
            .iter()
            .map(|u| ("done", u))
            .chain(run.pending.iter().map(|u| ("pending", u)))
        {
            info!(
                log,
                "child request";
                "state" => state,
                "child_request" => %unit.correlation_id,
                "cluster" => &unit.cluster_name,
                "fabric_id" => unit.fabric_id.0,
                "non_switch" => unit.non_switch,
                "status" => %unit.status,
                "error" => &unit.error,
                "error_detail" => &unit.error_detail,
                "targets" => ?unit.call.target_types,
            );
        }
    }

    /// Turns the job's request list into the run's verdict.
    async fn aggregate(
        &self,
        log: &Logger,
        run: &DispatcherRun,
    ) -> Result<Verdict, StoreError> {
        let job = run.job.id();
        let rows = self.store.list_child_requests(job).await?;
        match verdict_from_rows(&rows) {
            RowsVerdict::Reported { row, code, message } => {
                info!(
                    log,
                    "child request reported an error";
                    "child_request" => %row,
                    "code" => %code,
                );
                let error = patch_dispatcher_types::request::ChildError {
                    code: code.to_string(),
                    message: message.clone(),
                };
                self.store.update_child_request_error(job, row, &error).await?;
                return Ok(Verdict::new(code, message));
            }
            RowsVerdict::Failed(verdict) => return Ok(verdict),
            RowsVerdict::Finished { no_action_required } => {
                if run.done.iter().any(ChildWorkUnit::never_started_sentinel) {
                    return Ok(Verdict::new(
                        ResultCode::OperationDidNotStart,
                        DID_NOT_START,
                    ));
                }
                if no_action_required {
                    return Ok(Verdict::new(
                        ResultCode::Success,
                        NO_ACTION_REQUIRED,
                    ));
                }
            }
        }
        Ok(Verdict::success())
    }
}

/// The status a unit's request list row should carry.
fn list_status(log: &Logger, unit: &ChildWorkUnit) -> RequestStatus {
    let error = unit.error.trim();
    if error == WORKER_ERROR_UNDEF || error == WORKER_ERROR_NONE {
        return unit.status.clone();
    }
    if error == WORKER_NO_ACTION_REQUIRED {
        info!(
            log,
            "no action required";
            "child_request" => %unit.correlation_id,
        );
        RequestStatus::NoActionRequired
    } else {
        RequestStatus::Failed
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RowsVerdict {
    /// A child wrote a report with a non-success code.
    Reported { row: ChildRequestUuid, code: ResultCode, message: String },
    Failed(Verdict),
    Finished { no_action_required: bool },
}

fn verdict_from_rows(rows: &[PatchListRow]) -> RowsVerdict {
    let mut latest: Option<&RequestStatus> = None;
    for row in rows {
        if let Some(report) = &row.report {
            let code = ResultCode::from_code(report.code.trim());
            if !report.code.trim().is_empty() && !code.is_success() {
                return RowsVerdict::Reported {
                    row: row.correlation_id,
                    code,
                    message: report.message.clone(),
                };
            }
        }
        match &row.status {
            RequestStatus::Failed => {
                let verdict = match &row.error {
                    Some(error)
                        if ResultCode::is_patching_code(&error.code)
                            && !error.message.is_empty() =>
                    {
                        Verdict::new(
                            ResultCode::from_code(&error.code),
                            error.message.clone(),
                        )
                    }
                    _ => Verdict::new(
                        ResultCode::OneOrMoreRequestsFailed,
                        ONE_OR_MORE_FAILED,
                    ),
                };
                return RowsVerdict::Failed(verdict);
            }
            RequestStatus::Pending => {
                return RowsVerdict::Failed(Verdict::new(
                    ResultCode::OneOrMoreRequestsFailed,
                    ONE_OR_MORE_FAILED,
                ));
            }
            RequestStatus::NoActionRequired if latest.is_none() => {
                latest = Some(&row.status);
            }
            RequestStatus::Done => latest = Some(&row.status),
            _ => {}
        }
    }
    RowsVerdict::Finished {
        no_action_required: latest == Some(&RequestStatus::NoActionRequired),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use patch_dispatcher_types::descriptor::{
        BackupMode, ClusterRef, PatchFiles, PayloadType, TargetEnv,
    };
    use patch_dispatcher_types::request::ChildError;
    use patch_dispatcher_types::MasterJobUuid;

    fn call(
        targets: &[TargetType],
        operation: Operation,
        style: OperationStyle,
        cells: usize,
    ) -> CallDescriptor {
        CallDescriptor {
            operation,
            payload: PayloadType::Release,
            style,
            backup_mode: BackupMode::Unspecified,
            target_types: targets.to_vec(),
            target_version: "24.1.2.0.0.250212".to_string(),
            enable_plugins: false,
            plugin_types: None,
            retry: false,
            request_id: "r".to_string(),
            additional_options: Default::default(),
            compute_node_list: Vec::new(),
            storage_node_list: (0..cells).map(|i| format!("cell{i}")).collect(),
            download_files: Vec::new(),
            patch_files: PatchFiles::default(),
            cluster: ClusterRef {
                topology: "t".to_string(),
                target_env: TargetEnv::Test,
                rack_name: "r".to_string(),
            },
        }
    }

    #[test]
    fn timeout_scales_with_cell_count() {
        let config = MonitorConfig {
            operation_timeout: Duration::from_secs(100),
            timeout_margin: Duration::from_secs(10),
            ..Default::default()
        };
        let rolling_cells = |n| {
            call(&[TargetType::Cell], Operation::Patch, OperationStyle::Rolling, n)
        };

        assert_eq!(
            run_timeout(&config, &[rolling_cells(5)]),
            Duration::from_secs(110)
        );
        assert_eq!(
            run_timeout(&config, &[rolling_cells(6)]),
            Duration::from_secs(210)
        );
        assert_eq!(
            run_timeout(&config, &[rolling_cells(9), rolling_cells(12)]),
            Duration::from_secs(310)
        );

        // Only rolling or auto cell patches and rollbacks are scaled.
        let non_rolling = call(
            &[TargetType::Cell],
            Operation::Patch,
            OperationStyle::NonRolling,
            12,
        );
        let precheck = call(
            &[TargetType::Cell],
            Operation::PatchPrereqCheck,
            OperationStyle::Auto,
            12,
        );
        let guests =
            call(&[TargetType::Domu], Operation::Rollback, OperationStyle::Auto, 12);
        assert_eq!(
            run_timeout(&config, &[non_rolling, precheck, guests]),
            Duration::from_secs(110)
        );
    }

    fn row(status: RequestStatus) -> PatchListRow {
        PatchListRow {
            master_job: MasterJobUuid::nil(),
            correlation_id: ChildRequestUuid::new_v4(),
            status,
            report: None,
            error: None,
        }
    }

    #[test]
    fn rows_to_verdict() {
        let done = row(RequestStatus::Done);
        let nar = row(RequestStatus::NoActionRequired);
        assert_eq!(
            verdict_from_rows(&[done.clone(), nar.clone()]),
            RowsVerdict::Finished { no_action_required: false }
        );
        assert_eq!(
            verdict_from_rows(&[nar.clone(), nar.clone()]),
            RowsVerdict::Finished { no_action_required: true }
        );

        let mut failed = row(RequestStatus::Failed);
        assert_eq!(
            verdict_from_rows(&[done.clone(), failed.clone()]),
            RowsVerdict::Failed(Verdict::new(
                ResultCode::OneOrMoreRequestsFailed,
                ONE_OR_MORE_FAILED
            ))
        );
        failed.error = Some(ChildError {
            code: "0x03010022".to_string(),
            message: "cell patch failed".to_string(),
        });
        assert_eq!(
            verdict_from_rows(&[failed.clone()]),
            RowsVerdict::Failed(Verdict::new(
                ResultCode::Worker("0x03010022".to_string()),
                "cell patch failed"
            ))
        );

        // A report with an error wins over the status of the same row.
        let mut reported = row(RequestStatus::Done);
        reported.report = Some(ChildError {
            code: "0x03010099".to_string(),
            message: "from the report".to_string(),
        });
        let id = reported.correlation_id;
        assert_eq!(
            verdict_from_rows(&[reported, failed]),
            RowsVerdict::Reported {
                row: id,
                code: ResultCode::Worker("0x03010099".to_string()),
                message: "from the report".to_string(),
            }
        );

        let mut clean = row(RequestStatus::NoActionRequired);
        clean.report = Some(ChildError {
            code: "0x00000000".to_string(),
            message: String::new(),
        });
        assert_eq!(
            verdict_from_rows(&[clean]),
            RowsVerdict::Finished { no_action_required: true }
        );
    }
}
