// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs one master job from request document to verdict.

use crate::artifacts::ArtifactStore;
use crate::config::DispatcherConfig;
use crate::dispatch::DispatchCoordinator;
use crate::log_area::{LogArea, LogAreaError};
use crate::master_lock::MasterLockManager;
use crate::monitor::RequestMonitor;
use crate::outcome::{DispatchOutcome, Failure, Verdict};
use crate::payload::{PatchRequest, PayloadResolver};
use crate::preflight;
use crate::registry::{FabricClusterRegistry, PopulateError};
use crate::report::DispatcherReport;
use crate::run::{DispatchStep, DispatcherRun, MasterJob};
use crate::store::{LockStore, StoreError};
use crate::worker::{PatchWorker, TopologyProvider};
use patch_dispatcher_types::ResultCode;
use slog::{error, info, o, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const SYSTEM_BUSY: &str =
    "System is busy. Please retry the operation after some time.";
const PARALLEL_SWITCH_NON_SWITCH: &str =
    "Parallel patching on an IBSwitch and a non-IBSwitch target not allowed.";
const NO_CLUSTERS: &str = "Patching child request to Exacloud is not created \
                           due to the absence of cluster details introduced \
                           by some fabric changes";

/// A failure that prevented the dispatcher from reaching any verdict.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    LogArea(#[from] LogAreaError),
}

pub struct PatchDispatcher {
    log: Logger,
    config: DispatcherConfig,
    store: Arc<dyn LockStore>,
    artifacts: Arc<dyn ArtifactStore>,
    log_area: Arc<dyn LogArea>,
    resolver: PayloadResolver,
    registry: FabricClusterRegistry,
    coordinator: Arc<DispatchCoordinator>,
    master_lock: MasterLockManager,
    cancel: CancellationToken,
}

impl PatchDispatcher {
    pub fn new(
        log: &Logger,
        config: DispatcherConfig,
        store: Arc<dyn LockStore>,
        worker: Arc<dyn PatchWorker>,
        topology: Arc<dyn TopologyProvider>,
        artifacts: Arc<dyn ArtifactStore>,
        log_area: Arc<dyn LogArea>,
    ) -> Self {
        let log = log.new(o!("component" => "PatchDispatcher"));
        let resolver = PayloadResolver::new(&log, artifacts.clone());
        let registry =
            FabricClusterRegistry::new(&log, store.clone(), topology);
        let coordinator = Arc::new(DispatchCoordinator::new(
            &log,
            store.clone(),
            worker,
            log_area.clone(),
            config.dispatch.clone(),
        ));
        let master_lock = MasterLockManager::new(
            &log,
            store.clone(),
            config.master_lock.clone(),
        );
        PatchDispatcher {
            log,
            config,
            store,
            artifacts,
            log_area,
            resolver,
            registry,
            coordinator,
            master_lock,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops a running monitor at its next tick.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs one patch request to completion.
    ///
    /// `job` identifies the caller's master job. Without one, a local job is
    /// made up and progress is only logged.
    pub async fn start_patch_request(
        &self,
        job: Option<MasterJob>,
        request: &serde_json::Value,
    ) -> Result<DispatchOutcome, DispatcherError> {
        let job = job.unwrap_or_else(MasterJob::local);
        let log = self.log.new(o!("master_job" => job.id().to_string()));

        info!(log, "step 1 of 5: creating log directory");
        let job_dir = self.log_area.create_job_dir(job.id())?;
        let mut run = DispatcherRun::new(job, job_dir, Vec::new());

        info!(log, "step 2 of 5: parsing request");
        self.enter_step(&mut run, DispatchStep::ParseJsonFile).await?;
        let request: PatchRequest =
            match serde_json::from_value(request.clone()) {
                Ok(request) => request,
                Err(err) => {
                    let failure = Failure::incorrect_input(&err);
                    return Ok(self.finish(&log, &run, failure.into()));
                }
            };
        run.calls = match self.resolver.parse(&request) {
            Ok(calls) => calls,
            Err(failure) => return Ok(self.finish(&log, &run, failure.into())),
        };

        self.enter_step(&mut run, DispatchStep::DownloadPatchFiles).await?;
        if let Err(failure) = preflight::check_space(
            &log,
            self.log_area.as_ref(),
            self.config.log_area.working_space_mb,
            run.calls.len(),
        )? {
            return Ok(self.finish(&log, &run, failure.into()));
        }
        if let Err(failure) = preflight::check_artifacts(
            &log,
            self.artifacts.as_ref(),
            &run.calls,
        ) {
            return Ok(self.finish(&log, &run, failure.into()));
        }

        info!(log, "step 3 of 5: populating fabric and cluster tables");
        self.enter_step(&mut run, DispatchStep::PopulateTables).await?;
        let job = run.job.clone();
        let run_ref = &mut run;
        let log_ref = &log;
        let locked = self
            .master_lock
            .run_locked(&job, || async move {
                self.populate_and_dispatch(log_ref, run_ref).await
            })
            .await?;
        info!(log, "step 4 of 5: released master lock");
        match locked {
            None => {
                let verdict = Verdict::new(ResultCode::SystemBusy, SYSTEM_BUSY);
                return Ok(self.finish(&log, &run, verdict));
            }
            Some(Err(err)) => return Err(err),
            Some(Ok(Err(failure))) => {
                return Ok(self.finish(&log, &run, failure.into()));
            }
            Some(Ok(Ok(()))) => {}
        }

        info!(log, "step 5 of 5: monitoring requests");
        self.enter_step(&mut run, DispatchStep::PatchMonitor).await?;
        let monitor = RequestMonitor::new(
            &log,
            self.store.clone(),
            self.coordinator.clone(),
            self.config.monitor.clone(),
            self.cancel.clone(),
        );
        let verdict = monitor.monitor(&mut run).await?;
        Ok(self.finish(&log, &run, verdict))
    }

    /// The part of a run that needs the master lock: registering fabrics and
    /// clusters and sending the first wave of work.
    async fn populate_and_dispatch(
        &self,
        log: &Logger,
        run: &mut DispatcherRun,
    ) -> Result<Result<(), Failure>, DispatcherError> {
        if let Err(failure) = self.populate(log, run).await? {
            return Ok(Err(failure));
        }
        if run.cluster_count() == 0 {
            warn!(
                log,
                "no cluster could be registered; cleaning fabric tables and \
                 retrying"
            );
            self.store.cleanup_switch_fabric_tables().await?;
            run.fabrics.clear();
            if let Err(failure) = self.populate(log, run).await? {
                return Ok(Err(failure));
            }
        }
        if run.cluster_count() == 0 {
            error!(log, "no cluster could be registered");
            return Ok(Err(Failure::new(
                ResultCode::ChildRequestCreationFailed,
                NO_CLUSTERS,
            )));
        }

        run.expected = self.coordinator.expected_count(&run.fabrics);
        if run.expected == 0 {
            return Ok(Err(Failure::new(
                ResultCode::ParallelSwitchNonSwitch,
                PARALLEL_SWITCH_NON_SWITCH,
            )));
        }

        info!(log, "sending non-switch work"; "expected" => run.expected);
        self.coordinator.send_initial_wave(run).await?;
        Ok(Ok(()))
    }

    async fn populate(
        &self,
        log: &Logger,
        run: &mut DispatcherRun,
    ) -> Result<Result<(), Failure>, StoreError> {
        match self.registry.populate(&run.calls, &mut run.fabrics).await {
            Ok(()) => Ok(Ok(())),
            Err(PopulateError::Store(err)) => Err(err),
            Err(err @ PopulateError::InvalidSwitchData { .. }) => {
                error!(
                    log,
                    "switch discovery failed";
                    "error" => InlineErrorChain::new(&err),
                );
                Ok(Err(Failure::new(
                    ResultCode::InvalidSwitchData,
                    format!(
                        "Switch discovery returned invalid data. {}",
                        InlineErrorChain::new(&err)
                    ),
                )))
            }
        }
    }

    async fn enter_step(
        &self,
        run: &mut DispatcherRun,
        step: DispatchStep,
    ) -> Result<(), StoreError> {
        let job = run.job.id();
        let reporting = run.job.is_reporting();
        let status = run.job.enter_step(step, None);
        if reporting {
            self.store.update_job_status(job, status).await?;
        }
        Ok(())
    }

    fn finish(
        &self,
        log: &Logger,
        run: &DispatcherRun,
        verdict: Verdict,
    ) -> DispatchOutcome {
        let message = verdict.suggestion.as_deref().unwrap_or("");
        let report = DispatcherReport::for_run(run, verdict.code.clone(), message);
        if verdict.code.is_success() {
            info!(
                log,
                "patch request finished";
                "code" => %verdict.code,
                "suggestion" => message,
            );
        } else {
            error!(
                log,
                "patch request failed";
                "code" => %verdict.code,
                "suggestion" => message,
            );
        }
        DispatchOutcome {
            code: verdict.code,
            suggestion: verdict.suggestion,
            report,
        }
    }
}
