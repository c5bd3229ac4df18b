// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! State owned by a single master job for the length of one run.

use crate::registry::{Cluster, Fabric};
use camino::Utf8PathBuf;
use patch_dispatcher_types::descriptor::{CallDescriptor, TargetType};
use patch_dispatcher_types::fabric::{ClusterId, FabricId};
use patch_dispatcher_types::request::RequestStatus;
use patch_dispatcher_types::{ChildRequestUuid, MasterJobUuid};
use serde::Serialize;
use std::fmt;

/// Share of the progress bar covered by the steps before monitoring.
const SETUP_PERCENT: u32 = 15;

/// Identity of the master job a run belongs to.
#[derive(Clone, Debug)]
pub struct MasterJob {
    id: MasterJobUuid,
    worker: String,
    reporting: bool,
    status: String,
}

impl MasterJob {
    /// A job created by a caller that tracks its progress.
    pub fn new(id: MasterJobUuid, worker: impl Into<String>) -> MasterJob {
        MasterJob {
            id,
            worker: worker.into(),
            reporting: true,
            status: String::new(),
        }
    }

    /// A job synthesized for a caller that supplied none. Its progress is
    /// only logged.
    pub fn local() -> MasterJob {
        MasterJob {
            id: MasterJobUuid::new_v4(),
            worker: "local".to_string(),
            reporting: false,
            status: String::new(),
        }
    }

    pub fn id(&self) -> MasterJobUuid {
        self.id
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn is_reporting(&self) -> bool {
        self.reporting
    }

    /// The last progress string produced for this job.
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Records that `step` has been reached and returns the new progress
    /// string, `True:<pct>:<step>[-comment]`.
    pub fn enter_step(
        &mut self,
        step: DispatchStep,
        comment: Option<&str>,
    ) -> &str {
        self.status = match comment {
            Some(comment) => {
                format!("True:{}:{step}-{comment}", step.percent())
            }
            None => format!("True:{}:{step}", step.percent()),
        };
        &self.status
    }

    /// Records monitoring progress and returns the new progress string.
    ///
    /// Keeps the prefix and step of the current string and replaces the
    /// percentage and comment.
    pub fn monitor_progress(
        &mut self,
        pending: usize,
        done: usize,
        expected: usize,
    ) -> &str {
        let percent = if expected == 0 {
            SETUP_PERCENT
        } else {
            let share = (100 - SETUP_PERCENT) as usize * done / expected;
            SETUP_PERCENT + share as u32
        };
        let mut parts = self.status.splitn(3, ':');
        let prefix = parts.next().filter(|p| !p.is_empty()).unwrap_or("True");
        let _ = parts.next();
        let step = parts
            .next()
            .and_then(|rest| rest.split('-').next())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| DispatchStep::PatchMonitor.to_string());
        self.status = format!(
            "{prefix}:{percent}:{step}-pending[{pending}/{expected}]_\
             done[{done}/{expected}]"
        );
        &self.status
    }
}

/// The coarse steps a run goes through, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DispatchStep {
    ParseJsonFile,
    DownloadPatchFiles,
    PopulateTables,
    PatchMonitor,
}

impl DispatchStep {
    pub const ALL: [DispatchStep; 4] = [
        DispatchStep::ParseJsonFile,
        DispatchStep::DownloadPatchFiles,
        DispatchStep::PopulateTables,
        DispatchStep::PatchMonitor,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            DispatchStep::ParseJsonFile => "parse_json_file",
            DispatchStep::DownloadPatchFiles => "download_patch_files",
            DispatchStep::PopulateTables => "populate_tables",
            DispatchStep::PatchMonitor => "patch_monitor",
        }
    }

    /// Progress reported on entering this step.
    pub fn percent(&self) -> u32 {
        let index = Self::ALL.iter().position(|s| s == self).unwrap_or(0);
        SETUP_PERCENT * (index as u32 + 1) / Self::ALL.len() as u32
    }
}

impl fmt::Display for DispatchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work handed to the worker, or refused before it got there.
#[derive(Clone, Debug, Serialize)]
pub struct ChildWorkUnit {
    /// Nil when the unit never started.
    pub correlation_id: ChildRequestUuid,
    pub status: RequestStatus,
    pub error: String,
    pub error_detail: String,
    pub fabric_id: FabricId,
    pub cluster_id: ClusterId,
    pub cluster_name: String,
    /// Whether this is the non-switch half of the cluster's work.
    pub non_switch: bool,
    /// Whether dispatching this unit took a fabric lock that it owns.
    pub lock_acquired: bool,
    /// The target the unit's active-operation row was written for.
    pub primary_target: TargetType,
    /// What was sent, already restricted to this unit's targets.
    pub call: CallDescriptor,
}

impl ChildWorkUnit {
    /// A unit that was refused before reaching the worker.
    pub fn never_started(
        cluster: &Cluster,
        call: CallDescriptor,
        non_switch: bool,
        detail: impl Into<String>,
    ) -> ChildWorkUnit {
        let primary_target = call.target_types[0];
        ChildWorkUnit {
            correlation_id: ChildRequestUuid::nil(),
            status: RequestStatus::Done,
            error: patch_dispatcher_types::request::NEVER_STARTED_ERROR
                .to_string(),
            error_detail: detail.into(),
            fabric_id: cluster.fabric_id,
            cluster_id: cluster.id,
            cluster_name: cluster.name.clone(),
            non_switch,
            lock_acquired: false,
            primary_target,
            call,
        }
    }

    pub fn never_started_sentinel(&self) -> bool {
        self.correlation_id.is_nil()
    }
}

/// Everything one master job tracks between dispatch and the final verdict.
#[derive(Debug)]
pub struct DispatcherRun {
    pub job: MasterJob,
    pub job_dir: Utf8PathBuf,
    pub calls: Vec<CallDescriptor>,
    pub fabrics: Vec<Fabric>,
    pub pending: Vec<ChildWorkUnit>,
    pub done: Vec<ChildWorkUnit>,
    /// Non-switch work whose fabric lock was not available yet.
    pub deferred: Vec<(FabricId, ClusterId)>,
    pub expected: usize,
}

impl DispatcherRun {
    pub fn new(
        job: MasterJob,
        job_dir: Utf8PathBuf,
        calls: Vec<CallDescriptor>,
    ) -> DispatcherRun {
        DispatcherRun {
            job,
            job_dir,
            calls,
            fabrics: Vec::new(),
            pending: Vec::new(),
            done: Vec::new(),
            deferred: Vec::new(),
            expected: 0,
        }
    }

    /// Units handed out so far, finished or not.
    pub fn sent(&self) -> usize {
        self.pending.len() + self.done.len()
    }

    pub fn is_complete(&self) -> bool {
        self.done.len() >= self.expected
    }

    pub fn fabric(&self, id: FabricId) -> Option<&Fabric> {
        self.fabrics.iter().find(|f| f.row.id == id)
    }

    pub fn fabric_mut(&mut self, id: FabricId) -> Option<&mut Fabric> {
        self.fabrics.iter_mut().find(|f| f.row.id == id)
    }

    pub fn cluster(
        &self,
        fabric: FabricId,
        cluster: ClusterId,
    ) -> Option<&Cluster> {
        self.fabric(fabric)?.clusters.iter().find(|c| c.id == cluster)
    }

    pub fn cluster_count(&self) -> usize {
        self.fabrics.iter().map(|f| f.clusters.len()).sum()
    }

    pub fn fabric_has_pending(&self, id: FabricId) -> bool {
        self.pending.iter().any(|unit| unit.fabric_id == id)
    }

    /// Whether switch work for this fabric has been handed out in this run.
    pub fn switch_sent(&self, id: FabricId) -> bool {
        self.pending
            .iter()
            .chain(&self.done)
            .any(|unit| unit.fabric_id == id && !unit.non_switch)
    }

    /// Files a freshly dispatched unit. Units that are already terminal
    /// move to `done` on the next poll, like any other.
    pub fn record(&mut self, unit: ChildWorkUnit) {
        self.pending.push(unit);
    }

    /// The most recently handed out unit, if any.
    pub fn last_unit(&self) -> Option<&ChildWorkUnit> {
        self.pending.last().or_else(|| self.done.last())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn step_percentages() {
        let percents: Vec<_> =
            DispatchStep::ALL.iter().map(DispatchStep::percent).collect();
        assert_eq!(percents, [3, 7, 11, 15]);
    }

    #[test]
    fn progress_strings() {
        let mut job = MasterJob::new(MasterJobUuid::new_v4(), "w1");
        assert_eq!(
            job.enter_step(DispatchStep::PopulateTables, None),
            "True:11:populate_tables"
        );
        assert_eq!(
            job.enter_step(DispatchStep::PatchMonitor, Some("start")),
            "True:15:patch_monitor-start"
        );
        assert_eq!(
            job.monitor_progress(1, 2, 4),
            "True:57:patch_monitor-pending[1/4]_done[2/4]"
        );
        assert_eq!(
            job.monitor_progress(0, 4, 4),
            "True:100:patch_monitor-pending[0/4]_done[4/4]"
        );
    }

    #[test]
    fn progress_without_prior_step() {
        let mut job = MasterJob::local();
        assert!(!job.is_reporting());
        assert_eq!(
            job.monitor_progress(1, 0, 1),
            "True:15:patch_monitor-pending[1/1]_done[0/1]"
        );
    }
}
