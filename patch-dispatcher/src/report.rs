// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The error report attached to every terminal outcome.

use crate::run::DispatcherRun;
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use patch_dispatcher_types::descriptor::{
    CallDescriptor, Operation, OperationStyle, TargetType,
};
use patch_dispatcher_types::{ChildRequestUuid, MasterJobUuid, ResultCode};
use serde::{Deserialize, Serialize};

/// Longest message a report carries, in characters.
pub const MAX_MESSAGE_CHARS: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherReport {
    pub code: ResultCode,
    pub message: String,
    pub detail: String,
    pub master_job: MasterJobUuid,
    pub child_request: Option<ChildRequestUuid>,
    pub cluster_name: Option<String>,
    pub target_types: Vec<TargetType>,
    pub operation: Option<Operation>,
    pub style: Option<OperationStyle>,
    pub target_version: Option<String>,
    pub log_dir: Option<Utf8PathBuf>,
    pub request_id: Option<String>,
    pub time: DateTime<Utc>,
}

impl DispatcherReport {
    /// A report for a job that never got as far as a parsed request.
    pub fn bare(
        master_job: MasterJobUuid,
        code: ResultCode,
        message: &str,
    ) -> DispatcherReport {
        DispatcherReport {
            code,
            message: truncate(message),
            detail: String::new(),
            master_job,
            child_request: None,
            cluster_name: None,
            target_types: Vec::new(),
            operation: None,
            style: None,
            target_version: None,
            log_dir: None,
            request_id: None,
            time: Utc::now(),
        }
    }

    /// A report describing `run` as it stands.
    pub fn for_run(
        run: &DispatcherRun,
        code: ResultCode,
        message: &str,
    ) -> DispatcherReport {
        let mut report = DispatcherReport::bare(run.job.id(), code, message);
        report.detail = run.job.status().to_string();
        report.log_dir = Some(run.job_dir.clone());

        let last = run.last_unit();
        report.child_request = last
            .map(|unit| unit.correlation_id)
            .filter(|id| !id.is_nil());
        if let Some(call) = last.map(|unit| &unit.call).or(run.calls.first()) {
            report.describe(call);
        }
        if let Some(unit) = last {
            report.cluster_name = Some(unit.cluster_name.clone());
        }
        report
    }

    fn describe(&mut self, call: &CallDescriptor) {
        self.target_types = call.target_types.clone();
        self.operation = Some(call.operation);
        self.style = Some(call.style);
        self.target_version = Some(call.target_version.clone());
        self.request_id = Some(call.request_id.clone());
        self.cluster_name = Some(call.cluster.topology.clone());
    }
}

fn truncate(message: &str) -> String {
    message.chars().take(MAX_MESSAGE_CHARS).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn long_messages_are_truncated() {
        let message = "é".repeat(MAX_MESSAGE_CHARS + 10);
        let report = DispatcherReport::bare(
            MasterJobUuid::new_v4(),
            ResultCode::IncorrectInput,
            &message,
        );
        assert_eq!(report.message.chars().count(), MAX_MESSAGE_CHARS);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["code"], "0x03010004");
    }
}
