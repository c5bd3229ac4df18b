// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rows describing dispatched work and in-progress operations.

use crate::descriptor::{
    Operation, OperationStyle, PatchCategory, TargetType,
};
use crate::typed_uuid::{ChildRequestUuid, MasterJobUuid};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error value a worker reports while a request is still unresolved.
pub const WORKER_ERROR_UNDEF: &str = "Undef";

/// Error value a worker reports for a request that finished cleanly.
pub const WORKER_ERROR_NONE: &str = "0";

/// Error code a worker reports when the target was already up to date.
pub const WORKER_NO_ACTION_REQUIRED: &str = "701-614";

/// Error code carried by a unit that was never handed to the worker.
pub const NEVER_STARTED_ERROR: &str = "-1";

/// Status of a child request, either as the worker reports it or as the
/// dispatcher records it in its own request list.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RequestStatus {
    Undef,
    Pending,
    Done,
    Failed,
    NoActionRequired,
    /// Anything else a worker reports; treated as still running.
    Other(String),
}

impl RequestStatus {
    /// Worker statuses such as `Done` or `Done-with-warnings` all finish a
    /// request.
    pub fn is_done(&self) -> bool {
        matches!(self, RequestStatus::Done)
    }

    pub fn as_str(&self) -> &str {
        match self {
            RequestStatus::Undef => "Undef",
            RequestStatus::Pending => "Pending",
            RequestStatus::Done => "Done",
            RequestStatus::Failed => "Failed",
            RequestStatus::NoActionRequired => "No_action_required",
            RequestStatus::Other(s) => s,
        }
    }
}

impl From<String> for RequestStatus {
    fn from(s: String) -> Self {
        RequestStatus::from(s.as_str())
    }
}

impl From<&str> for RequestStatus {
    fn from(s: &str) -> Self {
        match s {
            "Undef" => RequestStatus::Undef,
            "Pending" => RequestStatus::Pending,
            "Failed" => RequestStatus::Failed,
            "No_action_required" => RequestStatus::NoActionRequired,
            s if s.starts_with("Done") => RequestStatus::Done,
            other => RequestStatus::Other(other.to_string()),
        }
    }
}

impl From<RequestStatus> for String {
    fn from(status: RequestStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marks that a cluster has an operation in progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveOperationRow {
    pub cluster_name: String,
    pub master_job: MasterJobUuid,
    pub target_type: TargetType,
    pub patch_category: Option<PatchCategory>,
    pub operation: Operation,
    pub style: OperationStyle,
}

/// A child request as the worker tracks it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRequestRow {
    pub correlation_id: ChildRequestUuid,
    pub status: RequestStatus,
    pub error: String,
    pub error_detail: String,
}

/// A structured error the worker attached to a finished child request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildError {
    pub code: String,
    pub message: String,
}

/// One entry in the dispatcher's own list of child requests for a master
/// job, used for the final verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchListRow {
    pub master_job: MasterJobUuid,
    pub correlation_id: ChildRequestUuid,
    pub status: RequestStatus,
    /// The worker's final report, if it wrote one.
    pub report: Option<ChildError>,
    /// An error recorded separately for this child.
    pub error: Option<ChildError>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn done_prefix_is_terminal() {
        assert!(RequestStatus::from("Done").is_done());
        assert!(RequestStatus::from("Done-partial").is_done());
        assert!(!RequestStatus::from("Pending").is_done());
        assert_eq!(
            RequestStatus::from("Copying"),
            RequestStatus::Other("Copying".to_string())
        );
        assert_eq!(
            RequestStatus::from("No_action_required").to_string(),
            "No_action_required"
        );
    }

    #[test]
    fn status_serializes_as_string() {
        let json = serde_json::to_string(&RequestStatus::Failed).unwrap();
        assert_eq!(json, "\"Failed\"");
        let back: RequestStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RequestStatus::Failed);
    }
}
