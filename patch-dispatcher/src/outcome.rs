// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::report::DispatcherReport;
use patch_dispatcher_types::ResultCode;
use std::fmt;

/// An expected way for a run, or one step of it, to end without success.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    pub code: ResultCode,
    /// What the operator is told to do about it.
    pub suggestion: String,
}

impl Failure {
    pub fn new(code: ResultCode, suggestion: impl Into<String>) -> Failure {
        Failure { code, suggestion: suggestion.into() }
    }

    pub fn incorrect_input(detail: impl fmt::Display) -> Failure {
        Failure::new(
            ResultCode::IncorrectInput,
            format!("Failed to validate the input configuration file. {detail}"),
        )
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.suggestion)
    }
}

/// How monitoring ended: a code plus an optional message for the operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub code: ResultCode,
    pub suggestion: Option<String>,
}

impl Verdict {
    pub fn success() -> Verdict {
        Verdict { code: ResultCode::Success, suggestion: None }
    }

    pub fn new(code: ResultCode, suggestion: impl Into<String>) -> Verdict {
        Verdict { code, suggestion: Some(suggestion.into()) }
    }
}

impl From<Failure> for Verdict {
    fn from(failure: Failure) -> Verdict {
        Verdict { code: failure.code, suggestion: Some(failure.suggestion) }
    }
}

/// The terminal result of one master job.
#[derive(Clone, Debug)]
pub struct DispatchOutcome {
    pub code: ResultCode,
    pub suggestion: Option<String>,
    pub report: DispatcherReport,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}
