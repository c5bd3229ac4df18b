// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal result of a dispatcher run, or of one of its steps.
///
/// Codes are rendered as the eight-digit hex strings callers already parse.
/// A code reported by a child that is not one of ours is carried verbatim in
/// [`ResultCode::Worker`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResultCode {
    Success,
    MissingPatchFiles,
    SystemBusy,
    IncorrectInput,
    RequestTimeout,
    MasterRequestException,
    OneOrMoreRequestsFailed,
    MonitorException,
    InsufficientSpace,
    MissingPatchDirectory,
    MasterRequestError,
    OperationDidNotStart,
    ParallelSwitchNonSwitch,
    NoActionRequired,
    InvalidSwitchData,
    ChildRequestCreationFailed,
    Worker(String),
}

const KNOWN: &[(&str, ResultCode)] = &[
    ("0x00000000", ResultCode::Success),
    ("0x03010001", ResultCode::MissingPatchFiles),
    ("0x03010003", ResultCode::SystemBusy),
    ("0x03010004", ResultCode::IncorrectInput),
    ("0x03010005", ResultCode::RequestTimeout),
    ("0x03010006", ResultCode::MasterRequestException),
    ("0x03010007", ResultCode::OneOrMoreRequestsFailed),
    ("0x03010008", ResultCode::MonitorException),
    ("0x03010009", ResultCode::InsufficientSpace),
    ("0x0301000B", ResultCode::MissingPatchDirectory),
    ("0x0301000E", ResultCode::MasterRequestError),
    ("0x0301000F", ResultCode::OperationDidNotStart),
    ("0x03010033", ResultCode::ParallelSwitchNonSwitch),
    ("0x0301003D", ResultCode::NoActionRequired),
    ("0x03010048", ResultCode::InvalidSwitchData),
    ("0x03010061", ResultCode::ChildRequestCreationFailed),
];

impl ResultCode {
    pub fn as_code(&self) -> &str {
        if let ResultCode::Worker(code) = self {
            return code;
        }
        KNOWN
            .iter()
            .find(|(_, known)| known == self)
            .map(|(code, _)| *code)
            .unwrap_or_default()
    }

    pub fn from_code(code: &str) -> ResultCode {
        KNOWN
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(code))
            .map(|(_, rc)| rc.clone())
            .unwrap_or_else(|| ResultCode::Worker(code.to_string()))
    }

    /// Success, including the "nothing needed doing" flavour.
    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Success | ResultCode::NoActionRequired)
            || self.as_code() == "0x00000000"
    }

    /// Whether `code` belongs to the patching error family: `0x03` followed
    /// by six more hex digits.
    pub fn is_patching_code(code: &str) -> bool {
        code.len() == 10 && code.starts_with("0x03")
    }
}

impl From<String> for ResultCode {
    fn from(code: String) -> Self {
        ResultCode::from_code(&code)
    }
}

impl From<ResultCode> for String {
    fn from(code: ResultCode) -> Self {
        code.as_code().to_string()
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_round_trip_through_strings() {
        for (code, rc) in KNOWN {
            assert_eq!(rc.as_code(), *code);
            assert_eq!(&ResultCode::from_code(code), rc);
        }
        assert_eq!(
            ResultCode::from_code("0x0301000b"),
            ResultCode::MissingPatchDirectory
        );
        assert_eq!(
            ResultCode::from_code("0x03020101"),
            ResultCode::Worker("0x03020101".to_string())
        );
    }

    #[test]
    fn patching_code_family() {
        assert!(ResultCode::is_patching_code("0x03010007"));
        assert!(!ResultCode::is_patching_code("0x0301"));
        assert!(!ResultCode::is_patching_code("701-614"));
        assert!(!ResultCode::is_patching_code("0x04010007"));
    }
}
