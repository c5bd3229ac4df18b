// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities intended for the test suite. These should not be used in
//! production code.

mod artifacts;
mod log_area;
mod store;
mod worker;

pub use artifacts::MemoryArtifactStore;
pub use dropshot::test_util::LogContext;
pub use log_area::FakeLogArea;
pub use store::MemoryLockStore;
pub use worker::{FakeTopology, FakeWorker, WorkerBehavior};

use dropshot::ConfigLogging;
use dropshot::ConfigLoggingIfExists;
use dropshot::ConfigLoggingLevel;

/// Set up a [`dropshot::test_util::LogContext`] appropriate for a test named
/// `test_name`
pub fn test_setup_log(test_name: &str) -> LogContext {
    let log_config = ConfigLogging::File {
        level: ConfigLoggingLevel::Trace,
        path: String::from("UNUSED").into(),
        if_exists: ConfigLoggingIfExists::Fail,
    };

    LogContext::new(test_name, &log_config)
}
