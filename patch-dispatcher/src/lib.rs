// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Patch orchestration dispatcher.
//!
//! Takes a patch request covering any number of clusters, decides which
//! pieces of it may run at the same time, hands those pieces to a patch
//! worker and watches them until they are all done. Clusters that share a
//! switch fabric never have switch and non-switch work running together,
//! and only one master job registers fabrics and clusters at a time.
//!
//! All persistent state lives behind [`LockStore`]; several dispatchers in
//! different processes may share one.

pub mod artifacts;
pub mod config;
pub mod dispatch;
mod dispatcher;
pub mod log_area;
pub mod master_lock;
pub mod monitor;
mod outcome;
pub mod payload;
pub mod preflight;
pub mod registry;
pub mod report;
pub mod run;
pub mod store;
pub mod worker;

pub use artifacts::{ArtifactStore, FsArtifactStore};
pub use config::{Config, ConfigError, DispatcherConfig};
pub use dispatcher::{DispatcherError, PatchDispatcher};
pub use log_area::{FsLogArea, LogArea};
pub use outcome::{DispatchOutcome, Failure, Verdict};
pub use report::DispatcherReport;
pub use run::{DispatcherRun, MasterJob};
pub use store::{LockStore, StoreError};
pub use worker::{PatchWorker, TopologyProvider};

use slog::Logger;

/// Builds the root logger described by the config's `[log]` table.
pub fn root_logger(config: &Config) -> Result<Logger, std::io::Error> {
    config.log.to_logger("patch-dispatcher")
}
