// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The "one master patch run at a time" lock.

use crate::config::MasterLockConfig;
use crate::run::MasterJob;
use crate::store::{LockStore, StoreError};
use futures::FutureExt;
use rand::Rng;
use slog::{debug, error, info, o, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

pub struct MasterLockManager {
    log: Logger,
    store: Arc<dyn LockStore>,
    config: MasterLockConfig,
}

impl MasterLockManager {
    pub fn new(
        log: &Logger,
        store: Arc<dyn LockStore>,
        config: MasterLockConfig,
    ) -> Self {
        let log = log.new(o!("component" => "MasterLockManager"));
        MasterLockManager { log, store, config }
    }

    /// The wait before retry number `attempt` (counting from 1).
    fn wait_before(&self, attempt: u32) -> Duration {
        let upper = if attempt > self.config.widen_after {
            self.config.wide_max_wait
        } else {
            self.config.max_wait
        };
        let lower = self.config.min_wait;
        if upper <= lower {
            return lower;
        }
        rand::thread_rng().gen_range(lower..upper)
    }

    /// Tries to take the master lock for `job`.
    ///
    /// Returns `Ok(false)` once `max_retries` waits have passed with the lock
    /// still held elsewhere. Nothing is written in that case.
    pub async fn acquire(&self, job: &MasterJob) -> Result<bool, StoreError> {
        let key = &self.config.registry_key;
        let mut failed = 0;
        loop {
            if !self.store.check_registry_entry(key).await?
                && self
                    .store
                    .set_registry_entry(
                        key,
                        "True",
                        job.id(),
                        job.worker(),
                    )
                    .await?
            {
                info!(
                    self.log,
                    "acquired master lock";
                    "master_job" => %job.id(),
                    "worker" => job.worker(),
                    "attempts" => failed + 1,
                );
                return Ok(true);
            }

            if failed >= self.config.max_retries {
                error!(
                    self.log,
                    "could not acquire master lock";
                    "master_job" => %job.id(),
                    "attempts" => failed,
                );
                return Ok(false);
            }
            failed += 1;
            let wait = self.wait_before(failed);
            warn!(
                self.log,
                "another master patch request is in progress; waiting";
                "master_job" => %job.id(),
                "attempt" => failed,
                "wait" => ?wait,
            );
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn release(&self) -> Result<(), StoreError> {
        self.store.delete_registry_entry(&self.config.registry_key).await?;
        debug!(self.log, "released master lock");
        Ok(())
    }

    /// Runs `body` while holding the master lock.
    ///
    /// Returns `Ok(None)` without running `body` if the lock could not be
    /// taken. The lock is released however `body` finishes, including by
    /// panicking.
    pub async fn run_locked<F, Fut, T>(
        &self,
        job: &MasterJob,
        body: F,
    ) -> Result<Option<T>, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire(job).await? {
            return Ok(None);
        }
        let result = AssertUnwindSafe(body()).catch_unwind().await;
        if let Err(err) = self.release().await {
            error!(
                self.log,
                "failed to release master lock";
                "master_job" => %job.id(),
                "error" => InlineErrorChain::new(&err),
            );
            if result.is_ok() {
                return Err(err);
            }
        }
        match result {
            Ok(value) => Ok(Some(value)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
