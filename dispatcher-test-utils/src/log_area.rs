// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::{Utf8Path, Utf8PathBuf};
use patch_dispatcher::log_area::{LogArea, LogAreaError};
use patch_dispatcher_types::{ChildRequestUuid, MasterJobUuid};
use std::sync::{Arc, Mutex};

struct FakeLogAreaInner {
    available_mb: u64,
    job_dirs: Vec<Utf8PathBuf>,
    links: Vec<(Utf8PathBuf, ChildRequestUuid)>,
}

/// A log area that only records what was asked of it.
#[derive(Clone)]
pub struct FakeLogArea {
    inner: Arc<Mutex<FakeLogAreaInner>>,
}

impl FakeLogArea {
    pub fn new(available_mb: u64) -> Self {
        FakeLogArea {
            inner: Arc::new(Mutex::new(FakeLogAreaInner {
                available_mb,
                job_dirs: Vec::new(),
                links: Vec::new(),
            })),
        }
    }

    pub fn job_dirs(&self) -> Vec<Utf8PathBuf> {
        self.inner.lock().unwrap().job_dirs.clone()
    }

    /// Worker logs linked so far, by job directory.
    pub fn links(&self) -> Vec<(Utf8PathBuf, ChildRequestUuid)> {
        self.inner.lock().unwrap().links.clone()
    }
}

impl LogArea for FakeLogArea {
    fn create_job_dir(
        &self,
        job: MasterJobUuid,
    ) -> Result<Utf8PathBuf, LogAreaError> {
        let path = Utf8PathBuf::from(format!("/log/patch/{job}"));
        self.inner.lock().unwrap().job_dirs.push(path.clone());
        Ok(path)
    }

    fn available_mb(&self) -> Result<u64, LogAreaError> {
        Ok(self.inner.lock().unwrap().available_mb)
    }

    fn link_worker_log(
        &self,
        job_dir: &Utf8Path,
        child: ChildRequestUuid,
    ) -> Result<(), LogAreaError> {
        self.inner.lock().unwrap().links.push((job_dir.to_owned(), child));
        Ok(())
    }
}
