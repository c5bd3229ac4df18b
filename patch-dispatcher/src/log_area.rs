// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-job log directories.

use camino::{Utf8Path, Utf8PathBuf};
use nix::sys::statvfs::statvfs;
use patch_dispatcher_types::{ChildRequestUuid, MasterJobUuid};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogAreaError {
    #[error("failed to create log directory {path}")]
    Create {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to query free space under {path}")]
    FreeSpace {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to link {link} to {target}")]
    Link {
        link: Utf8PathBuf,
        target: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
}

/// Where a master job keeps its logs.
pub trait LogArea: Send + Sync {
    fn create_job_dir(
        &self,
        job: MasterJobUuid,
    ) -> Result<Utf8PathBuf, LogAreaError>;

    /// Free space available to the log area, in MiB.
    fn available_mb(&self) -> Result<u64, LogAreaError>;

    /// Makes a child request's own logs reachable from the job directory.
    fn link_worker_log(
        &self,
        job_dir: &Utf8Path,
        child: ChildRequestUuid,
    ) -> Result<(), LogAreaError>;
}

#[derive(Clone, Debug)]
pub struct FsLogArea {
    root: Utf8PathBuf,
    worker_log_root: Utf8PathBuf,
}

impl FsLogArea {
    pub fn new(
        root: impl Into<Utf8PathBuf>,
        worker_log_root: impl Into<Utf8PathBuf>,
    ) -> Self {
        FsLogArea { root: root.into(), worker_log_root: worker_log_root.into() }
    }
}

impl LogArea for FsLogArea {
    fn create_job_dir(
        &self,
        job: MasterJobUuid,
    ) -> Result<Utf8PathBuf, LogAreaError> {
        let path = self.root.join(job.to_string());
        std::fs::create_dir_all(&path)
            .map_err(|err| LogAreaError::Create { path: path.clone(), err })?;
        Ok(path)
    }

    fn available_mb(&self) -> Result<u64, LogAreaError> {
        free_space_mb(&self.root).map_err(|err| LogAreaError::FreeSpace {
            path: self.root.clone(),
            err,
        })
    }

    fn link_worker_log(
        &self,
        job_dir: &Utf8Path,
        child: ChildRequestUuid,
    ) -> Result<(), LogAreaError> {
        let target = self.worker_log_root.join(child.to_string()).join("log");
        let link = job_dir.join(child.to_string());
        std::os::unix::fs::symlink(&target, &link)
            .map_err(|err| LogAreaError::Link { link, target, err })
    }
}

fn free_space_mb(path: &Utf8Path) -> Result<u64, io::Error> {
    let stat = statvfs(path.as_std_path()).map_err(io::Error::from)?;
    let bytes = u64::from(stat.blocks_available())
        .saturating_mul(u64::from(stat.fragment_size()));
    Ok(bytes / (1024 * 1024))
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    #[test]
    fn job_dir_and_links() {
        let dir = Utf8TempDir::new().unwrap();
        let area = FsLogArea::new(
            dir.path().join("patch"),
            dir.path().join("requests"),
        );
        let job = MasterJobUuid::new_v4();
        let job_dir = area.create_job_dir(job).unwrap();
        assert!(job_dir.is_dir());
        assert!(job_dir.ends_with(job.to_string()));

        let child = ChildRequestUuid::new_v4();
        area.link_worker_log(&job_dir, child).unwrap();
        let link = job_dir.join(child.to_string());
        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            dir.path()
                .join("requests")
                .join(child.to_string())
                .join("log")
                .into_std_path_buf()
        );
        assert!(area.link_worker_log(&job_dir, child).is_err());
        assert!(area.available_mb().unwrap() > 0);
    }

    #[test]
    fn free_space_of_missing_root_is_an_error() {
        let dir = Utf8TempDir::new().unwrap();
        let root = dir.path().join("absent");
        let area = FsLogArea::new(&root, dir.path().join("requests"));
        match area.available_mb() {
            Err(LogAreaError::FreeSpace { path, err }) => {
                assert_eq!(path, root);
                assert_eq!(err.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected free space result: {other:?}"),
        }
    }
}
