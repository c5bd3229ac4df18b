// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checks made before the master lock is requested.

use crate::artifacts::{self, ArtifactStore, DBSERVER_ARCHIVE};
use crate::log_area::{LogArea, LogAreaError};
use crate::outcome::Failure;
use camino::{Utf8Path, Utf8PathBuf};
use patch_dispatcher_types::descriptor::{
    ArtifactKind, CallDescriptor, PayloadType, LATEST_VERSION,
};
use patch_dispatcher_types::ResultCode;
use slog::{info, Logger};
use slog_error_chain::InlineErrorChain;
use std::collections::{BTreeMap, BTreeSet};

/// Fails with `InsufficientSpace` unless the log area can hold
/// `working_space_mb` for each of `clusters`.
///
/// Only a failure to measure the space is an `Err` of the outer result.
pub fn check_space(
    log: &Logger,
    log_area: &dyn LogArea,
    working_space_mb: u64,
    clusters: usize,
) -> Result<Result<(), Failure>, LogAreaError> {
    let available = log_area.available_mb()?;
    let required = working_space_mb.saturating_mul(clusters as u64);
    info!(
        log,
        "checked log area space";
        "available_mb" => available,
        "required_mb" => required,
    );
    if available < required {
        return Ok(Err(Failure::new(
            ResultCode::InsufficientSpace,
            "Insufficient disk space to store exacloud requests and thread \
             logs.",
        )));
    }
    Ok(Ok(()))
}

/// Confirms every artifact directory `calls` rely on is present and not
/// empty.
pub fn check_artifacts(
    log: &Logger,
    store: &dyn ArtifactStore,
    calls: &[CallDescriptor],
) -> Result<(), Failure> {
    let mut wanted: BTreeMap<&str, BTreeSet<ArtifactKind>> = BTreeMap::new();
    for call in calls {
        match call.payload {
            PayloadType::Release => {
                if call.target_version.eq_ignore_ascii_case(LATEST_VERSION) {
                    continue;
                }
                wanted
                    .entry(call.target_version.as_str())
                    .or_default()
                    .extend(call.download_files.iter().copied());
            }
            PayloadType::OneOff => {
                if let Some(path) = &call.patch_files.patch_file {
                    if !store.exists(Utf8Path::new(path)) {
                        return Err(Failure::new(
                            ResultCode::MissingPatchFiles,
                            format!("Patch file '{path}' not found"),
                        ));
                    }
                }
            }
        }
    }

    for (version, kinds) in wanted {
        for kind in kinds {
            if kind == ArtifactKind::PatchFile {
                continue;
            }
            let dir = artifact_dir(store, version, kind)?;
            let entries = store.list_dir(&dir).map_err(|err| {
                Failure::new(
                    ResultCode::MissingPatchDirectory,
                    format!(
                        "Failed to read '{dir}': {}",
                        InlineErrorChain::new(&err)
                    ),
                )
            })?;
            match entries {
                None => {
                    return Err(Failure::new(
                        ResultCode::MissingPatchDirectory,
                        format!("Patch directory '{dir}' not found"),
                    ));
                }
                Some(entries) if entries.is_empty() => {
                    return Err(Failure::new(
                        ResultCode::MissingPatchFiles,
                        format!("Patch file not found in '{dir}'"),
                    ));
                }
                Some(_) => {
                    info!(log, "artifact directory present"; "dir" => %dir);
                }
            }
        }
    }
    Ok(())
}

/// The directory holding `kind` for `version`. For the host update tool
/// this may be the shared directory, if its copy is newer.
fn artifact_dir(
    store: &dyn ArtifactStore,
    version: &str,
    kind: ArtifactKind,
) -> Result<Utf8PathBuf, Failure> {
    let dir = Utf8PathBuf::from(version).join(kind.to_string());
    if kind != ArtifactKind::DbPatchFile {
        return Ok(dir);
    }
    let archive = dir.join(DBSERVER_ARCHIVE);
    if !store.exists(&archive) {
        return Ok(dir);
    }
    let chosen =
        artifacts::newer_dbserver_archive(store, &archive).map_err(|err| {
            Failure::new(
                ResultCode::MissingPatchFiles,
                format!(
                    "Failed to read '{archive}': {}",
                    InlineErrorChain::new(&err)
                ),
            )
        })?;
    Ok(chosen.parent().map(Utf8Path::to_owned).unwrap_or(dir))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::artifacts::FsArtifactStore;
    use camino_tempfile::Utf8TempDir;
    use patch_dispatcher_types::descriptor::{
        BackupMode, ClusterRef, Operation, OperationStyle, PatchFiles,
        TargetEnv, TargetType,
    };
    use patch_dispatcher_test_utils::test_setup_log;

    const VERSION: &str = "24.1.2.0.0.250212";

    fn call(version: &str, kinds: &[ArtifactKind]) -> CallDescriptor {
        CallDescriptor {
            operation: Operation::Patch,
            payload: PayloadType::Release,
            style: OperationStyle::Rolling,
            backup_mode: BackupMode::No,
            target_types: vec![TargetType::Dom0],
            target_version: version.to_string(),
            enable_plugins: false,
            plugin_types: None,
            retry: false,
            request_id: "r1".to_string(),
            additional_options: Default::default(),
            compute_node_list: Vec::new(),
            storage_node_list: Vec::new(),
            download_files: kinds.to_vec(),
            patch_files: PatchFiles::default(),
            cluster: ClusterRef {
                topology: "c1".to_string(),
                target_env: TargetEnv::Production,
                rack_name: "r1".to_string(),
            },
        }
    }

    #[test]
    fn artifact_directories() {
        let logctx = test_setup_log("artifact_directories");
        let dir = Utf8TempDir::new().unwrap();
        let root = dir.path();
        let store = FsArtifactStore::new(root);
        let kinds =
            [ArtifactKind::DbPatchFile, ArtifactKind::Dom0YumRepository];

        let err =
            check_artifacts(&logctx.log, &store, &[call(VERSION, &kinds)])
                .unwrap_err();
        assert_eq!(err.code, ResultCode::MissingPatchDirectory);

        std::fs::create_dir_all(root.join(VERSION).join("DBPatchFile"))
            .unwrap();
        std::fs::create_dir_all(root.join(VERSION).join("Dom0YumRepository"))
            .unwrap();
        let err =
            check_artifacts(&logctx.log, &store, &[call(VERSION, &kinds)])
                .unwrap_err();
        assert_eq!(err.code, ResultCode::MissingPatchFiles);
        assert!(err.suggestion.contains("DBPatchFile"));

        std::fs::write(
            root.join(VERSION).join("DBPatchFile").join(DBSERVER_ARCHIVE),
            b"",
        )
        .unwrap();
        std::fs::write(
            root.join(VERSION).join("Dom0YumRepository").join("repo.zip"),
            b"",
        )
        .unwrap();
        check_artifacts(&logctx.log, &store, &[call(VERSION, &kinds)])
            .unwrap();

        // The literal version is resolved later, downstream.
        check_artifacts(&logctx.log, &store, &[call(LATEST_VERSION, &kinds)])
            .unwrap();
        logctx.cleanup_successful();
    }

    struct FixedSpace(u64);

    impl LogArea for FixedSpace {
        fn create_job_dir(
            &self,
            _: patch_dispatcher_types::MasterJobUuid,
        ) -> Result<Utf8PathBuf, LogAreaError> {
            unimplemented!()
        }

        fn available_mb(&self) -> Result<u64, LogAreaError> {
            Ok(self.0)
        }

        fn link_worker_log(
            &self,
            _: &Utf8Path,
            _: patch_dispatcher_types::ChildRequestUuid,
        ) -> Result<(), LogAreaError> {
            unimplemented!()
        }
    }

    #[test]
    fn space_scales_with_clusters() {
        let logctx = test_setup_log("space_scales_with_clusters");
        let area = FixedSpace(3000);
        assert!(check_space(&logctx.log, &area, 1024, 2).unwrap().is_ok());
        let failure =
            check_space(&logctx.log, &area, 1024, 3).unwrap().unwrap_err();
        assert_eq!(failure.code, ResultCode::InsufficientSpace);
        logctx.cleanup_successful();
    }
}
