// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Turns a caller's patch request document into validated
//! [`CallDescriptor`]s, one per cluster.
//!
//! Every field of a [`RawPatchEntry`] is optional on the wire so that a
//! missing field can be reported by name rather than as a generic
//! deserialization failure. The first invalid entry rejects the whole
//! request.

use crate::artifacts::{self, ArtifactError, ArtifactStore, DBSERVER_ARCHIVE};
use crate::outcome::Failure;
use camino::{Utf8Path, Utf8PathBuf};
use patch_dispatcher_types::descriptor::{
    AdditionalOptions, ArtifactKind, BackupMode, CallDescriptor, ClusterRef,
    Operation, OperationStyle, PatchFiles, PayloadType, TargetEnv, TargetType,
    LATEST_VERSION,
};
use patch_dispatcher_types::ResultCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use slog::{debug, error, info, o, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;

/// Plugin selections accepted alongside a hypervisor host target.
const DOM0_PLUGIN_TYPES: &[&str] =
    &["dom0", "dom0domu", "dom0+dom0domu", "dom0domu+dom0"];

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PatchRequest {
    #[serde(rename = "Params", default)]
    pub params: Vec<RawPatchEntry>,
}

/// One entry of a patch request as the caller sent it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawPatchEntry {
    pub operation: Option<String>,
    pub payload_type: Option<String>,
    pub operation_style: Option<String>,
    pub backup_mode: Option<String>,
    pub target_type: Option<Vec<String>>,
    pub target_version: Option<String>,
    pub enable_plugins: Option<String>,
    pub plugin_types: Option<String>,
    pub retry: Option<String>,
    pub request_id: Option<String>,
    pub clusters: Option<Vec<RawClusterRef>>,
    pub additional_options: Option<Vec<serde_json::Map<String, Value>>>,
    pub compute_node_list: Option<Vec<String>>,
    pub storage_node_list: Option<Vec<String>>,
    pub cell_patch_file: Option<String>,
    pub switch_patch_file: Option<String>,
    #[serde(rename = "DBPatchFile")]
    pub db_patch_file: Option<String>,
    pub dom0_yum_repository: Option<String>,
    pub domu_yum_repository: Option<String>,
    pub exasplice_repository: Option<String>,
    pub patch_file: Option<String>,
}

impl RawPatchEntry {
    fn file(&self, kind: ArtifactKind) -> Option<&str> {
        match kind {
            ArtifactKind::CellPatchFile => self.cell_patch_file.as_deref(),
            ArtifactKind::SwitchPatchFile => self.switch_patch_file.as_deref(),
            ArtifactKind::DbPatchFile => self.db_patch_file.as_deref(),
            ArtifactKind::Dom0YumRepository => {
                self.dom0_yum_repository.as_deref()
            }
            ArtifactKind::DomuYumRepository => {
                self.domu_yum_repository.as_deref()
            }
            ArtifactKind::ExaspliceRepository => {
                self.exasplice_repository.as_deref()
            }
            ArtifactKind::PatchFile => self.patch_file.as_deref(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawClusterRef {
    pub topology: Option<String>,
    pub target_env: Option<String>,
    pub rack_name: Option<String>,
}

pub struct PayloadResolver {
    log: Logger,
    store: Arc<dyn ArtifactStore>,
}

impl PayloadResolver {
    pub fn new(log: &Logger, store: Arc<dyn ArtifactStore>) -> Self {
        let log = log.new(o!("component" => "PayloadResolver"));
        PayloadResolver { log, store }
    }

    /// Validates `request` and returns one descriptor per cluster reference.
    pub fn parse(
        &self,
        request: &PatchRequest,
    ) -> Result<Vec<CallDescriptor>, Failure> {
        let result = self.parse_entries(request);
        match &result {
            Ok(calls) => {
                info!(self.log, "parsed patch request"; "calls" => calls.len())
            }
            Err(failure) => error!(
                self.log,
                "rejected patch request";
                "code" => %failure.code,
                "suggestion" => &failure.suggestion,
            ),
        }
        result
    }

    fn parse_entries(
        &self,
        request: &PatchRequest,
    ) -> Result<Vec<CallDescriptor>, Failure> {
        check_duplicate_topologies(request)?;
        let mut calls = Vec::new();
        for (index, entry) in request.params.iter().enumerate() {
            calls.extend(self.parse_entry(index, entry)?);
        }
        if calls.is_empty() {
            return Err(Failure::incorrect_input(
                "No cluster to patch was found in the request.",
            ));
        }
        Ok(calls)
    }

    fn parse_entry(
        &self,
        index: usize,
        entry: &RawPatchEntry,
    ) -> Result<Vec<CallDescriptor>, Failure> {
        let log = self.log.new(o!("entry" => index));

        let operation: Operation =
            required("Operation", entry.operation.as_deref())?;
        let payload: PayloadType =
            required("PayloadType", entry.payload_type.as_deref())?;
        let style: OperationStyle =
            required("OperationStyle", entry.operation_style.as_deref())?;
        let backup_mode: BackupMode =
            required("BackupMode", entry.backup_mode.as_deref())?;
        let additional_options = additional_options(entry)?;
        let exasplice = additional_options.exasplice == Some(true);
        let target_types = target_types(&log, entry)?;

        let Some(raw_version) = entry.target_version.as_deref() else {
            return Err(Failure::incorrect_input("TargetVersion not provided."));
        };
        let target_version = if raw_version.eq_ignore_ascii_case(LATEST_VERSION)
        {
            if target_types == [TargetType::Dom0] && exasplice {
                info!(
                    log,
                    "keeping literal target version for incremental host \
                     update"
                );
                LATEST_VERSION.to_string()
            } else {
                self.latest_version()?
            }
        } else {
            raw_version.to_string()
        };

        let enable_plugins =
            yes_no("EnablePlugins", entry.enable_plugins.as_deref())?;
        let plugin_types = plugin_types(entry, enable_plugins, &target_types)?;
        let retry = yes_no("Retry", entry.retry.as_deref())?;
        let request_id = entry
            .request_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| Failure::incorrect_input("RequestId not provided."))?;

        let Some(clusters) = entry.clusters.as_ref().filter(|c| !c.is_empty())
        else {
            warn!(log, "entry names no clusters; ignoring it");
            return Ok(Vec::new());
        };

        let (download_files, patch_files) = match payload {
            PayloadType::Release => self.release_files(
                &log,
                entry,
                &target_types,
                &target_version,
                operation,
                exasplice,
            )?,
            PayloadType::OneOff => (Vec::new(), oneoff_files(&log, entry)),
        };

        let mut calls = Vec::new();
        for raw in clusters {
            let Some(cluster) = cluster_ref(&log, raw) else {
                continue;
            };
            calls.push(CallDescriptor {
                operation,
                payload,
                style,
                backup_mode,
                target_types: target_types.clone(),
                target_version: target_version.clone(),
                enable_plugins,
                plugin_types: plugin_types.clone(),
                retry,
                request_id: request_id.clone(),
                additional_options: additional_options.clone(),
                compute_node_list: entry
                    .compute_node_list
                    .clone()
                    .unwrap_or_default(),
                storage_node_list: entry
                    .storage_node_list
                    .clone()
                    .unwrap_or_default(),
                download_files: download_files.clone(),
                patch_files: patch_files.clone(),
                cluster,
            });
        }
        Ok(calls)
    }

    fn latest_version(&self) -> Result<String, Failure> {
        let versions = self.store.versions().map_err(artifact_failure)?;
        let latest =
            artifacts::latest_release_version(&versions).ok_or_else(|| {
                Failure::new(
                    ResultCode::MissingPatchDirectory,
                    "No patch version was found in the artifact store.",
                )
            })?;
        info!(self.log, "resolved latest target version"; "version" => &latest);
        Ok(latest)
    }

    /// Artifact kinds and resolved file paths a release payload needs for
    /// `targets`.
    fn release_files(
        &self,
        log: &Logger,
        entry: &RawPatchEntry,
        targets: &[TargetType],
        version: &str,
        operation: Operation,
        exasplice: bool,
    ) -> Result<(Vec<ArtifactKind>, PatchFiles), Failure> {
        let mut kinds = Vec::new();
        let mut files = PatchFiles::default();
        for &target in targets {
            let needed: Vec<ArtifactKind> = match target {
                TargetType::Cell => vec![ArtifactKind::CellPatchFile],
                TargetType::Switch
                | TargetType::IbSwitch
                | TargetType::RoceSwitch => vec![ArtifactKind::SwitchPatchFile],
                TargetType::Dom0 if exasplice => {
                    let mut kinds = vec![ArtifactKind::DbPatchFile];
                    if !artifacts::is_quarterly_version(version) {
                        kinds.push(ArtifactKind::ExaspliceRepository);
                    }
                    kinds
                }
                TargetType::Dom0 => vec![
                    ArtifactKind::DbPatchFile,
                    ArtifactKind::Dom0YumRepository,
                ],
                TargetType::Domu | TargetType::Dom0Domu => vec![
                    ArtifactKind::DbPatchFile,
                    ArtifactKind::DomuYumRepository,
                ],
            };
            for kind in needed {
                if !kinds.contains(&kind) {
                    kinds.push(kind);
                }
                if files.get(kind).is_some() {
                    continue;
                }
                let raw = match (kind, entry.file(kind)) {
                    (_, Some(raw)) => raw,
                    (ArtifactKind::SwitchPatchFile, None)
                        if entry.cell_patch_file.is_some() =>
                    {
                        warn!(
                            log,
                            "no switch patch file given; using the cell \
                             patch file"
                        );
                        entry.file(ArtifactKind::CellPatchFile).unwrap_or("")
                    }
                    (_, None) => {
                        return Err(Failure::incorrect_input(format!(
                            "{kind} not provided for target {target}."
                        )));
                    }
                };
                let resolved = self.resolve_path(kind, raw, version, operation)?;
                debug!(
                    log,
                    "resolved artifact path";
                    "kind" => %kind,
                    "path" => &resolved,
                );
                files.set(kind, resolved);
            }
        }
        Ok((kinds, files))
    }

    /// Replaces the `LATEST` token in `raw` and picks the concrete file the
    /// worker should use.
    fn resolve_path(
        &self,
        kind: ArtifactKind,
        raw: &str,
        version: &str,
        operation: Operation,
    ) -> Result<String, Failure> {
        if operation.is_oneoff()
            || version.eq_ignore_ascii_case(LATEST_VERSION)
        {
            return Ok(raw.to_string());
        }
        match kind {
            ArtifactKind::DbPatchFile => {}
            ArtifactKind::ExaspliceRepository => {
                return Ok(raw.replace(LATEST_VERSION, version));
            }
            _ if !raw.contains(LATEST_VERSION) => return Ok(raw.to_string()),
            _ => {}
        }

        let mut dir = Utf8PathBuf::from(raw.replace(LATEST_VERSION, version));
        if kind == ArtifactKind::DbPatchFile {
            let archive = if dir.file_name() == Some(DBSERVER_ARCHIVE) {
                dir.clone()
            } else {
                dir.join(DBSERVER_ARCHIVE)
            };
            let chosen = if self.store.exists(&archive) {
                artifacts::newer_dbserver_archive(&*self.store, &archive)
                    .map_err(artifact_failure)?
            } else {
                archive
            };
            info!(self.log, "selected host update tool"; "path" => %chosen);
            dir = chosen.parent().map(Utf8Path::to_owned).unwrap_or_default();
        }

        let entries =
            self.store.list_dir(&dir).map_err(artifact_failure)?.ok_or_else(
                || {
                    Failure::new(
                        ResultCode::MissingPatchDirectory,
                        format!("Patch directory path does not exist: {dir}"),
                    )
                },
            )?;

        let picked: Vec<Utf8PathBuf> = match kind {
            ArtifactKind::Dom0YumRepository if entries.len() > 1 => {
                entries.iter().map(|name| dir.join(name)).collect()
            }
            ArtifactKind::DomuYumRepository => {
                let prefix = "exadata_";
                let suffix = format!("_{version}_Linux-x86-64.zip");
                let found = entries.iter().find(|name| {
                    name.len() >= prefix.len() + suffix.len()
                        && name.starts_with(prefix)
                        && name.ends_with(&suffix)
                });
                match found {
                    Some(name) => vec![dir.join(name)],
                    None => {
                        return Err(Failure::new(
                            ResultCode::MissingPatchFiles,
                            format!(
                                "No matching file found in {dir} for version \
                                 {version}"
                            ),
                        ));
                    }
                }
            }
            ArtifactKind::CellPatchFile => {
                vec![dir.join(format!("{version}.patch.zip"))]
            }
            ArtifactKind::SwitchPatchFile => {
                vec![dir.join(format!("{version}.switch.patch.zip"))]
            }
            ArtifactKind::DbPatchFile => vec![dir.join(DBSERVER_ARCHIVE)],
            _ if entries.len() == 1 => vec![dir.join(&entries[0])],
            _ => {
                return Err(Failure::new(
                    ResultCode::MissingPatchFiles,
                    format!("Patch file is not found in {dir}"),
                ));
            }
        };
        Ok(picked
            .iter()
            .map(|path| self.store.locate(path).into_string())
            .collect::<Vec<_>>()
            .join(","))
    }
}

fn artifact_failure(err: ArtifactError) -> Failure {
    Failure::new(
        ResultCode::MissingPatchDirectory,
        format!(
            "Failed to read the artifact store: {}",
            InlineErrorChain::new(&err)
        ),
    )
}

fn required<T: FromStr>(
    field: &str,
    value: Option<&str>,
) -> Result<T, Failure> {
    let value = value.ok_or_else(|| {
        Failure::incorrect_input(format!("{field} not provided."))
    })?;
    value.trim().to_ascii_lowercase().parse().map_err(|_| {
        Failure::incorrect_input(format!("Invalid {field} value '{value}'."))
    })
}

fn yes_no(field: &str, value: Option<&str>) -> Result<bool, Failure> {
    let value = value.ok_or_else(|| {
        Failure::incorrect_input(format!("{field} not provided."))
    })?;
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" => Ok(true),
        "no" => Ok(false),
        _ => Err(Failure::incorrect_input(format!(
            "Invalid {field} value '{value}'."
        ))),
    }
}

fn target_types(
    log: &Logger,
    entry: &RawPatchEntry,
) -> Result<Vec<TargetType>, Failure> {
    let raw = entry
        .target_type
        .as_ref()
        .ok_or_else(|| Failure::incorrect_input("TargetType not provided."))?;
    let mut targets = Vec::new();
    for name in raw {
        match name.trim().to_ascii_lowercase().parse::<TargetType>() {
            Ok(target) if !targets.contains(&target) => targets.push(target),
            Ok(_) => {}
            Err(_) => warn!(log, "ignoring unknown target type"; "target" => name),
        }
    }
    if targets.is_empty() {
        return Err(Failure::incorrect_input(
            "TargetType has no valid entry.",
        ));
    }
    Ok(targets)
}

fn plugin_types(
    entry: &RawPatchEntry,
    enable_plugins: bool,
    targets: &[TargetType],
) -> Result<Option<String>, Failure> {
    let plugin_types = entry
        .plugin_types
        .as_deref()
        .map(|p| p.replace(' ', "").to_ascii_lowercase())
        .filter(|p| !p.is_empty());
    if !enable_plugins {
        return Ok(plugin_types);
    }
    let invalid = |for_target: &str| {
        Failure::incorrect_input(format!(
            "Invalid plugin types specified{for_target}: '{}'.",
            plugin_types.as_deref().unwrap_or("")
        ))
    };
    match plugin_types.as_deref() {
        None | Some("none") => Err(invalid("")),
        Some(p)
            if targets.contains(&TargetType::Dom0)
                && !DOM0_PLUGIN_TYPES.contains(&p) =>
        {
            Err(invalid(" for dom0"))
        }
        Some(p)
            if !targets.contains(&TargetType::Dom0)
                && targets.contains(&TargetType::Domu)
                && p != "domu" =>
        {
            Err(invalid(" for domU"))
        }
        _ => Ok(plugin_types),
    }
}

fn additional_options(
    entry: &RawPatchEntry,
) -> Result<AdditionalOptions, Failure> {
    let Some(first) =
        entry.additional_options.as_ref().and_then(|opts| opts.first())
    else {
        return Ok(AdditionalOptions::default());
    };
    let mut passthrough: BTreeMap<String, Value> =
        first.clone().into_iter().collect();
    let exasplice = match passthrough.remove("exasplice") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(yes_no("exasplice", Some(&s))?),
        Some(other) => {
            return Err(Failure::incorrect_input(format!(
                "Invalid exasplice value '{other}'."
            )));
        }
    };
    Ok(AdditionalOptions { exasplice, passthrough })
}

fn oneoff_files(log: &Logger, entry: &RawPatchEntry) -> PatchFiles {
    let mut files = PatchFiles::default();
    match &entry.patch_file {
        Some(path) => files.set(ArtifactKind::PatchFile, path.clone()),
        None => warn!(log, "no PatchFile given for one-off payload"),
    }
    for kind in
        [ArtifactKind::Dom0YumRepository, ArtifactKind::DomuYumRepository]
    {
        if let Some(path) = entry.file(kind) {
            files.set(kind, path.to_string());
        }
    }
    files
}

fn cluster_ref(log: &Logger, raw: &RawClusterRef) -> Option<ClusterRef> {
    let Some(topology) = raw.topology.clone().filter(|t| !t.is_empty()) else {
        warn!(log, "cluster entry has no topology; ignoring it");
        return None;
    };
    let target_env = raw
        .target_env
        .as_deref()
        .and_then(|env| env.to_ascii_lowercase().parse::<TargetEnv>().ok());
    let Some(target_env) = target_env else {
        warn!(
            log,
            "target_env missing or invalid; ignoring cluster";
            "topology" => &topology,
        );
        return None;
    };
    let Some(rack_name) = raw.rack_name.clone().filter(|r| !r.is_empty())
    else {
        warn!(
            log,
            "rack_name missing; ignoring cluster";
            "topology" => &topology,
        );
        return None;
    };
    Some(ClusterRef { topology, target_env, rack_name })
}

fn check_duplicate_topologies(request: &PatchRequest) -> Result<(), Failure> {
    let mut seen = BTreeSet::new();
    let refs = request
        .params
        .iter()
        .flat_map(|entry| entry.clusters.iter().flatten());
    for topology in refs.filter_map(|c| c.topology.as_deref()) {
        if !seen.insert(topology) {
            return Err(Failure::incorrect_input(format!(
                "Cluster topology {topology} is used in more than one entry."
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::artifacts::FsArtifactStore;
    use camino_tempfile::Utf8TempDir;
    use patch_dispatcher_test_utils::test_setup_log;
    use serde_json::json;

    const OLD: &str = "23.1.20.0.0.241008";
    const NEW: &str = "24.1.2.0.0.250212";

    fn touch(root: &Utf8Path, path: &str) {
        let path = root.join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    fn payload_root() -> Utf8TempDir {
        let dir = Utf8TempDir::new().unwrap();
        let root = dir.path();
        for version in [OLD, NEW] {
            touch(root, &format!("{version}/DBPatchFile/{DBSERVER_ARCHIVE}"));
            touch(
                root,
                &format!(
                    "{version}/DomuYumRepository/\
                     exadata_ol8_{version}_Linux-x86-64.zip"
                ),
            );
            touch(
                root,
                &format!("{version}/CellPatchFile/{version}.patch.zip"),
            );
        }
        touch(root, "not-a-version/README");
        dir
    }

    fn entry() -> Value {
        json!({
            "Operation": "patch",
            "PayloadType": "exadata_release",
            "OperationStyle": "rolling",
            "BackupMode": "yes",
            "TargetType": ["domu"],
            "TargetVersion": "LATEST",
            "EnablePlugins": "no",
            "PluginTypes": "none",
            "Retry": "no",
            "RequestId": "E2F947DD-B902-4949-BC04-8B8C52EC170B",
            "DBPatchFile": "LATEST/DBPatchFile/dbserver.patch.zip",
            "DomuYumRepository": "LATEST/DomuYumRepository",
            "CellPatchFile": "LATEST/CellPatchFile",
            "Clusters": [
                {
                    "topology": "cluster-a",
                    "target_env": "production",
                    "rack_name": "rack-a",
                },
            ],
        })
    }

    fn request(entries: Vec<Value>) -> PatchRequest {
        serde_json::from_value(json!({ "Params": entries })).unwrap()
    }

    fn parse(
        name: &str,
        root: &Utf8Path,
        entries: Vec<Value>,
    ) -> Result<Vec<CallDescriptor>, Failure> {
        let logctx = test_setup_log(name);
        let resolver = PayloadResolver::new(
            &logctx.log,
            Arc::new(FsArtifactStore::new(root)),
        );
        let result = resolver.parse(&request(entries));
        logctx.cleanup_successful();
        result
    }

    #[test]
    fn latest_resolves_to_newest_release() {
        let dir = payload_root();
        let root = dir.path();
        let calls = parse("latest_resolves_to_newest_release", root, vec![
            entry(),
        ])
        .unwrap();
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.target_version, NEW);
        assert_eq!(call.target_types, [TargetType::Domu]);
        assert_eq!(
            call.download_files,
            [ArtifactKind::DbPatchFile, ArtifactKind::DomuYumRepository]
        );
        assert_eq!(
            call.patch_files.db_patch.as_deref(),
            Some(
                root.join(format!("{NEW}/DBPatchFile/{DBSERVER_ARCHIVE}"))
                    .as_str()
            )
        );
        assert_eq!(
            call.patch_files.domu_yum_repository.as_deref(),
            Some(
                root.join(format!(
                    "{NEW}/DomuYumRepository/exadata_ol8_{NEW}_Linux-x86-64.zip"
                ))
                .as_str()
            )
        );
        assert_eq!(call.request_id, "e2f947dd-b902-4949-bc04-8b8c52ec170b");
        assert_eq!(call.cluster.topology, "cluster-a");
        assert_eq!(call.cluster.target_env, TargetEnv::Production);
        assert_eq!(call.patch_category(), None);
    }

    #[test]
    fn literal_latest_for_incremental_host_update() {
        let dir = payload_root();
        let mut e = entry();
        e["TargetType"] = json!(["dom0"]);
        e["AdditionalOptions"] = json!([{ "exasplice": "yes", "EnvType": "ecs" }]);
        e["ExaspliceRepository"] = json!("LATEST/ExaspliceRepository");
        let calls = parse(
            "literal_latest_for_incremental_host_update",
            dir.path(),
            vec![e],
        )
        .unwrap();
        let call = &calls[0];
        assert_eq!(call.target_version, LATEST_VERSION);
        assert!(call.keeps_literal_latest());
        assert_eq!(
            call.patch_files.db_patch.as_deref(),
            Some("LATEST/DBPatchFile/dbserver.patch.zip")
        );
        assert_eq!(
            call.download_files,
            [ArtifactKind::DbPatchFile, ArtifactKind::ExaspliceRepository]
        );
        assert_eq!(call.additional_options.exasplice, Some(true));
        assert_eq!(
            call.additional_options.passthrough.get("EnvType"),
            Some(&json!("ecs"))
        );
    }

    #[test]
    fn explicit_version_and_switch_falls_back_to_cell_file() {
        let dir = payload_root();
        let root = dir.path();
        let mut e = entry();
        e["TargetType"] = json!(["Cell", "ibswitch", "bogus", "cell"]);
        e["TargetVersion"] = json!(OLD);
        e["CellPatchFile"] = json!("LATEST/CellPatchFile");
        let calls = parse(
            "explicit_version_and_switch_falls_back_to_cell_file",
            root,
            vec![e],
        )
        .unwrap();
        let call = &calls[0];
        assert_eq!(call.target_types, [TargetType::Cell, TargetType::IbSwitch]);
        let cell = root.join(format!("{OLD}/CellPatchFile/{OLD}.patch.zip"));
        assert_eq!(call.patch_files.cell.as_deref(), Some(cell.as_str()));
        // The cell directory was given for the switch too.
        let switch =
            root.join(format!("{OLD}/CellPatchFile/{OLD}.switch.patch.zip"));
        assert_eq!(call.patch_files.switch.as_deref(), Some(switch.as_str()));
    }

    #[test]
    fn validation_failures() {
        fn mutation(
            f: impl Fn(&mut Value) + 'static,
        ) -> Box<dyn Fn(&mut Value)> {
            Box::new(f)
        }

        let dir = payload_root();
        let cases: Vec<(&str, Box<dyn Fn(&mut Value)>)> = vec![
            ("Operation not provided", mutation(|e: &mut Value| e["Operation"] = Value::Null)),
            ("Invalid Operation", mutation(|e: &mut Value| e["Operation"] = json!("reboot"))),
            ("Invalid Retry", mutation(|e: &mut Value| e["Retry"] = json!("maybe"))),
            ("RequestId not provided", mutation(|e: &mut Value| e["RequestId"] = json!(" "))),
            ("TargetType has no valid entry", mutation(|e: &mut Value| {
                e["TargetType"] = json!(["toaster"])
            })),
            ("Invalid plugin types specified", mutation(|e: &mut Value| {
                e["EnablePlugins"] = json!("yes");
            })),
            ("Invalid plugin types specified for domU", mutation(|e: &mut Value| {
                e["EnablePlugins"] = json!("yes");
                e["PluginTypes"] = json!("dom0");
            })),
            ("Invalid plugin types specified for dom0", mutation(|e: &mut Value| {
                e["EnablePlugins"] = json!("yes");
                e["PluginTypes"] = json!("domu");
                e["TargetType"] = json!(["dom0", "domu"]);
                e["Dom0YumRepository"] = json!("LATEST/Dom0YumRepository");
            })),
            ("Invalid exasplice", mutation(|e: &mut Value| {
                e["AdditionalOptions"] = json!([{ "exasplice": 1 }]);
            })),
        ];
        let logctx = test_setup_log("validation_failures");
        let resolver = PayloadResolver::new(
            &logctx.log,
            Arc::new(FsArtifactStore::new(dir.path())),
        );
        for (expected, mutate) in cases {
            let mut e = entry();
            mutate(&mut e);
            let failure = resolver.parse(&request(vec![e])).unwrap_err();
            assert_eq!(failure.code, ResultCode::IncorrectInput, "{expected}");
            assert!(
                failure.suggestion.contains(expected),
                "{:?} does not mention {expected:?}",
                failure.suggestion
            );
        }

        let plugins_ok = {
            let mut e = entry();
            e["EnablePlugins"] = json!("yes");
            e["PluginTypes"] = json!("DomU");
            e
        };
        let calls = resolver.parse(&request(vec![plugins_ok])).unwrap();
        assert_eq!(calls[0].plugin_types.as_deref(), Some("domu"));
        logctx.cleanup_successful();
    }

    #[test]
    fn duplicate_topology_is_rejected() {
        let dir = payload_root();
        let mut second = entry();
        second["TargetType"] = json!(["cell"]);
        let failure =
            parse("duplicate_topology_is_rejected", dir.path(), vec![
                entry(),
                second,
            ])
            .unwrap_err();
        assert_eq!(failure.code, ResultCode::IncorrectInput);
        assert!(failure.suggestion.contains("cluster-a"));
    }

    #[test]
    fn incomplete_clusters_are_skipped() {
        let dir = payload_root();
        let mut e = entry();
        e["Clusters"] = json!([
            { "topology": "no-env", "rack_name": "r1" },
            { "topology": "bad-env", "target_env": "lab", "rack_name": "r2" },
            { "topology": "no-rack", "target_env": "test" },
            { "topology": "ok", "target_env": "Test", "rack_name": "r3" },
        ]);
        let mut no_clusters = entry();
        no_clusters["Clusters"] = json!([]);
        let calls = parse("incomplete_clusters_are_skipped", dir.path(), vec![
            e,
            no_clusters,
        ])
        .unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].cluster.topology, "ok");
        assert_eq!(calls[0].cluster.target_env, TargetEnv::Test);

        let mut none_valid = entry();
        none_valid["Clusters"] = json!([{ "topology": "x" }]);
        let failure =
            parse("incomplete_clusters_are_skipped", dir.path(), vec![
                none_valid,
            ])
            .unwrap_err();
        assert_eq!(failure.code, ResultCode::IncorrectInput);
    }

    #[test]
    fn missing_artifacts() {
        let dir = payload_root();
        let mut e = entry();
        e["TargetVersion"] = json!("22.1.0.0.0.220101");
        let failure = parse("missing_artifacts", dir.path(), vec![e]).unwrap_err();
        assert_eq!(failure.code, ResultCode::MissingPatchDirectory);
        assert!(failure.suggestion.starts_with("Patch directory path does not exist"));

        // A versioned directory with no image for that version.
        let dir = payload_root();
        std::fs::remove_file(dir.path().join(format!(
            "{NEW}/DomuYumRepository/exadata_ol8_{NEW}_Linux-x86-64.zip"
        )))
        .unwrap();
        let failure =
            parse("missing_artifacts", dir.path(), vec![entry()]).unwrap_err();
        assert_eq!(failure.code, ResultCode::MissingPatchFiles);

        let empty = Utf8TempDir::new().unwrap();
        let failure =
            parse("missing_artifacts", empty.path(), vec![entry()]).unwrap_err();
        assert_eq!(failure.code, ResultCode::MissingPatchDirectory);
    }

    #[test]
    fn oneoff_operations_keep_paths() {
        let dir = payload_root();
        let mut e = entry();
        e["Operation"] = json!("oneoff");
        e["TargetVersion"] = json!(OLD);
        let calls =
            parse("oneoff_operations_keep_paths", dir.path(), vec![e]).unwrap();
        assert_eq!(
            calls[0].patch_files.domu_yum_repository.as_deref(),
            Some("LATEST/DomuYumRepository")
        );

        let mut e = entry();
        e["PayloadType"] = json!("one-offs");
        e["PatchFile"] = json!("patches/p1234.zip");
        let calls =
            parse("oneoff_operations_keep_paths", dir.path(), vec![e]).unwrap();
        assert!(calls[0].download_files.is_empty());
        assert_eq!(
            calls[0].patch_files.patch_file.as_deref(),
            Some("patches/p1234.zip")
        );
    }
}
