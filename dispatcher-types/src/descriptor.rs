// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The validated, per-cluster description of one patch operation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumIter, EnumString};

/// The literal token callers use to ask for the newest available version.
pub const LATEST_VERSION: &str = "LATEST";

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    BackupImage,
    PatchPrereqCheck,
    Patch,
    RollbackPrereqCheck,
    Rollback,
    Postcheck,
    Oneoff,
    #[serde(rename = "oneoffv2")]
    #[strum(serialize = "oneoffv2")]
    OneoffV2,
}

impl Operation {
    /// One-off operations carry their own files and skip version handling.
    pub fn is_oneoff(&self) -> bool {
        matches!(self, Operation::Oneoff | Operation::OneoffV2)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
pub enum PayloadType {
    /// A published release bundle laid out in the versioned artifact store.
    #[serde(rename = "exadata_release")]
    #[strum(serialize = "exadata_release")]
    Release,
    /// An ad-hoc payload named explicitly by the caller.
    #[serde(rename = "one-offs")]
    #[strum(serialize = "one-offs")]
    OneOff,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum OperationStyle {
    Rolling,
    NonRolling,
    Auto,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackupMode {
    #[default]
    #[serde(rename = "")]
    #[strum(serialize = "")]
    Unspecified,
    Yes,
    No,
}

/// What a patch operation acts on.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TargetType {
    /// The hypervisor host.
    Dom0,
    /// The guests of a hypervisor host, patched through the host.
    Dom0Domu,
    /// A guest operating system.
    Domu,
    /// A storage cell.
    Cell,
    /// A fabric switch of unspecified kind.
    Switch,
    IbSwitch,
    RoceSwitch,
}

impl TargetType {
    pub fn is_switch(&self) -> bool {
        matches!(
            self,
            TargetType::Switch | TargetType::IbSwitch | TargetType::RoceSwitch
        )
    }

    /// Targets that live inside a cluster and so participate in the
    /// per-cluster active-operation table.
    pub fn is_cluster_visible(&self) -> bool {
        matches!(
            self,
            TargetType::Dom0
                | TargetType::Dom0Domu
                | TargetType::Domu
                | TargetType::Cell
        )
    }
}

/// The kind of bundle a request installs, derived from the request's
/// incremental-update flag.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
pub enum PatchCategory {
    /// An incremental live update.
    #[serde(rename = "monthly")]
    #[strum(serialize = "monthly")]
    Incremental,
    /// A full scheduled release bundle.
    #[serde(rename = "quarterly")]
    #[strum(serialize = "quarterly")]
    ScheduledBundle,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TargetEnv {
    Production,
    Preproduction,
    Development,
    Test,
}

/// A reference to one cluster's topology definition in a request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterRef {
    /// Name under which the topology provider knows this cluster.
    pub topology: String,
    pub target_env: TargetEnv,
    pub rack_name: String,
}

/// Directories of a release bundle, as named in the artifact store.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
pub enum ArtifactKind {
    CellPatchFile,
    SwitchPatchFile,
    #[serde(rename = "DBPatchFile")]
    #[strum(serialize = "DBPatchFile")]
    DbPatchFile,
    Dom0YumRepository,
    DomuYumRepository,
    ExaspliceRepository,
    PatchFile,
}

/// Artifact paths handed downstream, one optional entry per artifact kind.
///
/// After resolution these are concrete paths (or, for a multi-file host
/// repository, a comma-separated list of paths).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchFiles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom0_yum_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domu_yum_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exasplice_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_file: Option<String>,
}

impl PatchFiles {
    pub fn get(&self, kind: ArtifactKind) -> Option<&str> {
        self.slot(kind).as_deref()
    }

    pub fn set(&mut self, kind: ArtifactKind, path: String) {
        *self.slot_mut(kind) = Some(path);
    }

    fn slot(&self, kind: ArtifactKind) -> &Option<String> {
        match kind {
            ArtifactKind::CellPatchFile => &self.cell,
            ArtifactKind::SwitchPatchFile => &self.switch,
            ArtifactKind::DbPatchFile => &self.db_patch,
            ArtifactKind::Dom0YumRepository => &self.dom0_yum_repository,
            ArtifactKind::DomuYumRepository => &self.domu_yum_repository,
            ArtifactKind::ExaspliceRepository => &self.exasplice_repository,
            ArtifactKind::PatchFile => &self.patch_file,
        }
    }

    fn slot_mut(&mut self, kind: ArtifactKind) -> &mut Option<String> {
        match kind {
            ArtifactKind::CellPatchFile => &mut self.cell,
            ArtifactKind::SwitchPatchFile => &mut self.switch,
            ArtifactKind::DbPatchFile => &mut self.db_patch,
            ArtifactKind::Dom0YumRepository => &mut self.dom0_yum_repository,
            ArtifactKind::DomuYumRepository => &mut self.domu_yum_repository,
            ArtifactKind::ExaspliceRepository => {
                &mut self.exasplice_repository
            }
            ArtifactKind::PatchFile => &mut self.patch_file,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalOptions {
    /// Set when the request is an incremental live update. `None` when the
    /// caller did not say.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exasplice: Option<bool>,
    /// Options passed through to the worker untouched.
    #[serde(default, flatten)]
    pub passthrough: BTreeMap<String, serde_json::Value>,
}

/// One cluster's patch operation, validated and normalized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDescriptor {
    pub operation: Operation,
    pub payload: PayloadType,
    pub style: OperationStyle,
    pub backup_mode: BackupMode,
    /// Ordered and free of duplicates.
    pub target_types: Vec<TargetType>,
    pub target_version: String,
    pub enable_plugins: bool,
    pub plugin_types: Option<String>,
    pub retry: bool,
    pub request_id: String,
    pub additional_options: AdditionalOptions,
    pub compute_node_list: Vec<String>,
    pub storage_node_list: Vec<String>,
    /// Artifact kinds that must be present before the run may start.
    pub download_files: Vec<ArtifactKind>,
    pub patch_files: PatchFiles,
    pub cluster: ClusterRef,
}

impl CallDescriptor {
    pub fn targets_switch(&self) -> bool {
        self.target_types.iter().any(TargetType::is_switch)
    }

    pub fn targets_non_switch(&self) -> bool {
        self.target_types.iter().any(|t| !t.is_switch())
    }

    /// Whether the call patches cells, hypervisor hosts or guests directly.
    pub fn targets_node(&self) -> bool {
        self.target_types.iter().any(|t| {
            matches!(t, TargetType::Cell | TargetType::Dom0 | TargetType::Domu)
        })
    }

    pub fn targets_cluster_visible(&self) -> bool {
        self.target_types.iter().any(TargetType::is_cluster_visible)
    }

    pub fn targets(&self, target: TargetType) -> bool {
        self.target_types.contains(&target)
    }

    pub fn exasplice(&self) -> bool {
        self.additional_options.exasplice == Some(true)
    }

    pub fn patch_category(&self) -> Option<PatchCategory> {
        self.additional_options.exasplice.map(|exasplice| {
            if exasplice {
                PatchCategory::Incremental
            } else {
                PatchCategory::ScheduledBundle
            }
        })
    }

    /// Whether `LATEST` is handed downstream as a literal rather than
    /// resolved here. Only a lone hypervisor-host target under an
    /// incremental update qualifies.
    pub fn keeps_literal_latest(&self) -> bool {
        self.target_version.eq_ignore_ascii_case(LATEST_VERSION)
            && self.target_types == [TargetType::Dom0]
            && self.exasplice()
    }

    /// A copy of this descriptor restricted to its switch or non-switch
    /// targets, or `None` when nothing of that kind is requested.
    pub fn filtered(&self, non_switch: bool) -> Option<CallDescriptor> {
        let target_types: Vec<_> = self
            .target_types
            .iter()
            .copied()
            .filter(|t| t.is_switch() != non_switch)
            .collect();
        if target_types.is_empty() {
            return None;
        }
        Some(CallDescriptor { target_types, ..self.clone() })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) fn descriptor(targets: &[TargetType]) -> CallDescriptor {
        CallDescriptor {
            operation: Operation::Patch,
            payload: PayloadType::Release,
            style: OperationStyle::Rolling,
            backup_mode: BackupMode::Unspecified,
            target_types: targets.to_vec(),
            target_version: "23.1.0.0.0.240101".to_string(),
            enable_plugins: false,
            plugin_types: None,
            retry: false,
            request_id: "req-1".to_string(),
            additional_options: AdditionalOptions::default(),
            compute_node_list: vec![],
            storage_node_list: vec![],
            download_files: vec![],
            patch_files: PatchFiles::default(),
            cluster: ClusterRef {
                topology: "cluster-a".to_string(),
                target_env: TargetEnv::Test,
                rack_name: "rack-1".to_string(),
            },
        }
    }

    #[test]
    fn filtered_splits_switch_from_non_switch() {
        let call = descriptor(&[
            TargetType::Cell,
            TargetType::IbSwitch,
            TargetType::Dom0,
        ]);

        let non_switch = call.filtered(true).unwrap();
        assert_eq!(non_switch.target_types, [TargetType::Cell, TargetType::Dom0]);

        let switch = call.filtered(false).unwrap();
        assert_eq!(switch.target_types, [TargetType::IbSwitch]);

        assert!(descriptor(&[TargetType::Domu]).filtered(false).is_none());
        assert!(descriptor(&[TargetType::Switch]).filtered(true).is_none());
    }

    #[test]
    fn literal_latest_only_for_lone_incremental_host() {
        let mut call = descriptor(&[TargetType::Dom0]);
        call.target_version = "latest".to_string();
        assert!(!call.keeps_literal_latest());

        call.additional_options.exasplice = Some(true);
        assert!(call.keeps_literal_latest());
        assert_eq!(call.patch_category(), Some(PatchCategory::Incremental));

        call.target_types.push(TargetType::Domu);
        assert!(!call.keeps_literal_latest());
    }

    #[test]
    fn wire_names() {
        assert_eq!("oneoffv2".parse::<Operation>().unwrap(), Operation::OneoffV2);
        assert_eq!(
            "patch_prereq_check".parse::<Operation>().unwrap(),
            Operation::PatchPrereqCheck
        );
        assert_eq!(
            "non-rolling".parse::<OperationStyle>().unwrap(),
            OperationStyle::NonRolling
        );
        assert_eq!("".parse::<BackupMode>().unwrap(), BackupMode::Unspecified);
        assert_eq!("ibswitch".parse::<TargetType>().unwrap(), TargetType::IbSwitch);
        assert_eq!(
            "one-offs".parse::<PayloadType>().unwrap(),
            PayloadType::OneOff
        );
        assert_eq!(ArtifactKind::DbPatchFile.to_string(), "DBPatchFile");
        assert_eq!(PatchCategory::ScheduledBundle.to_string(), "quarterly");
    }
}
