// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::{Utf8Path, Utf8PathBuf};
use patch_dispatcher::artifacts::{
    ArtifactError, ArtifactStore, DBSERVER_ARCHIVE,
};
use std::collections::{BTreeMap, BTreeSet};

/// Where [`MemoryArtifactStore::locate`] claims files live.
const MOUNT: &str = "/payloads";

/// An [`ArtifactStore`] holding a fixed set of file paths.
#[derive(Clone, Debug, Default)]
pub struct MemoryArtifactStore {
    files: BTreeSet<Utf8PathBuf>,
    stamps: BTreeMap<Utf8PathBuf, String>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.files.insert(path.into());
        self
    }

    /// Adds a host update tool archive carrying `stamp`.
    pub fn with_dbserver(
        mut self,
        path: impl Into<Utf8PathBuf>,
        stamp: &str,
    ) -> Self {
        let path = path.into();
        self.stamps.insert(path.clone(), stamp.to_string());
        self.files.insert(path);
        self
    }

    /// Adds one file of every kind for `version`.
    pub fn with_release(self, version: &str) -> Self {
        self.with_file(format!("{version}/CellPatchFile/{version}.patch.zip"))
            .with_file(format!(
                "{version}/SwitchPatchFile/{version}.switch.patch.zip"
            ))
            .with_file(format!("{version}/DBPatchFile/{DBSERVER_ARCHIVE}"))
            .with_file(format!("{version}/Dom0YumRepository/dom0_{version}.zip"))
            .with_file(format!(
                "{version}/DomuYumRepository/\
                 exadata_ol8_{version}_Linux-x86-64.zip"
            ))
    }

    fn is_dir(&self, path: &Utf8Path) -> bool {
        self.files.iter().any(|f| f != path && f.starts_with(path))
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn versions(&self) -> Result<Vec<String>, ArtifactError> {
        let names: BTreeSet<String> = self
            .files
            .iter()
            .filter(|f| f.components().count() > 1)
            .filter_map(|f| f.components().next())
            .map(|c| c.as_str().to_string())
            .collect();
        Ok(names.into_iter().collect())
    }

    fn list_dir(
        &self,
        path: &Utf8Path,
    ) -> Result<Option<Vec<String>>, ArtifactError> {
        if !self.is_dir(path) {
            return Ok(None);
        }
        let names: BTreeSet<String> = self
            .files
            .iter()
            .filter_map(|f| f.strip_prefix(path).ok())
            .filter_map(|rest| rest.components().next())
            .map(|c| c.as_str().to_string())
            .collect();
        Ok(Some(names.into_iter().collect()))
    }

    fn exists(&self, path: &Utf8Path) -> bool {
        self.files.contains(path) || self.is_dir(path)
    }

    fn dbserver_stamp(
        &self,
        archive: &Utf8Path,
    ) -> Result<Option<String>, ArtifactError> {
        Ok(self.stamps.get(archive).cloned())
    }

    fn locate(&self, path: &Utf8Path) -> Utf8PathBuf {
        Utf8Path::new(MOUNT).join(path)
    }
}
