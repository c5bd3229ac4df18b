// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The versioned artifact store patch payloads are staged in.
//!
//! The store is laid out as one directory per release version, each holding
//! one directory per [`ArtifactKind`]:
//!
//! ```text
//! <root>/23.1.24.0.0.250306/CellPatchFile/23.1.24.0.0.250306.patch.zip
//! <root>/23.1.24.0.0.250306/DBPatchFile/dbserver.patch.zip
//! <root>/DBPatchFile/dbserver.patch.zip
//! ```
//!
//! The top-level `DBPatchFile` holds a host update tool shared by all
//! versions; whichever copy is newer is used.
//!
//! [`ArtifactKind`]: patch_dispatcher_types::descriptor::ArtifactKind

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use std::cmp::Ordering;
use std::fs::File;
use std::sync::OnceLock;
use thiserror::Error;

pub const DBSERVER_ARCHIVE: &str = "dbserver.patch.zip";
const DBSERVER_STAMP_PREFIX: &str = "dbserver_patch_";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to read {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to read archive {path}")]
    Archive {
        path: Utf8PathBuf,
        #[source]
        err: zip::result::ZipError,
    },
}

/// Read-only view of the artifact store. Paths are relative to its root.
pub trait ArtifactStore: Send + Sync {
    /// Names of the top-level directories.
    fn versions(&self) -> Result<Vec<String>, ArtifactError>;

    /// Entries of a directory, or `None` if it is not a directory.
    fn list_dir(
        &self,
        path: &Utf8Path,
    ) -> Result<Option<Vec<String>>, ArtifactError>;

    fn exists(&self, path: &Utf8Path) -> bool;

    /// The `YYMMDD[.n]` stamp of a host update tool archive.
    fn dbserver_stamp(
        &self,
        archive: &Utf8Path,
    ) -> Result<Option<String>, ArtifactError>;

    /// The path handed downstream for `path`.
    fn locate(&self, path: &Utf8Path) -> Utf8PathBuf;
}

/// An [`ArtifactStore`] on the local filesystem.
#[derive(Clone, Debug)]
pub struct FsArtifactStore {
    root: Utf8PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        FsArtifactStore { root: root.into() }
    }

    fn read_names(
        path: &Utf8Path,
        dirs_only: bool,
    ) -> Result<Vec<String>, ArtifactError> {
        let io_err =
            |err| ArtifactError::Io { path: path.to_owned(), err };
        let mut names = Vec::new();
        for entry in path.read_dir_utf8().map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if dirs_only && !entry.file_type().map_err(io_err)?.is_dir() {
                continue;
            }
            names.push(entry.file_name().to_string());
        }
        names.sort();
        Ok(names)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn versions(&self) -> Result<Vec<String>, ArtifactError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        Self::read_names(&self.root, true)
    }

    fn list_dir(
        &self,
        path: &Utf8Path,
    ) -> Result<Option<Vec<String>>, ArtifactError> {
        let path = self.root.join(path);
        if !path.is_dir() {
            return Ok(None);
        }
        Self::read_names(&path, false).map(Some)
    }

    fn exists(&self, path: &Utf8Path) -> bool {
        self.root.join(path).exists()
    }

    fn dbserver_stamp(
        &self,
        archive: &Utf8Path,
    ) -> Result<Option<String>, ArtifactError> {
        let path = self.root.join(archive);
        let file = File::open(&path)
            .map_err(|err| ArtifactError::Io { path: path.clone(), err })?;
        let archive = zip::ZipArchive::new(file)
            .map_err(|err| ArtifactError::Archive { path, err })?;
        let stamp = archive.file_names().find_map(dbserver_stamp_of);
        Ok(stamp)
    }

    fn locate(&self, path: &Utf8Path) -> Utf8PathBuf {
        self.root.join(path)
    }
}

/// Picks between a version's host update tool archive and the shared one
/// at the top of the store, whichever carries the later stamp. Equal stamps
/// pick the shared copy. Without a readable stamp on both sides the
/// versioned archive is kept.
pub fn newer_dbserver_archive(
    store: &dyn ArtifactStore,
    versioned: &Utf8Path,
) -> Result<Utf8PathBuf, ArtifactError> {
    let Some(shared) = shared_dbserver_archive(versioned) else {
        return Ok(versioned.to_owned());
    };
    if shared == versioned || !store.exists(&shared) {
        return Ok(versioned.to_owned());
    }
    let (Some(ours), Some(theirs)) =
        (store.dbserver_stamp(versioned)?, store.dbserver_stamp(&shared)?)
    else {
        return Ok(versioned.to_owned());
    };
    if compare_versions(&ours, &theirs) == Ordering::Greater {
        Ok(versioned.to_owned())
    } else {
        Ok(shared)
    }
}

/// `<ver>/DBPatchFile/dbserver.patch.zip` maps to
/// `DBPatchFile/dbserver.patch.zip` beside `<ver>`.
fn shared_dbserver_archive(versioned: &Utf8Path) -> Option<Utf8PathBuf> {
    let kind_dir = versioned.parent()?;
    let kind = kind_dir.file_name()?;
    let store_root = kind_dir.parent()?.parent()?;
    Some(store_root.join(kind).join(DBSERVER_ARCHIVE))
}

/// Extracts the stamp from an archive entry such as
/// `dbserver_patch_250313/` or `dbserver_patch_240915.1/README`.
pub fn dbserver_stamp_of(entry: &str) -> Option<String> {
    let top = entry.split('/').next()?;
    let stamp = top.strip_prefix(DBSERVER_STAMP_PREFIX)?;
    (!stamp.is_empty()).then(|| stamp.to_string())
}

fn release_version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\d+\.\d+\.\d+\.\d+\.\d+\.\d{6}(\.\d+)?$")
            .expect("release version pattern is valid")
    })
}

/// A release version such as `23.1.24.0.0.250306` or
/// `18.1.4.0.0.180125.3`.
pub fn is_release_version(name: &str) -> bool {
    release_version_re().is_match(name)
}

/// Full quarterly release strings, as opposed to the bare `YYMMDD[.n]`
/// stamps incremental updates use.
pub fn is_quarterly_version(version: &str) -> bool {
    let parts: Vec<_> = version.split('.').collect();
    (6..=7).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

/// Orders dotted version strings.
///
/// Dashes count as dots. Numeric components compare as numbers and sort
/// before non-numeric ones, which compare as strings. When one version is a
/// prefix of the other the longer one is greater.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a = a.replace('-', ".");
    let b = b.replace('-', ".");
    let a: Vec<&str> = a.split('.').collect();
    let b: Vec<&str> = b.split('.').collect();
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// The newest release version among `names`, ignoring anything that is not
/// a release version.
pub fn latest_release_version<I, S>(names: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .filter(|name| is_release_version(name.as_ref()))
        .max_by(|a, b| compare_versions(a.as_ref(), b.as_ref()))
        .map(|name| name.as_ref().to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use proptest::prelude::*;
    use std::io::Write;
    use test_strategy::proptest;

    #[test]
    fn picks_newest_release() {
        let names = [
            "19.3.6.0.0.200317",
            "23.1.24.0.0.250306",
            "23.1.24.0.0.250306.1",
            "23.1.3.0.0.230613",
            "DBPatchFile",
            "250306",
        ];
        assert_eq!(
            latest_release_version(names).as_deref(),
            Some("23.1.24.0.0.250306.1")
        );
        assert_eq!(latest_release_version(["DBPatchFile"]), None);
    }

    #[test]
    fn version_ordering() {
        assert_eq!(compare_versions("19.10", "19.9"), Ordering::Greater);
        assert_eq!(compare_versions("19-10", "19.10"), Ordering::Equal);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Less);
        assert_eq!(compare_versions("1.a", "1.9"), Ordering::Greater);
        assert!(is_quarterly_version("23.1.24.0.0.250306"));
        assert!(is_quarterly_version("23.1.24.0.0.250306.1"));
        assert!(!is_quarterly_version("250306"));
        assert!(!is_quarterly_version("250306.1"));
    }

    fn component() -> impl Strategy<Value = String> {
        prop_oneof![
            (0u64..30).prop_map(|n| n.to_string()),
            "[a-c]{1,2}",
        ]
    }

    fn version() -> impl Strategy<Value = String> {
        proptest::collection::vec(component(), 1..5)
            .prop_map(|parts| parts.join("."))
    }

    #[proptest]
    fn version_order_is_total(
        #[strategy(version())] a: String,
        #[strategy(version())] b: String,
        #[strategy(version())] c: String,
    ) {
        prop_assert_eq!(compare_versions(&a, &b), compare_versions(&b, &a).reverse());
        if compare_versions(&a, &b) != Ordering::Greater
            && compare_versions(&b, &c) != Ordering::Greater
        {
            prop_assert_ne!(compare_versions(&a, &c), Ordering::Greater);
        }
    }

    fn write_zip(path: &Utf8Path, entries: &[&str]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for entry in entries {
            if entry.ends_with('/') {
                zip.add_directory(*entry, options).unwrap();
            } else {
                zip.start_file(*entry, options).unwrap();
                zip.write_all(b"x").unwrap();
            }
        }
        zip.finish().unwrap();
    }

    #[test]
    fn filesystem_store() {
        let dir = Utf8TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("23.1.24.0.0.250306/DBPatchFile"))
            .unwrap();
        std::fs::write(root.join("README"), "not a version").unwrap();
        write_zip(
            &root.join("23.1.24.0.0.250306/DBPatchFile/dbserver.patch.zip"),
            &["dbserver_patch_250313/", "dbserver_patch_250313/notes.txt"],
        );

        let store = FsArtifactStore::new(root);
        assert_eq!(store.versions().unwrap(), ["23.1.24.0.0.250306"]);
        assert_eq!(
            store
                .list_dir(Utf8Path::new("23.1.24.0.0.250306/DBPatchFile"))
                .unwrap()
                .unwrap(),
            ["dbserver.patch.zip"]
        );
        assert_eq!(store.list_dir(Utf8Path::new("9.9.9.9.9.999999")).unwrap(), None);
        assert_eq!(
            store
                .dbserver_stamp(Utf8Path::new(
                    "23.1.24.0.0.250306/DBPatchFile/dbserver.patch.zip"
                ))
                .unwrap()
                .as_deref(),
            Some("250313")
        );
        assert_eq!(store.locate(Utf8Path::new("a/b")), root.join("a/b"));
    }

    #[test]
    fn shared_dbserver_archive_wins_when_newer() {
        let dir = Utf8TempDir::new().unwrap();
        let root = dir.path();
        let versioned =
            Utf8Path::new("23.1.24.0.0.250306/DBPatchFile/dbserver.patch.zip");
        let shared = Utf8Path::new("DBPatchFile/dbserver.patch.zip");
        std::fs::create_dir_all(root.join("23.1.24.0.0.250306/DBPatchFile"))
            .unwrap();
        std::fs::create_dir_all(root.join("DBPatchFile")).unwrap();
        write_zip(&root.join(versioned), &["dbserver_patch_250313/"]);
        let store = FsArtifactStore::new(root);

        // No shared copy yet.
        assert_eq!(newer_dbserver_archive(&store, versioned).unwrap(), versioned);

        write_zip(&root.join(shared), &["dbserver_patch_231017/"]);
        assert_eq!(newer_dbserver_archive(&store, versioned).unwrap(), versioned);

        write_zip(&root.join(shared), &["dbserver_patch_250313.1/"]);
        assert_eq!(newer_dbserver_archive(&store, versioned).unwrap(), shared);

        write_zip(&root.join(shared), &["dbserver_patch_250313/"]);
        assert_eq!(newer_dbserver_archive(&store, versioned).unwrap(), shared);
    }
}
