//! mtree-style rootfs snapshots. A snapshot records one keyword set per
//! path; diffing a saved snapshot against the current rootfs yields the
//! inode deltas the layer generator consumes.

use crate::fseval::FsEval;
use crate::hash::hex_digest;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File, Metadata};
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    File { size: u64, digest: String },
    Dir,
    Symlink { target: String },
    Char { major: u32, minor: u32 },
    Block { major: u32, minor: u32 },
    Fifo,
    Socket,
}

/// The per-inode keyword set a snapshot stores for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keywords {
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Modified,
    Extra,
    Missing,
    Same,
}

/// One change relative to a prior snapshot. Paths are relative,
/// slash-separated and unique within a delta set.
#[derive(Debug, Clone)]
pub struct InodeDelta {
    pub path: String,
    pub kind: DeltaKind,
    pub prior: Option<Keywords>,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entries: BTreeMap<String, Keywords>,
}

impl Snapshot {
    pub fn capture(root: &Path, fs: FsEval) -> Result<Snapshot> {
        let mut entries = BTreeMap::new();
        fs.walk(root, &mut |path, meta| {
            let rel = path
                .strip_prefix(root)
                .map_err(io::Error::other)?
                .to_path_buf();
            if rel.as_os_str().is_empty() {
                return Ok(());
            }
            let Some(name) = rel.to_str() else {
                return Err(io::Error::other(format!("non-utf8 path name {rel:?}")));
            };
            entries.insert(name.to_string(), keywords_for(fs, path, meta)?);
            Ok(())
        })
        .context("walk rootfs")?;
        Ok(Snapshot { entries })
    }

    pub fn load(path: &Path) -> Result<Snapshot> {
        let file =
            File::open(path).with_context(|| format!("open snapshot {}", path.display()))?;
        serde_json::from_reader(file).context("parse snapshot")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self).context("serialize snapshot")?)
            .with_context(|| format!("write snapshot {}", path.display()))
    }

    /// Compares `self` (the saved baseline) against a freshly-captured
    /// snapshot. Unchanged paths produce no delta.
    pub fn diff(&self, current: &Snapshot) -> Vec<InodeDelta> {
        let mut deltas = Vec::new();
        for (path, prior) in &self.entries {
            match current.entries.get(path) {
                None => deltas.push(InodeDelta {
                    path: path.clone(),
                    kind: DeltaKind::Missing,
                    prior: Some(prior.clone()),
                }),
                Some(keywords) if keywords != prior => deltas.push(InodeDelta {
                    path: path.clone(),
                    kind: DeltaKind::Modified,
                    prior: Some(prior.clone()),
                }),
                Some(_) => {}
            }
        }
        for path in current.entries.keys() {
            if !self.entries.contains_key(path) {
                deltas.push(InodeDelta {
                    path: path.clone(),
                    kind: DeltaKind::Extra,
                    prior: None,
                });
            }
        }
        deltas.sort_by(|a, b| a.path.cmp(&b.path));
        deltas
    }
}

fn keywords_for(fs: FsEval, path: &Path, meta: &Metadata) -> io::Result<Keywords> {
    let file_type = meta.file_type();
    let kind = if file_type.is_file() {
        EntryKind::File {
            size: meta.len(),
            digest: file_digest(fs, path)?,
        }
    } else if file_type.is_dir() {
        EntryKind::Dir
    } else if file_type.is_symlink() {
        let target = fs.readlink(path)?;
        EntryKind::Symlink {
            target: target.to_string_lossy().into_owned(),
        }
    } else if file_type.is_char_device() {
        let (major, minor) = split_rdev(meta.rdev());
        EntryKind::Char { major, minor }
    } else if file_type.is_block_device() {
        let (major, minor) = split_rdev(meta.rdev());
        EntryKind::Block { major, minor }
    } else if file_type.is_fifo() {
        EntryKind::Fifo
    } else {
        EntryKind::Socket
    };

    let mut xattrs = BTreeMap::new();
    for name in fs.list_xattrs(path)? {
        let value = fs.get_xattr(path, &name)?;
        xattrs.insert(name, const_hex::encode(value));
    }

    Ok(Keywords {
        kind,
        mode: meta.mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
        mtime: meta.mtime(),
        xattrs,
    })
}

fn split_rdev(rdev: u64) -> (u32, u32) {
    (rustix::fs::major(rdev), rustix::fs::minor(rdev))
}

fn file_digest(fs: FsEval, path: &Path) -> io::Result<String> {
    let mut file = fs.open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex_digest(hasher.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn kinds(deltas: &[InodeDelta]) -> Vec<(&str, DeltaKind)> {
        deltas.iter().map(|d| (d.path.as_str(), d.kind)).collect()
    }

    #[test]
    fn identical_trees_have_no_deltas() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let snapshot = Snapshot::capture(dir.path(), FsEval::Default).unwrap();
        let again = Snapshot::capture(dir.path(), FsEval::Default).unwrap();
        assert!(snapshot.diff(&again).is_empty());
    }

    #[test]
    fn added_removed_and_changed_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d/old"), b"old").unwrap();
        fs::write(dir.path().join("kept"), b"same").unwrap();
        fs::write(dir.path().join("changed"), b"before").unwrap();
        let baseline = Snapshot::capture(dir.path(), FsEval::Default).unwrap();

        fs::remove_file(dir.path().join("d/old")).unwrap();
        fs::write(dir.path().join("changed"), b"after!").unwrap();
        fs::write(dir.path().join("new"), b"fresh").unwrap();
        let current = Snapshot::capture(dir.path(), FsEval::Default).unwrap();

        let deltas = baseline.diff(&current);
        assert_eq!(
            kinds(&deltas),
            vec![
                ("changed", DeltaKind::Modified),
                ("d/old", DeltaKind::Missing),
                ("new", DeltaKind::Extra),
            ]
        );
        let modified = &deltas[0];
        assert!(matches!(
            modified.prior.as_ref().unwrap().kind,
            EntryKind::File { size: 6, .. }
        ));
        assert!(deltas[2].prior.is_none());
    }

    #[test]
    fn content_change_with_same_size_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"aaaa").unwrap();
        let baseline = Snapshot::capture(dir.path(), FsEval::Default).unwrap();
        fs::write(dir.path().join("f"), b"bbbb").unwrap();
        let current = Snapshot::capture(dir.path(), FsEval::Default).unwrap();
        assert_eq!(kinds(&baseline.diff(&current)), vec![("f", DeltaKind::Modified)]);
    }

    #[test]
    fn symlink_targets_are_keywords() {
        let dir = tempfile::tempdir().unwrap();
        symlink("target-1", dir.path().join("link")).unwrap();
        let baseline = Snapshot::capture(dir.path(), FsEval::Default).unwrap();
        fs::remove_file(dir.path().join("link")).unwrap();
        symlink("target-2", dir.path().join("link")).unwrap();
        let current = Snapshot::capture(dir.path(), FsEval::Default).unwrap();
        assert_eq!(kinds(&baseline.diff(&current)), vec![("link", DeltaKind::Modified)]);
    }

    #[test]
    fn snapshot_roundtrips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d/file"), b"content").unwrap();
        let snapshot = Snapshot::capture(dir.path(), FsEval::Default).unwrap();

        let path = dir.path().join("snapshot.json");
        snapshot.save(&path).unwrap();
        let loaded = Snapshot::load(&path).unwrap();
        assert_eq!(snapshot, loaded);
    }
}
