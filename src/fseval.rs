//! Capability boundary for every filesystem read the layer generator
//! performs. The rootless variant retries denied operations after granting
//! the owner temporary access, which only works when the caller owns the
//! files (the rootless user-namespace case).

use crate::idmap::MapOptions;
use rustix::fs::Mode;
use rustix::io::Errno;
use std::fs::{self, File, Metadata};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEval {
    Default,
    Rootless,
}

impl FsEval {
    pub fn for_map_options(opt: &MapOptions) -> FsEval {
        if opt.rootless {
            FsEval::Rootless
        } else {
            FsEval::Default
        }
    }

    pub fn lstat(&self, path: &Path) -> io::Result<Metadata> {
        self.with_access(path, || fs::symlink_metadata(path))
    }

    pub fn readlink(&self, path: &Path) -> io::Result<PathBuf> {
        self.with_access(path, || fs::read_link(path))
    }

    pub fn open(&self, path: &Path) -> io::Result<File> {
        self.with_access(path, || File::open(path))
    }

    pub fn list_xattrs(&self, path: &Path) -> io::Result<Vec<String>> {
        self.with_access(path, || list_xattrs(path))
    }

    pub fn get_xattr(&self, path: &Path, name: &str) -> io::Result<Vec<u8>> {
        self.with_access(path, || get_xattr(path, name))
    }

    /// Directory entries sorted by file name, so walks are deterministic.
    pub fn read_dir(&self, path: &Path) -> io::Result<Vec<fs::DirEntry>> {
        self.with_access(path, || {
            let mut entries = fs::read_dir(path)?.collect::<io::Result<Vec<_>>>()?;
            entries.sort_by_key(|entry| entry.file_name());
            Ok(entries)
        })
    }

    /// Pre-order walk: the root first, then each directory before its
    /// children, siblings in file-name order.
    pub fn walk<F>(&self, root: &Path, visitor: &mut F) -> io::Result<()>
    where
        F: FnMut(&Path, &Metadata) -> io::Result<()>,
    {
        let meta = self.lstat(root)?;
        self.walk_inner(root, &meta, visitor)
    }

    fn walk_inner<F>(&self, path: &Path, meta: &Metadata, visitor: &mut F) -> io::Result<()>
    where
        F: FnMut(&Path, &Metadata) -> io::Result<()>,
    {
        visitor(path, meta)?;
        if meta.is_dir() {
            for entry in self.read_dir(path)? {
                let child = entry.path();
                let child_meta = self.lstat(&child)?;
                self.walk_inner(&child, &child_meta, visitor)?;
            }
        }
        Ok(())
    }

    fn with_access<T>(&self, path: &Path, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
        match op() {
            Err(err)
                if *self == FsEval::Rootless && err.kind() == io::ErrorKind::PermissionDenied =>
            {
                let restore = grant_owner_access(path);
                let result = op();
                restore_modes(restore);
                result
            }
            result => result,
        }
    }
}

/// Grants the owner access along the whole path, top-down so each chmod can
/// stat the next component. Returns the modes to restore, deepest last.
fn grant_owner_access(path: &Path) -> Vec<(PathBuf, u32)> {
    let mut restore = Vec::new();
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        let Ok(meta) = fs::symlink_metadata(&current) else {
            break;
        };
        // chmod on a symlink would change its target instead.
        if meta.file_type().is_symlink() {
            continue;
        }
        let mode = meta.mode() & 0o7777;
        let want = if meta.is_dir() { 0o700 } else { 0o600 };
        if mode & want != want
            && rustix::fs::chmod(&current, Mode::from_raw_mode(mode | want)).is_ok()
        {
            restore.push((current.clone(), mode));
        }
    }
    restore
}

fn restore_modes(restore: Vec<(PathBuf, u32)>) {
    for (path, mode) in restore.into_iter().rev() {
        let _ = rustix::fs::chmod(&path, Mode::from_raw_mode(mode));
    }
}

fn list_xattrs(path: &Path) -> io::Result<Vec<String>> {
    let mut buf = Vec::new();
    loop {
        let needed = match rustix::fs::llistxattr(path, &mut []) {
            Ok(needed) => needed,
            Err(Errno::OPNOTSUPP) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        if needed == 0 {
            return Ok(Vec::new());
        }
        buf.resize(needed, 0);
        match rustix::fs::llistxattr(path, &mut buf) {
            Ok(len) => {
                buf.truncate(len);
                return Ok(buf
                    .split(|byte| *byte == 0)
                    .filter(|name| !name.is_empty())
                    .map(|name| String::from_utf8_lossy(name).into_owned())
                    .collect());
            }
            // The list changed between the two calls.
            Err(Errno::RANGE) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

fn get_xattr(path: &Path, name: &str) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    loop {
        let needed = rustix::fs::lgetxattr(path, name, &mut [])?;
        buf.resize(needed, 0);
        match rustix::fs::lgetxattr(path, name, &mut buf) {
            Ok(len) => {
                buf.truncate(len);
                return Ok(buf);
            }
            Err(Errno::RANGE) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}
