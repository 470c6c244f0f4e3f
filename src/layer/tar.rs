use crate::fseval::FsEval;
use crate::layer::PackOptions;
use crate::utils::split_path;
use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::io;
use std::io::Write;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tar::{Builder, EntryType, Header};
use tracing::{debug, warn};

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// overlayfs bookkeeping must never leak into a layer.
const OVERLAY_XATTR_PREFIX: &str = "trusted.overlay.";

const PAX_SCHILY_XATTR: &str = "SCHILY.xattr.";

/// Emulates a tar generator for exactly one layer stream. Hardlink state
/// does not survive the generator, so hardlinks split across layers are
/// re-archived as regular files.
pub struct TarGenerator<W: Write> {
    builder: Builder<CountingWriter<W>>,
    opts: PackOptions,
    fs: FsEval,
    hardlinks: HashMap<(u64, u64), String>,
    seen_dirs: HashSet<String>,
}

impl<W: Write> TarGenerator<W> {
    pub fn new(sink: W, opts: PackOptions) -> Self {
        let fs = FsEval::for_map_options(&opts.map);
        TarGenerator {
            builder: Builder::new(CountingWriter::new(sink)),
            opts,
            fs,
            hardlinks: HashMap::new(),
            seen_dirs: HashSet::new(),
        }
    }

    pub fn fs(&self) -> FsEval {
        self.fs
    }

    /// Bytes emitted into the underlying sink so far.
    pub fn bytes_written(&self) -> u64 {
        self.builder.get_ref().written()
    }

    /// Serializes the filesystem object at `disk_path` as a tar entry named
    /// `tar_path`. The caller provides the lstat result so it can account
    /// for the entry's size before committing to it.
    pub fn add_file(&mut self, tar_path: &str, disk_path: &Path, meta: &Metadata) -> Result<()> {
        validate_path(tar_path)?;
        if self.opts.is_masked(tar_path) {
            warn!("skipping masked path {tar_path}");
            return Ok(());
        }

        let file_type = meta.file_type();

        // overlayfs represents a deletion as a character device with
        // device number 0:0.
        if self.opts.map.translate_overlay_whiteouts && file_type.is_char_device() {
            let (major, minor) = split_rdev(meta.rdev());
            if major == 0 && minor == 0 {
                debug!("translating overlayfs whiteout at {tar_path}");
                return self.emit_whiteout(tar_path);
            }
        }

        if file_type.is_socket() {
            warn!("skipping socket {tar_path}: sockets cannot be archived");
            return Ok(());
        }

        let mut header = Header::new_gnu();
        header.set_mode(meta.mode() & 0o7777);
        header.set_uid(u64::from(
            self.opts.map.uid_to_container(meta.uid()).context("map uid")?,
        ));
        header.set_gid(u64::from(
            self.opts.map.gid_to_container(meta.gid()).context("map gid")?,
        ));
        header.set_mtime(meta.mtime().max(0) as u64);
        header.set_size(0);

        let xattrs = self.collect_xattrs(disk_path)?;

        if file_type.is_file() {
            if meta.nlink() > 1 {
                let key = (meta.dev(), meta.ino());
                if let Some(first) = self.hardlinks.get(&key).cloned() {
                    header.set_entry_type(EntryType::Link);
                    self.builder
                        .append_link(&mut header, tar_path, &first)
                        .context("write hardlink header")?;
                    return Ok(());
                }
                self.hardlinks.insert(key, tar_path.to_string());
            }
            self.append_pax(&xattrs)?;
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.len());
            let file = self.fs.open(disk_path).context("open file")?;
            self.builder
                .append_data(&mut header, tar_path, file)
                .context("write file")?;
        } else if file_type.is_dir() {
            if !self.seen_dirs.insert(tar_path.to_string()) {
                debug!("directory {tar_path} already archived");
                return Ok(());
            }
            self.append_pax(&xattrs)?;
            header.set_entry_type(EntryType::Directory);
            self.builder
                .append_data(&mut header, tar_path, io::empty())
                .context("write directory header")?;
        } else if file_type.is_symlink() {
            let target = self.fs.readlink(disk_path).context("readlink")?;
            self.append_pax(&xattrs)?;
            header.set_entry_type(EntryType::Symlink);
            self.builder
                .append_link(&mut header, tar_path, &target)
                .context("write symlink header")?;
        } else if file_type.is_char_device() || file_type.is_block_device() {
            let (major, minor) = split_rdev(meta.rdev());
            self.append_pax(&xattrs)?;
            header.set_entry_type(if file_type.is_char_device() {
                EntryType::Char
            } else {
                EntryType::Block
            });
            header.set_device_major(major).context("set device major")?;
            header.set_device_minor(minor).context("set device minor")?;
            self.builder
                .append_data(&mut header, tar_path, io::empty())
                .context("write device header")?;
        } else if file_type.is_fifo() {
            self.append_pax(&xattrs)?;
            header.set_entry_type(EntryType::Fifo);
            self.builder
                .append_data(&mut header, tar_path, io::empty())
                .context("write fifo header")?;
        } else {
            warn!("skipping {tar_path}: unknown file type");
        }
        Ok(())
    }

    /// Marks `tar_path` as deleted by emitting an empty `.wh.`-prefixed
    /// regular file next to it.
    pub fn add_whiteout(&mut self, tar_path: &str) -> Result<()> {
        validate_path(tar_path)?;
        if self.opts.is_masked(tar_path) {
            warn!("skipping masked path {tar_path}");
            return Ok(());
        }
        self.emit_whiteout(tar_path)
    }

    /// Marks the directory `tar_path` as opaque: lower-layer contents are
    /// hidden when the layer is applied.
    pub fn add_opaque_whiteout(&mut self, tar_path: &str) -> Result<()> {
        validate_path(tar_path)?;
        if self.opts.is_masked(tar_path) {
            warn!("skipping masked path {tar_path}");
            return Ok(());
        }
        let name = format!("{}/{OPAQUE_WHITEOUT}", tar_path.trim_end_matches('/'));
        self.append_empty_file(&name)
            .context("write opaque whiteout header")
    }

    /// Finalizes the stream with the two end-of-archive zero blocks and
    /// hands the sink back.
    pub fn close(self) -> Result<W> {
        let counting = self.builder.into_inner().context("close tar writer")?;
        let mut sink = counting.into_inner();
        sink.flush().context("flush layer sink")?;
        Ok(sink)
    }

    fn emit_whiteout(&mut self, tar_path: &str) -> Result<()> {
        let (dir, base) = split_path(tar_path);
        self.append_empty_file(&format!("{dir}{WHITEOUT_PREFIX}{base}"))
            .context("write whiteout header")
    }

    fn append_empty_file(&mut self, name: &str) -> io::Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0);
        header.set_size(0);
        header.set_mtime(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |elapsed| elapsed.as_secs()),
        );
        self.builder.append_data(&mut header, name, io::empty())
    }

    fn collect_xattrs(&self, disk_path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
        let mut names = self.fs.list_xattrs(disk_path).context("list xattrs")?;
        names.sort();
        let mut records = Vec::with_capacity(names.len());
        for name in names {
            let Some(key) = xattr_pax_key(&name) else {
                debug!("dropping xattr {name} on {}", disk_path.display());
                continue;
            };
            let value = self.fs.get_xattr(disk_path, &name).context("get xattr")?;
            records.push((key, value));
        }
        Ok(records)
    }

    fn append_pax(&mut self, xattrs: &[(String, Vec<u8>)]) -> Result<()> {
        if xattrs.is_empty() {
            return Ok(());
        }
        self.builder
            .append_pax_extensions(xattrs.iter().map(|(key, value)| (key.as_str(), value.as_slice())))
            .context("write pax header")
    }
}

/// PAX record key for an xattr, or `None` for names that must not be
/// archived.
fn xattr_pax_key(name: &str) -> Option<String> {
    if name.starts_with(OVERLAY_XATTR_PREFIX) {
        return None;
    }
    Some(format!("{PAX_SCHILY_XATTR}{name}"))
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        bail!("empty tar path");
    }
    if path.split('/').any(|component| component == "..") {
        bail!("unsafe tar path {path:?}");
    }
    Ok(())
}

fn split_rdev(rdev: u64) -> (u32, u32) {
    (rustix::fs::major(rdev), rustix::fs::minor(rdev))
}

pub(crate) struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        CountingWriter { inner, written: 0 }
    }

    fn written(&self) -> u64 {
        self.written
    }

    fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
