use crate::layer::pipe::{pipe, PipeReader, PipeSentinel, PipeWriter};
use crate::layer::tar::TarGenerator;
use crate::layer::PackOptions;
use crate::idmap::MapOptions;
use crate::snapshot::{DeltaKind, InodeDelta};
use crate::utils::parent_dir;
use anyhow::{bail, Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;
use tracing::{trace, warn};

/// Over-approximation of one tar header plus its PAX records. Entries with
/// very large xattr payloads can exceed it, which only makes the layer
/// budget a soft target.
const HEADER_SLACK: u64 = 1024;

/// Turns a sorted delta set into a sequence of tar layer streams, each kept
/// under `max_layer_bytes` where possible. Splitting is entry-granular: an
/// oversized file still lands in a single layer. The receiver holds at most
/// one pending stream, so production of layer N+1 stalls until the consumer
/// picks up layer N; a dropped receiver aborts the producer.
pub fn generate_layers(
    root: &Path,
    deltas: Vec<InodeDelta>,
    opts: PackOptions,
) -> Result<Receiver<PipeReader>> {
    let (tx, rx) = sync_channel(1);
    let root = root.to_path_buf();
    thread::Builder::new()
        .name("layer-generator".into())
        .spawn(move || produce(root, deltas, opts, tx))
        .context("spawn layer generator")?;
    Ok(rx)
}

/// Single-layer convenience wrapper around [`generate_layers`].
pub fn generate_layer(
    root: &Path,
    deltas: Vec<InodeDelta>,
    mut opts: PackOptions,
) -> Result<PipeReader> {
    opts.max_layer_bytes = 0;
    let layers = generate_layers(root, deltas, opts)?;
    layers.recv().context("layer generator produced no stream")
}

/// Generates a layer holding the whole tree under `root`, archived at
/// `target`. With `root = None` the target is deleted via a whiteout
/// instead; `opaque` additionally hides lower-layer contents of the target
/// directory.
pub fn generate_insert_layer(
    root: Option<PathBuf>,
    target: &str,
    opaque: bool,
    map: MapOptions,
) -> PipeReader {
    let opts = PackOptions {
        map,
        ..PackOptions::default()
    };
    let (writer, reader) = pipe();
    let target = target.to_string();
    thread::spawn(move || {
        let sentinel = writer.sentinel();
        let mut generator = TarGenerator::new(writer, opts);
        let result = insert_tree(&mut generator, root.as_deref(), &target, opaque)
            .and_then(|()| generator.close().map(|_| ()));
        finish(result, &sentinel);
    });
    reader
}

fn produce(
    root: PathBuf,
    mut deltas: Vec<InodeDelta>,
    opts: PackOptions,
    tx: SyncSender<PipeReader>,
) {
    sort_deltas(&mut deltas);

    let (writer, reader) = pipe();
    if tx.send(reader).is_err() {
        return;
    }
    let mut sentinel = writer.sentinel();
    let generator = TarGenerator::new(writer, opts.clone());
    let result = drain_deltas(&root, &deltas, &opts, &tx, &mut sentinel, generator);
    finish(result, &sentinel);
}

fn finish(result: Result<()>, sentinel: &PipeSentinel) {
    if let Err(err) = result {
        warn!("generate layer: {err:#}");
        sentinel.close_with_error(io::Error::other(format!("generate layer: {err:#}")));
    }
}

fn drain_deltas(
    root: &Path,
    deltas: &[InodeDelta],
    opts: &PackOptions,
    tx: &SyncSender<PipeReader>,
    sentinel: &mut PipeSentinel,
    mut generator: TarGenerator<PipeWriter>,
) -> Result<()> {
    for delta in deltas {
        // Masked deltas contribute neither entries nor budget.
        if opts.is_masked(&delta.path) {
            warn!("skipping masked delta {}", delta.path);
            continue;
        }
        match delta.kind {
            DeltaKind::Modified | DeltaKind::Extra => {
                let disk_path = root.join(&delta.path);
                let meta = generator
                    .fs()
                    .lstat(&disk_path)
                    .context("add file lstat")?;
                generator = maybe_split(opts, tx, sentinel, generator, meta.len())?;
                if let Some(prior) = &delta.prior {
                    trace!(path = %delta.path, was = ?prior.kind, "re-archiving modified entry");
                }
                generator
                    .add_file(&delta.path, &disk_path, &meta)
                    .context("generate layer file")?;
            }
            DeltaKind::Missing => {
                generator = maybe_split(opts, tx, sentinel, generator, 0)?;
                generator
                    .add_whiteout(&delta.path)
                    .context("generate whiteout layer file")?;
            }
            DeltaKind::Same => {}
        }
    }
    generator.close().context("close tar writer")?;
    Ok(())
}

/// Seals the current layer and opens the next one if the upcoming entry
/// would blow the budget.
fn maybe_split(
    opts: &PackOptions,
    tx: &SyncSender<PipeReader>,
    sentinel: &mut PipeSentinel,
    generator: TarGenerator<PipeWriter>,
    entry_size: u64,
) -> Result<TarGenerator<PipeWriter>> {
    let written = generator.bytes_written();
    if opts.max_layer_bytes == 0
        || written == 0
        || written + entry_size + HEADER_SLACK <= opts.max_layer_bytes
    {
        return Ok(generator);
    }
    generator.close().context("close tar writer")?;
    let (writer, reader) = pipe();
    if tx.send(reader).is_err() {
        bail!("layer consumer dropped");
    }
    *sentinel = writer.sentinel();
    Ok(TarGenerator::new(writer, opts.clone()))
}

/// Orders deltas so that parent directories precede their children while
/// whiteouts precede additions within the same directory; plain
/// lexicographic order alone would let a same-directory addition slip in
/// front of a deletion it is meant to replace.
fn sort_deltas(deltas: &mut [InodeDelta]) {
    deltas.sort_by(|a, b| {
        parent_dir(&a.path)
            .cmp(parent_dir(&b.path))
            .then_with(|| (a.kind != DeltaKind::Missing).cmp(&(b.kind != DeltaKind::Missing)))
            .then_with(|| a.path.cmp(&b.path))
    });
}

fn insert_tree(
    generator: &mut TarGenerator<PipeWriter>,
    root: Option<&Path>,
    target: &str,
    opaque: bool,
) -> Result<()> {
    if opaque {
        generator.add_opaque_whiteout(target)?;
    }
    let Some(root) = root else {
        return generator.add_whiteout(target);
    };
    let fs = generator.fs();
    fs.walk(root, &mut |path, meta| {
        let rel = path.strip_prefix(root).map_err(io::Error::other)?;
        let tar_path = join_target(target, rel);
        generator
            .add_file(&tar_path, path, meta)
            .map_err(io::Error::other)
    })
    .context("walk insert root")?;
    Ok(())
}

fn join_target(target: &str, rel: &Path) -> String {
    let rel = rel.to_string_lossy();
    let target = if target.is_empty() { "/" } else { target };
    if rel.is_empty() {
        target.to_string()
    } else if target.ends_with('/') {
        format!("{target}{rel}")
    } else {
        format!("{target}/{rel}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Keywords;
    use crate::test_utils::{entry_names, read_all, read_tar_entries};
    use std::fs;
    use tar::EntryType;

    fn delta(path: &str, kind: DeltaKind) -> InodeDelta {
        InodeDelta {
            path: path.to_string(),
            kind,
            prior: None,
        }
    }

    #[test]
    fn empty_diff_is_one_empty_layer() {
        let dir = tempfile::tempdir().unwrap();
        let layers =
            generate_layers(dir.path(), Vec::new(), PackOptions::default()).unwrap();
        let streams: Vec<_> = layers.into_iter().map(read_all).collect();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0], vec![0u8; 1024]);
    }

    #[test]
    fn single_added_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let reader = generate_layer(
            dir.path(),
            vec![delta("a.txt", DeltaKind::Extra)],
            PackOptions::default(),
        )
        .unwrap();
        let content = read_all(reader);

        let entries = read_tar_entries(&content);
        assert_eq!(entries.len(), 1);
        let (header, body) = &entries[0];
        assert_eq!(header.path().unwrap().to_str().unwrap(), "a.txt");
        assert_eq!(header.entry_type(), EntryType::Regular);
        assert_eq!(header.size().unwrap(), 5);
        assert_eq!(body.as_slice(), b"hello");
        assert!(content.ends_with(&[0u8; 1024]));
    }

    #[test]
    fn whiteout_precedes_replacement() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d/x"), b"new content").unwrap();

        // Replacement: the path is deleted and re-added in one delta set,
        // supplied in the wrong order on purpose.
        let reader = generate_layer(
            dir.path(),
            vec![delta("d/x", DeltaKind::Extra), delta("d/x", DeltaKind::Missing)],
            PackOptions::default(),
        )
        .unwrap();
        let content = read_all(reader);
        assert_eq!(entry_names(&content), vec!["d/.wh.x", "d/x"]);
    }

    #[test]
    fn parents_precede_children() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/c"), b"x").unwrap();

        let reader = generate_layer(
            dir.path(),
            vec![
                delta("a/b/c", DeltaKind::Extra),
                delta("a", DeltaKind::Extra),
                delta("a/b", DeltaKind::Extra),
            ],
            PackOptions::default(),
        )
        .unwrap();
        let content = read_all(reader);
        assert_eq!(entry_names(&content), vec!["a", "a/b", "a/b/c"]);
    }

    #[test]
    fn same_deltas_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let reader = generate_layer(
            dir.path(),
            vec![delta("ghost", DeltaKind::Same)],
            PackOptions::default(),
        )
        .unwrap();
        assert_eq!(read_all(reader), vec![0u8; 1024]);
    }

    #[test]
    fn masked_delta_produces_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let opts = PackOptions {
            masked_paths: vec!["var/".to_string()],
            ..PackOptions::default()
        };
        // The path does not even exist on disk; masking must skip it before
        // the lstat.
        let reader = generate_layer(
            dir.path(),
            vec![delta("var/log/x", DeltaKind::Extra)],
            opts,
        )
        .unwrap();
        assert_eq!(read_all(reader), vec![0u8; 1024]);
    }

    #[test]
    fn layers_split_at_the_byte_budget() {
        let dir = tempfile::tempdir().unwrap();
        let big = vec![0x42u8; 10 * 1024 * 1024];
        fs::write(dir.path().join("first.bin"), &big).unwrap();
        fs::write(dir.path().join("second.bin"), &big).unwrap();

        let opts = PackOptions {
            max_layer_bytes: 12_000_000,
            ..PackOptions::default()
        };
        let layers = generate_layers(
            dir.path(),
            vec![
                delta("first.bin", DeltaKind::Extra),
                delta("second.bin", DeltaKind::Extra),
            ],
            opts,
        )
        .unwrap();

        let streams: Vec<_> = layers.into_iter().map(read_all).collect();
        assert_eq!(streams.len(), 2);
        assert_eq!(entry_names(&streams[0]), vec!["first.bin"]);
        assert_eq!(entry_names(&streams[1]), vec!["second.bin"]);
        for stream in &streams {
            assert!(stream.len() as u64 <= 12_000_000);
        }
    }

    #[test]
    fn missing_file_fails_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let reader = generate_layer(
            dir.path(),
            vec![delta("does-not-exist", DeltaKind::Extra)],
            PackOptions::default(),
        )
        .unwrap();
        let mut reader = reader;
        let err = std::io::copy(&mut reader, &mut std::io::sink()).unwrap_err();
        assert!(err.to_string().contains("add file lstat"), "{err}");
    }

    #[test]
    fn modified_delta_re_archives_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"after").unwrap();

        let prior = None::<Keywords>;
        let reader = generate_layer(
            dir.path(),
            vec![InodeDelta {
                path: "f".to_string(),
                kind: DeltaKind::Modified,
                prior,
            }],
            PackOptions::default(),
        )
        .unwrap();
        let entries = read_tar_entries(&read_all(reader));
        assert_eq!(entries[0].1, b"after");
    }

    #[test]
    fn insert_layer_walks_from_the_target() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("test"), b"inserted").unwrap();

        let reader = generate_insert_layer(
            Some(dir.path().to_path_buf()),
            "/",
            false,
            MapOptions::default(),
        );
        let content = read_all(reader);
        assert_eq!(entry_names(&content), vec!["/", "/test"]);
        let entries = read_tar_entries(&content);
        assert_eq!(entries[0].0.entry_type(), EntryType::Directory);
        assert_eq!(entries[1].1, b"inserted");
    }

    #[test]
    fn insert_layer_without_root_is_a_whiteout() {
        let reader = generate_insert_layer(None, "/etc/conf", true, MapOptions::default());
        let content = read_all(reader);
        assert_eq!(
            entry_names(&content),
            vec!["/etc/conf/.wh..wh..opq", "/etc/.wh.conf"]
        );
    }
}
