use crate::bundle::BundleMeta;
use crate::compress::Compressor;
use crate::fseval::FsEval;
use crate::hash::digest_reader;
use crate::layer::{generate_layers, PackOptions};
use crate::mutate::Mutator;
use crate::snapshot::Snapshot;
use crate::store::Store;
use crate::utils::display_bytes;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use oci_spec::image::{History, HistoryBuilder, ImageConfiguration};
use std::path::PathBuf;
use tracing::{debug, info};

pub struct RepackOptions {
    pub bundle: PathBuf,
    pub image: PathBuf,
    pub tag: String,
    pub mask_paths: Vec<String>,
    pub no_mask_volumes: bool,
    pub refresh_bundle: bool,
    pub max_layer_bytes: u64,
    pub compressor: Compressor,
    /// `None` disables the history entry entirely.
    pub history: Option<HistoryOverrides>,
}

#[derive(Debug, Default, Clone)]
pub struct HistoryOverrides {
    pub author: Option<String>,
    pub comment: Option<String>,
    pub created: Option<String>,
    pub created_by: Option<String>,
}

pub fn repack(opts: RepackOptions) -> Result<()> {
    let meta = BundleMeta::read(&opts.bundle).context("read bundle metadata")?;
    debug!(
        version = %meta.version,
        from = %meta.from.digest(),
        rootless = meta.map_options.rootless,
        "loaded bundle metadata"
    );

    let store = Store::open(&opts.image).context("open image store")?;
    let mut mutator = Mutator::new(&store, &meta.from).context("create mutator for base image")?;

    // Volume mountpoints never contribute to the diff.
    let mut masked_paths = opts.mask_paths.clone();
    if !opts.no_mask_volumes {
        if let Some(config) = mutator.config().config() {
            if let Some(volumes) = config.volumes() {
                masked_paths.extend(volumes.iter().cloned());
            }
        }
    }

    let rootfs = BundleMeta::rootfs(&opts.bundle);
    let fs = FsEval::for_map_options(&meta.map_options);
    let saved = Snapshot::load(&BundleMeta::snapshot_path(&opts.bundle))
        .context("read bundle snapshot")?;
    let current = Snapshot::capture(&rootfs, fs).context("snapshot rootfs")?;
    let deltas = saved.diff(&current);
    info!("computed {} deltas against the saved snapshot", deltas.len());

    let history = build_history(opts.history.as_ref(), mutator.config())?;

    let pack = PackOptions {
        map: meta.map_options.clone(),
        masked_paths,
        max_layer_bytes: opts.max_layer_bytes,
    };
    let layers = generate_layers(&rootfs, deltas, pack).context("generate layers")?;

    for (index, layer) in layers.into_iter().enumerate() {
        let (raw, digest) = digest_reader(layer);
        let compressed = opts
            .compressor
            .compress(Box::new(raw))
            .context("compress layer")?;
        let descriptor = store
            .put_blob(compressed, opts.compressor.media_type())
            .context("store layer blob")?;
        info!(
            "layer {index} stored: {} ({:#.1})",
            descriptor.digest(),
            display_bytes(descriptor.size() as u64)
        );
        mutator.append_layer(descriptor, digest.prefixed_hash());
    }

    if let Some(history) = history {
        mutator.append_history(history);
    }

    let new_descriptor = mutator.commit().context("commit image")?;
    store.tag(&opts.tag, &new_descriptor).context("tag image")?;
    info!(
        "created new image {}:{} ({})",
        opts.image.display(),
        opts.tag,
        new_descriptor.digest()
    );

    if opts.refresh_bundle {
        let refreshed = BundleMeta {
            version: meta.version,
            from: new_descriptor,
            map_options: meta.map_options,
        };
        refreshed.write(&opts.bundle).context("refresh bundle metadata")?;
        // The next repack must diff against what we just packed.
        current
            .save(&BundleMeta::snapshot_path(&opts.bundle))
            .context("refresh bundle snapshot")?;
        info!("refreshed bundle metadata");
    }
    Ok(())
}

fn build_history(
    overrides: Option<&HistoryOverrides>,
    config: &ImageConfiguration,
) -> Result<Option<History>> {
    let Some(overrides) = overrides else {
        return Ok(None);
    };
    let created = match &overrides.created {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .context("parsing --history.created")?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    let mut builder = HistoryBuilder::default()
        .comment(overrides.comment.clone().unwrap_or_default())
        .created(created.to_rfc3339_opts(SecondsFormat::Secs, true))
        .created_by(
            overrides
                .created_by
                .clone()
                .unwrap_or_else(|| "ocipack repack".to_string()),
        )
        .empty_layer(false);
    if let Some(author) = overrides.author.clone().or_else(|| config.author().clone()) {
        builder = builder.author(author);
    }
    Ok(Some(builder.build()?))
}
