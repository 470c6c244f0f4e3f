use crate::idmap::MapOptions;
use anyhow::{bail, Context, Result};
use oci_spec::image::{Descriptor, MediaType};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

pub const META_NAME: &str = "ocipack.json";
pub const SNAPSHOT_NAME: &str = "snapshot.json";
pub const ROOTFS_NAME: &str = "rootfs";
pub const META_VERSION: &str = "1";

/// Sidecar metadata linking an unpacked bundle to its source image: the
/// manifest it was unpacked from and the id mappings used to do it.
/// Unknown fields are ignored for forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMeta {
    pub version: String,
    pub from: Descriptor,
    #[serde(default)]
    pub map_options: MapOptions,
}

impl BundleMeta {
    pub fn read(bundle: &Path) -> Result<BundleMeta> {
        let path = bundle.join(META_NAME);
        let file = File::open(&path)
            .with_context(|| format!("open bundle metadata {}", path.display()))?;
        let meta: BundleMeta =
            serde_json::from_reader(file).context("parse bundle metadata")?;
        if meta.version != META_VERSION {
            bail!("unsupported bundle metadata version {:?}", meta.version);
        }
        if meta.from.media_type() != &MediaType::ImageManifest {
            bail!(
                "bundle descriptor does not point to an image manifest: {}",
                meta.from.media_type()
            );
        }
        Ok(meta)
    }

    pub fn write(&self, bundle: &Path) -> Result<()> {
        let path = bundle.join(META_NAME);
        let file = File::create(&path)
            .with_context(|| format!("create bundle metadata {}", path.display()))?;
        serde_json::to_writer_pretty(file, self).context("write bundle metadata")?;
        Ok(())
    }

    pub fn rootfs(bundle: &Path) -> PathBuf {
        bundle.join(ROOTFS_NAME)
    }

    pub fn snapshot_path(bundle: &Path) -> PathBuf {
        bundle.join(SNAPSHOT_NAME)
    }
}
