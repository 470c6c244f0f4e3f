use crate::store::Store;
use anyhow::{bail, Context, Result};
use oci_spec::image::{
    Descriptor, History, ImageConfiguration, ImageManifest, ImageManifestBuilder, MediaType,
};
use tracing::debug;

/// Accumulates changes to an image (new layers, diff IDs, history) and
/// commits them as fresh config and manifest blobs.
pub struct Mutator<'a> {
    store: &'a Store,
    config: ImageConfiguration,
    layers: Vec<Descriptor>,
}

impl<'a> Mutator<'a> {
    pub fn new(store: &'a Store, from: &Descriptor) -> Result<Mutator<'a>> {
        if from.media_type() != &MediaType::ImageManifest {
            bail!(
                "descriptor does not point to an image manifest: {}",
                from.media_type()
            );
        }
        let manifest: ImageManifest =
            store.read_json_blob(from.digest()).context("read manifest")?;
        let config: ImageConfiguration = store
            .read_json_blob(manifest.config().digest())
            .context("read image config")?;
        Ok(Mutator {
            store,
            layers: manifest.layers().clone(),
            config,
        })
    }

    pub fn config(&self) -> &ImageConfiguration {
        &self.config
    }

    /// Appends a layer blob descriptor together with the diff ID of its
    /// uncompressed content.
    pub fn append_layer(&mut self, descriptor: Descriptor, diff_id: String) {
        debug!("appending layer {} (diff id {diff_id})", descriptor.digest());
        self.layers.push(descriptor);
        self.config.rootfs_mut().diff_ids_mut().push(diff_id);
    }

    pub fn append_history(&mut self, history: History) {
        self.config.history_mut().push(history);
    }

    /// Writes the mutated config and a manifest referencing it, returning
    /// the new manifest descriptor.
    pub fn commit(self) -> Result<Descriptor> {
        let config_descriptor = self
            .store
            .write_json_blob(&self.config, MediaType::ImageConfig)
            .context("write image config")?;
        let manifest = ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .config(config_descriptor)
            .layers(self.layers)
            .build()?;
        self.store
            .write_json_blob(&manifest, MediaType::ImageManifest)
            .context("write manifest")
    }
}
