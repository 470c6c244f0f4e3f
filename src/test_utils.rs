use crate::store::Store;
use oci_spec::image::{
    ConfigBuilder, Descriptor, ImageConfiguration, ImageManifestBuilder, MediaType,
};
use std::io::Read;
use std::path::Path;
use tar::{Builder, EntryType, Header};

pub fn read_all(mut reader: impl Read) -> Vec<u8> {
    let mut content = Vec::new();
    reader.read_to_end(&mut content).unwrap();
    content
}

pub fn read_tar_entries(content: &[u8]) -> Vec<(Header, Vec<u8>)> {
    let mut archive = tar::Archive::new(content);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let header = entry.header().clone();
            let mut content = vec![];
            entry.read_to_end(&mut content).unwrap();
            (header, content)
        })
        .collect()
}

pub fn entry_names(content: &[u8]) -> Vec<String> {
    read_tar_entries(content)
        .iter()
        .map(|(header, _)| header.path().unwrap().to_str().unwrap().to_string())
        .collect()
}

/// A one-layer base image in an OCI layout at `root`, with `/volatile`
/// declared as a volume. Returns the store and the manifest descriptor.
pub fn scratch_image_in(root: &Path) -> (Store, Descriptor) {
    let store = Store::init(root).unwrap();

    let mut base_tar = Builder::new(Vec::new());
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(9);
    base_tar
        .append_data(&mut header, "etc/hostname", &b"original\n"[..])
        .unwrap();
    let base_layer = base_tar.into_inner().unwrap();
    let layer_descriptor = store
        .put_blob(base_layer.as_slice(), MediaType::ImageLayer)
        .unwrap();

    let mut config = ImageConfiguration::default();
    config.set_config(Some(
        ConfigBuilder::default()
            .volumes(vec!["/volatile".to_string()])
            .build()
            .unwrap(),
    ));
    config
        .rootfs_mut()
        .diff_ids_mut()
        // Uncompressed base layer: the diff ID is the blob digest itself.
        .push(layer_descriptor.digest().clone());
    let config_descriptor = store
        .write_json_blob(&config, MediaType::ImageConfig)
        .unwrap();

    let manifest = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .config(config_descriptor)
        .layers(vec![layer_descriptor])
        .build()
        .unwrap();
    let manifest_descriptor = store
        .write_json_blob(&manifest, MediaType::ImageManifest)
        .unwrap();
    (store, manifest_descriptor)
}

pub fn scratch_image() -> (tempfile::TempDir, Store, Descriptor) {
    let dir = tempfile::tempdir().unwrap();
    let (store, descriptor) = scratch_image_in(dir.path());
    (dir, store, descriptor)
}
