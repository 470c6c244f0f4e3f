//! Directory-backed content-addressable store in the OCI image layout:
//! `oci-layout`, `index.json`, and `blobs/sha256/<digest>`.

use crate::hash::HashedWriter;
use crate::utils::display_bytes;
use anyhow::{bail, Context, Result};
use itertools::Itertools;
use oci_spec::image::{Descriptor, DescriptorBuilder, ImageIndex, ImageIndexBuilder, MediaType};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

pub struct Store {
    root: PathBuf,
    blobs_dir: PathBuf,
}

impl Store {
    pub fn open(root: &Path) -> Result<Store> {
        if !root.join("oci-layout").is_file() {
            bail!("{} is not an OCI image layout", root.display());
        }
        Ok(Store {
            root: root.to_path_buf(),
            blobs_dir: root.join("blobs").join("sha256"),
        })
    }

    /// Creates an empty image layout.
    pub fn init(root: &Path) -> Result<Store> {
        let blobs_dir = root.join("blobs").join("sha256");
        fs::create_dir_all(&blobs_dir).context("create blobs directory")?;
        fs::write(
            root.join("oci-layout"),
            json!({"imageLayoutVersion": "1.0.0"}).to_string(),
        )
        .context("write oci-layout")?;
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .manifests(Vec::new())
            .build()?;
        fs::write(
            root.join("index.json"),
            serde_json::to_string_pretty(&index)?,
        )
        .context("write image index")?;
        Ok(Store {
            root: root.to_path_buf(),
            blobs_dir,
        })
    }

    /// Streams a blob into the store and returns its descriptor. The blob
    /// is written to a temp file first and renamed once the digest is known.
    pub fn put_blob(&self, mut reader: impl Read, media_type: MediaType) -> Result<Descriptor> {
        let mut tmp = NamedTempFile::new_in(&self.blobs_dir).context("create blob temp file")?;
        let hash_and_size = {
            let mut writer = HashedWriter::new(BufWriter::new(&mut tmp));
            io::copy(&mut reader, &mut writer).context("write blob")?;
            let (mut buffered, hash_and_size) = writer.into_inner();
            buffered.flush().context("flush blob")?;
            hash_and_size
        };
        tmp.persist(self.blobs_dir.join(hash_and_size.raw_hash()))
            .context("persist blob")?;
        debug!(
            "stored blob {} ({:#.1})",
            hash_and_size.prefixed_hash(),
            display_bytes(hash_and_size.size)
        );
        Ok(Descriptor::new(
            media_type,
            hash_and_size.size as i64,
            hash_and_size.prefixed_hash(),
        ))
    }

    pub fn read_json_blob<T: DeserializeOwned>(&self, digest: &str) -> Result<T> {
        let hash = digest.split_once(':').map_or(digest, |(_, hash)| hash);
        let file = File::open(self.blobs_dir.join(hash))
            .with_context(|| format!("open blob {digest}"))?;
        serde_json::from_reader(file).with_context(|| format!("parse blob {digest}"))
    }

    pub fn write_json_blob<T: Serialize>(&self, item: &T, media_type: MediaType) -> Result<Descriptor> {
        let mut writer = HashedWriter::new(Vec::new());
        serde_json::to_writer_pretty(&mut writer, item).context("serialize blob")?;
        let (content, hash_and_size) = writer.into_inner();
        fs::write(self.blobs_dir.join(hash_and_size.raw_hash()), content)
            .context("write blob")?;
        Ok(Descriptor::new(
            media_type,
            hash_and_size.size as i64,
            hash_and_size.prefixed_hash(),
        ))
    }

    pub fn resolve(&self, tag: &str) -> Result<Descriptor> {
        let index = self.read_index()?;
        index
            .manifests()
            .iter()
            .find(|descriptor| ref_name(descriptor) == Some(tag))
            .cloned()
            .with_context(|| format!("tag {tag} not found in image index"))
    }

    /// Points `name` at `descriptor`, replacing any previous use of the
    /// name.
    pub fn tag(&self, name: &str, descriptor: &Descriptor) -> Result<()> {
        let index = self.read_index()?;
        let mut manifests = index
            .manifests()
            .iter()
            .filter(|existing| ref_name(existing) != Some(name))
            .cloned()
            .collect_vec();
        let tagged = DescriptorBuilder::default()
            .media_type(descriptor.media_type().clone())
            .digest(descriptor.digest().clone())
            .size(descriptor.size())
            .annotations(HashMap::from([(
                REF_NAME_ANNOTATION.to_string(),
                name.to_string(),
            )]))
            .build()?;
        manifests.push(tagged);
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .manifests(manifests)
            .build()?;
        fs::write(
            self.root.join("index.json"),
            serde_json::to_string_pretty(&index)?,
        )
        .context("write image index")?;
        Ok(())
    }

    fn read_index(&self) -> Result<ImageIndex> {
        let file = File::open(self.root.join("index.json")).context("open image index")?;
        serde_json::from_reader(file).context("parse image index")
    }
}

fn ref_name(descriptor: &Descriptor) -> Option<&str> {
    descriptor
        .annotations()
        .as_ref()
        .and_then(|annotations| annotations.get(REF_NAME_ANNOTATION))
        .map(String::as_str)
}
