use crate::layer::{pipe, PipeReader};
use anyhow::{anyhow, Context, Result};
use gzp::deflate::Gzip;
use gzp::par::compress::ParCompress;
use gzp::ZWriter;
use oci_spec::image::MediaType;
use std::io;
use std::io::Read;
use std::thread;
use tracing::warn;

const GZIP_BLOCK_SIZE: usize = 256 * 1024;

/// Streaming filter between the raw tar stream and the blob store. The
/// media type it reports is the one recorded in the layer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    None,
    Gzip,
    Zstd,
}

impl Compressor {
    pub fn media_type(&self) -> MediaType {
        match self {
            Compressor::None => MediaType::ImageLayer,
            Compressor::Gzip => MediaType::ImageLayerGzip,
            Compressor::Zstd => MediaType::ImageLayerZstd,
        }
    }

    pub fn compress(&self, reader: Box<dyn Read + Send>) -> Result<Box<dyn Read + Send>> {
        match self {
            Compressor::None => Ok(reader),
            Compressor::Gzip => Ok(Box::new(gzip_stream(reader)?)),
            Compressor::Zstd => Ok(Box::new(zstd_stream(reader))),
        }
    }
}

fn workers() -> usize {
    thread::available_parallelism().map_or(2, |cpus| cpus.get() * 2)
}

fn gzip_stream(mut reader: Box<dyn Read + Send>) -> Result<PipeReader> {
    let num_threads = workers();
    let builder = ParCompress::<Gzip>::builder()
        .num_threads(num_threads)
        .map_err(|err| anyhow!("set gzip concurrency to {num_threads} workers: {err}"))?
        .buffer_size(GZIP_BLOCK_SIZE)
        .map_err(|err| anyhow!("set gzip block size: {err}"))?;

    let (writer, out) = pipe();
    thread::spawn(move || {
        let sentinel = writer.sentinel();
        let mut encoder = builder.from_writer(writer);
        let result = io::copy(&mut reader, &mut encoder)
            .map_err(anyhow::Error::from)
            .context("compressing layer")
            .and_then(|_| {
                encoder
                    .finish()
                    .map_err(|err| anyhow!("close gzip writer: {err}"))
            });
        if let Err(err) = result {
            warn!("gzip compressor: {err:#}");
            sentinel.close_with_error(io::Error::other(format!("{err:#}")));
        }
    });
    Ok(out)
}

fn zstd_stream(mut reader: Box<dyn Read + Send>) -> PipeReader {
    let (writer, out) = pipe();
    thread::spawn(move || {
        let sentinel = writer.sentinel();
        let result = zstd::stream::copy_encode(&mut reader, writer, zstd::DEFAULT_COMPRESSION_LEVEL)
            .map_err(anyhow::Error::from)
            .context("compressing layer");
        if let Err(err) = result {
            warn!("zstd compressor: {err:#}");
            sentinel.close_with_error(io::Error::other(format!("{err:#}")));
        }
    });
    out
}
