use byte_unit::Byte;
use clap::{Parser, Subcommand};
use compress::Compressor;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

mod bundle;
mod cmd;
mod compress;
mod fseval;
mod hash;
mod idmap;
mod layer;
mod mutate;
mod snapshot;
mod store;
#[cfg(test)]
mod test_utils;
mod utils;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Repack an unpacked bundle rootfs into a new layer of its source image
    Repack(RepackArgs),
}

#[derive(clap::Args, Debug)]
struct RepackArgs {
    /// Bundle directory produced when the image was unpacked
    bundle: PathBuf,

    /// Image layout path, optionally with a tag: <path>[:<tag>]
    #[arg(long)]
    image: String,

    /// Path prefix whose deltas are ignored when generating layers (repeatable)
    #[arg(long = "mask-path")]
    mask_paths: Vec<String>,

    /// Do not add the image's Config.Volumes to the set of masked paths
    #[arg(long)]
    no_mask_volumes: bool,

    /// Update the bundle metadata to reflect the packed rootfs
    #[arg(long)]
    refresh_bundle: bool,

    /// Maximum uncompressed bytes per layer (0 = one unbounded layer)
    #[arg(long, default_value = "0")]
    max_layer_size: Byte,

    #[arg(long, value_parser = parse_compression, default_value = "gzip")]
    compression: Compressor,

    /// Do not append a history entry for the new layer
    #[arg(long)]
    no_history: bool,

    #[arg(long = "history.author")]
    history_author: Option<String>,

    #[arg(long = "history.comment")]
    history_comment: Option<String>,

    /// ISO-8601 timestamp recorded as the history entry's creation time
    #[arg(long = "history.created")]
    history_created: Option<String>,

    #[arg(long = "history.created_by")]
    history_created_by: Option<String>,
}

fn parse_compression(raw: &str) -> Result<Compressor, String> {
    match raw {
        "none" => Ok(Compressor::None),
        "gzip" => Ok(Compressor::Gzip),
        "zstd" => Ok(Compressor::Zstd),
        other => Err(format!("unknown compression {other:?} (expected none, gzip or zstd)")),
    }
}

/// Splits `<path>[:<tag>]`, defaulting the tag to "latest".
fn parse_image(raw: &str) -> (PathBuf, String) {
    match raw.rsplit_once(':') {
        Some((path, tag)) if !tag.is_empty() && !tag.contains('/') => {
            (PathBuf::from(path), tag.to_string())
        }
        _ => (PathBuf::from(raw), "latest".to_string()),
    }
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive("ocipack=info".parse().unwrap())
        .from_env_lossy();
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let args = Args::parse();
    match args.command {
        Command::Repack(repack) => {
            let (image, tag) = parse_image(&repack.image);
            let history = if repack.no_history {
                None
            } else {
                Some(cmd::repack::HistoryOverrides {
                    author: repack.history_author,
                    comment: repack.history_comment,
                    created: repack.history_created,
                    created_by: repack.history_created_by,
                })
            };
            cmd::repack::repack(cmd::repack::RepackOptions {
                bundle: repack.bundle,
                image,
                tag,
                mask_paths: repack.mask_paths,
                no_mask_volumes: repack.no_mask_volumes,
                refresh_bundle: repack.refresh_bundle,
                max_layer_bytes: repack.max_layer_size.as_u64(),
                compressor: repack.compression,
                history,
            })
        }
    }
}
