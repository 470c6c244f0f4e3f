use crate::idmap::MapOptions;

mod generate;
mod pipe;
mod tar;

pub use generate::{generate_insert_layer, generate_layer, generate_layers};
pub use pipe::{pipe, PipeReader, PipeSentinel, PipeWriter};
pub use tar::{TarGenerator, OPAQUE_WHITEOUT, WHITEOUT_PREFIX};

/// Everything the layer generator needs to know: id translation, paths to
/// exclude, and the per-layer byte budget (0 = one unbounded layer).
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    pub map: MapOptions,
    pub masked_paths: Vec<String>,
    pub max_layer_bytes: u64,
}

impl PackOptions {
    /// Component-wise prefix match: `var` masks `var` and `var/log/x` but
    /// not `varnish`.
    pub fn is_masked(&self, path: &str) -> bool {
        let path = path.trim_matches('/');
        self.masked_paths.iter().any(|prefix| {
            match path.strip_prefix(prefix.trim_matches('/')) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            }
        })
    }
}
