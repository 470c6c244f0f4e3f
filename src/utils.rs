use byte_unit::{AdjustedByte, Byte, UnitType};

pub fn display_bytes(size: u64) -> AdjustedByte {
    Byte::from(size).get_appropriate_unit(UnitType::Binary)
}

/// Splits a slash-separated tar path into its parent directory (with a
/// trailing slash, or empty for top-level names) and base name.
pub fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => (&trimmed[..idx + 1], &trimmed[idx + 1..]),
        None => ("", trimmed),
    }
}

pub fn parent_dir(path: &str) -> &str {
    split_path(path).0
}
