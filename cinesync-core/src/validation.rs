//! Input validation for wire-facing identifiers and paths.
//!
//! Stream names and HLS subpaths come straight off the network and are used
//! to build filesystem paths, so the rules here are strict allowlists.

use crate::{Error, Result};

/// Maximum client display-name length in code points
pub const MAX_NAME_LEN: usize = 30;

/// Prefix that marks a stream reference on the wire
pub const STREAM_PREFIX: &str = "hls:";

fn is_stream_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_subpath_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

/// Validate a bare stream name: `[A-Za-z0-9_-]+`.
pub fn validate_stream_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("Stream name must not be empty".to_string()));
    }
    if !name.chars().all(is_stream_name_char) {
        return Err(Error::InvalidInput(format!("Invalid stream name: {name:?}")));
    }
    Ok(())
}

/// Parse a wire stream reference of the form `hls:<name>`, returning the name.
pub fn parse_stream_ref(video: &str) -> Result<&str> {
    let name = video
        .strip_prefix(STREAM_PREFIX)
        .ok_or_else(|| Error::InvalidInput(format!("Invalid stream reference: {video:?}")))?;
    validate_stream_name(name)?;
    Ok(name)
}

/// Validate a relative HLS subpath. Each `/`-separated component must match
/// `[A-Za-z0-9_.-]+` and must not contain `..`.
pub fn validate_subpath(subpath: &str) -> Result<()> {
    if subpath.is_empty() {
        return Err(Error::InvalidInput("Empty path".to_string()));
    }
    for component in subpath.split('/') {
        if component.is_empty() {
            return Err(Error::InvalidInput(format!("Invalid path: {subpath:?}")));
        }
        if component.contains("..") {
            return Err(Error::InvalidInput(format!("Invalid path component: {component:?}")));
        }
        if !component.chars().all(is_subpath_char) {
            return Err(Error::InvalidInput(format!("Invalid path component: {component:?}")));
        }
    }
    Ok(())
}

/// Trim and truncate a client display name; fall back to `fallback` when the
/// result is empty.
#[must_use]
pub fn sanitize_client_name(name: &str, fallback: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return fallback.to_string();
    }
    trimmed.chars().take(MAX_NAME_LEN).collect()
}

/// Derive a stream output name from a source filename stem: every character
/// outside `[A-Za-z0-9_-]` becomes `_`.
#[must_use]
pub fn sanitize_output_name(stem: &str) -> String {
    stem.chars()
        .map(|c| if is_stream_name_char(c) { c } else { '_' })
        .collect()
}
