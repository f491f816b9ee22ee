//! Configuration file discovery.

use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};

/// Extensions tried, in order, after the path as given.
pub const CONFIG_EXTENSIONS: &[&str] = &[".json"];

/// Resolve a configuration path, allowing the extension to be omitted.
pub fn find_config_file(path: &Path) -> Result<PathBuf> {
    std::iter::once(String::new())
        .chain(CONFIG_EXTENSIONS.iter().map(|ext| ext.to_string()))
        .map(|ext| {
            let mut candidate = path.as_os_str().to_owned();
            candidate.push(ext);
            PathBuf::from(candidate)
        })
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| BuildError::ConfigNotFound(path.to_path_buf()))
}
