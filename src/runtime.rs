//! Runtime files shipped with protected scripts
//!
//! Protected scripts only run with the license/key files and the native
//! support library next to them, so these are copied verbatim from the
//! protected tree into the final bundle.

use crate::{PackError, PackResult};
use std::fs;
use std::path::{Path, PathBuf};

/// License and key files, always present in a protected tree
pub const RUNTIME_KEY_FILES: [&str; 4] = [
    "pyshield.key",
    "pyshield.lic",
    "product.key",
    "license.lic",
];

/// Native support library, one file per platform build
pub const NATIVE_LIBRARY_PATTERN: &str = "_pytransform.*";

/// Copy runtime files from `runtime_dir` into `output`
pub fn copy_runtime_files(runtime_dir: &Path, output: &Path) -> PackResult<Vec<PathBuf>> {
    tracing::info!("Copy runtime files to {}", output.display());
    fs::create_dir_all(output)?;

    let mut copied = Vec::new();
    for name in RUNTIME_KEY_FILES {
        let source = runtime_dir.join(name);
        if !source.is_file() {
            return Err(PackError::FileNotFound(source.display().to_string()));
        }
        copied.push(copy_into(&source, output)?);
    }

    for library in native_libraries(runtime_dir)? {
        copied.push(copy_into(&library, output)?);
    }
    Ok(copied)
}

/// Files in `runtime_dir` matching [`NATIVE_LIBRARY_PATTERN`]
pub fn native_libraries(runtime_dir: &Path) -> PackResult<Vec<PathBuf>> {
    let escaped = glob::Pattern::escape(&runtime_dir.display().to_string());
    let pattern = Path::new(&escaped).join(NATIVE_LIBRARY_PATTERN);
    let entries = glob::glob(&pattern.to_string_lossy())
        .map_err(|e| PackError::Config(format!("Invalid pattern {}: {}", pattern.display(), e)))?;

    let mut libraries = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| PackError::Io(e.into_error()))?;
        if path.is_file() {
            libraries.push(path);
        }
    }
    libraries.sort();
    Ok(libraries)
}

fn copy_into(source: &Path, dir: &Path) -> PackResult<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| PackError::FileNotFound(source.display().to_string()))?;
    let target = dir.join(name);
    fs::copy(source, &target)?;
    tracing::debug!("Copied {} to {}", source.display(), target.display());
    Ok(target)
}
