use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::thumbnail_types::{ThumbError, ThumbResult};

/// Rejects traversal segments and absolute-path markers.
///
/// The HTTP boundary validates request paths already; this re-check keeps
/// the core safe when called with an unvalidated path.
pub fn validate_relative_path(path: &str) -> ThumbResult<()> {
    let candidate = Path::new(path);
    if path.starts_with('/') || path.starts_with('\\') || candidate.is_absolute() {
        return Err(ThumbError::InvalidPath(path.to_string()));
    }
    if candidate
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(ThumbError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Identity and location of one original image under the served root.
#[derive(Debug, Clone)]
pub struct ImageRef {
    root_path: PathBuf,
    relative_path: String,
    stem: String,
    extension: String,
    full_path: PathBuf,
}

impl ImageRef {
    /// Resolves `relative_path` under `root_path`.
    ///
    /// Fails with `InvalidPath` before any filesystem access when the path
    /// carries traversal segments, and with `NotFound` when it does not
    /// point at a readable file.
    pub fn resolve(root_path: &Path, relative_path: &str) -> ThumbResult<Self> {
        validate_relative_path(relative_path)?;

        let full_path = root_path.join(relative_path);
        if !full_path.is_file() {
            return Err(ThumbError::NotFound(relative_path.to_string()));
        }

        let stem = full_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = full_path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        Ok(Self {
            root_path: root_path.to_path_buf(),
            relative_path: relative_path.to_string(),
            stem,
            extension,
            full_path,
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// Filename without extension.
    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Lowercase file extension.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn full_path(&self) -> &Path {
        &self.full_path
    }

    pub fn mod_time(&self) -> ThumbResult<SystemTime> {
        let metadata = std::fs::metadata(&self.full_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ThumbError::NotFound(self.relative_path.clone())
            } else {
                ThumbError::Io(e)
            }
        })?;
        Ok(metadata.modified()?)
    }
}
