//! Per-delivery scratch artifacts.
//!
//! A [`ScratchFile`] reserves a unique path in the scratch directory and
//! removes whatever was written there when it goes out of scope, on every
//! exit path of the pipeline.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

/// Attachment name used when the URL has no usable final path segment.
pub const FALLBACK_FILENAME: &str = "downloaded-file";

/// Longest attachment name kept, in characters.
const MAX_FILENAME_CHARS: usize = 120;

/// Derive a human-meaningful attachment name from a URL.
///
/// Uses the last non-empty path segment, percent-decoded and sanitized;
/// falls back to [`FALLBACK_FILENAME`].
pub fn attachment_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.rfind(|segment| !segment.is_empty()))
        .map(|segment| sanitize_filename(&decode_segment(segment)))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_FILENAME.to_owned())
}

/// Percent-decode a path segment, keeping it raw if it is not UTF-8.
fn decode_segment(segment: &str) -> String {
    urlencoding::decode(segment).map_or_else(|_| segment.to_owned(), |s| s.into_owned())
}

/// Sanitize a filename so it stays inside the scratch directory.
///
/// Replaces path separators with underscores, strips leading dots and
/// control characters, and caps the length.
pub fn sanitize_filename(name: &str) -> String {
    name.replace(['/', '\\'], "_")
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim_start_matches('.')
        .chars()
        .take(MAX_FILENAME_CHARS)
        .collect()
}

/// A unique scratch path whose file is deleted on drop.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    name: String,
    released: bool,
}

impl ScratchFile {
    /// Reserve `{dir}/download-{uuid}-{name}`. Nothing is created yet.
    pub fn reserve(dir: &Path, name: &str) -> Self {
        let path = dir.join(format!("download-{}-{name}", Uuid::new_v4()));
        Self {
            path,
            name: name.to_owned(),
            released: false,
        }
    }

    /// Create the scratch directory and an empty file at the reserved path.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory or file cannot be created.
    pub async fn create(&self) -> std::io::Result<tokio::fs::File> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::File::create(&self.path).await
    }

    /// Reserved path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attachment name the file will be delivered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the file now instead of on drop.
    ///
    /// # Errors
    ///
    /// Returns an I/O error other than "not found".
    pub async fn remove(mut self) -> std::io::Result<()> {
        self.released = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "scratch file removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "scratch file removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove scratch file"),
        }
    }
}
