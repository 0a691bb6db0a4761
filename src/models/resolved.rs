//! The resolved form of a record's image.

use serde::Serialize;
use std::path::{Path, PathBuf};

/// An image resolved to something servable: either the record's own upload
/// or the static asset its fallback attribute names.
///
/// Chosen once at resolution time; callers only see the capability surface
/// (`url`, `path`) and whether the image is managed storage or not.
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ResolvedImage {
    Uploaded {
        /// Storage-relative path of the upload.
        rel_path: String,
        /// Local filesystem path of the stored file.
        disk_path: PathBuf,
        /// Public URL of the upload.
        url: String,
    },
    Fallback {
        /// Static-relative path from the fallback attribute.
        rel_path: String,
        /// Local filesystem path of the static asset.
        disk_path: PathBuf,
        /// Public URL of the static asset.
        url: String,
    },
}

impl ResolvedImage {
    pub fn url(&self) -> &str {
        match self {
            ResolvedImage::Uploaded { url, .. } | ResolvedImage::Fallback { url, .. } => url,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ResolvedImage::Uploaded { disk_path, .. }
            | ResolvedImage::Fallback { disk_path, .. } => disk_path,
        }
    }

    /// True when the image lives in managed storage (and so has thumbnails
    /// to generate or clean up).
    pub fn is_uploaded(&self) -> bool {
        matches!(self, ResolvedImage::Uploaded { .. })
    }
}
