//! Static asset resolution for fallback images.
//!
//! Fallback attributes hold paths relative to a statically-served directory
//! that this service does not manage. The resolver only maps those relative
//! paths to a public URL and a local filesystem path; it never writes.

use std::path::PathBuf;
use tokio::fs;

#[derive(Clone, Debug)]
pub struct StaticFiles {
    root: PathBuf,
    url_prefix: String,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        let mut url_prefix = url_prefix.into();
        while url_prefix.ends_with('/') {
            url_prefix.pop();
        }
        Self {
            root: root.into(),
            url_prefix,
        }
    }

    fn safe(rel: &str) -> bool {
        !rel.is_empty()
            && !rel.starts_with('/')
            && !rel
                .split('/')
                .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    }

    /// Filesystem path the asset would occupy. `None` for unsafe paths.
    pub fn path(&self, rel: &str) -> Option<PathBuf> {
        Self::safe(rel).then(|| self.root.join(rel))
    }

    /// Public URL of the asset. `None` for unsafe paths.
    pub fn url(&self, rel: &str) -> Option<String> {
        Self::safe(rel).then(|| format!("{}/{}", self.url_prefix, rel))
    }

    /// Filesystem path of the asset, only if it exists on disk.
    pub async fn find(&self, rel: &str) -> Option<PathBuf> {
        let path = self.path(rel)?;
        match fs::try_exists(&path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }
}
