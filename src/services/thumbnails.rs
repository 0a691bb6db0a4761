//! Thumbnail lifecycle: path derivation, generation, and cleanup.
//!
//! A thumbnail of width `w` for a file at `dir/name.ext` lives at
//! `dir/w/name.ext`, so a file's thumbnails are exactly the co-named files
//! inside the purely-numeric subdirectories of its parent. Generation is
//! idempotent via an existence check; cleanup never removes the (possibly
//! now empty) size directories themselves, since not every backend can
//! delete directories.

use crate::models::{field::FieldDef, record::ImageRecord};
use crate::storage::StorageBackend;
use image::{ImageFormat, imageops::FilterType};
use serde::Serialize;
use std::io::{self, Cursor};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("field `{0}` has thumbnails disabled")]
    Disabled(String),
    #[error("record `{0}` has no file associated with it")]
    NoFile(String),
    #[error("unsupported image extension `{0}`")]
    UnsupportedFormat(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What happened to a single requested thumbnail.
///
/// An unreadable source is an outcome, not an error: the caller decides
/// whether to log and continue (the save lifecycle does) or surface it.
/// Storage failures on the write side still propagate as errors.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ThumbnailOutcome {
    Created { path: String },
    AlreadyExists { path: String },
    SourceUnreadable { reason: String },
}

/// Outcome of one size in a batch generation pass.
#[derive(Serialize, Clone, Debug)]
pub struct ThumbnailReport {
    pub size: u32,
    #[serde(flatten)]
    pub outcome: ThumbnailOutcome,
}

/// Storage path of the width-`size` thumbnail for the file at `path`.
pub fn thumbnail_path(path: &str, size: u32) -> String {
    match path.rsplit_once('/') {
        Some((dir, name)) => format!("{dir}/{size}/{name}"),
        None => format!("{size}/{path}"),
    }
}

/// Lowercased file extension, with `jpg` normalized to the codec's `jpeg`.
pub fn normalized_ext(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    let ext = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext,
        _ => "",
    };
    let ext = ext.to_ascii_lowercase();
    if ext == "jpg" { "jpeg".to_string() } else { ext }
}

/// Encode format for a target path, from its normalized extension.
fn encode_format(path: &str) -> Option<ImageFormat> {
    ImageFormat::from_extension(normalized_ext(path))
}

/// Decode, resize to exactly `width` preserving aspect ratio, re-encode.
/// CPU-bound; run under `spawn_blocking`.
fn resize_to_width(bytes: &[u8], width: u32, format: ImageFormat) -> Result<Vec<u8>, String> {
    let img = image::load_from_memory(bytes).map_err(|err| err.to_string())?;
    let resized = img.resize(width, u32::MAX, FilterType::Lanczos3);
    let mut buf = Cursor::new(Vec::new());
    resized
        .write_to(&mut buf, format)
        .map_err(|err| err.to_string())?;
    Ok(buf.into_inner())
}

/// Generates and removes thumbnails through the storage backend.
#[derive(Clone)]
pub struct Thumbnailer {
    backend: Arc<dyn StorageBackend>,
}

impl Thumbnailer {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn require_enabled(field: &FieldDef) -> Result<(), ThumbnailError> {
        if !field.config.thumbnails {
            return Err(ThumbnailError::Disabled(field.name.clone()));
        }
        Ok(())
    }

    /// Generate the width-`size` thumbnail for `record`'s file.
    ///
    /// No write happens when the target already exists. Requires thumbnails
    /// enabled on the field and a non-empty record.
    pub async fn generate(
        &self,
        field: &FieldDef,
        record: &ImageRecord,
        size: u32,
    ) -> Result<ThumbnailOutcome, ThumbnailError> {
        Self::require_enabled(field)?;
        let source = record
            .file_path
            .as_deref()
            .ok_or_else(|| ThumbnailError::NoFile(record.key.clone()))?;

        let target = thumbnail_path(source, size);
        if self.backend.exists(&target).await? {
            return Ok(ThumbnailOutcome::AlreadyExists { path: target });
        }

        let format = encode_format(&target)
            .ok_or_else(|| ThumbnailError::UnsupportedFormat(normalized_ext(&target)))?;

        let bytes = match self.backend.read(source).await {
            Ok(bytes) => bytes,
            Err(err) => {
                return Ok(ThumbnailOutcome::SourceUnreadable {
                    reason: err.to_string(),
                });
            }
        };

        let encoded =
            match tokio::task::spawn_blocking(move || resize_to_width(&bytes, size, format))
                .await
                .map_err(io::Error::other)?
            {
                Ok(encoded) => encoded,
                Err(reason) => return Ok(ThumbnailOutcome::SourceUnreadable { reason }),
            };

        self.backend.save(&target, &encoded).await?;
        Ok(ThumbnailOutcome::Created { path: target })
    }

    /// Generate every configured size for `record`, in order.
    ///
    /// No-op for an empty record (the fallback asset is not ours to
    /// thumbnail). Unreadable sources are logged and skipped; there is no
    /// atomicity across sizes.
    pub async fn generate_all(
        &self,
        field: &FieldDef,
        record: &ImageRecord,
    ) -> Result<Vec<ThumbnailReport>, ThumbnailError> {
        Self::require_enabled(field)?;
        if record.is_empty() {
            return Ok(Vec::new());
        }

        let mut reports = Vec::with_capacity(field.config.thumbnail_sizes.len());
        for &size in &field.config.thumbnail_sizes {
            let outcome = self.generate(field, record, size).await?;
            if let ThumbnailOutcome::SourceUnreadable { reason } = &outcome {
                warn!(
                    field = %field.name,
                    key = %record.key,
                    size,
                    "thumbnail skipped, source unreadable: {reason}"
                );
            }
            reports.push(ThumbnailReport { size, outcome });
        }
        Ok(reports)
    }

    /// Remove every thumbnail of `record`'s file.
    ///
    /// No-op for an empty record. Returns the removed paths.
    pub async fn remove_all(
        &self,
        field: &FieldDef,
        record: &ImageRecord,
    ) -> Result<Vec<String>, ThumbnailError> {
        Self::require_enabled(field)?;
        match record.file_path.as_deref() {
            Some(source) => self.remove_for_path(source).await,
            None => Ok(Vec::new()),
        }
    }

    /// Remove the co-named files in every purely-numeric sibling directory
    /// of `source`. Used directly when a superseded file's record row no
    /// longer points at it.
    pub(crate) async fn remove_for_path(&self, source: &str) -> Result<Vec<String>, ThumbnailError> {
        let Some((dir, name)) = source.rsplit_once('/') else {
            return Ok(Vec::new());
        };

        let (subdirs, _files) = self.backend.list_dir(dir).await?;
        let mut removed = Vec::new();
        for sub in subdirs {
            if !sub.is_empty() && sub.bytes().all(|b| b.is_ascii_digit()) {
                let path = format!("{dir}/{sub}/{name}");
                self.backend.delete(&path).await?;
                removed.push(path);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::field::FieldConfig;
    use crate::storage::MemoryBackend;
    use chrono::Utc;
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    fn field(thumbnails: bool, sizes: Vec<u32>) -> FieldDef {
        FieldDef {
            id: Uuid::new_v4(),
            name: "avatar".into(),
            config: FieldConfig {
                thumbnails,
                thumbnail_sizes: sizes,
                fallback_field: None,
            },
            created_at: Utc::now(),
        }
    }

    fn record(field: &FieldDef, file_path: Option<&str>) -> ImageRecord {
        ImageRecord {
            id: Uuid::new_v4(),
            field_id: field.id,
            key: "users/alice".into(),
            file_path: file_path.map(String::from),
            content_type: None,
            size_bytes: 0,
            checksum: None,
            last_modified: Utc::now(),
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::DynamicImage::new_rgba8(width, height);
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn thumbnail_path_inserts_size_before_filename() {
        assert_eq!(thumbnail_path("a/b/cat.png", 100), "a/b/100/cat.png");
        assert_eq!(thumbnail_path("cat.png", 100), "100/cat.png");
    }

    #[test]
    fn normalized_ext_maps_jpg_to_jpeg() {
        assert_eq!(normalized_ext("a.JPG"), "jpeg");
        assert_eq!(normalized_ext("a.png"), "png");
        assert_eq!(normalized_ext("dir.v2/noext"), "");
        assert_eq!(normalized_ext(".hidden"), "");
    }

    #[tokio::test]
    async fn generate_resizes_to_requested_width() {
        let backend = Arc::new(MemoryBackend::new());
        backend.save("avatar/k/img.png", &png_bytes(400, 200)).await.unwrap();
        let thumbnailer = Thumbnailer::new(backend.clone());

        let f = field(true, vec![100]);
        let r = record(&f, Some("avatar/k/img.png"));
        let outcome = thumbnailer.generate(&f, &r, 100).await.unwrap();
        assert!(matches!(outcome, ThumbnailOutcome::Created { ref path } if path == "avatar/k/100/img.png"));

        let thumb = backend.read("avatar/k/100/img.png").await.unwrap();
        let img = image::load_from_memory(&thumb).unwrap();
        assert_eq!(img.width(), 100);
        assert_eq!(img.height(), 50);
    }

    #[tokio::test]
    async fn generate_twice_writes_once() {
        let backend = Arc::new(MemoryBackend::new());
        backend.save("avatar/k/img.png", &png_bytes(64, 64)).await.unwrap();
        let thumbnailer = Thumbnailer::new(backend.clone());

        let f = field(true, vec![32]);
        let r = record(&f, Some("avatar/k/img.png"));
        let baseline = backend.save_calls.load(Ordering::SeqCst);

        let first = thumbnailer.generate(&f, &r, 32).await.unwrap();
        let second = thumbnailer.generate(&f, &r, 32).await.unwrap();

        assert!(matches!(first, ThumbnailOutcome::Created { .. }));
        assert!(matches!(second, ThumbnailOutcome::AlreadyExists { .. }));
        assert_eq!(backend.save_calls.load(Ordering::SeqCst), baseline + 1);
    }

    #[tokio::test]
    async fn generate_with_disabled_field_names_it() {
        let backend = Arc::new(MemoryBackend::new());
        let thumbnailer = Thumbnailer::new(backend);

        let f = field(false, vec![]);
        let r = record(&f, Some("avatar/k/img.png"));
        let err = thumbnailer.generate(&f, &r, 100).await.unwrap_err();
        assert!(err.to_string().contains("avatar"));
    }

    #[tokio::test]
    async fn undecodable_source_is_a_typed_outcome() {
        let backend = Arc::new(MemoryBackend::new());
        backend.save("avatar/k/img.png", b"not an image").await.unwrap();
        let thumbnailer = Thumbnailer::new(backend.clone());

        let f = field(true, vec![100]);
        let r = record(&f, Some("avatar/k/img.png"));
        let outcome = thumbnailer.generate(&f, &r, 100).await.unwrap();
        assert!(matches!(outcome, ThumbnailOutcome::SourceUnreadable { .. }));
        assert!(!backend.contains("avatar/k/100/img.png"));
    }

    #[tokio::test]
    async fn generate_all_walks_sizes_in_order() {
        let backend = Arc::new(MemoryBackend::new());
        backend.save("avatar/k/img.png", &png_bytes(400, 400)).await.unwrap();
        let thumbnailer = Thumbnailer::new(backend.clone());

        let f = field(true, vec![100, 200]);
        let r = record(&f, Some("avatar/k/img.png"));
        let reports = thumbnailer.generate_all(&f, &r).await.unwrap();

        assert_eq!(reports.iter().map(|r| r.size).collect::<Vec<_>>(), vec![100, 200]);
        assert!(backend.contains("avatar/k/100/img.png"));
        assert!(backend.contains("avatar/k/200/img.png"));
    }

    #[tokio::test]
    async fn generate_all_is_a_noop_for_empty_records() {
        let backend = Arc::new(MemoryBackend::new());
        let thumbnailer = Thumbnailer::new(backend.clone());

        let f = field(true, vec![100]);
        let r = record(&f, None);
        let reports = thumbnailer.generate_all(&f, &r).await.unwrap();
        assert!(reports.is_empty());
        assert_eq!(backend.save_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remove_all_deletes_numeric_siblings_only() {
        let backend = Arc::new(MemoryBackend::new());
        backend.save("avatar/k/img.png", b"src").await.unwrap();
        backend.save("avatar/k/100/img.png", b"t1").await.unwrap();
        backend.save("avatar/k/200/img.png", b"t2").await.unwrap();
        backend.save("avatar/k/200/other.png", b"keep").await.unwrap();
        backend.save("avatar/k/extra/img.png", b"keep").await.unwrap();
        let thumbnailer = Thumbnailer::new(backend.clone());

        let f = field(true, vec![100, 200]);
        let r = record(&f, Some("avatar/k/img.png"));
        let removed = thumbnailer.remove_all(&f, &r).await.unwrap();

        assert_eq!(removed.len(), 2);
        assert!(!backend.contains("avatar/k/100/img.png"));
        assert!(!backend.contains("avatar/k/200/img.png"));
        assert!(backend.contains("avatar/k/img.png"));
        assert!(backend.contains("avatar/k/200/other.png"));
        assert!(backend.contains("avatar/k/extra/img.png"));
    }

    #[tokio::test]
    async fn remove_all_is_a_noop_without_size_dirs() {
        let backend = Arc::new(MemoryBackend::new());
        backend.save("avatar/k/img.png", b"src").await.unwrap();
        let thumbnailer = Thumbnailer::new(backend.clone());

        let f = field(true, vec![100]);
        let r = record(&f, Some("avatar/k/img.png"));
        assert!(thumbnailer.remove_all(&f, &r).await.unwrap().is_empty());
    }
}
