//! ImageService — the save/delete lifecycle for image fields, backed by
//! SQLite for record metadata and a pluggable [`StorageBackend`] for payload
//! bytes.
//!
//! All lifecycle side effects (deduplicating superseded files, generating
//! and removing thumbnails, fallback resolution) happen here, explicitly,
//! before or after the row is persisted. Nothing is hooked into the
//! persistence layer itself.

use crate::models::{
    field::{FieldConfig, FieldDef, FieldRow},
    record::{ImageRecord, RecordAttr},
    resolved::ResolvedImage,
};
use crate::services::thumbnails::{ThumbnailError, ThumbnailOutcome, ThumbnailReport, Thumbnailer};
use crate::statics::StaticFiles;
use crate::storage::StorageBackend;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{io, sync::Arc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct ListRecordsParams {
    pub prefix: Option<String>,
    pub after: Option<String>,
    pub limit: usize,
}

#[derive(Debug)]
pub struct ListRecordsResult {
    pub records: Vec<ImageRecord>,
    pub is_truncated: bool,
    pub next_after: Option<String>,
}

/// Per-upload metadata supplied by the caller.
#[derive(Clone, Debug, Default)]
pub struct UploadMeta {
    /// Filename to store under; derived from the content type when absent.
    pub filename: Option<String>,
    pub content_type: Option<String>,
    /// Record attributes to set alongside the upload.
    pub attrs: Vec<(String, String)>,
}

/// A persisted record plus what happened to its thumbnails.
#[derive(Debug)]
pub struct StoreResult {
    pub record: ImageRecord,
    pub thumbnails: Vec<ThumbnailReport>,
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("field `{0}` not found")]
    FieldNotFound(String),
    #[error("field `{0}` already exists")]
    FieldAlreadyExists(String),
    #[error("field `{name}` invalid: {reason}")]
    InvalidField { name: String, reason: String },
    #[error("record `{key}` not found in field `{field}`")]
    RecordNotFound { field: String, key: String },
    #[error("invalid record key")]
    InvalidKey,
    #[error("invalid filename `{0}`")]
    InvalidFilename(String),
    #[error("record `{key}` has no `{attr}` attribute")]
    MisconfiguredFallback { key: String, attr: String },
    #[error("fallback attribute holds an unsafe static path `{0}`")]
    UnsafeStaticPath(String),
    #[error(transparent)]
    Thumbnail(#[from] ThumbnailError),
    #[error(transparent)]
    Config(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ImageResult<T> = Result<T, ImageError>;

const MAX_KEY_LEN: usize = 1024;
const MAX_FILENAME_LEN: usize = 255;
const FIELD_NAME_MAX_LEN: usize = 64;

/// ImageService holds the shared SQLite pool, the payload backend, the
/// thumbnailer riding on that backend, and the static-asset resolver used
/// for fallbacks.
#[derive(Clone)]
pub struct ImageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Payload storage for uploads and thumbnails.
    pub backend: Arc<dyn StorageBackend>,

    thumbnailer: Thumbnailer,
    statics: StaticFiles,
    media_url: String,
}

impl ImageService {
    pub fn new(
        db: Arc<SqlitePool>,
        backend: Arc<dyn StorageBackend>,
        statics: StaticFiles,
        media_url: impl Into<String>,
    ) -> Self {
        let mut media_url = media_url.into();
        while media_url.ends_with('/') {
            media_url.pop();
        }
        Self {
            db,
            thumbnailer: Thumbnailer::new(backend.clone()),
            backend,
            statics,
            media_url,
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(&self, key: &str) -> ImageResult<()> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(ImageError::InvalidKey);
        }
        if key.starts_with('/')
            || key
                .split('/')
                .any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(ImageError::InvalidKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(ImageError::InvalidKey);
        }
        Ok(())
    }

    /// Field names become the first path segment of every stored file, so
    /// they are restricted to a single lowercase identifier-ish segment.
    fn ensure_field_name_safe(&self, name: &str) -> ImageResult<()> {
        let reason = if name.is_empty() || name.len() > FIELD_NAME_MAX_LEN {
            Some("must be between 1 and 64 characters")
        } else if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_' | '-'))
        {
            Some("allowed characters are lowercase letters, digits, underscores, and hyphens")
        } else if name.starts_with('-') || name.ends_with('-') {
            Some("must start and end with a letter or digit")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ImageError::InvalidField {
                name: name.to_string(),
                reason: reason.into(),
            }),
            None => Ok(()),
        }
    }

    fn ensure_filename_safe(&self, filename: &str) -> ImageResult<()> {
        if filename.is_empty()
            || filename.len() > MAX_FILENAME_LEN
            || filename.contains('/')
            || filename == "."
            || filename == ".."
            || filename
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(ImageError::InvalidFilename(filename.to_string()));
        }
        Ok(())
    }

    /// Create a field definition after validating its name and options.
    pub async fn create_field(&self, name: &str, config: FieldConfig) -> ImageResult<FieldDef> {
        self.ensure_field_name_safe(name)?;
        if let Err(reason) = config.validate() {
            return Err(ImageError::InvalidField {
                name: name.to_string(),
                reason,
            });
        }

        let field = FieldDef {
            id: Uuid::new_v4(),
            name: name.to_string(),
            config,
            created_at: Utc::now(),
        };

        let serialized = serde_json::to_string(&field.config)?;
        match sqlx::query("INSERT INTO fields (id, name, config, created_at) VALUES (?, ?, ?, ?)")
            .bind(field.id)
            .bind(&field.name)
            .bind(&serialized)
            .bind(field.created_at)
            .execute(&*self.db)
            .await
        {
            Ok(_) => Ok(field),
            Err(err) if is_unique_violation(&err) => {
                Err(ImageError::FieldAlreadyExists(name.to_string()))
            }
            Err(err) => Err(ImageError::Sqlx(err)),
        }
    }

    /// Fetch a field definition, deserializing its stored configuration.
    pub async fn fetch_field(&self, name: &str) -> ImageResult<FieldDef> {
        self.ensure_field_name_safe(name)?;
        let row = sqlx::query_as::<Sqlite, FieldRow>(
            "SELECT id, name, config, created_at FROM fields WHERE name = ?",
        )
        .bind(name)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => ImageError::FieldNotFound(name.to_string()),
            other => ImageError::Sqlx(other),
        })?;
        Ok(FieldDef::try_from(row)?)
    }

    /// Delete a field definition along with all of its records; every record
    /// goes through the full delete lifecycle first.
    pub async fn delete_field(&self, name: &str) -> ImageResult<()> {
        let field = self.fetch_field(name).await?;

        let records = sqlx::query_as::<_, ImageRecord>(
            "SELECT id, field_id, key, file_path, content_type, size_bytes, checksum, last_modified
             FROM records WHERE field_id = ?",
        )
        .bind(field.id)
        .fetch_all(&*self.db)
        .await?;

        for record in records {
            self.delete_record_files(&field, &record).await?;
            self.delete_record_rows(&record).await?;
        }

        sqlx::query("DELETE FROM fields WHERE id = ?")
            .bind(field.id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn fetch_record_opt(
        &self,
        field: &FieldDef,
        key: &str,
    ) -> ImageResult<Option<ImageRecord>> {
        Ok(sqlx::query_as::<_, ImageRecord>(
            "SELECT id, field_id, key, file_path, content_type, size_bytes, checksum, last_modified
             FROM records WHERE field_id = ? AND key = ?",
        )
        .bind(field.id)
        .bind(key)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Fetch a record of `field` by key.
    pub async fn fetch_record(&self, field: &FieldDef, key: &str) -> ImageResult<ImageRecord> {
        self.ensure_key_safe(key)?;
        self.fetch_record_opt(field, key)
            .await?
            .ok_or_else(|| ImageError::RecordNotFound {
                field: field.name.clone(),
                key: key.to_string(),
            })
    }

    /// Save an upload for `(field, key)`, applying the full save lifecycle:
    ///
    /// 1. Buffer the body while computing its md5 checksum. An empty body
    ///    stores an empty record (no file).
    /// 2. Write the payload at `field/key/filename`.
    /// 3. If the previously persisted record pointed at a different file,
    ///    remove that file's thumbnails (when enabled) and delete it — the
    ///    superseded upload never outlives the save.
    ///    When the path is unchanged but the content differs, stale
    ///    thumbnails are removed so they regenerate from the new content.
    /// 4. Upsert the record row and its attributes.
    /// 5. Generate the configured thumbnails for the new file.
    pub async fn store_image<S>(
        &self,
        field_name: &str,
        key: &str,
        meta: UploadMeta,
        stream: S,
    ) -> ImageResult<StoreResult>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.ensure_key_safe(key)?;
        let field = self.fetch_field(field_name).await?;
        let old = self.fetch_record_opt(&field, key).await?;

        let mut digest = Context::new();
        let mut content = BytesMut::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            digest.consume(&chunk);
            content.extend_from_slice(&chunk);
        }

        let (file_path, checksum, size_bytes) = if content.is_empty() {
            (None, None, 0i64)
        } else {
            let filename = meta
                .filename
                .clone()
                .unwrap_or_else(|| default_filename(meta.content_type.as_deref()));
            self.ensure_filename_safe(&filename)?;
            let path = format!("{}/{}/{}", field.name, key, filename);
            let stored = self.backend.save(&path, &content).await?;
            let checksum = format!("{:x}", digest.compute());
            (Some(stored), Some(checksum), content.len() as i64)
        };

        if let Some(old_path) = old.as_ref().and_then(|rec| rec.file_path.as_deref()) {
            match file_path.as_deref() {
                Some(new_path) if new_path == old_path => {
                    // Same stored name: drop stale thumbnails when the
                    // content changed so they regenerate below.
                    let changed = old.as_ref().and_then(|rec| rec.checksum.as_deref())
                        != checksum.as_deref();
                    if field.config.thumbnails && changed {
                        self.thumbnailer.remove_for_path(old_path).await?;
                    }
                }
                _ => {
                    if field.config.thumbnails {
                        self.thumbnailer.remove_for_path(old_path).await?;
                    }
                    self.backend.delete(old_path).await?;
                }
            }
        }

        let content_type = file_path.is_some().then_some(meta.content_type).flatten();
        let insert = sqlx::query_as::<_, ImageRecord>(
            r#"
            INSERT INTO records (
                id, field_id, key, file_path, content_type, size_bytes, checksum, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(field_id, key) DO UPDATE SET
                file_path = excluded.file_path,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                checksum = excluded.checksum,
                last_modified = excluded.last_modified
            RETURNING id, field_id, key, file_path, content_type, size_bytes, checksum, last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(field.id)
        .bind(key)
        .bind(&file_path)
        .bind(&content_type)
        .bind(size_bytes)
        .bind(&checksum)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        let record = match insert {
            Ok(record) => record,
            Err(err) => {
                if let Some(path) = &file_path {
                    let _ = self.backend.delete(path).await;
                }
                return Err(ImageError::Sqlx(err));
            }
        };

        for (name, value) in &meta.attrs {
            sqlx::query(
                "INSERT INTO record_attrs (id, record_id, name, value) VALUES (?, ?, ?, ?)
                 ON CONFLICT(record_id, name) DO UPDATE SET value = excluded.value",
            )
            .bind(Uuid::new_v4())
            .bind(record.id)
            .bind(name)
            .bind(value)
            .execute(&*self.db)
            .await?;
        }

        let thumbnails = if field.config.thumbnails && !record.is_empty() {
            self.thumbnailer.generate_all(&field, &record).await?
        } else {
            Vec::new()
        };

        Ok(StoreResult { record, thumbnails })
    }

    /// Delete a record: thumbnails first (when the field manages them and a
    /// file exists), then the payload, then the rows. For an empty record
    /// the storage side is untouched — the fallback asset is not ours.
    pub async fn delete_image(&self, field_name: &str, key: &str) -> ImageResult<ImageRecord> {
        let field = self.fetch_field(field_name).await?;
        let record = self.fetch_record(&field, key).await?;

        self.delete_record_files(&field, &record).await?;
        self.delete_record_rows(&record).await?;
        Ok(record)
    }

    async fn delete_record_files(
        &self,
        field: &FieldDef,
        record: &ImageRecord,
    ) -> ImageResult<()> {
        if field.config.thumbnails {
            self.thumbnailer.remove_all(field, record).await?;
        }
        if let Some(path) = record.file_path.as_deref() {
            self.backend.delete(path).await?;
        }
        Ok(())
    }

    async fn delete_record_rows(&self, record: &ImageRecord) -> ImageResult<()> {
        sqlx::query("DELETE FROM record_attrs WHERE record_id = ?")
            .bind(record.id)
            .execute(&*self.db)
            .await?;
        sqlx::query("DELETE FROM records WHERE id = ?")
            .bind(record.id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Resolve a record to something servable.
    ///
    /// A non-empty record resolves to its upload. An empty record resolves
    /// through the field's fallback attribute: a record missing that
    /// attribute entirely is a configuration error; an attribute holding an
    /// empty value means there is nothing to resolve.
    pub async fn resolve(
        &self,
        field: &FieldDef,
        record: &ImageRecord,
    ) -> ImageResult<Option<ResolvedImage>> {
        if let Some(rel) = record.file_path.as_deref() {
            return Ok(Some(ResolvedImage::Uploaded {
                rel_path: rel.to_string(),
                disk_path: self.backend.disk_path(rel),
                url: format!("{}/{}", self.media_url, rel),
            }));
        }

        let Some(attr) = field.config.fallback_field.as_deref() else {
            return Ok(None);
        };
        let value = self
            .fetch_attr(record.id, attr)
            .await?
            .ok_or_else(|| ImageError::MisconfiguredFallback {
                key: record.key.clone(),
                attr: attr.to_string(),
            })?;
        if value.is_empty() {
            return Ok(None);
        }

        match (self.statics.path(&value), self.statics.url(&value)) {
            (Some(disk_path), Some(url)) => Ok(Some(ResolvedImage::Fallback {
                rel_path: value,
                disk_path,
                url,
            })),
            _ => Err(ImageError::UnsafeStaticPath(value)),
        }
    }

    /// Generate (or find) one thumbnail on demand.
    pub async fn generate_thumbnail(
        &self,
        field: &FieldDef,
        record: &ImageRecord,
        width: u32,
    ) -> ImageResult<ThumbnailOutcome> {
        Ok(self.thumbnailer.generate(field, record, width).await?)
    }

    async fn fetch_attr(&self, record_id: Uuid, name: &str) -> ImageResult<Option<String>> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT value FROM record_attrs WHERE record_id = ? AND name = ?",
        )
        .bind(record_id)
        .bind(name)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// All attributes of a record, for metadata responses.
    pub async fn fetch_attrs(&self, record_id: Uuid) -> ImageResult<Vec<RecordAttr>> {
        Ok(sqlx::query_as::<_, RecordAttr>(
            "SELECT id, record_id, name, value FROM record_attrs WHERE record_id = ? ORDER BY name",
        )
        .bind(record_id)
        .fetch_all(&*self.db)
        .await?)
    }

    /// List a field's records in key order with prefix filtering and a
    /// key-based cursor.
    pub async fn list_records(
        &self,
        field: &FieldDef,
        params: ListRecordsParams,
    ) -> ImageResult<ListRecordsResult> {
        let limit = params.limit.clamp(1, 1000);
        let fetch_limit = limit + 1;

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, field_id, key, file_path, content_type, size_bytes, checksum, \
             last_modified FROM records WHERE field_id = ",
        );
        builder.push_bind(field.id);

        if let Some(prefix) = &params.prefix {
            builder.push(" AND key LIKE ");
            builder.push_bind(format!("{}%", prefix));
        }
        if let Some(after) = &params.after {
            builder.push(" AND key > ");
            builder.push_bind(after);
        }
        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut records: Vec<ImageRecord> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut is_truncated = false;
        let mut next_after = None;
        if records.len() == fetch_limit {
            records.pop();
            next_after = records.last().map(|rec| rec.key.clone());
            is_truncated = true;
        }

        Ok(ListRecordsResult {
            records,
            is_truncated,
            next_after,
        })
    }
}

/// Return true if the SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Stored filename when the caller supplied none.
fn default_filename(content_type: Option<&str>) -> String {
    let ext = match content_type {
        Some("image/png") => "png",
        Some("image/jpeg") | Some("image/jpg") => "jpg",
        Some("image/gif") => "gif",
        Some("image/webp") => "webp",
        _ => "bin",
    };
    format!("image.{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use image::ImageFormat;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::io::Cursor;
    use std::sync::atomic::Ordering;

    async fn service() -> (ImageService, Arc<MemoryBackend>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        for stmt in include_str!("../../migrations/0001_init.sql")
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }

        let backend = Arc::new(MemoryBackend::new());
        let statics = StaticFiles::new("/srv/static", "/static");
        let service = ImageService::new(
            Arc::new(pool),
            backend.clone(),
            statics,
            "/media",
        );
        (service, backend)
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::DynamicImage::new_rgba8(width, height);
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn body(data: Vec<u8>) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        futures::stream::iter(vec![Ok(Bytes::from(data))])
    }

    fn upload(filename: &str) -> UploadMeta {
        UploadMeta {
            filename: Some(filename.into()),
            content_type: Some("image/png".into()),
            attrs: Vec::new(),
        }
    }

    fn plain_config() -> FieldConfig {
        FieldConfig::default()
    }

    fn thumb_config(sizes: Vec<u32>) -> FieldConfig {
        FieldConfig {
            thumbnails: true,
            thumbnail_sizes: sizes,
            fallback_field: None,
        }
    }

    #[tokio::test]
    async fn field_config_round_trips_through_the_database() {
        let (service, _) = service().await;
        let config = FieldConfig {
            thumbnails: true,
            thumbnail_sizes: vec![100, 200],
            fallback_field: Some("default_image".into()),
        };
        service.create_field("avatar", config.clone()).await.unwrap();

        let fetched = service.fetch_field("avatar").await.unwrap();
        assert_eq!(fetched.config, config);
    }

    #[tokio::test]
    async fn duplicate_field_names_are_rejected() {
        let (service, _) = service().await;
        service.create_field("avatar", plain_config()).await.unwrap();
        let err = service
            .create_field("avatar", plain_config())
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::FieldAlreadyExists(_)));
    }

    #[tokio::test]
    async fn store_persists_payload_and_checksum() {
        let (service, backend) = service().await;
        service.create_field("avatar", plain_config()).await.unwrap();

        let data = png_bytes(10, 10);
        let expected = format!("{:x}", md5::compute(&data));
        let result = service
            .store_image("avatar", "users/alice", upload("cat.png"), body(data))
            .await
            .unwrap();

        assert_eq!(
            result.record.file_path.as_deref(),
            Some("avatar/users/alice/cat.png")
        );
        assert_eq!(result.record.checksum.as_deref(), Some(expected.as_str()));
        assert!(backend.contains("avatar/users/alice/cat.png"));
    }

    #[tokio::test]
    async fn superseded_file_is_deleted_exactly_once() {
        let (service, backend) = service().await;
        service.create_field("avatar", plain_config()).await.unwrap();

        service
            .store_image("avatar", "k", upload("old.png"), body(png_bytes(8, 8)))
            .await
            .unwrap();
        let baseline = backend.delete_calls.load(Ordering::SeqCst);

        service
            .store_image("avatar", "k", upload("new.png"), body(png_bytes(8, 8)))
            .await
            .unwrap();

        assert_eq!(backend.delete_calls.load(Ordering::SeqCst), baseline + 1);
        assert!(!backend.contains("avatar/k/old.png"));
        assert!(backend.contains("avatar/k/new.png"));
    }

    #[tokio::test]
    async fn replacing_a_file_removes_its_thumbnails() {
        let (service, backend) = service().await;
        service
            .create_field("avatar", thumb_config(vec![16]))
            .await
            .unwrap();

        service
            .store_image("avatar", "k", upload("old.png"), body(png_bytes(64, 64)))
            .await
            .unwrap();
        assert!(backend.contains("avatar/k/16/old.png"));

        service
            .store_image("avatar", "k", upload("new.png"), body(png_bytes(64, 64)))
            .await
            .unwrap();

        assert!(!backend.contains("avatar/k/old.png"));
        assert!(!backend.contains("avatar/k/16/old.png"));
        assert!(backend.contains("avatar/k/16/new.png"));
    }

    #[tokio::test]
    async fn same_name_new_content_regenerates_thumbnails() {
        let (service, backend) = service().await;
        service
            .create_field("avatar", thumb_config(vec![16]))
            .await
            .unwrap();

        service
            .store_image("avatar", "k", upload("img.png"), body(png_bytes(64, 64)))
            .await
            .unwrap();
        let stale = backend.read("avatar/k/16/img.png").await.unwrap();

        service
            .store_image("avatar", "k", upload("img.png"), body(png_bytes(32, 16)))
            .await
            .unwrap();
        let fresh = backend.read("avatar/k/16/img.png").await.unwrap();

        assert_ne!(stale, fresh);
        let img = image::load_from_memory(&fresh).unwrap();
        assert_eq!((img.width(), img.height()), (16, 8));
    }

    #[tokio::test]
    async fn same_name_same_content_writes_thumbnails_once() {
        let (service, backend) = service().await;
        service
            .create_field("avatar", thumb_config(vec![16]))
            .await
            .unwrap();

        let data = png_bytes(64, 64);
        service
            .store_image("avatar", "k", upload("img.png"), body(data.clone()))
            .await
            .unwrap();
        let baseline = backend.save_calls.load(Ordering::SeqCst);

        let result = service
            .store_image("avatar", "k", upload("img.png"), body(data))
            .await
            .unwrap();

        // one write for the payload, none for the thumbnail
        assert_eq!(backend.save_calls.load(Ordering::SeqCst), baseline + 1);
        assert!(matches!(
            result.thumbnails[0].outcome,
            ThumbnailOutcome::AlreadyExists { .. }
        ));
    }

    #[tokio::test]
    async fn empty_body_clears_the_file() {
        let (service, backend) = service().await;
        service
            .create_field("avatar", thumb_config(vec![16]))
            .await
            .unwrap();

        service
            .store_image("avatar", "k", upload("img.png"), body(png_bytes(64, 64)))
            .await
            .unwrap();

        let result = service
            .store_image("avatar", "k", UploadMeta::default(), body(Vec::new()))
            .await
            .unwrap();

        assert!(result.record.is_empty());
        assert!(result.thumbnails.is_empty());
        assert!(!backend.contains("avatar/k/img.png"));
        assert!(!backend.contains("avatar/k/16/img.png"));
    }

    #[tokio::test]
    async fn empty_record_resolves_through_the_fallback_attribute() {
        let (service, backend) = service().await;
        let config = FieldConfig {
            thumbnails: true,
            thumbnail_sizes: vec![16],
            fallback_field: Some("default_image".into()),
        };
        service.create_field("avatar", config).await.unwrap();

        let meta = UploadMeta {
            attrs: vec![("default_image".into(), "img/default.png".into())],
            ..UploadMeta::default()
        };
        let result = service
            .store_image("avatar", "k", meta, body(Vec::new()))
            .await
            .unwrap();
        assert!(result.thumbnails.is_empty());
        assert_eq!(backend.save_calls.load(Ordering::SeqCst), 0);

        let field = service.fetch_field("avatar").await.unwrap();
        let resolved = service
            .resolve(&field, &result.record)
            .await
            .unwrap()
            .unwrap();
        assert!(!resolved.is_uploaded());
        assert_eq!(resolved.url(), "/static/img/default.png");
        assert_eq!(
            resolved.path(),
            std::path::Path::new("/srv/static/img/default.png")
        );
    }

    #[tokio::test]
    async fn uploaded_record_resolves_to_media_url() {
        let (service, _) = service().await;
        service.create_field("avatar", plain_config()).await.unwrap();
        let result = service
            .store_image("avatar", "k", upload("cat.png"), body(png_bytes(4, 4)))
            .await
            .unwrap();

        let field = service.fetch_field("avatar").await.unwrap();
        let resolved = service
            .resolve(&field, &result.record)
            .await
            .unwrap()
            .unwrap();
        assert!(resolved.is_uploaded());
        assert_eq!(resolved.url(), "/media/avatar/k/cat.png");
    }

    #[tokio::test]
    async fn missing_fallback_attribute_is_a_configuration_error() {
        let (service, _) = service().await;
        let config = FieldConfig {
            fallback_field: Some("default_image".into()),
            ..FieldConfig::default()
        };
        service.create_field("avatar", config).await.unwrap();

        let result = service
            .store_image("avatar", "k", UploadMeta::default(), body(Vec::new()))
            .await
            .unwrap();

        let field = service.fetch_field("avatar").await.unwrap();
        let err = service.resolve(&field, &result.record).await.unwrap_err();
        assert!(matches!(err, ImageError::MisconfiguredFallback { .. }));
    }

    #[tokio::test]
    async fn empty_fallback_value_resolves_to_nothing() {
        let (service, _) = service().await;
        let config = FieldConfig {
            fallback_field: Some("default_image".into()),
            ..FieldConfig::default()
        };
        service.create_field("avatar", config).await.unwrap();

        let meta = UploadMeta {
            attrs: vec![("default_image".into(), "".into())],
            ..UploadMeta::default()
        };
        let result = service
            .store_image("avatar", "k", meta, body(Vec::new()))
            .await
            .unwrap();

        let field = service.fetch_field("avatar").await.unwrap();
        assert!(service.resolve(&field, &result.record).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_payload_thumbnails_and_row() {
        let (service, backend) = service().await;
        service
            .create_field("avatar", thumb_config(vec![16, 32]))
            .await
            .unwrap();
        service
            .store_image("avatar", "k", upload("img.png"), body(png_bytes(64, 64)))
            .await
            .unwrap();

        service.delete_image("avatar", "k").await.unwrap();

        assert!(backend.paths().is_empty());
        let field = service.fetch_field("avatar").await.unwrap();
        let err = service.fetch_record(&field, "k").await.unwrap_err();
        assert!(matches!(err, ImageError::RecordNotFound { .. }));
    }

    #[tokio::test]
    async fn delete_of_empty_record_touches_no_storage() {
        let (service, backend) = service().await;
        let config = FieldConfig {
            thumbnails: true,
            thumbnail_sizes: vec![16],
            fallback_field: Some("default_image".into()),
        };
        service.create_field("avatar", config).await.unwrap();
        let meta = UploadMeta {
            attrs: vec![("default_image".into(), "img/default.png".into())],
            ..UploadMeta::default()
        };
        service
            .store_image("avatar", "k", meta, body(Vec::new()))
            .await
            .unwrap();

        service.delete_image("avatar", "k").await.unwrap();
        assert_eq!(backend.delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn list_records_filters_and_paginates() {
        let (service, _) = service().await;
        service.create_field("avatar", plain_config()).await.unwrap();
        for key in ["users/alice", "users/bob", "users/carol", "teams/red"] {
            service
                .store_image("avatar", key, upload("img.png"), body(png_bytes(2, 2)))
                .await
                .unwrap();
        }

        let field = service.fetch_field("avatar").await.unwrap();
        let page = service
            .list_records(
                &field,
                ListRecordsParams {
                    prefix: Some("users/".into()),
                    after: None,
                    limit: 2,
                },
            )
            .await
            .unwrap();

        assert_eq!(
            page.records.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(),
            vec!["users/alice", "users/bob"]
        );
        assert!(page.is_truncated);
        assert_eq!(page.next_after.as_deref(), Some("users/bob"));

        let rest = service
            .list_records(
                &field,
                ListRecordsParams {
                    prefix: Some("users/".into()),
                    after: page.next_after,
                    limit: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(rest.records.len(), 1);
        assert!(!rest.is_truncated);
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let (service, _) = service().await;
        service.create_field("avatar", plain_config()).await.unwrap();
        let err = service
            .store_image("avatar", "../escape", upload("img.png"), body(png_bytes(2, 2)))
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::InvalidKey));
    }
}
