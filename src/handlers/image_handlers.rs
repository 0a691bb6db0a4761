//! HTTP handlers for field and record operations.
//! Parsing and response shaping only; every lifecycle concern is delegated
//! to `ImageService`.

use crate::{
    errors::AppError,
    models::{field::FieldConfig, field::FieldDef, record::ImageRecord, resolved::ResolvedImage},
    services::image_service::{ImageService, ListRecordsParams, UploadMeta},
    services::thumbnails::{ThumbnailOutcome, ThumbnailReport},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::{io, path::Path as FsPath};
use tokio_util::io::ReaderStream;

/// Prefix for upload headers that become record attributes
/// (`x-image-attr-default-image: img/default.png`).
const ATTR_HEADER_PREFIX: &str = "x-image-attr-";

/// Upload header naming the stored file.
const FILENAME_HEADER: &str = "x-image-filename";

#[derive(Debug, Deserialize)]
pub struct ListRecordsQuery {
    pub prefix: Option<String>,
    pub after: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct GetRecordQuery {
    /// Serve the thumbnail of this width instead of the original.
    pub width: Option<u32>,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub record: ImageRecord,
    pub thumbnails: Vec<ThumbnailReport>,
}

#[derive(Serialize)]
pub struct FieldResponse {
    pub field: FieldDef,
    pub records: Vec<ImageRecord>,
    pub is_truncated: bool,
    pub next_after: Option<String>,
}

/// PUT `/{field}` — create a field definition. An absent or `null` body
/// means the default configuration.
pub async fn create_field(
    State(service): State<ImageService>,
    Path(field): Path<String>,
    Json(payload): Json<Option<FieldConfig>>,
) -> Result<impl IntoResponse, AppError> {
    let config = payload.unwrap_or_default();
    let def = service.create_field(&field, config).await?;
    Ok((StatusCode::CREATED, Json(def)))
}

/// GET `/{field}` — field definition plus a page of its records,
/// supports `?prefix=&after=&limit=`.
pub async fn get_field(
    State(service): State<ImageService>,
    Path(field): Path<String>,
    Query(q): Query<ListRecordsQuery>,
) -> Result<Json<FieldResponse>, AppError> {
    let field = service.fetch_field(&field).await?;
    let page = service
        .list_records(
            &field,
            ListRecordsParams {
                prefix: q.prefix,
                after: q.after,
                limit: q.limit.unwrap_or(1000),
            },
        )
        .await?;

    Ok(Json(FieldResponse {
        field,
        records: page.records,
        is_truncated: page.is_truncated,
        next_after: page.next_after,
    }))
}

/// DELETE `/{field}` — delete the definition and all of its records.
pub async fn delete_field(
    State(service): State<ImageService>,
    Path(field): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    service.delete_field(&field).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT `/{field}/{*key}` — save an upload through the full lifecycle.
/// An empty body stores an empty record (fallback resolution applies).
pub async fn upload_record(
    State(service): State<ImageService>,
    Path((field, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<UploadResponse>, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let filename = headers
        .get(FILENAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let mut attrs = Vec::new();
    for (name, value) in headers.iter() {
        if let Some(attr) = name.as_str().strip_prefix(ATTR_HEADER_PREFIX) {
            if !attr.is_empty() {
                if let Ok(value) = value.to_str() {
                    attrs.push((attr.to_string(), value.to_string()));
                }
            }
        }
    }

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let result = service
        .store_image(
            &field,
            &key,
            UploadMeta {
                filename,
                content_type,
                attrs,
            },
            stream,
        )
        .await?;

    Ok(Json(UploadResponse {
        record: result.record,
        thumbnails: result.thumbnails,
    }))
}

/// GET `/{field}/{*key}` — serve the resolved image. `?width=N` serves the
/// width-`N` thumbnail, generated on first access; with the fallback active
/// the fallback asset is served unscaled instead.
pub async fn get_record(
    State(service): State<ImageService>,
    Path((field, key)): Path<(String, String)>,
    Query(q): Query<GetRecordQuery>,
) -> Result<Response, AppError> {
    let field = service.fetch_field(&field).await?;
    let record = service.fetch_record(&field, &key).await?;

    if let Some(width) = q.width {
        if width == 0 {
            return Err(AppError::new(
                StatusCode::BAD_REQUEST,
                "thumbnail width must be positive",
            ));
        }
        if !record.is_empty() {
            return serve_thumbnail(&service, &field, &record, width).await;
        }
        // Empty record: the fallback asset is served as-is below.
    }

    let resolved = service
        .resolve(&field, &record)
        .await?
        .ok_or_else(|| AppError::not_found(format!("record `{key}` has no image")))?;

    match resolved {
        ResolvedImage::Uploaded { rel_path, .. } => {
            let bytes = service
                .backend
                .read(&rel_path)
                .await
                .map_err(|err| read_error(err, &rel_path))?;
            let mut response = Response::new(Body::from(bytes));
            set_record_headers(response.headers_mut(), &record);
            Ok(response)
        }
        ResolvedImage::Fallback { disk_path, .. } => serve_static_file(&disk_path).await,
    }
}

/// HEAD `/{field}/{*key}` — resolution headers, no body.
pub async fn head_record(
    State(service): State<ImageService>,
    Path((field, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let field = service.fetch_field(&field).await?;
    let record = service.fetch_record(&field, &key).await?;
    let resolved = service
        .resolve(&field, &record)
        .await?
        .ok_or_else(|| AppError::not_found(format!("record `{key}` has no image")))?;

    let mut response = Response::new(Body::empty());
    match &resolved {
        ResolvedImage::Uploaded { .. } => {
            set_record_headers(response.headers_mut(), &record);
            insert_header(
                response.headers_mut(),
                header::CONTENT_LENGTH,
                &record.size_bytes.to_string(),
            );
        }
        ResolvedImage::Fallback { disk_path, .. } => {
            let meta = tokio::fs::metadata(disk_path)
                .await
                .map_err(|err| read_error(err, &disk_path.display().to_string()))?;
            insert_header(
                response.headers_mut(),
                header::CONTENT_TYPE,
                content_type_for(disk_path),
            );
            insert_header(
                response.headers_mut(),
                header::CONTENT_LENGTH,
                &meta.len().to_string(),
            );
        }
    }
    Ok(response)
}

/// DELETE `/{field}/{*key}` — full delete lifecycle.
pub async fn delete_record(
    State(service): State<ImageService>,
    Path((field, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    service.delete_image(&field, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn serve_thumbnail(
    service: &ImageService,
    field: &FieldDef,
    record: &ImageRecord,
    width: u32,
) -> Result<Response, AppError> {
    match service.generate_thumbnail(field, record, width).await? {
        ThumbnailOutcome::Created { path } | ThumbnailOutcome::AlreadyExists { path } => {
            let bytes = service
                .backend
                .read(&path)
                .await
                .map_err(|err| read_error(err, &path))?;
            let mut response = Response::new(Body::from(bytes));
            if let Some(content_type) = record.content_type.as_deref() {
                insert_header(response.headers_mut(), header::CONTENT_TYPE, content_type);
            }
            Ok(response)
        }
        ThumbnailOutcome::SourceUnreadable { reason } => Err(AppError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("cannot thumbnail source image: {reason}"),
        )),
    }
}

async fn serve_static_file(path: &FsPath) -> Result<Response, AppError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|err| read_error(err, &path.display().to_string()))?;
    let stream = ReaderStream::new(file);
    let mut response = Response::new(Body::from_stream(stream));
    insert_header(
        response.headers_mut(),
        header::CONTENT_TYPE,
        content_type_for(path),
    );
    Ok(response)
}

fn set_record_headers(headers: &mut HeaderMap, record: &ImageRecord) {
    let content_type = record
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    insert_header(headers, header::CONTENT_TYPE, &content_type);

    if let Some(checksum) = record.checksum.as_ref() {
        insert_header(headers, header::ETAG, &format!("\"{}\"", checksum));
    }
    insert_header(
        headers,
        header::LAST_MODIFIED,
        &record.last_modified.to_rfc2822(),
    );
}

fn insert_header(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn content_type_for(path: &FsPath) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

fn read_error(err: io::Error, what: &str) -> AppError {
    if err.kind() == io::ErrorKind::NotFound {
        AppError::not_found(format!("`{what}` is missing from storage"))
    } else {
        AppError::internal(err.to_string())
    }
}
