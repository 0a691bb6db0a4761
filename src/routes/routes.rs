//! Defines routes for all field and record operations.
//!
//! ## Structure
//! - **Field-level endpoints**
//!   - `GET    /{field}` — field definition + record listing (supports prefix, after, limit)
//!   - `PUT    /{field}` — create field definition
//!   - `DELETE /{field}` — delete field definition and its records
//!
//! - **Record-level endpoints**
//!   - `PUT    /{field}/{*key}` — upload an image (empty body clears the file)
//!   - `GET    /{field}/{*key}` — serve the resolved image (`?width=N` for a thumbnail)
//!   - `HEAD   /{field}/{*key}` — resolution headers only
//!   - `DELETE /{field}/{*key}` — delete record, payload, and thumbnails
//!
//! The wildcard `*key` allows nested keys like `users/alice`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        image_handlers::{
            create_field, delete_field, delete_record, get_field, get_record, head_record,
            upload_record,
        },
    },
    services::image_service::ImageService,
};
use axum::{
    Router,
    routing::{get, put},
};

/// Build and return the router for all field and record routes.
///
/// The router carries shared state (`ImageService`) to all handlers.
pub fn routes() -> Router<ImageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Record-level routes
        .route(
            "/{field}/{*key}",
            put(upload_record)
                .get(get_record)
                .head(head_record)
                .delete(delete_record),
        )
        // Field-level routes
        .route(
            "/{field}",
            get(get_field).put(create_field).delete(delete_field),
        )
}
