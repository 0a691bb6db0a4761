//! Core data models: image field definitions, owning records, and the
//! resolved "image with optional fallback" value type.
//!
//! Rows map to SQLite tables via `sqlx::FromRow` and serialize as JSON via
//! `serde`.

pub mod field;
pub mod record;
pub mod resolved;
