//! Image field definitions and their serialized configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Declarative options for an image field.
///
/// This is the configuration a field is created with and the shape it
/// round-trips through for schema history: keys are only emitted when they
/// differ from the defaults, and absent keys deserialize back to the
/// defaults, so stored configurations stay stable across versions.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldConfig {
    /// Generate thumbnails on save and clean them up on delete.
    #[serde(default, skip_serializing_if = "is_false")]
    pub thumbnails: bool,

    /// Thumbnail widths in pixels, generated in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thumbnail_sizes: Vec<u32>,

    /// Name of the record attribute holding a static asset path used when
    /// the record has no uploaded file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_field: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !value
}

impl FieldConfig {
    /// Check the invariants a definition must hold before it is stored.
    pub fn validate(&self) -> Result<(), String> {
        if self.thumbnail_sizes.iter().any(|&size| size == 0) {
            return Err("thumbnail sizes must be positive".into());
        }
        if !self.thumbnails && !self.thumbnail_sizes.is_empty() {
            return Err("thumbnail sizes given but thumbnails are disabled".into());
        }
        if let Some(fallback) = &self.fallback_field {
            if fallback.is_empty() {
                return Err("fallback field name cannot be empty".into());
            }
        }
        Ok(())
    }
}

/// A named image field definition.
#[derive(Serialize, Clone, Debug)]
pub struct FieldDef {
    pub id: Uuid,
    pub name: String,
    pub config: FieldConfig,
    pub created_at: DateTime<Utc>,
}

/// Raw `fields` row; `config` is the serialized [`FieldConfig`].
#[derive(FromRow, Debug)]
pub struct FieldRow {
    pub id: Uuid,
    pub name: String,
    pub config: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<FieldRow> for FieldDef {
    type Error = serde_json::Error;

    fn try_from(row: FieldRow) -> Result<Self, Self::Error> {
        Ok(FieldDef {
            id: row.id,
            name: row.name,
            config: serde_json::from_str(&row.config)?,
            created_at: row.created_at,
        })
    }
}
