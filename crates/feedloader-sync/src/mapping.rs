//! Schema mapping configuration: which snapshot columns feed the fingerprint.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("reading schema config {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },
    #[error("schema config is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("schema config has no \"mapping\" list")]
    NotAList,
    #[error("unable to map any columns from the schema config")]
    Empty,
    #[error("column name {0:?} is not a plain identifier")]
    InvalidIdentifier(String),
}

/// One descriptor as written in `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    #[serde(rename = "csvHeader", default)]
    pub source_column: Option<String>,
    #[serde(rename = "bqColumn", default)]
    pub destination_column: Option<String>,
    #[serde(rename = "columnType", default)]
    pub column_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedColumn {
    pub source_column: String,
    pub destination_column: String,
    pub column_type: String,
}

/// Ordered, validated list of mapped columns. Order determines fingerprint input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaMapping {
    columns: Vec<MappedColumn>,
}

impl SchemaMapping {
    pub fn parse(text: &str) -> Result<Self, MappingError> {
        let root: Value = serde_json::from_str(text)?;
        let entries = match root.get("mapping") {
            Some(Value::Array(entries)) => entries,
            _ => return Err(MappingError::NotAList),
        };

        // Entries without a destination column are dropped silently.
        let columns = entries
            .iter()
            .filter_map(|entry| serde_json::from_value::<ColumnDescriptor>(entry.clone()).ok())
            .filter_map(|descriptor| {
                let destination_column = descriptor
                    .destination_column
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())?;
                Some(MappedColumn {
                    source_column: descriptor
                        .source_column
                        .unwrap_or_else(|| destination_column.clone()),
                    column_type: descriptor.column_type.unwrap_or_else(|| "STRING".to_string()),
                    destination_column,
                })
            })
            .collect::<Vec<_>>();

        Self::from_columns(columns)
    }

    pub fn from_columns(columns: Vec<MappedColumn>) -> Result<Self, MappingError> {
        if columns.is_empty() {
            return Err(MappingError::Empty);
        }
        if let Some(bad) = columns
            .iter()
            .find(|c| !is_identifier(&c.destination_column))
        {
            return Err(MappingError::InvalidIdentifier(bad.destination_column.clone()));
        }
        Ok(Self { columns })
    }

    pub async fn load(path: &Path) -> Result<Self, MappingError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| MappingError::Unreadable {
                path: path.display().to_string(),
                source,
            })?;
        Self::parse(&text)
    }

    pub fn columns(&self) -> &[MappedColumn] {
        &self.columns
    }

    pub fn destination_columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.destination_column.as_str())
    }

    pub fn declares(&self, column: &str) -> bool {
        self.destination_columns().any(|c| c == column)
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, so names can be spliced into SQL safely.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
