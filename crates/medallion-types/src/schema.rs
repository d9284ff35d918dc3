//! Versioned table schemas.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::QualityFlag;
use crate::state::TableName;
use crate::value::{ColumnType, Value};

fn default_nullable() -> bool {
    true
}

/// Declared shape of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnSpec {
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Enumerated domain; compared by canonical representation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<serde_json::Value>>,
    /// Regex a string value must match in full.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl ColumnSpec {
    #[must_use]
    pub fn new(column_type: ColumnType) -> Self {
        Self {
            column_type,
            nullable: true,
            min: None,
            max: None,
            allowed: None,
            pattern: None,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    #[must_use]
    pub fn with_allowed(mut self, allowed: Vec<serde_json::Value>) -> Self {
        self.allowed = Some(allowed);
        self
    }

    #[must_use]
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Canonical forms of the allowed values, if the column is enumerated.
    #[must_use]
    pub fn allowed_keys(&self) -> Option<Vec<String>> {
        self.allowed.as_ref().map(|values| {
            values
                .iter()
                .map(|v| Value::from_json_loose(v).key_repr())
                .collect()
        })
    }
}

/// Versioned column set for a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub table: TableName,
    pub version: u32,
    pub columns: BTreeMap<String, ColumnSpec>,
}

impl SchemaDefinition {
    #[must_use]
    pub fn new(table: impl Into<TableName>, version: u32) -> Self {
        Self {
            table: table.into(),
            version,
            columns: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_column(mut self, name: impl Into<String>, spec: ColumnSpec) -> Self {
        self.columns.insert(name.into(), spec);
        self
    }

    #[must_use]
    pub fn id(&self) -> SchemaId {
        SchemaId {
            table: self.table.clone(),
            version: self.version,
        }
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.get(name)
    }

    pub fn required_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|(_, spec)| !spec.nullable)
            .map(|(name, _)| name.as_str())
    }
}

/// Stable identity of a registered schema version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaId {
    pub table: TableName,
    pub version: u32,
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.table, self.version)
    }
}

/// Kind of a field-level validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Null,
    Range,
    Type,
    Domain,
}

impl ViolationKind {
    #[must_use]
    pub fn flag(self) -> QualityFlag {
        match self {
            Self::Null => QualityFlag::NullViolation,
            Self::Range => QualityFlag::RangeViolation,
            Self::Type => QualityFlag::TypeViolation,
            Self::Domain => QualityFlag::DomainViolation,
        }
    }
}

/// One field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub column: String,
    pub kind: ViolationKind,
    pub message: String,
}

impl Violation {
    #[must_use]
    pub fn new(column: impl Into<String>, kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.column, self.message)
    }
}
