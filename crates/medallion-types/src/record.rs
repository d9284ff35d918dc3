//! Records and stored rows.
//!
//! A [`Record`] is the schema-typed payload; a [`Row`] is what a table
//! version stores: the record plus lineage, quality and enrichment data.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A raw, untyped record exactly as it arrived in a batch.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Schema-typed record.
///
/// Fields the schema does not declare are kept in `extra` instead of being
/// dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub values: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a column, falling back to the extra bucket.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column).or_else(|| self.extra.get(column))
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.values.insert(column.into(), value);
    }

    /// Canonical, lossless rendering of the whole record.
    ///
    /// Two records with the same canonical content are interchangeable for
    /// merge and aggregation purposes. Column order does not matter.
    #[must_use]
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for (bucket, map) in [("v", &self.values), ("x", &self.extra)] {
            for (column, value) in map {
                out.push_str(bucket);
                out.push(':');
                out.push_str(column);
                out.push('=');
                out.push_str(value.type_name());
                out.push(':');
                out.push_str(&value.content_repr());
                out.push('\u{1f}');
            }
        }
        out
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            extra: BTreeMap::new(),
        }
    }
}

/// Per-record quality flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityFlag {
    NullViolation,
    RangeViolation,
    TypeViolation,
    DomainViolation,
    LookupMissing,
}

impl QualityFlag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NullViolation => "NULL_VIOLATION",
            Self::RangeViolation => "RANGE_VIOLATION",
            Self::TypeViolation => "TYPE_VIOLATION",
            Self::DomainViolation => "DOMAIN_VIOLATION",
            Self::LookupMissing => "LOOKUP_MISSING",
        }
    }
}

impl fmt::Display for QualityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality outcome attached to a row once processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowQuality {
    pub score: f64,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub flags: BTreeSet<QualityFlag>,
    #[serde(default)]
    pub quarantined: bool,
}

impl RowQuality {
    #[must_use]
    pub fn clean() -> Self {
        Self {
            score: 1.0,
            flags: BTreeSet::new(),
            quarantined: false,
        }
    }
}

/// Where a row came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    pub batch_id: String,
    pub source_id: String,
    pub ingestion_timestamp: DateTime<Utc>,
}

/// A stored row: typed record plus processing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub record: Record,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage: Option<Lineage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<RowQuality>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub enrichment: BTreeMap<String, Value>,
    /// Original payload, kept for quarantined rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawRecord>,
}

impl Row {
    #[must_use]
    pub fn new(record: Record) -> Self {
        Self {
            record,
            lineage: None,
            quality: None,
            enrichment: BTreeMap::new(),
            raw: None,
        }
    }

    #[must_use]
    pub fn with_lineage(mut self, lineage: Lineage) -> Self {
        self.lineage = Some(lineage);
        self
    }

    #[must_use]
    pub fn with_quality(mut self, quality: RowQuality) -> Self {
        self.quality = Some(quality);
        self
    }

    #[must_use]
    pub fn is_quarantined(&self) -> bool {
        self.quality.as_ref().is_some_and(|q| q.quarantined)
    }

    /// Quality score, treating unscored rows as clean.
    #[must_use]
    pub fn score(&self) -> f64 {
        self.quality.as_ref().map_or(1.0, |q| q.score)
    }

    #[must_use]
    pub fn ingestion_timestamp(&self) -> Option<DateTime<Utc>> {
        self.lineage.as_ref().map(|l| l.ingestion_timestamp)
    }

    /// Look up a column in the record, then in the enrichment map.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.record.get(column).or_else(|| self.enrichment.get(column))
    }

    /// Canonical rendering of everything that makes two rows differ.
    #[must_use]
    pub fn canonical(&self) -> String {
        let mut out = self.record.canonical();
        for (column, value) in &self.enrichment {
            out.push_str("e:");
            out.push_str(column);
            out.push('=');
            out.push_str(value.type_name());
            out.push(':');
            out.push_str(&value.content_repr());
            out.push('\u{1f}');
        }
        out
    }
}
