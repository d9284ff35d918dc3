//! Batch-level quality reports.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::QualityFlag;
use crate::state::TableName;

/// Coarse quality grade derived from [`QualityDimensions::overall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityLevel {
    #[default]
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityLevel {
    pub const ALL: [Self; 4] = [Self::Excellent, Self::Good, Self::Fair, Self::Poor];

    /// Grade an overall score in `[0, 1]`.
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= 0.95 {
            Self::Excellent
        } else if score >= 0.85 {
            Self::Good
        } else if score >= 0.70 {
            Self::Fair
        } else {
            Self::Poor
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "EXCELLENT",
            Self::Good => "GOOD",
            Self::Fair => "FAIR",
            Self::Poor => "POOR",
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Batch quality broken down by dimension. Every ratio is in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityDimensions {
    /// Non-null share of the batch's cells.
    pub completeness: f64,
    /// Records whose values match their declared formats and domains.
    pub accuracy: f64,
    /// Records whose values all coerce to their declared types.
    pub consistency: f64,
    /// Records within declared ranges and with every required value.
    pub validity: f64,
    /// Records whose business key is not repeated earlier in the batch.
    pub uniqueness: f64,
    /// Mean of the five dimensions.
    pub overall: f64,
}

impl QualityDimensions {
    #[must_use]
    pub fn new(
        completeness: f64,
        accuracy: f64,
        consistency: f64,
        validity: f64,
        uniqueness: f64,
    ) -> Self {
        let overall = (completeness + accuracy + consistency + validity + uniqueness) / 5.0;
        Self {
            completeness,
            accuracy,
            consistency,
            validity,
            uniqueness,
            overall,
        }
    }

    #[must_use]
    pub fn level(&self) -> QualityLevel {
        QualityLevel::from_score(self.overall)
    }
}

impl Default for QualityDimensions {
    fn default() -> Self {
        Self::new(1.0, 1.0, 1.0, 1.0, 1.0)
    }
}

/// Aggregated quality outcome for one batch.
///
/// Computed once at processing time and stored with the commit; never
/// recomputed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub record_count: u64,
    pub quarantined_count: u64,
    /// Records carrying each flag (a record counts once per flag).
    pub flag_counts: BTreeMap<QualityFlag, u64>,
    pub aggregate_score: f64,
    pub threshold: f64,
    pub below_threshold: bool,
    #[serde(default)]
    pub dimensions: QualityDimensions,
    #[serde(default)]
    pub level: QualityLevel,
}

impl QualityReport {
    /// Report for a batch with no records.
    #[must_use]
    pub fn empty(threshold: f64) -> Self {
        Self {
            record_count: 0,
            quarantined_count: 0,
            flag_counts: BTreeMap::new(),
            aggregate_score: 1.0,
            threshold,
            below_threshold: 1.0 < threshold,
            dimensions: QualityDimensions::default(),
            level: QualityLevel::Excellent,
        }
    }

    #[must_use]
    pub fn flagged(&self, flag: QualityFlag) -> u64 {
        self.flag_counts.get(&flag).copied().unwrap_or(0)
    }
}

/// Summary of the latest stored report of several tables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityOverview {
    pub tables: BTreeMap<TableName, QualityReport>,
    /// Mean overall dimension score, `None` when no table has a report.
    pub overall: Option<f64>,
    /// Number of tables at each level. Every level is present.
    pub distribution: BTreeMap<QualityLevel, u64>,
}

impl QualityOverview {
    #[must_use]
    pub fn from_reports(reports: impl IntoIterator<Item = (TableName, QualityReport)>) -> Self {
        let tables: BTreeMap<TableName, QualityReport> = reports.into_iter().collect();
        let mut distribution: BTreeMap<QualityLevel, u64> =
            QualityLevel::ALL.iter().map(|level| (*level, 0)).collect();
        for report in tables.values() {
            *distribution.entry(report.level).or_default() += 1;
        }
        #[allow(clippy::cast_precision_loss)]
        let overall = (!tables.is_empty()).then(|| {
            tables.values().map(|r| r.dimensions.overall).sum::<f64>() / tables.len() as f64
        });
        Self {
            tables,
            overall,
            distribution,
        }
    }

    #[must_use]
    pub fn level(&self) -> Option<QualityLevel> {
        self.overall.map(QualityLevel::from_score)
    }
}
