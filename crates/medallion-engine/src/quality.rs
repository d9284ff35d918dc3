//! Per-record quality scoring and per-batch quality reports.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use medallion_types::quality::{QualityDimensions, QualityReport};
use medallion_types::record::{QualityFlag, RawRecord, Row, RowQuality};
use medallion_types::schema::{Violation, ViolationKind};

use crate::config::types::{Penalties, QualityConfig};
use crate::merge::row_key;
use crate::schema_registry::{CompiledSchema, ValidationResult};

/// Deterministic scorer configured with fixed penalties.
#[derive(Debug, Clone)]
pub struct QualityEngine {
    penalties: Penalties,
    threshold: f64,
}

impl QualityEngine {
    #[must_use]
    pub fn new(config: &QualityConfig) -> Self {
        Self {
            penalties: config.penalties.clone(),
            threshold: config.min_batch_score,
        }
    }

    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Validate and score a raw record in one step.
    #[must_use]
    pub fn score(&self, record: &RawRecord, schema: &CompiledSchema) -> (ValidationResult, RowQuality) {
        let validation = schema.validate_raw(record);
        let quality = self.score_violations(&validation.violations);
        (validation, quality)
    }

    /// Score a set of field violations.
    ///
    /// A type violation forces the score to 0; type and null violations
    /// quarantine the record.
    #[must_use]
    pub fn score_violations(&self, violations: &[Violation]) -> RowQuality {
        let mut flags = BTreeSet::new();
        let mut penalty = 0.0;
        let mut type_failure = false;
        let mut quarantined = false;

        for violation in violations {
            flags.insert(violation.kind.flag());
            match violation.kind {
                ViolationKind::Type => {
                    type_failure = true;
                    quarantined = true;
                }
                ViolationKind::Null => {
                    penalty += self.penalties.null;
                    quarantined = true;
                }
                ViolationKind::Range => penalty += self.penalties.range,
                ViolationKind::Domain => penalty += self.penalties.domain,
            }
        }

        let score = if type_failure {
            0.0
        } else {
            (1.0 - penalty).max(0.0)
        };
        RowQuality {
            score,
            flags,
            quarantined,
        }
    }

    /// Record a failed reference lookup. Never quarantines.
    pub fn flag_lookup_missing(&self, quality: &mut RowQuality) {
        if quality.flags.insert(QualityFlag::LookupMissing) {
            quality.score = (quality.score - self.penalties.lookup_missing).max(0.0);
        }
    }

    /// Aggregate record outcomes into a batch report.
    ///
    /// The aggregate is the mean record score (1.0 for an empty batch).
    /// `below_threshold` is informational only. Dimensions that need the
    /// records themselves (completeness, uniqueness) are left at 1.0; see
    /// [`QualityEngine::batch_report`].
    pub fn report<'a>(&self, outcomes: impl IntoIterator<Item = &'a RowQuality>) -> QualityReport {
        let mut record_count = 0u64;
        let mut quarantined_count = 0u64;
        let mut flag_counts: BTreeMap<QualityFlag, u64> = BTreeMap::new();
        let mut total = 0.0;
        let mut inaccurate = 0u64;
        let mut inconsistent = 0u64;
        let mut invalid = 0u64;

        for quality in outcomes {
            record_count += 1;
            total += quality.score;
            if quality.quarantined {
                quarantined_count += 1;
            }
            for flag in &quality.flags {
                *flag_counts.entry(*flag).or_default() += 1;
            }
            let has = |flag: QualityFlag| quality.flags.contains(&flag);
            if has(QualityFlag::DomainViolation) {
                inaccurate += 1;
            }
            if has(QualityFlag::TypeViolation) {
                inconsistent += 1;
            }
            if has(QualityFlag::RangeViolation) || has(QualityFlag::NullViolation) {
                invalid += 1;
            }
        }

        if record_count == 0 {
            return QualityReport::empty(self.threshold);
        }

        #[allow(clippy::cast_precision_loss)]
        let aggregate_score = total / record_count as f64;
        let dimensions = QualityDimensions::new(
            1.0,
            clean_share(inaccurate, record_count),
            clean_share(inconsistent, record_count),
            clean_share(invalid, record_count),
            1.0,
        );
        QualityReport {
            record_count,
            quarantined_count,
            flag_counts,
            aggregate_score,
            threshold: self.threshold,
            below_threshold: aggregate_score < self.threshold,
            dimensions,
            level: dimensions.level(),
        }
    }

    /// Report over whole rows, adding cell completeness and key uniqueness
    /// to the flag-based dimensions.
    ///
    /// Rows without a quality outcome count as clean. With no key columns
    /// every row is unique.
    #[must_use]
    pub fn batch_report(&self, rows: &[Row], key_columns: &[String]) -> QualityReport {
        let clean = RowQuality::clean();
        let mut report = self.report(rows.iter().map(|r| r.quality.as_ref().unwrap_or(&clean)));
        if rows.is_empty() {
            return report;
        }
        let d = report.dimensions;
        report.dimensions = QualityDimensions::new(
            completeness(rows),
            d.accuracy,
            d.consistency,
            d.validity,
            uniqueness(rows, key_columns),
        );
        report.level = report.dimensions.level();
        report
    }
}

#[allow(clippy::cast_precision_loss)]
fn clean_share(failing: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    1.0 - failing as f64 / total as f64
}

/// Non-null share over every column seen anywhere in the batch. A column
/// absent from a row counts as null there.
fn completeness(rows: &[Row]) -> f64 {
    let columns: BTreeSet<&str> = rows
        .iter()
        .flat_map(|r| r.record.values.keys().chain(r.record.extra.keys()))
        .map(String::as_str)
        .collect();
    let cells = (rows.len() * columns.len()) as u64;
    let missing = rows
        .iter()
        .flat_map(|row| columns.iter().map(move |c| row.record.get(c)))
        .filter(|v| v.map_or(true, |v| v.is_null()))
        .count() as u64;
    clean_share(missing, cells)
}

/// Share of rows whose business key did not already occur earlier in the
/// batch. Rows with a null key part are not duplicates of anything.
fn uniqueness(rows: &[Row], key_columns: &[String]) -> f64 {
    if key_columns.is_empty() {
        return 1.0;
    }
    let mut seen = HashSet::new();
    let repeats = rows
        .iter()
        .filter_map(|row| row_key(row, key_columns))
        .filter(|key| !seen.insert(key.clone()))
        .count() as u64;
    clean_share(repeats, rows.len() as u64)
}
