//! Silver layer: standardize, deduplicate and enrich new Bronze versions.
//!
//! Each run folds the Bronze versions after the Silver watermark, in commit
//! order, into one new Silver version. The version and the watermark move
//! in the same transaction. Rows refused by standardization are handed
//! back for the quarantine log.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use medallion_state::StateBackend;
use medallion_types::record::{Row, RowQuality};
use medallion_types::schema::ViolationKind;
use medallion_types::state::{CheckpointAdvance, CheckpointKey, Layer, RunStats, TableName};
use medallion_types::table::{CommitRequest, Operation, VersionId};
use medallion_types::value::Value;
use tokio_util::sync::CancellationToken;

use crate::config::types::{CaseRule, ColumnRule, EnrichmentRule, NullAction, SilverConfig};
use crate::derive::apply_derivations;
use crate::errors::StageError;
use crate::merge::{merge, MergeStats};
use crate::quality::QualityEngine;
use crate::quarantine::quarantine_record;
use crate::result::{StageOutput, StageStatus};
use crate::schema_registry::{CompiledSchema, SchemaRegistry};

/// Why a Bronze row did not make it into the merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// A `drop` null policy fired.
    Dropped,
    /// Null in a required column or an untypeable value, with the
    /// offending violations.
    Invalid(Vec<String>),
}

/// Per-column standardization rules with mappings pre-normalized.
struct ColumnPlan<'a> {
    rule: &'a ColumnRule,
    mappings: HashMap<String, Value>,
}

/// Pure per-row standardization: trimming, mappings, case, null policy and
/// typing against the Silver schema.
pub struct Standardizer<'a> {
    columns: Vec<(&'a str, ColumnPlan<'a>)>,
    schema: Option<&'a CompiledSchema>,
    quality: &'a QualityEngine,
}

impl<'a> Standardizer<'a> {
    #[must_use]
    pub fn new(
        config: &'a SilverConfig,
        schema: Option<&'a CompiledSchema>,
        quality: &'a QualityEngine,
    ) -> Self {
        let columns = config
            .columns
            .iter()
            .map(|(name, rule)| {
                let mappings = rule
                    .mappings
                    .iter()
                    .map(|(from, to)| (from.trim().to_lowercase(), Value::from_json_loose(to)))
                    .collect();
                (name.as_str(), ColumnPlan { rule, mappings })
            })
            .collect();
        Self {
            columns,
            schema,
            quality,
        }
    }

    /// Standardize one Bronze row.
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] when the row must not reach Silver.
    pub fn apply(&self, row: &Row) -> Result<Row, Rejection> {
        let mut record = row.record.clone();
        for value in record.values.values_mut().chain(record.extra.values_mut()) {
            if let Value::Str(s) = value {
                let trimmed = s.trim();
                if trimmed.len() != s.len() {
                    let owned = trimmed.to_string();
                    *s = owned;
                }
            }
        }

        for (column, plan) in &self.columns {
            let mut value = record.get(column).cloned().unwrap_or(Value::Null);
            if let Value::Str(s) = &value {
                if let Some(mapped) = plan.mappings.get(&s.to_lowercase()) {
                    value = mapped.clone();
                }
            }
            if let (Value::Str(s), Some(case)) = (&value, plan.rule.case) {
                value = Value::Str(match case {
                    CaseRule::Lower => s.to_lowercase(),
                    CaseRule::Upper => s.to_uppercase(),
                });
            }
            if value.is_null() {
                match plan.rule.null_policy.action {
                    NullAction::Drop => return Err(Rejection::Dropped),
                    NullAction::Default => {
                        if let Some(default) = &plan.rule.null_policy.default {
                            value = Value::from_json_loose(default);
                        }
                    }
                    NullAction::CarryNull => {}
                }
            }
            if record.extra.contains_key(*column) && !record.values.contains_key(*column) {
                record.extra.insert((*column).to_string(), value);
            } else {
                record.insert(*column, value);
            }
        }

        let (record, quality) = match self.schema {
            Some(schema) => {
                let validation = schema.validate_record(&record);
                let blocking: Vec<String> = validation
                    .violations
                    .iter()
                    .filter(|v| matches!(v.kind, ViolationKind::Type | ViolationKind::Null))
                    .map(ToString::to_string)
                    .collect();
                if !blocking.is_empty() {
                    return Err(Rejection::Invalid(blocking));
                }
                let quality = self.quality.score_violations(&validation.violations);
                (validation.record, quality)
            }
            None => (record, row.quality.clone().unwrap_or_else(RowQuality::clean)),
        };

        let mut out = Row::new(record).with_quality(quality);
        out.lineage.clone_from(&row.lineage);
        Ok(out)
    }
}

/// Reference table indexed by the lookup key.
struct Lookup<'a> {
    rule: &'a EnrichmentRule,
    index: HashMap<String, Row>,
}

impl Lookup<'_> {
    fn enrich(&self, row: &mut Row, quality: &QualityEngine) {
        let hit = row
            .get(&self.rule.on)
            .filter(|v| !v.is_null())
            .and_then(|v| self.index.get(&v.key_repr()));
        match hit {
            Some(reference) => {
                for column in &self.rule.columns {
                    let value = reference.record.get(column).cloned().unwrap_or(Value::Null);
                    row.enrichment.insert(column.clone(), value);
                }
            }
            None => {
                let q = row.quality.get_or_insert_with(RowQuality::clean);
                quality.flag_lookup_missing(q);
            }
        }
    }
}

pub struct SilverProcessor<'a> {
    backend: &'a dyn StateBackend,
    registry: &'a SchemaRegistry,
    quality: &'a QualityEngine,
    bronze_table: &'a TableName,
    config: &'a SilverConfig,
}

impl<'a> SilverProcessor<'a> {
    #[must_use]
    pub fn new(
        backend: &'a dyn StateBackend,
        registry: &'a SchemaRegistry,
        quality: &'a QualityEngine,
        bronze_table: &'a TableName,
        config: &'a SilverConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            quality,
            bronze_table,
            config,
        }
    }

    fn load_lookups(&self) -> Result<Vec<Lookup<'a>>, StageError> {
        self.config
            .enrichment
            .iter()
            .map(|rule| {
                let snapshot = self.backend.read_table(&rule.reference, None)?;
                if snapshot.version.is_none() {
                    tracing::warn!(
                        reference = %rule.reference,
                        "Reference table is empty, every lookup will miss"
                    );
                }
                let index = snapshot
                    .rows
                    .into_iter()
                    .filter_map(|r| {
                        let key = r
                            .record
                            .get(&rule.reference_key)
                            .filter(|v| !v.is_null())?
                            .key_repr();
                        Some((key, r))
                    })
                    .collect();
                Ok(Lookup { rule, index })
            })
            .collect()
    }

    /// Fold Bronze versions after the watermark, up to `as_of` (head when
    /// `None`), into Silver.
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] on schema or storage failure, a lost commit
    /// race or cancellation before commit.
    pub fn run(
        &self,
        as_of: Option<VersionId>,
        cancel: &CancellationToken,
    ) -> Result<StageOutput, StageError> {
        let silver_table = &self.config.table;
        let key = CheckpointKey::new(silver_table.clone(), Layer::Silver);
        let watermark = self
            .backend
            .get_checkpoint(&key)?
            .map(|cp| cp.upstream_version);
        let silver_head = self.backend.head_version(silver_table)?;
        let bronze_head = self.backend.head_version(self.bronze_table)?;

        let target = match (bronze_head, as_of) {
            (Some(head), Some(v)) => Some(head.min(v)),
            (head, _) => head,
        };
        let Some(target) = target.filter(|t| watermark.map_or(true, |w| *t > w)) else {
            tracing::debug!(table = %silver_table, ?watermark, "No new Bronze version for Silver");
            return Ok(StageOutput::no_change(silver_head, watermark));
        };

        let schema = match self.registry.resolve_optional(silver_table)? {
            Some(schema) => Some(schema),
            None => self.registry.resolve_optional(self.bronze_table)?,
        };
        let standardizer = Standardizer::new(self.config, schema.as_deref(), self.quality);
        let lookups = self.load_lookups()?;

        let changes = self
            .backend
            .read_changes(self.bronze_table, watermark, Some(target))?;

        let quarantined_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut batch_ids = Vec::new();
        let mut incoming = Vec::new();
        let mut quarantined = Vec::new();
        let mut read = 0u64;
        let mut skipped_quarantined = 0u64;
        let mut dropped = 0u64;
        let mut rejected = 0u64;
        for change in &changes {
            batch_ids.extend(change.commit.input_batch_ids.iter().cloned());
            for row in &change.rows {
                read += 1;
                if row.is_quarantined() {
                    skipped_quarantined += 1;
                    continue;
                }
                match standardizer.apply(row) {
                    Ok(mut standardized) => {
                        for lookup in &lookups {
                            lookup.enrich(&mut standardized, self.quality);
                        }
                        apply_derivations(&self.config.derive, &mut standardized);
                        incoming.push(standardized);
                    }
                    Err(Rejection::Dropped) => dropped += 1,
                    Err(Rejection::Invalid(reasons)) => {
                        rejected += 1;
                        let batch_id = row.lineage.as_ref().map_or("", |l| l.batch_id.as_str());
                        quarantined.push(quarantine_record(
                            silver_table,
                            batch_id,
                            row,
                            &reasons,
                            &quarantined_at,
                        ));
                    }
                }
            }
        }

        let existing = self.backend.read_table(silver_table, silver_head)?;
        let result = merge(
            &existing.rows,
            &incoming,
            &self.config.key_columns,
            self.config.strategy,
        )?;
        let report = self
            .quality
            .batch_report(&incoming, &self.config.key_columns);
        let stats = RunStats {
            records_read: read,
            records_written: result.stats.inserted + result.stats.updated,
            records_quarantined: rejected,
            version_id: silver_head,
            error_message: None,
        };
        let details = merge_details(
            &result.stats,
            watermark,
            target,
            skipped_quarantined,
            dropped,
            rejected,
        );

        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        if !result.has_changes() {
            self.backend
                .advance_checkpoint(&key, watermark, target)
                .map_err(|e| StageError::from_commit(silver_table.as_str(), e))?;
            tracing::info!(
                table = %silver_table,
                bronze_version = target,
                unchanged = result.stats.unchanged,
                "Silver unchanged, watermark advanced"
            );
            return Ok(StageOutput {
                status: StageStatus::NoChange,
                version_id: silver_head,
                upstream_version: Some(target),
                batch_ids,
                stats,
                quality_report: Some(report),
                quarantined,
            });
        }

        let request = CommitRequest::new(Operation::Merge, silver_head, result.rows)
            .with_batch_ids(batch_ids)
            .with_quality_report(report.clone())
            .with_details(details)
            .with_checkpoint(CheckpointAdvance {
                key,
                expected: watermark,
                new: target,
            });
        let commit = self
            .backend
            .commit(silver_table, request)
            .map_err(|e| StageError::from_commit(silver_table.as_str(), e))?;

        tracing::info!(
            table = %silver_table,
            version_id = commit.version_id,
            bronze_version = target,
            inserted = result.stats.inserted,
            updated = result.stats.updated,
            unchanged = result.stats.unchanged,
            conflicts = result.stats.conflicts,
            dropped,
            rejected,
            "Silver merge committed"
        );

        Ok(StageOutput {
            status: StageStatus::Committed,
            version_id: Some(commit.version_id),
            upstream_version: Some(target),
            batch_ids: commit.input_batch_ids,
            stats: RunStats {
                version_id: Some(commit.version_id),
                ..stats
            },
            quality_report: Some(report),
            quarantined,
        })
    }
}

fn merge_details(
    stats: &MergeStats,
    watermark: Option<VersionId>,
    target: VersionId,
    skipped_quarantined: u64,
    dropped: u64,
    rejected: u64,
) -> serde_json::Value {
    serde_json::json!({
        "bronze_after": watermark,
        "bronze_upto": target,
        "merge": stats,
        "skipped_quarantined": skipped_quarantined,
        "dropped": dropped,
        "rejected": rejected,
    })
}
