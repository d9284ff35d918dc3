//! Gold layer: deterministic aggregation of Silver into business metrics.
//!
//! Every run rewrites the Gold table as one `overwrite` version computed
//! from a fixed Silver version. When the rules have not changed since the
//! previous run, only groups touched by the Silver delta are recomputed and
//! spliced into the previous Gold rows; the result is identical to a full
//! recompute.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Datelike, Days, NaiveDate};
use medallion_state::StateBackend;
use medallion_types::record::{Record, Row};
use medallion_types::state::{CheckpointAdvance, CheckpointKey, Layer, RunStats, TableName};
use medallion_types::table::{CommitRequest, Operation, VersionId};
use medallion_types::value::{parse_timestamp, Value};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::types::GoldConfig;
use crate::errors::StageError;
use crate::result::{StageOutput, StageStatus};

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationRules {
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_grain: Option<TimeGrainRule>,
    pub measures: Vec<Measure>,
    /// Rows scoring below this are left out of every aggregate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_quality_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeGrainRule {
    pub column: String,
    pub grain: TimeGrain,
    /// Output column holding the bucket start.
    #[serde(default = "default_period_alias")]
    pub alias: String,
}

fn default_period_alias() -> String {
    "period".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGrain {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl TimeGrain {
    /// Start of the bucket containing `date`. Weeks start on Monday.
    #[must_use]
    pub fn bucket(self, date: NaiveDate) -> Option<NaiveDate> {
        match self {
            Self::Daily => Some(date),
            Self::Weekly => {
                date.checked_sub_days(Days::new(u64::from(date.weekday().num_days_from_monday())))
            }
            Self::Monthly => NaiveDate::from_ymd_opt(date.year(), date.month(), 1),
            Self::Quarterly => {
                let first_month = (date.month() - 1) / 3 * 3 + 1;
                NaiveDate::from_ymd_opt(date.year(), first_month, 1)
            }
            Self::Yearly => NaiveDate::from_ymd_opt(date.year(), 1, 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub name: String,
    pub function: MeasureFunction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    CountDistinct,
}

impl MeasureFunction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::CountDistinct => "count_distinct",
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

fn group_key(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| format!("{}:{}", v.type_name(), v.key_repr()))
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

fn content_key(values: &[Value]) -> Vec<String> {
    values.iter().map(Value::content_repr).collect()
}

fn bucket_value(value: Option<&Value>, grain: TimeGrain) -> Value {
    let timestamp = match value {
        Some(Value::Timestamp(ts)) => Some(*ts),
        Some(Value::Str(s)) => parse_timestamp(s.trim()),
        _ => None,
    };
    timestamp
        .and_then(|ts| grain.bucket(ts.date_naive()))
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map_or(Value::Null, |ndt| Value::Timestamp(ndt.and_utc()))
}

impl AggregationRules {
    fn group_values(&self, row: &Row) -> Vec<Value> {
        let mut values: Vec<Value> = self
            .group_by
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        if let Some(grain) = &self.time_grain {
            values.push(bucket_value(row.get(&grain.column), grain.grain));
        }
        values
    }

    /// Group values of an already aggregated Gold row.
    fn output_group_values(&self, row: &Row) -> Vec<Value> {
        let mut values: Vec<Value> = self
            .group_by
            .iter()
            .map(|c| row.record.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        if let Some(grain) = &self.time_grain {
            values.push(row.record.get(&grain.alias).cloned().unwrap_or(Value::Null));
        }
        values
    }

    fn includes(&self, row: &Row) -> bool {
        !row.is_quarantined() && self.min_quality_score.map_or(true, |min| row.score() >= min)
    }

    fn output_columns(&self) -> impl Iterator<Item = &str> {
        self.group_by
            .iter()
            .map(String::as_str)
            .chain(self.time_grain.iter().map(|g| g.alias.as_str()))
    }

    /// Fingerprint stored with each Gold commit; a change forces a full
    /// recompute.
    fn fingerprint(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn fold_measure(measure: &Measure, rows: &[&Row]) -> Value {
    let values: Vec<&Value> = match &measure.column {
        Some(column) => rows
            .iter()
            .filter_map(|r| r.get(column))
            .filter(|v| !v.is_null())
            .collect(),
        None => Vec::new(),
    };

    match measure.function {
        MeasureFunction::Count => {
            let n = if measure.column.is_some() {
                values.len()
            } else {
                rows.len()
            };
            Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
        }
        MeasureFunction::CountDistinct => {
            let distinct: BTreeSet<String> = values.iter().map(|v| v.key_repr()).collect();
            Value::Int(i64::try_from(distinct.len()).unwrap_or(i64::MAX))
        }
        MeasureFunction::Sum | MeasureFunction::Avg => {
            let mut count = 0u64;
            let mut float_sum = 0.0;
            let mut int_sum = Some(0i64);
            for value in &values {
                match value {
                    Value::Int(i) => {
                        int_sum = int_sum.and_then(|s| s.checked_add(*i));
                        if let Some(f) = value.as_f64() {
                            float_sum += f;
                        }
                        count += 1;
                    }
                    Value::Float(f) => {
                        int_sum = None;
                        float_sum += f;
                        count += 1;
                    }
                    _ => {}
                }
            }
            if count == 0 {
                return Value::Null;
            }
            if measure.function == MeasureFunction::Avg {
                #[allow(clippy::cast_precision_loss)]
                let avg = float_sum / count as f64;
                return Value::Float(avg);
            }
            int_sum.map_or(Value::Float(float_sum), Value::Int)
        }
        MeasureFunction::Min => values
            .iter()
            .min_by(|a, b| a.total_cmp(b))
            .map_or(Value::Null, |v| (*v).clone()),
        MeasureFunction::Max => values
            .iter()
            .max_by(|a, b| a.total_cmp(b))
            .map_or(Value::Null, |v| (*v).clone()),
    }
}

struct Group<'a> {
    key: String,
    values: Vec<Value>,
    rows: Vec<&'a Row>,
}

fn aggregate_group(rules: &AggregationRules, group: &mut Group<'_>) -> Row {
    // Fold order is fixed by content so float sums never depend on input order.
    group
        .rows
        .sort_by_cached_key(|r| (r.canonical(), r.score().to_bits()));

    let mut record = Record::new();
    for (column, value) in rules.output_columns().zip(&group.values) {
        record.insert(column, value.clone());
    }
    for measure in &rules.measures {
        record.insert(measure.name.clone(), fold_measure(measure, &group.rows));
    }
    Row::new(record)
}

fn collect_groups<'a>(
    rules: &AggregationRules,
    rows: &'a [Row],
    only: Option<&BTreeSet<String>>,
) -> Vec<Group<'a>> {
    let mut groups: BTreeMap<String, Group<'a>> = BTreeMap::new();
    for row in rows.iter().filter(|r| rules.includes(r)) {
        let values = rules.group_values(row);
        let key = group_key(&values);
        if only.is_some_and(|keys| !keys.contains(&key)) {
            continue;
        }
        let group = groups.entry(key.clone()).or_insert_with(|| Group {
            key,
            values: values.clone(),
            rows: Vec::new(),
        });
        // Keys match after trimming; the reported value must not depend on arrival order.
        if content_key(&values) < content_key(&group.values) {
            group.values = values;
        }
        group.rows.push(row);
    }
    groups.into_values().collect()
}

fn aggregate_groups(
    rules: &AggregationRules,
    mut groups: Vec<Group<'_>>,
    partitions: usize,
) -> Vec<(String, Row)> {
    if groups.is_empty() {
        return Vec::new();
    }
    let partitions = partitions.clamp(1, groups.len());
    let chunk_size = groups.len().div_ceil(partitions);

    if partitions == 1 {
        return groups
            .iter_mut()
            .map(|g| (g.key.clone(), aggregate_group(rules, g)))
            .collect();
    }

    std::thread::scope(|scope| {
        let handles: Vec<_> = groups
            .chunks_mut(chunk_size)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter_mut()
                        .map(|g| (g.key.clone(), aggregate_group(rules, g)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut out = Vec::new();
        for handle in handles {
            match handle.join() {
                Ok(part) => out.extend(part),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        out
    })
}

/// Full aggregation of `rows` under `rules`, split over `partitions`
/// threads. Output is sorted by group key and independent of `partitions`.
#[must_use]
pub fn aggregate(rows: &[Row], rules: &AggregationRules, partitions: usize) -> Vec<Row> {
    let groups = collect_groups(rules, rows, None);
    aggregate_groups(rules, groups, partitions)
        .into_iter()
        .map(|(_, row)| row)
        .collect()
}

fn multiset(rows: &[Row]) -> HashMap<String, (i64, &Row)> {
    let mut counts: HashMap<String, (i64, &Row)> = HashMap::new();
    for row in rows {
        let key = format!("{}|{}", row.canonical(), row.score().to_bits());
        counts.entry(key).or_insert((0, row)).0 += 1;
    }
    counts
}

/// Group keys touched by the difference between two Silver snapshots.
fn touched_groups(rules: &AggregationRules, before: &[Row], after: &[Row]) -> BTreeSet<String> {
    let old = multiset(before);
    let new = multiset(after);
    let mut touched = BTreeSet::new();
    for (key, (count, row)) in &old {
        if new.get(key).map_or(0, |(c, _)| *c) != *count {
            touched.insert(group_key(&rules.group_values(row)));
        }
    }
    for (key, (count, row)) in &new {
        if old.get(key).map_or(0, |(c, _)| *c) != *count {
            touched.insert(group_key(&rules.group_values(row)));
        }
    }
    touched
}

/// Incrementally update `previous_gold` (the aggregate of `before`) to the
/// aggregate of `after`.
#[must_use]
pub fn aggregate_incremental(
    previous_gold: &[Row],
    before: &[Row],
    after: &[Row],
    rules: &AggregationRules,
    partitions: usize,
) -> Vec<Row> {
    let touched = touched_groups(rules, before, after);
    let mut merged: BTreeMap<String, Row> = previous_gold
        .iter()
        .map(|row| (group_key(&rules.output_group_values(row)), row.clone()))
        .filter(|(key, _)| !touched.contains(key))
        .collect();

    let groups = collect_groups(rules, after, Some(&touched));
    merged.extend(aggregate_groups(rules, groups, partitions));
    merged.into_values().collect()
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// Runs one Gold pass for a dataset.
pub struct GoldProcessor<'a> {
    backend: &'a dyn StateBackend,
    silver_table: &'a TableName,
    config: &'a GoldConfig,
    partitions: usize,
}

impl<'a> GoldProcessor<'a> {
    #[must_use]
    pub fn new(
        backend: &'a dyn StateBackend,
        silver_table: &'a TableName,
        config: &'a GoldConfig,
        partitions: usize,
    ) -> Self {
        Self {
            backend,
            silver_table,
            config,
            partitions,
        }
    }

    /// Fold Silver up to `as_of` (head when `None`) into a new Gold version.
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] on storage failure, a lost commit race or
    /// cancellation before commit.
    pub fn run(
        &self,
        as_of: Option<VersionId>,
        cancel: &CancellationToken,
    ) -> Result<StageOutput, StageError> {
        let gold_table = &self.config.table;
        let rules = &self.config.rules;
        let key = CheckpointKey::new(gold_table.clone(), Layer::Gold);
        let watermark = self
            .backend
            .get_checkpoint(&key)?
            .map(|cp| cp.upstream_version);
        let gold_head = self.backend.head_version(gold_table)?;
        let silver_head = self.backend.head_version(self.silver_table)?;

        let target = match (silver_head, as_of) {
            (Some(head), Some(v)) => Some(head.min(v)),
            (head, _) => head,
        };
        let Some(target) = target.filter(|t| watermark.map_or(true, |w| *t > w)) else {
            tracing::debug!(table = %gold_table, ?watermark, "No new Silver version for Gold");
            return Ok(StageOutput::no_change(gold_head, watermark));
        };

        let after = self.backend.read_table(self.silver_table, Some(target))?;
        let fingerprint = rules.fingerprint();

        let previous = match (watermark, gold_head) {
            (Some(w), Some(head)) => {
                let last = self.backend.history(gold_table)?.into_iter().last();
                let reusable = last.is_some_and(|commit| {
                    commit.details.as_ref().is_some_and(|d| {
                        d.get("rules") == Some(&fingerprint)
                            && d.get("silver_version").and_then(serde_json::Value::as_u64)
                                == Some(w)
                    })
                });
                reusable.then_some((w, head))
            }
            _ => None,
        };

        let (rows, mode) = match previous {
            Some((w, head)) => {
                let before = self.backend.read_table(self.silver_table, Some(w))?;
                let previous_gold = self.backend.read_table(gold_table, Some(head))?;
                let rows = aggregate_incremental(
                    &previous_gold.rows,
                    &before.rows,
                    &after.rows,
                    rules,
                    self.partitions,
                );
                (rows, "incremental")
            }
            None => (aggregate(&after.rows, rules, self.partitions), "full"),
        };

        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let row_count = rows.len() as u64;
        let request = CommitRequest::new(Operation::Overwrite, gold_head, rows)
            .with_batch_ids(vec![format!("{}@{target}", self.silver_table)])
            .with_details(serde_json::json!({
                "rules": fingerprint,
                "silver_version": target,
                "mode": mode,
            }))
            .with_checkpoint(CheckpointAdvance {
                key,
                expected: watermark,
                new: target,
            });
        let commit = self
            .backend
            .commit(gold_table, request)
            .map_err(|e| StageError::from_commit(gold_table.as_str(), e))?;

        tracing::info!(
            table = %gold_table,
            version_id = commit.version_id,
            silver_version = target,
            groups = row_count,
            mode,
            "Gold aggregation committed"
        );

        Ok(StageOutput {
            status: StageStatus::Committed,
            version_id: Some(commit.version_id),
            upstream_version: Some(target),
            batch_ids: commit.input_batch_ids,
            stats: RunStats {
                records_read: after.rows.len() as u64,
                records_written: row_count,
                records_quarantined: 0,
                version_id: Some(commit.version_id),
                error_message: None,
            },
            quality_report: None,
            quarantined: Vec::new(),
        })
    }
}
