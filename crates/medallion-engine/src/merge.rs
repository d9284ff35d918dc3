//! Key-based deduplication and upsert merge.
//!
//! The merge keeps, per business key, the highest-ranked row seen so far.
//! Rank is a total order (strategy rank, then canonical content, then batch
//! id), so the result is the maximum over `existing ∪ incoming` regardless
//! of the order rows arrive in. Re-applying a batch therefore changes
//! nothing.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use medallion_types::record::Row;
use serde::{Deserialize, Serialize};

use crate::errors::MergeError;

/// How two rows with the same key are ranked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Latest `ingestion_timestamp` wins.
    #[default]
    LastWriteWins,
    /// Highest quality score wins, tie-broken by timestamp.
    HighestQualityWins,
}

impl MergeStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LastWriteWins => "last_write_wins",
            Self::HighestQualityWins => "highest_quality_wins",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    /// Same strategy rank but different content; resolved by tie-break.
    pub conflicts: u64,
    /// Incoming rows with a null or missing key column; not merged.
    pub missing_key: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    /// Merged table state ordered by key; existing keyless rows last.
    pub rows: Vec<Row>,
    pub stats: MergeStats,
    /// Keys whose stored row changed in any way, metadata included.
    pub changed_keys: BTreeSet<String>,
}

impl MergeResult {
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.changed_keys.is_empty()
    }
}

/// Canonical business key of a row, `None` if any key column is null or
/// missing.
#[must_use]
pub fn row_key(row: &Row, key_columns: &[String]) -> Option<String> {
    let mut parts = Vec::with_capacity(key_columns.len());
    for column in key_columns {
        match row.record.get(column) {
            Some(value) if !value.is_null() => parts.push(value.key_repr()),
            _ => return None,
        }
    }
    Some(parts.join("\u{1f}"))
}

struct Ranked {
    row: Row,
    canonical: String,
}

impl Ranked {
    fn new(row: Row) -> Self {
        let canonical = row.canonical();
        Self { row, canonical }
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.row.ingestion_timestamp()
    }

    fn batch_id(&self) -> &str {
        self.row.lineage.as_ref().map_or("", |l| l.batch_id.as_str())
    }

    fn primary_cmp(&self, other: &Self, strategy: MergeStrategy) -> Ordering {
        match strategy {
            MergeStrategy::LastWriteWins => self.timestamp().cmp(&other.timestamp()),
            MergeStrategy::HighestQualityWins => self
                .row
                .score()
                .total_cmp(&other.row.score())
                .then_with(|| self.timestamp().cmp(&other.timestamp())),
        }
    }

    fn rank_cmp(&self, other: &Self, strategy: MergeStrategy) -> Ordering {
        self.primary_cmp(other, strategy)
            .then_with(|| self.canonical.cmp(&other.canonical))
            .then_with(|| self.batch_id().cmp(other.batch_id()))
            .then_with(|| self.row.score().total_cmp(&other.row.score()))
    }
}

fn check_keys(key_columns: &[String]) -> Result<(), MergeError> {
    if key_columns.is_empty() {
        return Err(MergeError::NoKeyColumns);
    }
    let mut seen = HashSet::new();
    for column in key_columns {
        if !seen.insert(column.as_str()) {
            return Err(MergeError::DuplicateKeyColumn(column.clone()));
        }
    }
    Ok(())
}

/// Merge `incoming` rows into the `existing` table state.
///
/// # Errors
///
/// Returns [`MergeError`] if `key_columns` is empty or repeats a column.
pub fn merge(
    existing: &[Row],
    incoming: &[Row],
    key_columns: &[String],
    strategy: MergeStrategy,
) -> Result<MergeResult, MergeError> {
    check_keys(key_columns)?;

    let mut state: BTreeMap<String, Ranked> = BTreeMap::new();
    let mut keyless = Vec::new();
    for row in existing {
        match row_key(row, key_columns) {
            None => keyless.push(row.clone()),
            Some(key) => {
                let candidate = Ranked::new(row.clone());
                match state.get(&key) {
                    Some(current) if candidate.rank_cmp(current, strategy) != Ordering::Greater => {}
                    _ => {
                        state.insert(key, candidate);
                    }
                }
            }
        }
    }

    let mut stats = MergeStats::default();
    let mut changed_keys = BTreeSet::new();

    for row in incoming {
        let Some(key) = row_key(row, key_columns) else {
            stats.missing_key += 1;
            continue;
        };
        let candidate = Ranked::new(row.clone());
        let Some(current) = state.get(&key) else {
            stats.inserted += 1;
            changed_keys.insert(key.clone());
            state.insert(key, candidate);
            continue;
        };

        let same_content = candidate.canonical == current.canonical;
        if !same_content && candidate.primary_cmp(current, strategy) == Ordering::Equal {
            stats.conflicts += 1;
        }

        if candidate.rank_cmp(current, strategy) == Ordering::Greater {
            if same_content {
                stats.unchanged += 1;
            } else {
                stats.updated += 1;
            }
            changed_keys.insert(key.clone());
            state.insert(key, candidate);
        } else {
            stats.unchanged += 1;
        }
    }

    let mut rows: Vec<Row> = state.into_values().map(|r| r.row).collect();
    rows.extend(keyless);

    Ok(MergeResult {
        rows,
        stats,
        changed_keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use medallion_types::record::{Lineage, Record, RowQuality};
    use medallion_types::value::Value;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn row(id: &str, amount: i64, hour: u32, batch: &str) -> Row {
        let record: Record = [
            ("order_id", Value::Str(id.into())),
            ("amount", Value::Int(amount)),
        ]
        .into_iter()
        .collect();
        Row::new(record).with_lineage(Lineage {
            batch_id: batch.into(),
            source_id: "pos".into(),
            ingestion_timestamp: ts(hour),
        })
    }

    fn scored(mut row: Row, score: f64) -> Row {
        row.quality = Some(RowQuality {
            score,
            ..RowQuality::clean()
        });
        row
    }

    fn keys() -> Vec<String> {
        vec!["order_id".to_string()]
    }

    fn amount(row: &Row) -> &Value {
        row.record.get("amount").unwrap()
    }

    #[test]
    fn last_write_wins_keeps_later_record() {
        let first = merge(&[], &[row("o-1", 10, 1, "b1")], &keys(), MergeStrategy::LastWriteWins)
            .unwrap();
        assert_eq!(first.stats.inserted, 1);

        let second = merge(
            &first.rows,
            &[row("o-1", 12, 2, "b2")],
            &keys(),
            MergeStrategy::LastWriteWins,
        )
        .unwrap();
        assert_eq!(second.stats.updated, 1);
        assert_eq!(second.stats.inserted, 0);
        assert_eq!(second.rows.len(), 1);
        assert_eq!(amount(&second.rows[0]), &Value::Int(12));
    }

    #[test]
    fn late_arriving_older_record_is_ignored() {
        let state = vec![row("o-1", 12, 5, "b2")];
        let result = merge(&state, &[row("o-1", 10, 1, "b1")], &keys(), MergeStrategy::LastWriteWins)
            .unwrap();
        assert_eq!(result.stats.unchanged, 1);
        assert!(!result.has_changes());
        assert_eq!(amount(&result.rows[0]), &Value::Int(12));
    }

    #[test]
    fn duplicates_inside_one_batch() {
        let batch = vec![row("o-1", 10, 1, "b1"), row("o-1", 12, 2, "b1")];
        let result = merge(&[], &batch, &keys(), MergeStrategy::LastWriteWins).unwrap();
        assert_eq!(result.stats.inserted, 1);
        assert_eq!(result.stats.updated, 1);
        assert_eq!(amount(&result.rows[0]), &Value::Int(12));
    }

    #[test]
    fn reapplying_batch_changes_nothing() {
        let batch = vec![
            row("o-1", 10, 1, "b1"),
            row("o-2", 20, 1, "b1"),
            row("o-1", 11, 3, "b1"),
        ];
        let once = merge(&[], &batch, &keys(), MergeStrategy::LastWriteWins).unwrap();
        let twice = merge(&once.rows, &batch, &keys(), MergeStrategy::LastWriteWins).unwrap();
        assert_eq!(twice.rows, once.rows);
        assert_eq!(twice.stats.inserted, 0);
        assert_eq!(twice.stats.updated, 0);
        assert!(!twice.has_changes());
    }

    #[test]
    fn highest_quality_wins_prefers_score_then_time() {
        let state = vec![scored(row("o-1", 10, 5, "b1"), 0.8)];
        let worse_but_newer = scored(row("o-1", 11, 9, "b2"), 0.6);
        let result = merge(
            &state,
            &[worse_but_newer],
            &keys(),
            MergeStrategy::HighestQualityWins,
        )
        .unwrap();
        assert_eq!(amount(&result.rows[0]), &Value::Int(10));

        let equal_but_newer = scored(row("o-1", 12, 9, "b3"), 0.8);
        let result = merge(
            &result.rows,
            &[equal_but_newer],
            &keys(),
            MergeStrategy::HighestQualityWins,
        )
        .unwrap();
        assert_eq!(amount(&result.rows[0]), &Value::Int(12));
    }

    #[test]
    fn equal_rank_conflict_is_counted_and_deterministic() {
        let a = row("o-1", 10, 1, "b1");
        let b = row("o-1", 20, 1, "b2");
        let ab = merge(&[], &[a.clone(), b.clone()], &keys(), MergeStrategy::LastWriteWins).unwrap();
        let ba = merge(&[], &[b, a], &keys(), MergeStrategy::LastWriteWins).unwrap();
        assert_eq!(ab.stats.conflicts, 1);
        assert_eq!(ba.stats.conflicts, 1);
        assert_eq!(ab.rows, ba.rows);
    }

    #[test]
    fn key_matching_is_type_normalized() {
        let int_key: Record = [("id", Value::Int(5)), ("v", Value::Int(1))].into_iter().collect();
        let float_key: Record = [("id", Value::Float(5.0)), ("v", Value::Int(2))]
            .into_iter()
            .collect();
        let mut newer = Row::new(float_key);
        newer.lineage = Some(Lineage {
            batch_id: "b2".into(),
            source_id: "s".into(),
            ingestion_timestamp: ts(2),
        });
        let result = merge(
            &[Row::new(int_key)],
            &[newer],
            &["id".to_string()],
            MergeStrategy::LastWriteWins,
        )
        .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.stats.updated, 1);
    }

    #[test]
    fn sub_millisecond_correction_counts_as_update() {
        let event = |micros| {
            let at = ts(1) + chrono::Duration::microseconds(micros);
            let mut r = row("o-1", 10, 1, "b1");
            r.record.insert("order_ts", Value::Timestamp(at));
            r
        };
        let first = merge(&[], &[event(100)], &keys(), MergeStrategy::LastWriteWins).unwrap();

        let mut correction = event(200);
        if let Some(lineage) = correction.lineage.as_mut() {
            lineage.ingestion_timestamp = ts(2);
        }
        let second =
            merge(&first.rows, &[correction.clone()], &keys(), MergeStrategy::LastWriteWins).unwrap();
        assert_eq!(second.stats.updated, 1);
        assert_eq!(second.stats.unchanged, 0);
        assert_eq!(second.rows, vec![correction]);
    }

    #[test]
    fn missing_keys_are_counted_not_merged() {
        let mut keyless = row("o-1", 10, 1, "b1");
        keyless.record.insert("order_id", Value::Null);
        let result = merge(&[], &[keyless], &keys(), MergeStrategy::LastWriteWins).unwrap();
        assert_eq!(result.stats.missing_key, 1);
        assert!(result.rows.is_empty());
    }

    #[test]
    fn composite_keys_and_ordering() {
        let keys = vec!["order_id".to_string(), "amount".to_string()];
        let batch = vec![row("o-2", 1, 1, "b"), row("o-1", 2, 1, "b"), row("o-1", 1, 1, "b")];
        let result = merge(&[], &batch, &keys, MergeStrategy::LastWriteWins).unwrap();
        assert_eq!(result.stats.inserted, 3);
        let order: Vec<_> = result
            .rows
            .iter()
            .map(|r| row_key(r, &keys).unwrap())
            .collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
    }

    #[test]
    fn rejects_bad_key_columns() {
        assert_eq!(
            merge(&[], &[], &[], MergeStrategy::LastWriteWins),
            Err(MergeError::NoKeyColumns)
        );
        let dup = vec!["a".to_string(), "a".to_string()];
        assert_eq!(
            merge(&[], &[], &dup, MergeStrategy::LastWriteWins),
            Err(MergeError::DuplicateKeyColumn("a".into()))
        );
    }
}
