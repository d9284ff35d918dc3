//! Pipeline configuration types deserialized from YAML.

use std::collections::BTreeMap;

use medallion_types::record::RawRecord;
use medallion_types::schema::SchemaDefinition;
use medallion_types::state::{DatasetId, Layer, TableName};
use serde::{Deserialize, Serialize};

use crate::gold::AggregationRules;
use crate::merge::MergeStrategy;

/// Top-level pipeline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    /// Schemas registered when the orchestrator starts.
    #[serde(default)]
    pub schemas: Vec<SchemaDefinition>,
    /// Reference tables seeded for Silver enrichment.
    #[serde(default)]
    pub references: Vec<ReferenceTable>,
    pub datasets: Vec<DatasetConfig>,
}

impl PipelineConfig {
    #[must_use]
    pub fn dataset(&self, name: &DatasetId) -> Option<&DatasetConfig> {
        self.datasets.iter().find(|d| &d.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_backend")]
    pub backend: StateBackendKind,
    /// Database path. In-memory when absent.
    pub connection: Option<String>,
}

fn default_backend() -> StateBackendKind {
    StateBackendKind::Sqlite
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            connection: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_stage_timeout_seconds")]
    pub stage_timeout_seconds: u64,
    /// Parallel sub-tasks for Gold aggregation.
    #[serde(default = "default_gold_partitions")]
    pub gold_partitions: usize,
}

fn default_stage_timeout_seconds() -> u64 {
    300
}
fn default_gold_partitions() -> usize {
    4
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            stage_timeout_seconds: default_stage_timeout_seconds(),
            gold_partitions: default_gold_partitions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per stage, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    100
}
fn default_backoff_max_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Batches scoring below this are flagged, never rejected.
    #[serde(default = "default_min_batch_score")]
    pub min_batch_score: f64,
    #[serde(default)]
    pub penalties: Penalties,
}

fn default_min_batch_score() -> f64 {
    0.95
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_batch_score: default_min_batch_score(),
            penalties: Penalties::default(),
        }
    }
}

/// Score penalty per violation kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Penalties {
    #[serde(default = "default_null_penalty")]
    pub null: f64,
    #[serde(default = "default_range_penalty")]
    pub range: f64,
    #[serde(default = "default_domain_penalty")]
    pub domain: f64,
    #[serde(default = "default_lookup_penalty")]
    pub lookup_missing: f64,
}

fn default_null_penalty() -> f64 {
    0.5
}
fn default_range_penalty() -> f64 {
    0.2
}
fn default_domain_penalty() -> f64 {
    0.2
}
fn default_lookup_penalty() -> f64 {
    0.1
}

impl Default for Penalties {
    fn default() -> Self {
        Self {
            null: default_null_penalty(),
            range: default_range_penalty(),
            domain: default_domain_penalty(),
            lookup_missing: default_lookup_penalty(),
        }
    }
}

/// Inline reference data committed to `table` at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceTable {
    pub table: TableName,
    pub rows: Vec<RawRecord>,
}

/// One Bronze → Silver → Gold chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: DatasetId,
    pub bronze: BronzeConfig,
    pub silver: Option<SilverConfig>,
    pub gold: Option<GoldConfig>,
}

impl DatasetConfig {
    /// Table written by `layer`, if the layer is configured.
    #[must_use]
    pub fn table(&self, layer: Layer) -> Option<&TableName> {
        match layer {
            Layer::Bronze => Some(&self.bronze.table),
            Layer::Silver => self.silver.as_ref().map(|s| &s.table),
            Layer::Gold => self.gold.as_ref().map(|g| &g.table),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BronzeConfig {
    pub table: TableName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SilverConfig {
    pub table: TableName,
    /// Business key used for deduplication.
    pub key_columns: Vec<String>,
    #[serde(default)]
    pub strategy: MergeStrategy,
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnRule>,
    #[serde(default)]
    pub enrichment: Vec<EnrichmentRule>,
    /// Columns computed per row after lookups, in order.
    #[serde(default)]
    pub derive: Vec<DeriveRule>,
}

/// Per-column standardization applied before typing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnRule {
    #[serde(default)]
    pub case: Option<CaseRule>,
    /// Value substitutions, matched case-insensitively on the trimmed text.
    #[serde(default)]
    pub mappings: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub null_policy: NullPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseRule {
    Lower,
    Upper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullAction {
    /// Drop the whole record.
    Drop,
    /// Substitute `NullPolicy::default`.
    Default,
    #[default]
    CarryNull,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NullPolicy {
    #[serde(default)]
    pub action: NullAction,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

/// Lookup-join of a Silver column against a reference table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentRule {
    pub reference: TableName,
    /// Silver column holding the lookup value.
    pub on: String,
    /// Reference column matched against `on`.
    pub reference_key: String,
    /// Reference columns copied into the row's enrichment map.
    pub columns: Vec<String>,
}

/// A column computed from other columns of the same row. The result lands
/// in the row's enrichment map under `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeriveRule {
    /// Lower-cased part after the last `@`.
    EmailDomain { name: String, column: String },
    /// A calendar field of a timestamp column.
    DatePart {
        name: String,
        column: String,
        part: DatePart,
    },
    /// `labels[i]` where `i` is the number of `bounds` not above the value.
    Bucket {
        name: String,
        column: String,
        bounds: Vec<f64>,
        labels: Vec<String>,
    },
    /// Non-null values joined by `separator`.
    Concat {
        name: String,
        columns: Vec<String>,
        #[serde(default = "default_separator")]
        separator: String,
    },
}

fn default_separator() -> String {
    " ".to_string()
}

impl DeriveRule {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::EmailDomain { name, .. }
            | Self::DatePart { name, .. }
            | Self::Bucket { name, .. }
            | Self::Concat { name, .. } => name,
        }
    }

    /// Columns the rule reads.
    #[must_use]
    pub fn inputs(&self) -> Vec<&str> {
        match self {
            Self::EmailDomain { column, .. }
            | Self::DatePart { column, .. }
            | Self::Bucket { column, .. } => vec![column.as_str()],
            Self::Concat { columns, .. } => columns.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatePart {
    Year,
    Quarter,
    Month,
    Day,
    /// ISO weekday, Monday = 1.
    Weekday,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldConfig {
    pub table: TableName,
    #[serde(flatten)]
    pub rules: AggregationRules,
}
