//! Semantic validation for parsed pipeline configuration values.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use medallion_types::schema::SchemaDefinition;

use crate::config::types::{DeriveRule, NullAction, PipelineConfig, SilverConfig};
use crate::gold::{AggregationRules, MeasureFunction};

fn check_unit_interval(value: f64, context: &str, errors: &mut Vec<String>) {
    if !(0.0..=1.0).contains(&value) {
        errors.push(format!("{context} must be between 0 and 1, got {value}"));
    }
}

fn validate_schema(schema: &SchemaDefinition, errors: &mut Vec<String>) {
    let context = format!("schema '{}' v{}", schema.table, schema.version);
    if schema.version == 0 {
        errors.push(format!("{context}: versions start at 1"));
    }
    if schema.columns.is_empty() {
        errors.push(format!("{context}: must declare at least one column"));
    }
    for (name, spec) in &schema.columns {
        if let (Some(min), Some(max)) = (spec.min, spec.max) {
            if min > max {
                errors.push(format!("{context}: column '{name}' has min {min} > max {max}"));
            }
        }
        if (spec.min.is_some() || spec.max.is_some()) && !spec.column_type.is_numeric() {
            errors.push(format!(
                "{context}: column '{name}' declares a range but is {}",
                spec.column_type
            ));
        }
        if let Some(pattern) = &spec.pattern {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(format!("{context}: column '{name}' has invalid pattern: {e}"));
            }
        }
        if spec.allowed.as_ref().is_some_and(Vec::is_empty) {
            errors.push(format!("{context}: column '{name}' has an empty allowed list"));
        }
    }
}

fn validate_silver(dataset: &str, silver: &SilverConfig, errors: &mut Vec<String>) {
    if silver.key_columns.is_empty() {
        errors.push(format!(
            "Dataset '{dataset}': silver requires at least one key column"
        ));
    }
    for (column, rule) in &silver.columns {
        match (rule.null_policy.action, &rule.null_policy.default) {
            (NullAction::Default, None) => errors.push(format!(
                "Dataset '{dataset}': column '{column}' uses null_policy 'default' without a default value"
            )),
            (NullAction::Drop | NullAction::CarryNull, Some(_)) => errors.push(format!(
                "Dataset '{dataset}': column '{column}' sets a default but null_policy is not 'default'"
            )),
            _ => {}
        }
    }
    for (i, rule) in silver.enrichment.iter().enumerate() {
        if rule.on.trim().is_empty() || rule.reference_key.trim().is_empty() {
            errors.push(format!(
                "Dataset '{dataset}': enrichment[{i}] needs both 'on' and 'reference_key'"
            ));
        }
        if rule.columns.is_empty() {
            errors.push(format!(
                "Dataset '{dataset}': enrichment[{i}] copies no columns"
            ));
        }
    }
    validate_derive(dataset, silver, errors);
}

fn validate_derive(dataset: &str, silver: &SilverConfig, errors: &mut Vec<String>) {
    // Enrichment values are only reachable through names the record lacks.
    let mut taken: HashSet<&str> = silver
        .key_columns
        .iter()
        .chain(silver.columns.keys())
        .chain(silver.enrichment.iter().flat_map(|e| &e.columns))
        .map(String::as_str)
        .collect();
    for (i, rule) in silver.derive.iter().enumerate() {
        let name = rule.name();
        if name.trim().is_empty() {
            errors.push(format!("Dataset '{dataset}': derive[{i}] needs a name"));
        } else if !taken.insert(name) {
            errors.push(format!(
                "Dataset '{dataset}': derive[{i}] name '{name}' is already a silver column"
            ));
        }
        if rule.inputs().iter().any(|c| c.trim().is_empty()) || rule.inputs().is_empty() {
            errors.push(format!("Dataset '{dataset}': derive[{i}] needs input columns"));
        }
        if let DeriveRule::Bucket { bounds, labels, .. } = rule {
            if !bounds.iter().all(|b| b.is_finite()) || bounds.windows(2).any(|w| w[0] >= w[1]) {
                errors.push(format!(
                    "Dataset '{dataset}': derive[{i}] bounds must be finite and strictly increasing"
                ));
            }
            if labels.len() != bounds.len() + 1 {
                errors.push(format!(
                    "Dataset '{dataset}': derive[{i}] needs {} labels for {} bounds, got {}",
                    bounds.len() + 1,
                    bounds.len(),
                    labels.len()
                ));
            }
        }
    }
}

fn claim_output<'a>(
    dataset: &str,
    outputs: &mut HashMap<&'a str, &'static str>,
    name: &'a str,
    role: &'static str,
    errors: &mut Vec<String>,
) {
    if let Some(previous) = outputs.insert(name, role) {
        errors.push(format!(
            "Dataset '{dataset}': gold output column '{name}' is used by both {previous} and {role}"
        ));
    }
}

fn validate_gold(dataset: &str, rules: &AggregationRules, errors: &mut Vec<String>) {
    if rules.measures.is_empty() {
        errors.push(format!("Dataset '{dataset}': gold requires at least one measure"));
    }

    // Group columns, the time bucket and measures share one output row.
    let mut outputs: HashMap<&str, &'static str> = HashMap::new();
    for column in &rules.group_by {
        claim_output(dataset, &mut outputs, column, "group_by", errors);
    }
    if let Some(grain) = &rules.time_grain {
        if grain.alias.trim().is_empty() {
            errors.push(format!("Dataset '{dataset}': time_grain alias must not be empty"));
        }
        claim_output(dataset, &mut outputs, &grain.alias, "time_grain alias", errors);
    }
    for measure in &rules.measures {
        claim_output(dataset, &mut outputs, &measure.name, "a measure", errors);
        if measure.column.is_none() && measure.function != MeasureFunction::Count {
            errors.push(format!(
                "Dataset '{dataset}': measure '{}' ({}) requires a column",
                measure.name,
                measure.function.as_str()
            ));
        }
    }
    if let Some(min) = rules.min_quality_score {
        check_unit_interval(min, &format!("Dataset '{dataset}': min_quality_score"), errors);
    }
}

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    if config.datasets.is_empty() {
        errors.push("Pipeline must define at least one dataset".to_string());
    }

    if config.retry.max_attempts == 0 {
        errors.push("retry.max_attempts must be at least 1".to_string());
    }
    if config.retry.backoff_base_ms > config.retry.backoff_max_ms {
        errors.push("retry.backoff_base_ms must not exceed retry.backoff_max_ms".to_string());
    }
    if config.resources.stage_timeout_seconds == 0 {
        errors.push("resources.stage_timeout_seconds must be > 0".to_string());
    }
    if config.resources.gold_partitions == 0 {
        errors.push("resources.gold_partitions must be at least 1".to_string());
    }

    check_unit_interval(config.quality.min_batch_score, "quality.min_batch_score", &mut errors);
    let penalties = &config.quality.penalties;
    for (name, value) in [
        ("null", penalties.null),
        ("range", penalties.range),
        ("domain", penalties.domain),
        ("lookup_missing", penalties.lookup_missing),
    ] {
        check_unit_interval(value, &format!("quality.penalties.{name}"), &mut errors);
    }

    for schema in &config.schemas {
        validate_schema(schema, &mut errors);
    }

    let mut dataset_names = HashSet::new();
    let mut tables = HashSet::new();
    for reference in &config.references {
        if !tables.insert(reference.table.clone()) {
            errors.push(format!("Table '{}' is declared more than once", reference.table));
        }
    }

    for (i, dataset) in config.datasets.iter().enumerate() {
        let name = dataset.name.as_str();
        if name.trim().is_empty() {
            errors.push(format!("Dataset {i} has an empty name"));
        }
        if !dataset_names.insert(name) {
            errors.push(format!("Duplicate dataset name '{name}'"));
        }

        for table in [
            Some(&dataset.bronze.table),
            dataset.silver.as_ref().map(|s| &s.table),
            dataset.gold.as_ref().map(|g| &g.table),
        ]
        .into_iter()
        .flatten()
        {
            if table.as_str().trim().is_empty() {
                errors.push(format!("Dataset '{name}' has an empty table name"));
            } else if !tables.insert(table.clone()) {
                errors.push(format!(
                    "Table '{table}' is written by more than one layer or dataset"
                ));
            }
        }

        if dataset.gold.is_some() && dataset.silver.is_none() {
            errors.push(format!("Dataset '{name}': gold requires a silver layer"));
        }
        if let Some(silver) = &dataset.silver {
            validate_silver(name, silver, &mut errors);
        }
        if let Some(gold) = &dataset.gold {
            validate_gold(name, &gold.rules, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}
