//! Versioned schema registry and record validation.
//!
//! Schemas are stored through the [`StateBackend`]; this module adds the
//! evolution rules, a compiled-pattern cache and the per-record validator
//! every processor relies on.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use medallion_state::{StateBackend, StateError};
use medallion_types::record::{RawRecord, Record};
use medallion_types::schema::{ColumnSpec, SchemaDefinition, SchemaId, Violation, ViolationKind};
use medallion_types::state::TableName;
use medallion_types::value::Value;
use regex::Regex;

use crate::errors::SchemaError;

/// A schema with its patterns compiled and allowed sets canonicalized.
#[derive(Debug)]
pub struct CompiledSchema {
    definition: SchemaDefinition,
    patterns: HashMap<String, Regex>,
    allowed: HashMap<String, BTreeSet<String>>,
}

impl CompiledSchema {
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidPattern`] if a column pattern is not a
    /// valid regex.
    pub fn compile(definition: SchemaDefinition) -> Result<Self, SchemaError> {
        let mut patterns = HashMap::new();
        let mut allowed = HashMap::new();
        for (name, spec) in &definition.columns {
            if let Some(pattern) = &spec.pattern {
                let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
                    SchemaError::InvalidPattern {
                        column: name.clone(),
                        source,
                    }
                })?;
                patterns.insert(name.clone(), regex);
            }
            if let Some(keys) = spec.allowed_keys() {
                allowed.insert(name.clone(), keys.into_iter().collect());
            }
        }
        Ok(Self {
            definition,
            patterns,
            allowed,
        })
    }

    #[must_use]
    pub fn definition(&self) -> &SchemaDefinition {
        &self.definition
    }

    #[must_use]
    pub fn id(&self) -> SchemaId {
        self.definition.id()
    }

    /// Type and constrain a raw JSON record.
    #[must_use]
    pub fn validate_raw(&self, raw: &RawRecord) -> ValidationResult {
        let mut record = Record::new();
        let mut violations = Vec::new();
        for (name, spec) in &self.definition.columns {
            let coerced = match raw.get(name) {
                None => Ok(Value::Null),
                Some(value) => spec.column_type.coerce_json(value),
            };
            let value = self.check_column(name, spec, coerced, &mut violations);
            record.insert(name.clone(), value);
        }
        for (name, value) in raw {
            if !self.definition.columns.contains_key(name) {
                record
                    .extra
                    .insert(name.clone(), Value::from_json_loose(value));
            }
        }
        ValidationResult { record, violations }
    }

    /// Re-type an already typed record against this schema.
    ///
    /// Columns are looked up in both the typed values and the extra bucket,
    /// so a field promoted into a later schema version is picked up.
    #[must_use]
    pub fn validate_record(&self, input: &Record) -> ValidationResult {
        let mut record = Record::new();
        let mut violations = Vec::new();
        for (name, spec) in &self.definition.columns {
            let coerced = match input.get(name) {
                None => Ok(Value::Null),
                Some(value) => spec.column_type.coerce(value),
            };
            let value = self.check_column(name, spec, coerced, &mut violations);
            record.insert(name.clone(), value);
        }
        for (name, value) in input.values.iter().chain(&input.extra) {
            if !self.definition.columns.contains_key(name) {
                record.extra.insert(name.clone(), value.clone());
            }
        }
        ValidationResult { record, violations }
    }

    fn check_column(
        &self,
        name: &str,
        spec: &ColumnSpec,
        coerced: Result<Value, String>,
        violations: &mut Vec<Violation>,
    ) -> Value {
        let value = match coerced {
            Ok(value) => value,
            Err(reason) => {
                violations.push(Violation::new(name, ViolationKind::Type, reason));
                return Value::Null;
            }
        };

        if value.is_null() {
            if !spec.nullable {
                violations.push(Violation::new(
                    name,
                    ViolationKind::Null,
                    "required value is null",
                ));
            }
            return value;
        }

        if let Some(number) = value.as_f64() {
            let below = spec.min.is_some_and(|min| number < min);
            let above = spec.max.is_some_and(|max| number > max);
            if below || above {
                violations.push(Violation::new(
                    name,
                    ViolationKind::Range,
                    format!(
                        "{number} outside [{}, {}]",
                        spec.min.map_or("-inf".to_string(), |m| m.to_string()),
                        spec.max.map_or("inf".to_string(), |m| m.to_string()),
                    ),
                ));
            }
        }

        if let Some(allowed) = self.allowed.get(name) {
            if !allowed.contains(&value.key_repr()) {
                violations.push(Violation::new(
                    name,
                    ViolationKind::Domain,
                    format!("'{value}' is not an allowed value"),
                ));
            }
        }

        if let (Some(regex), Some(text)) = (self.patterns.get(name), value.as_str()) {
            if !regex.is_match(text) {
                violations.push(Violation::new(
                    name,
                    ViolationKind::Domain,
                    format!("'{text}' does not match pattern"),
                ));
            }
        }

        value
    }
}

/// Typed record plus every field-level violation found while typing it.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub record: Record,
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    #[must_use]
    pub fn ok(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Validate a raw record against a compiled schema.
#[must_use]
pub fn validate(record: &RawRecord, schema: &CompiledSchema) -> ValidationResult {
    schema.validate_raw(record)
}

/// Reasons `next` is not a compatible extension of `prev`. Empty when
/// compatible.
#[must_use]
pub fn compatibility_violations(prev: &SchemaDefinition, next: &SchemaDefinition) -> Vec<String> {
    let mut reasons = Vec::new();

    for (name, old) in &prev.columns {
        let Some(new) = next.columns.get(name) else {
            reasons.push(format!("column '{name}' was removed"));
            continue;
        };
        if new.column_type != old.column_type {
            reasons.push(format!(
                "column '{name}' changed type from {} to {}",
                old.column_type, new.column_type
            ));
        }
        if old.nullable && !new.nullable {
            reasons.push(format!("column '{name}' became required"));
        }
        if let Some(new_min) = new.min {
            if old.min.map_or(true, |old_min| new_min > old_min) {
                reasons.push(format!("column '{name}' raised its minimum to {new_min}"));
            }
        }
        if let Some(new_max) = new.max {
            if old.max.map_or(true, |old_max| new_max < old_max) {
                reasons.push(format!("column '{name}' lowered its maximum to {new_max}"));
            }
        }
        if let Some(new_allowed) = new.allowed_keys() {
            let new_allowed: BTreeSet<String> = new_allowed.into_iter().collect();
            match old.allowed_keys() {
                None => reasons.push(format!("column '{name}' gained an allowed-value list")),
                Some(old_allowed) => {
                    let dropped: Vec<String> = old_allowed
                        .into_iter()
                        .filter(|v| !new_allowed.contains(v))
                        .collect();
                    if !dropped.is_empty() {
                        reasons.push(format!(
                            "column '{name}' no longer allows {}",
                            dropped.join(", ")
                        ));
                    }
                }
            }
        }
        if new.pattern.is_some() && new.pattern != old.pattern {
            reasons.push(format!("column '{name}' gained or changed its pattern"));
        }
    }

    for (name, spec) in &next.columns {
        if !prev.columns.contains_key(name) && !spec.nullable {
            reasons.push(format!("new column '{name}' must be nullable"));
        }
    }

    reasons
}

type CacheKey = (TableName, u32);

/// Registry facade over the state backend.
pub struct SchemaRegistry {
    backend: Arc<dyn StateBackend>,
    compiled: RwLock<HashMap<CacheKey, Arc<CompiledSchema>>>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            backend,
            compiled: RwLock::new(HashMap::new()),
        }
    }

    /// Register `schema` as the next version of its table.
    ///
    /// Re-registering an identical definition is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Incompatible`] when the version is not exactly
    /// `latest + 1`, when an existing version is redefined, or when the
    /// change is not additive; [`SchemaError::Conflict`] when another writer
    /// registered first.
    pub fn register(&self, schema: SchemaDefinition) -> Result<SchemaId, SchemaError> {
        let compiled = CompiledSchema::compile(schema)?;
        let schema = compiled.definition();
        let id = schema.id();
        let versions = self.backend.schema_versions(&schema.table)?;

        if let Some(existing) = versions.iter().find(|v| v.version == schema.version) {
            if existing == schema {
                tracing::debug!(schema = %id, "Schema already registered");
                return Ok(id);
            }
            return Err(SchemaError::Incompatible {
                schema: id,
                reasons: vec!["version already registered with a different definition".into()],
            });
        }

        let latest = versions.last();
        let expected_version = latest.map_or(1, |s| s.version + 1);
        if schema.version != expected_version {
            return Err(SchemaError::Incompatible {
                schema: id,
                reasons: vec![format!("expected version {expected_version}")],
            });
        }
        if let Some(prev) = latest {
            let reasons = compatibility_violations(prev, schema);
            if !reasons.is_empty() {
                return Err(SchemaError::Incompatible { schema: id, reasons });
            }
        }

        self.backend
            .insert_schema(schema, latest.map(|s| s.version))
            .map_err(|source| match source {
                StateError::SchemaVersionConflict { .. } => SchemaError::Conflict {
                    table: schema.table.to_string(),
                    source,
                },
                other => SchemaError::Storage(other),
            })?;

        tracing::info!(schema = %id, columns = schema.columns.len(), "Registered schema");
        self.cache(compiled);
        Ok(id)
    }

    /// Resolve a schema version, the latest when `version` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::NotFound`] / [`SchemaError::VersionNotFound`]
    /// when nothing matches.
    pub fn resolve(
        &self,
        table: &TableName,
        version: Option<u32>,
    ) -> Result<Arc<CompiledSchema>, SchemaError> {
        if let Some(version) = version {
            if let Some(hit) = self.cached(table, version) {
                return Ok(hit);
            }
        }

        let versions = self.backend.schema_versions(table)?;
        let definition = match version {
            None => versions.into_iter().last().ok_or_else(|| SchemaError::NotFound {
                table: table.to_string(),
            })?,
            Some(v) => versions
                .into_iter()
                .find(|s| s.version == v)
                .ok_or_else(|| SchemaError::VersionNotFound {
                    table: table.to_string(),
                    version: v,
                })?,
        };

        if let Some(hit) = self.cached(table, definition.version) {
            return Ok(hit);
        }
        Ok(self.cache(CompiledSchema::compile(definition)?))
    }

    /// Resolve the latest schema, or `None` if the table has none.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] on storage failure.
    pub fn resolve_optional(
        &self,
        table: &TableName,
    ) -> Result<Option<Arc<CompiledSchema>>, SchemaError> {
        match self.resolve(table, None) {
            Ok(schema) => Ok(Some(schema)),
            Err(SchemaError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn cached(&self, table: &TableName, version: u32) -> Option<Arc<CompiledSchema>> {
        self.compiled
            .read()
            .ok()
            .and_then(|map| map.get(&(table.clone(), version)).cloned())
    }

    fn cache(&self, compiled: CompiledSchema) -> Arc<CompiledSchema> {
        let key = (compiled.definition.table.clone(), compiled.definition.version);
        let compiled = Arc::new(compiled);
        if let Ok(mut map) = self.compiled.write() {
            map.insert(key, Arc::clone(&compiled));
        }
        compiled
    }
}
