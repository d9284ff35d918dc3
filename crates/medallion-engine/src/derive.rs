//! Row-local derived columns for Silver.
//!
//! Every rule reads the row (record first, then enrichment) and writes one
//! value into the enrichment map. Rules run in order, so a later rule may
//! read an earlier one's output. Inputs that are null or of the wrong type
//! derive null; a derivation never rejects a row.

use chrono::Datelike;
use medallion_types::record::Row;
use medallion_types::value::Value;

use crate::config::types::{DatePart, DeriveRule};

/// Evaluate `rule` against `row`.
#[must_use]
pub fn derive_value(rule: &DeriveRule, row: &Row) -> Value {
    let input = |column: &str| row.get(column).filter(|v| !v.is_null());
    match rule {
        DeriveRule::EmailDomain { column, .. } => input(column)
            .and_then(Value::as_str)
            .and_then(email_domain)
            .map_or(Value::Null, Value::Str),
        DeriveRule::DatePart { column, part, .. } => input(column)
            .and_then(Value::as_timestamp)
            .map_or(Value::Null, |ts| {
                Value::Int(match part {
                    DatePart::Year => i64::from(ts.year()),
                    DatePart::Quarter => i64::from(ts.month0() / 3 + 1),
                    DatePart::Month => i64::from(ts.month()),
                    DatePart::Day => i64::from(ts.day()),
                    DatePart::Weekday => i64::from(ts.weekday().number_from_monday()),
                })
            }),
        DeriveRule::Bucket {
            column,
            bounds,
            labels,
            ..
        } => input(column)
            .and_then(Value::as_f64)
            .filter(|x| !x.is_nan())
            .and_then(|x| {
                let index = bounds.iter().take_while(|b| **b <= x).count();
                labels.get(index).cloned()
            })
            .map_or(Value::Null, Value::Str),
        DeriveRule::Concat {
            columns, separator, ..
        } => {
            let parts: Vec<String> = columns
                .iter()
                .filter_map(|c| input(c))
                .map(Value::content_repr)
                .collect();
            if parts.is_empty() {
                Value::Null
            } else {
                Value::Str(parts.join(separator))
            }
        }
    }
}

/// Apply every rule to `row` in order.
pub fn apply_derivations(rules: &[DeriveRule], row: &mut Row) {
    for rule in rules {
        let value = derive_value(rule, row);
        row.enrichment.insert(rule.name().to_string(), value);
    }
}

fn email_domain(address: &str) -> Option<String> {
    let (local, domain) = address.trim().rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return None;
    }
    Some(domain.to_lowercase())
}
