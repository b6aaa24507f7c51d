//! Bundle validation against a frame.
//!
//! Pure: the caller that persists the bundle freezes the frame version.

use crate::bundle::ContextBundle;
use crate::error::{FrameError, Violation};
use crate::frame::{FrameDef, ValidatorRule};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

/// A bundle that passed validation, with frame defaults merged in.
#[derive(Debug, Clone)]
pub struct ValidBundle {
    pub bundle: ContextBundle,
    pub frame_name: String,
    pub frame_version: u32,
}

/// Validate `bundle` against `frame`.
///
/// Missing required fields are reported first; validators only run on a bundle
/// that has all of them. Bundle-declared resolution and policy values take
/// precedence over frame defaults.
pub fn validate(bundle: &ContextBundle, frame: &FrameDef) -> Result<ValidBundle, FrameError> {
    let document = validation_document(bundle).map_err(|e| FrameError::InvalidDefinition {
        name: frame.name.clone(),
        message: format!("bundle not representable as JSON: {}", e),
    })?;

    let missing_fields: Vec<String> = frame
        .required
        .iter()
        .filter(|path| lookup_path(&document, path).map_or(true, Value::is_null))
        .cloned()
        .collect();
    if !missing_fields.is_empty() {
        return Err(FrameError::MissingFields { missing_fields });
    }

    let mut violations = Vec::new();
    if bundle.frame.name != frame.name {
        violations.push(Violation {
            field: "frame.name".to_string(),
            message: format!("bundle names frame '{}', validated against '{}'", bundle.frame.name, frame.name),
        });
    }
    for validator in &frame.validators {
        let Some(value) = lookup_path(&document, &validator.field) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        if let Err(message) = check_rule(&validator.rule, value) {
            violations.push(Violation {
                field: validator.field.clone(),
                message,
            });
        }
    }
    if !violations.is_empty() {
        return Err(FrameError::ValidatorViolation { violations });
    }

    let mut merged = bundle.clone();
    merged.resolution = bundle.resolution.or(frame.defaults.resolution);
    if merged.policy.read.is_empty() {
        merged.policy.read = frame.defaults.read.clone();
    }
    if merged.policy.purposes.is_empty() {
        merged.policy.purposes = frame.defaults.purposes.clone();
    }

    Ok(ValidBundle {
        bundle: merged,
        frame_name: frame.name.clone(),
        frame_version: frame.version,
    })
}

/// The bundle's JSON form with inline content lifted so that `content.<field>`
/// addresses payload fields directly.
fn validation_document(bundle: &ContextBundle) -> Result<Value, serde_json::Error> {
    let mut document = serde_json::to_value(bundle)?;
    if let (Some(inline), Value::Object(map)) = (bundle.inline_content(), &mut document) {
        map.insert("content".to_string(), inline.clone());
    }
    Ok(document)
}

/// Resolve a dotted path; numeric segments index arrays.
pub fn lookup_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(document, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn check_rule(rule: &ValidatorRule, value: &Value) -> Result<(), String> {
    match rule {
        ValidatorRule::OneOf { values } => {
            let actual = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return Err("must be a scalar".to_string()),
            };
            if values.iter().any(|allowed| *allowed == actual) {
                Ok(())
            } else {
                Err(format!("must be one of: {}", values.join(", ")))
            }
        }
        ValidatorRule::NonEmpty => {
            let empty = match value {
                Value::String(s) => s.trim().is_empty(),
                Value::Array(items) => items.is_empty(),
                Value::Object(map) => map.is_empty(),
                _ => false,
            };
            if empty {
                Err("cannot be empty".to_string())
            } else {
                Ok(())
            }
        }
        ValidatorRule::Pattern { regex } => {
            let Value::String(s) = value else {
                return Err("must be a string".to_string());
            };
            if regex.is_match(s) {
                Ok(())
            } else {
                Err(format!("must match {}", regex))
            }
        }
        ValidatorRule::IsoDate => {
            let Value::String(s) = value else {
                return Err("must be a string".to_string());
            };
            if is_iso_date(s) {
                Ok(())
            } else {
                Err("must be a valid ISO 8601 date (e.g., 2025-05-29T10:00:00Z)".to_string())
            }
        }
        ValidatorRule::MinItems { min } => match value {
            Value::Array(items) if items.len() >= *min => Ok(()),
            Value::Array(_) => Err(format!("must hold at least {} items", min)),
            _ => Err("must be a list".to_string()),
        },
        ValidatorRule::NumberRange { min, max } => {
            let Some(n) = value.as_f64() else {
                return Err("must be a number".to_string());
            };
            if min.map_or(false, |lo| n < lo) || max.map_or(false, |hi| n > hi) {
                Err(format!("must be within [{:?}, {:?}]", min, max))
            } else {
                Ok(())
            }
        }
    }
}

fn is_iso_date(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}
