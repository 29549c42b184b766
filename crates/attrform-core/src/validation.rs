//! Field validation.
//!
//! Constraints are compiled once per descriptor when a session mounts, so a
//! malformed pattern surfaces as a configuration error of that field instead
//! of failing every keystroke.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde_json::Value;

use crate::descriptor::{AttributeConstraint, AttributeContent, AttributeDescriptor, ConstraintType};
use crate::error::{ConfigurationError, ValidationError};
use crate::value::FieldValue;

/// A constraint ready to evaluate.
#[derive(Debug, Clone)]
pub enum ConstraintRule {
    Pattern {
        regex: Regex,
        message: String,
    },
    Range {
        from: Option<f64>,
        to: Option<f64>,
        message: String,
    },
    DateTime {
        from: Option<NaiveDateTime>,
        to: Option<NaiveDateTime>,
        message: String,
    },
}

/// Why a field blocks submission.
#[derive(Debug, Clone, PartialEq)]
pub enum IssueKind {
    /// The value fails a check.
    Invalid(ValidationError),
    /// A required field has not settled (pending, loading or in error).
    Unsettled { state: String },
}

/// A validation finding scoped to one field path.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldIssue {
    pub path: String,
    pub kind: IssueKind,
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            IssueKind::Invalid(err) => write!(f, "{}: {err}", self.path),
            IssueKind::Unsettled { state } => {
                write!(f, "{}: required attribute is {state}", self.path)
            }
        }
    }
}

/// Compile a descriptor's constraints.
///
/// # Errors
///
/// Returns [`ConfigurationError::InvalidConstraint`] for the first constraint
/// whose data cannot be compiled.
pub fn compile_constraints(
    descriptor: &AttributeDescriptor,
) -> Result<Vec<ConstraintRule>, ConfigurationError> {
    descriptor
        .constraints
        .iter()
        .map(|c| compile(descriptor, c))
        .collect()
}

fn compile(
    descriptor: &AttributeDescriptor,
    constraint: &AttributeConstraint,
) -> Result<ConstraintRule, ConfigurationError> {
    let invalid = |kind: &str, reason: String| ConfigurationError::InvalidConstraint {
        attribute: descriptor.name.clone(),
        kind: kind.to_owned(),
        reason,
    };
    let message = |fallback: String| {
        constraint
            .error_message
            .clone()
            .or_else(|| constraint.description.clone())
            .unwrap_or(fallback)
    };
    let label = descriptor.label();

    match constraint.kind {
        ConstraintType::RegExp => {
            let pattern = constraint
                .data
                .as_str()
                .ok_or_else(|| invalid("regExp", "pattern must be a string".to_owned()))?;
            let regex = Regex::new(pattern).map_err(|e| invalid("regExp", e.to_string()))?;
            Ok(ConstraintRule::Pattern {
                message: message(format!("'{label}' does not match {pattern}")),
                regex,
            })
        }
        ConstraintType::Range => {
            if !descriptor.content_type.is_numeric() {
                return Err(invalid("range", mismatch(descriptor, "numeric")));
            }
            let (from, to) = bounds(&constraint.data, |v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .map_err(|reason| invalid("range", reason))?;
            Ok(ConstraintRule::Range {
                message: message(describe_bounds(label, from, to)),
                from,
                to,
            })
        }
        ConstraintType::DateTime => {
            if !descriptor.content_type.is_temporal() {
                return Err(invalid("dateTime", mismatch(descriptor, "temporal")));
            }
            let (from, to) = bounds(&constraint.data, |v| v.as_str().and_then(parse_moment))
                .map_err(|reason| invalid("dateTime", reason))?;
            Ok(ConstraintRule::DateTime {
                message: message(describe_bounds(label, from, to)),
                from,
                to,
            })
        }
    }
}

fn mismatch(descriptor: &AttributeDescriptor, wanted: &str) -> String {
    format!(
        "needs {wanted} content, attribute holds {}",
        descriptor.content_type.as_str()
    )
}

fn bounds<T, F>(data: &Value, parse: F) -> Result<(Option<T>, Option<T>), String>
where
    T: PartialOrd,
    F: Fn(&Value) -> Option<T>,
{
    let Value::Object(map) = data else {
        return Err("expected an object with 'from' and/or 'to'".to_owned());
    };
    let bound = |key: &str| -> Result<Option<T>, String> {
        match map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(raw) => parse(raw)
                .map(Some)
                .ok_or_else(|| format!("unreadable '{key}' bound {raw}")),
        }
    };
    let (from, to) = (bound("from")?, bound("to")?);
    if let (Some(lo), Some(hi)) = (&from, &to) {
        if lo > hi {
            return Err("'from' is after 'to'".to_owned());
        }
    }
    Ok((from, to))
}

fn describe_bounds<T: fmt::Display>(label: &str, from: Option<T>, to: Option<T>) -> String {
    match (from, to) {
        (Some(lo), Some(hi)) => format!("'{label}' must be between {lo} and {hi}"),
        (Some(lo), None) => format!("'{label}' must be at least {lo}"),
        (None, Some(hi)) => format!("'{label}' must be at most {hi}"),
        (None, None) => format!("'{label}' is out of range"),
    }
}

/// Parse RFC 3339, naive date-time, date or time-of-day strings.
///
/// Offsets are normalized to UTC. Dates read as midnight, times as a time on
/// 1970-01-01, so values of one content type compare consistently.
#[must_use]
pub fn parse_moment(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    for fmt in ["%H:%M:%S%.f", "%H:%M"] {
        if let Ok(time) = NaiveTime::parse_from_str(raw, fmt) {
            return NaiveDate::from_ymd_opt(1970, 1, 1).map(|d| d.and_time(time));
        }
    }
    None
}

/// Validate one settled field's value.
///
/// Checks run in order: required, type coercion, membership in offered
/// content, then each compiled constraint against every submitted element.
#[must_use]
pub fn validate_value(
    descriptor: &AttributeDescriptor,
    rules: &[ConstraintRule],
    value: Option<&FieldValue>,
    content: &[AttributeContent],
) -> Vec<ValidationError> {
    let label = descriptor.label().to_owned();
    let Some(value) = value.filter(|v| !v.is_empty()) else {
        return if descriptor.is_required() {
            vec![ValidationError::Required { label }]
        } else {
            Vec::new()
        };
    };

    let submitted = match value.to_submission(descriptor.content_type) {
        Ok(v) => v,
        Err(failure) => {
            return vec![ValidationError::TypeMismatch {
                label,
                expected: failure.expected.as_str().to_owned(),
                found: failure.found,
            }];
        }
    };

    let mut errors = Vec::new();
    if descriptor.properties.list && !content.is_empty() && !value.is_within(content) {
        errors.push(ValidationError::NotInContent {
            label: label.clone(),
        });
    }

    let elements: Vec<&Value> = match &submitted {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };
    for rule in rules {
        if let Some(err) = elements.iter().find_map(|v| check(rule, v)) {
            errors.push(err);
        }
    }
    errors
}

fn check(rule: &ConstraintRule, value: &Value) -> Option<ValidationError> {
    match rule {
        ConstraintRule::Pattern { regex, message } => {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(_) | Value::Bool(_) => value.to_string(),
                _ => return None,
            };
            (!regex.is_match(&text)).then(|| ValidationError::Pattern {
                message: message.clone(),
            })
        }
        ConstraintRule::Range { from, to, message } => {
            let n = value.as_f64()?;
            let below = from.is_some_and(|lo| n < lo);
            let above = to.is_some_and(|hi| n > hi);
            (below || above).then(|| ValidationError::OutOfRange {
                message: message.clone(),
                value: n,
            })
        }
        ConstraintRule::DateTime { from, to, message } => {
            let Some(moment) = value.as_str().and_then(parse_moment) else {
                return Some(ValidationError::DateOutOfRange {
                    message: format!("{value} is not a date or time"),
                });
            };
            let early = from.is_some_and(|lo| moment < lo);
            let late = to.is_some_and(|hi| moment > hi);
            (early || late).then(|| ValidationError::DateOutOfRange {
                message: message.clone(),
            })
        }
    }
}
