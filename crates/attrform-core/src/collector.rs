//! Collection and edit-mode diffing.
//!
//! [`collect_form_attributes`] turns live values into the normalized
//! submission list. It is pure over its inputs, so it works both for a
//! [`FormSession`](crate::session::FormSession) and for values gathered
//! elsewhere.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::descriptor::{AttributeDescriptor, AttributeType, AttributeValue};
use crate::value::FieldValue;

/// Live values keyed by scope, then attribute name.
///
/// A nested group form lives in scope `{parent}/{group}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormValues {
    scopes: BTreeMap<String, BTreeMap<String, FieldValue>>,
}

impl FormValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, scope: &str, name: &str, value: FieldValue) {
        self.scopes
            .entry(scope.to_owned())
            .or_default()
            .insert(name.to_owned(), value);
    }

    #[must_use]
    pub fn get(&self, scope: &str, name: &str) -> Option<&FieldValue> {
        self.scopes.get(scope)?.get(name)
    }

    pub fn remove(&mut self, scope: &str, name: &str) -> Option<FieldValue> {
        self.scopes.get_mut(scope)?.remove(name)
    }

    /// Values of one scope, by name.
    pub fn scope(&self, scope: &str) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.scopes
            .get(scope)
            .into_iter()
            .flatten()
            .map(|(name, value)| (name.as_str(), value))
    }
}

/// Scope of the form nested under `name`.
#[must_use]
pub fn nested_scope(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_owned()
    } else {
        format!("{scope}/{name}")
    }
}

/// Collect the submission list for one scope.
///
/// - Info attributes are never emitted.
/// - Hidden attributes are emitted only when they carry constant content.
/// - Read-only attributes fall back to their content when no value is set.
/// - Empty values are skipped.
/// - A group item carrying a nested attribute set is emitted with
///   `attributes` replaced by the nested form's collected values.
///
/// Values that fail coercion are skipped with a warning; validation reports
/// them before submission.
#[must_use]
pub fn collect_form_attributes(
    scope: &str,
    descriptors: &[AttributeDescriptor],
    values: &FormValues,
) -> Vec<AttributeValue> {
    let mut seen = BTreeSet::new();
    let mut collected = Vec::new();

    for descriptor in descriptors {
        if descriptor.attribute_type == AttributeType::Info || !seen.insert(&descriptor.name) {
            continue;
        }

        let live = values.get(scope, &descriptor.name).filter(|v| !v.is_empty());
        let value = if !descriptor.is_visible() {
            constant(descriptor)
        } else if descriptor.properties.read_only {
            live.cloned().or_else(|| constant(descriptor))
        } else {
            live.cloned()
        };
        let Some(value) = value else {
            continue;
        };

        let submitted = match (&value, descriptor.attribute_type) {
            (FieldValue::Item(item), AttributeType::Group) => match item.nested_descriptors() {
                Some(nested) => {
                    let inner = collect_form_attributes(
                        &nested_scope(scope, &descriptor.name),
                        &nested,
                        values,
                    );
                    let mut data = item.data.clone();
                    if let Value::Object(map) = &mut data {
                        map.insert(
                            "attributes".to_owned(),
                            serde_json::to_value(inner).unwrap_or(Value::Array(Vec::new())),
                        );
                    }
                    Ok(data)
                }
                None => value.to_submission(descriptor.content_type),
            },
            _ => value.to_submission(descriptor.content_type),
        };

        match submitted {
            Ok(value) => collected.push(AttributeValue {
                uuid: Some(descriptor.uuid.clone()),
                name: descriptor.name.clone(),
                value,
            }),
            Err(failure) => warn!(
                scope,
                field = %descriptor.name,
                expected = failure.expected.as_str(),
                found = %failure.found,
                "value skipped, cannot coerce"
            ),
        }
    }
    collected
}

fn constant(descriptor: &AttributeDescriptor) -> Option<FieldValue> {
    let first = descriptor.content.first()?;
    Some(if descriptor.is_multi_select() {
        FieldValue::Items(descriptor.content.clone())
    } else if descriptor.is_selectable() {
        FieldValue::Item(first.clone())
    } else {
        FieldValue::Scalar(first.data.clone())
    })
}

/// How a collected attribute relates to the persisted entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    /// Not persisted before.
    New,
    Modified,
    Unchanged,
    /// Persisted but no longer collected.
    Removed,
    /// Not persisted before and brought in by a dependency change.
    Surfaced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub name: String,
    pub status: ChangeStatus,
    /// Collected value, `None` when removed.
    pub value: Option<Value>,
    /// Persisted value, `None` when new.
    pub previous: Option<Value>,
}

/// Compare collected values against the persisted ones by name.
///
/// Collected attributes come first in collection order, then removals in
/// persisted order.
#[must_use]
pub fn diff_attributes(
    collected: &[AttributeValue],
    original: &[AttributeValue],
    surfaced: &BTreeSet<String>,
) -> Vec<AttributeChange> {
    let mut changes: Vec<AttributeChange> = collected
        .iter()
        .map(|current| {
            let previous = original.iter().find(|o| o.name == current.name);
            let status = match previous {
                Some(p) if p.value == current.value => ChangeStatus::Unchanged,
                Some(_) => ChangeStatus::Modified,
                None if surfaced.contains(&current.name) => ChangeStatus::Surfaced,
                None => ChangeStatus::New,
            };
            AttributeChange {
                uuid: current.uuid.clone().or_else(|| previous.and_then(|p| p.uuid.clone())),
                name: current.name.clone(),
                status,
                value: Some(current.value.clone()),
                previous: previous.map(|p| p.value.clone()),
            }
        })
        .collect();

    changes.extend(
        original
            .iter()
            .filter(|o| !collected.iter().any(|c| c.name == o.name))
            .map(|o| AttributeChange {
                uuid: o.uuid.clone(),
                name: o.name.clone(),
                status: ChangeStatus::Removed,
                value: None,
                previous: Some(o.value.clone()),
            }),
    );
    changes
}

/// How a form is submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitMode {
    /// Every collected value.
    #[default]
    Create,
    /// Deltas, surfaced fields, and removals as `null`.
    Update,
}

/// Values to send for an update.
#[must_use]
pub fn select_for_submit(changes: &[AttributeChange]) -> Vec<AttributeValue> {
    changes
        .iter()
        .filter_map(|change| {
            let value = match change.status {
                ChangeStatus::Unchanged => return None,
                ChangeStatus::Removed => Value::Null,
                ChangeStatus::New | ChangeStatus::Modified | ChangeStatus::Surfaced => {
                    change.value.clone().unwrap_or(Value::Null)
                }
            };
            Some(AttributeValue {
                uuid: change.uuid.clone(),
                name: change.name.clone(),
                value,
            })
        })
        .collect()
}
