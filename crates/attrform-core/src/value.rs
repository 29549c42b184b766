//! Live attribute values.
//!
//! A [`FieldValue`] is what the user (or a hydrated persisted value) has put
//! into a field. It is coerced to the submission shape only when collected,
//! and read through a [`FieldPath`](crate::graph::FieldPath) when another
//! attribute's callback maps from it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::{AttributeContent, AttributeDescriptor, ContentType};

/// An uploaded file (or file-like credential material).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileValue {
    /// Base64 payload.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// The current value of one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Typed input.
    Scalar(Value),
    /// One selected content item.
    Item(AttributeContent),
    /// Several selected content items (`multiSelect`).
    Items(Vec<AttributeContent>),
    /// Uploaded file.
    File(FileValue),
}

/// Why a value could not be coerced to its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoercionFailure {
    pub expected: ContentType,
    pub found: String,
}

impl FieldValue {
    /// Whether this counts as "no value" for required checks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Scalar(Value::Null) => true,
            Self::Scalar(Value::String(s)) => s.trim().is_empty(),
            Self::Items(items) => items.is_empty(),
            Self::File(file) => file.data.is_empty(),
            Self::Scalar(_) | Self::Item(_) => false,
        }
    }

    /// Read a sub-value by path segments.
    ///
    /// The first segment selects `data` (the default) or `reference`; further
    /// segments index into object data. Multi-selections resolve to an array
    /// of per-item results. `null` reads as absent.
    #[must_use]
    pub fn resolve_path(&self, segments: &[String]) -> Option<Value> {
        let resolved = match self {
            Self::Scalar(value) => resolve_in(value, None, segments),
            Self::Item(item) => resolve_in(&item.data, item.reference.as_deref(), segments),
            Self::Items(items) => {
                let values: Vec<Value> = items
                    .iter()
                    .filter_map(|item| {
                        resolve_in(&item.data, item.reference.as_deref(), segments)
                    })
                    .collect();
                if values.is_empty() {
                    None
                } else {
                    Some(Value::Array(values))
                }
            }
            Self::File(file) => match segments.first().map(String::as_str) {
                None | Some("data") => Some(Value::String(file.data.clone())),
                Some("fileName") => file.file_name.clone().map(Value::String),
                Some("contentType") => file.content_type.clone().map(Value::String),
                Some(_) => None,
            },
        };
        resolved.filter(|v| !v.is_null())
    }

    /// Turn a raw persisted or user-entered JSON value into a field value.
    ///
    /// Selectable descriptors look the raw value up in `content` by `data`
    /// so the selection keeps its reference label. Values not found in
    /// content become unlabelled items. Returns `None` for `null`.
    #[must_use]
    pub fn hydrate(
        descriptor: &AttributeDescriptor,
        content: &[AttributeContent],
        raw: &Value,
    ) -> Option<Self> {
        if raw.is_null() {
            return None;
        }

        if descriptor.content_type == ContentType::File {
            if let Ok(file) = serde_json::from_value::<FileValue>(raw.clone()) {
                return Some(Self::File(file));
            }
        }

        if !descriptor.is_selectable() {
            return Some(Self::Scalar(raw.clone()));
        }

        let pick = |raw: &Value| -> AttributeContent {
            // A full content item may be given instead of bare data.
            if let Ok(item) = serde_json::from_value::<AttributeContent>(raw.clone()) {
                if raw.as_object().is_some_and(|o| o.len() <= 2 && o.contains_key("data")) {
                    return content
                        .iter()
                        .find(|c| c.matches_data(&item.data))
                        .cloned()
                        .unwrap_or(item);
                }
            }
            content
                .iter()
                .find(|c| c.matches_data(raw))
                .cloned()
                .unwrap_or_else(|| AttributeContent::new(raw.clone()))
        };

        if descriptor.is_multi_select() {
            let items = match raw {
                Value::Array(values) => values.iter().map(pick).collect(),
                single => vec![pick(single)],
            };
            Some(Self::Items(items))
        } else {
            Some(Self::Item(pick(raw)))
        }
    }

    /// Coerce to the submission shape for `content_type`.
    ///
    /// # Errors
    ///
    /// Returns a [`CoercionFailure`] when the value cannot represent the
    /// content type (e.g. `"abc"` for an integer).
    pub fn to_submission(&self, content_type: ContentType) -> Result<Value, CoercionFailure> {
        match self {
            Self::Scalar(value) => coerce(value, content_type),
            Self::Item(item) => coerce(&item.data, content_type),
            Self::Items(items) => items
                .iter()
                .map(|item| coerce(&item.data, content_type))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::File(file) => match content_type {
                ContentType::File | ContentType::Credential | ContentType::Object => {
                    serde_json::to_value(file).map_err(|_| CoercionFailure {
                        expected: content_type,
                        found: "file".to_owned(),
                    })
                }
                other => Err(CoercionFailure {
                    expected: other,
                    found: "file".to_owned(),
                }),
            },
        }
    }

    /// Keep only selections still present in `content`.
    ///
    /// Returns `None` when nothing survives. Scalars on non-selectable
    /// fields are kept as is.
    #[must_use]
    pub fn retain_in(self, content: &[AttributeContent], selectable: bool) -> Option<Self> {
        if !selectable {
            return Some(self);
        }
        let find = |data: &Value| content.iter().find(|c| c.matches_data(data)).cloned();
        match self {
            Self::Item(item) => find(&item.data).map(Self::Item),
            Self::Scalar(value) => find(&value).map(Self::Item),
            Self::Items(items) => {
                let kept: Vec<_> = items.iter().filter_map(|i| find(&i.data)).collect();
                if kept.is_empty() {
                    None
                } else {
                    Some(Self::Items(kept))
                }
            }
            Self::File(_) => None,
        }
    }

    /// Whether every selected item is one of `content`.
    #[must_use]
    pub fn is_within(&self, content: &[AttributeContent]) -> bool {
        let contains = |data: &Value| content.iter().any(|c| c.matches_data(data));
        match self {
            Self::Item(item) => contains(&item.data),
            Self::Scalar(value) => contains(value),
            Self::Items(items) => items.iter().all(|i| contains(&i.data)),
            Self::File(_) => false,
        }
    }

    /// The selected item, if exactly one.
    #[must_use]
    pub fn as_item(&self) -> Option<&AttributeContent> {
        match self {
            Self::Item(item) => Some(item),
            Self::Scalar(_) | Self::Items(_) | Self::File(_) => None,
        }
    }
}

fn resolve_in(data: &Value, reference: Option<&str>, segments: &[String]) -> Option<Value> {
    let (first, rest) = match segments.split_first() {
        None => return Some(data.clone()),
        Some((first, rest)) => (first.as_str(), rest),
    };
    match first {
        "reference" => reference.map(|r| Value::String(r.to_owned())),
        "data" => index(data, rest),
        _ => index(data, segments),
    }
}

fn index(data: &Value, segments: &[String]) -> Option<Value> {
    let mut current = data;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn kind_of(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_owned()
}

#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn whole_number(f: f64) -> Option<i64> {
    (f.fract() == 0.0 && f.abs() < 9.0e15).then_some(f as i64)
}

fn coerce(value: &Value, content_type: ContentType) -> Result<Value, CoercionFailure> {
    let fail = || CoercionFailure {
        expected: content_type,
        found: match value {
            Value::String(s) => format!("\"{s}\""),
            other => kind_of(other),
        },
    };

    match content_type {
        t if t.is_textual() => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(fail()),
        },
        ContentType::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().and_then(whole_number))
                .map(Value::from)
                .ok_or_else(fail),
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| fail()),
            _ => Err(fail()),
        },
        ContentType::Float => match value {
            Value::Number(n) => n.as_f64().map(Value::from).ok_or_else(fail),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::from)
                .ok_or_else(fail),
            _ => Err(fail()),
        },
        ContentType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
            _ => Err(fail()),
        },
        ContentType::File => match value {
            Value::Object(map) if map.contains_key("data") => Ok(value.clone()),
            _ => Err(fail()),
        },
        // Object, credential and anything else structured pass through.
        _ => Ok(value.clone()),
    }
}
