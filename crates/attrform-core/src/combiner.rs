//! Merge persisted values back onto their descriptors for edit forms.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::descriptor::{AttributeContent, AttributeDescriptor, AttributeType, AttributeValue};
use crate::value::FieldValue;

/// Descriptors with persisted values hydrated, ready for
/// [`FormSession::mount_edit`](crate::session::FormSession::mount_edit).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedAttributes {
    /// Descriptors, with list content extended by persisted selections.
    pub descriptors: Vec<AttributeDescriptor>,
    /// Hydrated values by attribute name.
    pub values: BTreeMap<String, FieldValue>,
    /// Raw persisted values by attribute name.
    pub persisted: BTreeMap<String, Value>,
    /// Persisted values naming no descriptor.
    pub orphans: Vec<AttributeValue>,
}

/// Match persisted values to descriptors by name.
///
/// A selectable descriptor whose content lacks a persisted item gets that
/// item appended, so the content the form shows still includes the current
/// selection before any callback runs. Info attributes and `null` values are
/// not hydrated.
#[must_use]
pub fn combine(
    descriptors: &[AttributeDescriptor],
    persisted: &[AttributeValue],
) -> MergedAttributes {
    let mut merged = MergedAttributes::default();

    for descriptor in descriptors {
        let mut descriptor = descriptor.clone();
        let found = persisted
            .iter()
            .find(|p| p.name == descriptor.name)
            .filter(|p| !p.value.is_null() && descriptor.attribute_type != AttributeType::Info);

        if let Some(found) = found {
            if descriptor.is_selectable() {
                let selected: Vec<&Value> = match &found.value {
                    Value::Array(items) if descriptor.is_multi_select() => items.iter().collect(),
                    single => vec![single],
                };
                for data in selected {
                    if !descriptor.content.iter().any(|c| c.matches_data(data)) {
                        descriptor.content.push(AttributeContent::new(data.clone()));
                    }
                }
            }
            if let Some(value) =
                FieldValue::hydrate(&descriptor, &descriptor.content, &found.value)
            {
                merged.values.insert(descriptor.name.clone(), value);
                merged
                    .persisted
                    .insert(descriptor.name.clone(), found.value.clone());
            }
        }
        merged.descriptors.push(descriptor);
    }

    merged.orphans = persisted
        .iter()
        .filter(|p| !descriptors.iter().any(|d| d.name == p.name))
        .cloned()
        .collect();
    debug!(
        descriptors = merged.descriptors.len(),
        values = merged.values.len(),
        orphans = merged.orphans.len(),
        "persisted values merged"
    );
    merged
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::collector::{FormValues, collect_form_attributes};
    use crate::descriptor::{AttributeProperties, ContentType};
    use serde_json::json;

    fn descriptor(
        name: &str,
        content_type: ContentType,
        list: bool,
        multi: bool,
    ) -> AttributeDescriptor {
        AttributeDescriptor {
            uuid: format!("u-{name}"),
            name: name.to_owned(),
            description: None,
            attribute_type: AttributeType::Data,
            content_type,
            properties: AttributeProperties {
                label: name.to_owned(),
                visible: true,
                required: false,
                read_only: false,
                list,
                multi_select: multi,
                group: None,
            },
            constraints: Vec::new(),
            content: Vec::new(),
            attribute_callback: None,
        }
    }

    #[test]
    fn appends_missing_selections_to_content() {
        let mut kind = descriptor("kind", ContentType::String, true, false);
        kind.content = vec![AttributeContent::labelled("Basic", json!("basic"))];
        let tags = descriptor("tags", ContentType::String, true, true);

        let merged = combine(
            &[kind, tags],
            &[
                AttributeValue::new("kind", json!("basic")),
                AttributeValue::new("tags", json!(["a", "b"])),
            ],
        );
        assert_eq!(merged.descriptors[0].content.len(), 1);
        assert_eq!(
            merged.values["kind"],
            FieldValue::Item(AttributeContent::labelled("Basic", json!("basic")))
        );
        assert_eq!(merged.descriptors[1].content.len(), 2);
        assert!(matches!(&merged.values["tags"], FieldValue::Items(items) if items.len() == 2));
    }

    #[test]
    fn orphans_nulls_and_info_are_not_hydrated() {
        let mut banner = descriptor("banner", ContentType::String, false, false);
        banner.attribute_type = AttributeType::Info;
        let merged = combine(
            &[descriptor("name", ContentType::String, false, false), banner],
            &[
                AttributeValue::new("name", Value::Null),
                AttributeValue::new("banner", json!("x")),
                AttributeValue::new("legacy", json!(1)),
            ],
        );
        assert!(merged.values.is_empty());
        assert_eq!(merged.orphans.len(), 1);
        assert_eq!(merged.orphans[0].name, "legacy");
    }

    #[test]
    fn collect_after_merge_round_trips() {
        let descriptors = vec![
            descriptor("port", ContentType::Integer, false, false),
            descriptor("ratio", ContentType::Float, false, false),
            descriptor("kind", ContentType::String, true, false),
            descriptor("tags", ContentType::String, true, true),
        ];
        let original = vec![
            AttributeValue {
                uuid: Some("u-port".to_owned()),
                name: "port".to_owned(),
                value: json!(8443),
            },
            AttributeValue {
                uuid: Some("u-ratio".to_owned()),
                name: "ratio".to_owned(),
                value: json!(0.25),
            },
            AttributeValue {
                uuid: Some("u-kind".to_owned()),
                name: "kind".to_owned(),
                value: json!("basic"),
            },
            AttributeValue {
                uuid: Some("u-tags".to_owned()),
                name: "tags".to_owned(),
                value: json!(["x", "y"]),
            },
        ];

        let merged = combine(&descriptors, &original);
        let mut values = FormValues::new();
        for (name, value) in &merged.values {
            values.set("", name, value.clone());
        }
        assert_eq!(
            collect_form_attributes("", &merged.descriptors, &values),
            original
        );
    }
}
