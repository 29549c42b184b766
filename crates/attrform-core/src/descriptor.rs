//! Attribute descriptor and content model.
//!
//! These are the wire shapes a connector declares for an entity kind. They
//! are immutable for the duration of a form session; only content and values
//! change as the user edits and callbacks resolve.

use std::collections::BTreeSet;

use attrform_transport::CallbackMethod;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Kind of attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    /// Read-only display information. Never submitted.
    #[serde(alias = "Info")]
    Info,
    /// Plain data attribute.
    #[serde(alias = "Data")]
    Data,
    /// Structured content, optionally carrying nested attribute sets.
    #[serde(alias = "Group")]
    Group,
    /// Custom (platform-level) attribute.
    #[serde(alias = "Custom")]
    Custom,
}

/// Primitive kind of an attribute's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    String,
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    Time,
    Datetime,
    File,
    Credential,
    Secret,
    Object,
    Codeblock,
}

impl ContentType {
    /// Content types submitted as JSON strings.
    #[must_use]
    pub fn is_textual(self) -> bool {
        matches!(
            self,
            Self::String
                | Self::Text
                | Self::Date
                | Self::Time
                | Self::Datetime
                | Self::Secret
                | Self::Codeblock
        )
    }

    /// Content types submitted as JSON numbers.
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    /// Content types whose values are temporal strings.
    #[must_use]
    pub fn is_temporal(self) -> bool {
        matches!(self, Self::Date | Self::Time | Self::Datetime)
    }

    /// Wire name, as used in error messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Time => "time",
            Self::Datetime => "datetime",
            Self::File => "file",
            Self::Credential => "credential",
            Self::Secret => "secret",
            Self::Object => "object",
            Self::Codeblock => "codeblock",
        }
    }
}

/// Display and behaviour flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeProperties {
    /// Human label.
    pub label: String,
    /// Hidden attributes are neither rendered nor submitted, except constants.
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub read_only: bool,
    /// The value is chosen from `content`.
    #[serde(default)]
    pub list: bool,
    #[serde(default)]
    pub multi_select: bool,
    /// Display grouping tag. Unrelated to [`AttributeType::Group`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

fn default_visible() -> bool {
    true
}

/// Constraint kinds understood by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConstraintType {
    /// `data` is a regular expression the value must match.
    RegExp,
    /// `data` is `{from?, to?}`, inclusive numeric bounds.
    Range,
    /// `data` is `{from?, to?}`, inclusive date/time bounds.
    DateTime,
}

/// One declared validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeConstraint {
    #[serde(rename = "type")]
    pub kind: ConstraintType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// One legal or fixed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeContent {
    /// Submission payload.
    pub data: Value,
    /// Display label for structured `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl AttributeContent {
    /// Content item with no reference label.
    #[must_use]
    pub fn new(data: Value) -> Self {
        Self {
            data,
            reference: None,
        }
    }

    /// Content item with a display label.
    #[must_use]
    pub fn labelled(reference: impl Into<String>, data: Value) -> Self {
        Self {
            data,
            reference: Some(reference.into()),
        }
    }

    /// Label to show for this item.
    #[must_use]
    pub fn display(&self) -> String {
        match (&self.reference, &self.data) {
            (Some(reference), _) => reference.clone(),
            (None, Value::String(s)) => s.clone(),
            (None, other) => other.to_string(),
        }
    }

    /// Nested attribute set carried by a group item under `data.attributes`.
    #[must_use]
    pub fn nested_descriptors(&self) -> Option<Vec<AttributeDescriptor>> {
        let raw = self.data.get("attributes")?;
        serde_json::from_value(raw.clone()).ok()
    }

    /// Whether `data` denotes this item.
    ///
    /// Items carrying nested attribute sets are compared without their
    /// `attributes` key, since a persisted selection stores collected values
    /// there rather than descriptors.
    #[must_use]
    pub fn matches_data(&self, data: &Value) -> bool {
        if &self.data == data {
            return true;
        }
        match (&self.data, data) {
            (Value::Object(ours), Value::Object(theirs))
                if ours.contains_key("attributes") || theirs.contains_key("attributes") =>
            {
                let strip = |m: &serde_json::Map<String, Value>| {
                    m.iter()
                        .filter(|(k, _)| k.as_str() != "attributes")
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect::<serde_json::Map<_, _>>()
                };
                strip(ours) == strip(theirs)
            }
            _ => false,
        }
    }
}

/// Where a mapped value is placed in the callback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MappingTarget {
    PathVariable,
    QueryParameter,
    RequestBody,
}

/// One input of a callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackMapping {
    /// Dotted path into another attribute's value, e.g. `kind.data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Name the connector expects.
    pub to: String,
    pub targets: BTreeSet<MappingTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_type: Option<AttributeType>,
    /// Literal value, used when `from` is absent or has no value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Declarative rule for fetching an attribute's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeCallback {
    /// Connector-relative path template with `{name}` placeholders.
    #[serde(default)]
    pub callback_context: String,
    #[serde(default)]
    pub callback_method: CallbackMethod,
    #[serde(default)]
    pub mappings: Vec<CallbackMapping>,
}

/// Declaration of one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDescriptor {
    pub uuid: String,
    /// Stable key, unique within a descriptor set.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub attribute_type: AttributeType,
    pub content_type: ContentType,
    pub properties: AttributeProperties,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<AttributeConstraint>,
    /// Legal values (list attributes) or the fixed/default value.
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub content: Vec<AttributeContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_callback: Option<AttributeCallback>,
}

impl AttributeDescriptor {
    #[must_use]
    pub fn label(&self) -> &str {
        if self.properties.label.is_empty() {
            &self.name
        } else {
            &self.properties.label
        }
    }

    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.properties.visible
    }

    #[must_use]
    pub fn is_required(&self) -> bool {
        self.properties.required
    }

    /// Whether the value is picked from content items rather than typed.
    #[must_use]
    pub fn is_selectable(&self) -> bool {
        self.properties.list || self.attribute_type == AttributeType::Group
    }

    #[must_use]
    pub fn is_multi_select(&self) -> bool {
        self.properties.multi_select
    }

    /// Info attributes and read-only attributes never take user input.
    #[must_use]
    pub fn accepts_input(&self) -> bool {
        self.attribute_type != AttributeType::Info && !self.properties.read_only
    }

    #[must_use]
    pub fn has_callback(&self) -> bool {
        self.attribute_callback.is_some()
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<AttributeContent>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<AttributeContent>),
        One(AttributeContent),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::Many(items)) => items,
        Some(OneOrMany::One(item)) => vec![item],
    })
}

/// Submission shape of one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub name: String,
    pub value: Value,
}

impl AttributeValue {
    #[must_use]
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            uuid: None,
            name: name.into(),
            value,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_wire_descriptor_with_single_content() {
        let raw = json!({
            "uuid": "6e0c7a1e",
            "name": "port",
            "type": "Data",
            "contentType": "integer",
            "properties": { "label": "Port", "visible": true, "required": true },
            "content": { "data": 443 }
        });
        let d: AttributeDescriptor = serde_json::from_value(raw).unwrap();
        assert_eq!(d.attribute_type, AttributeType::Data);
        assert_eq!(d.content_type, ContentType::Integer);
        assert_eq!(d.content, vec![AttributeContent::new(json!(443))]);
        assert!(d.is_required());
        assert!(!d.is_selectable());
    }

    #[test]
    fn parses_callback_mappings() {
        let raw = json!({
            "uuid": "u-2",
            "name": "attributes",
            "type": "group",
            "contentType": "object",
            "properties": { "label": "Attributes", "visible": true },
            "attributeCallback": {
                "callbackContext": "v1/kinds/{kind}/attributes",
                "mappings": [
                    { "from": "kind.data", "to": "kind", "targets": ["pathVariable"] },
                    {
                        "to": "profile",
                        "targets": ["queryParameter", "requestBody"],
                        "value": "default"
                    }
                ]
            }
        });
        let d: AttributeDescriptor = serde_json::from_value(raw).unwrap();
        let cb = d.attribute_callback.unwrap();
        assert_eq!(cb.callback_method, CallbackMethod::Post);
        assert_eq!(cb.mappings.len(), 2);
        assert!(cb.mappings[1].targets.contains(&MappingTarget::RequestBody));
        assert_eq!(cb.mappings[1].value, Some(json!("default")));
    }

    #[test]
    fn null_content_is_empty_and_visible_defaults_true() {
        let raw = json!({
            "uuid": "u", "name": "n", "type": "info", "contentType": "string",
            "properties": { "label": "N" }, "content": null
        });
        let d: AttributeDescriptor = serde_json::from_value(raw).unwrap();
        assert!(d.content.is_empty());
        assert!(d.is_visible());
        assert!(!d.accepts_input());
    }

    #[test]
    fn unknown_content_type_is_rejected() {
        let raw = json!({
            "uuid": "u", "name": "n", "type": "data", "contentType": "blob",
            "properties": { "label": "N" }
        });
        assert!(serde_json::from_value::<AttributeDescriptor>(raw).is_err());
    }

    #[test]
    fn matches_data_ignores_nested_attributes() {
        let item = AttributeContent::labelled(
            "Template v2",
            json!({"name": "tpl", "version": 2, "attributes": [{"uuid": "x"}]}),
        );
        assert!(item.matches_data(&json!({"name": "tpl", "version": 2, "attributes": []})));
        assert!(!item.matches_data(&json!({"name": "tpl", "version": 3})));
    }

    #[test]
    fn display_prefers_reference() {
        assert_eq!(AttributeContent::labelled("Basic", json!(1)).display(), "Basic");
        assert_eq!(AttributeContent::new(json!("x")).display(), "x");
        assert_eq!(AttributeContent::new(json!(7)).display(), "7");
    }
}
