//! Widget selection.
//!
//! Maps an attribute and its state to an abstract widget kind. Drawing the
//! widget is the host's business.

use serde::Serialize;

use crate::descriptor::{AttributeDescriptor, AttributeType, ContentType};
use crate::session::FieldState;

/// Abstract widget kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "widget", rename_all = "camelCase")]
pub enum Widget {
    Hidden,
    Spinner,
    ErrorNotice,
    ReadOnly,
    TextInput,
    TextArea,
    SecretInput,
    NumberInput { integer: bool },
    Checkbox,
    DatePicker,
    TimePicker,
    DateTimePicker,
    FileUpload,
    CodeEditor,
    Select { multi: bool },
    GroupSelect { multi: bool },
}

/// Pick the widget for a field.
///
/// State wins over type: hidden, loading and errored fields render the same
/// whatever their content type. A pending field renders its input widget;
/// hosts disable it until it settles.
#[must_use]
pub fn widget_for(descriptor: &AttributeDescriptor, state: &FieldState) -> Widget {
    match state {
        FieldState::Hidden => return Widget::Hidden,
        FieldState::Loading => return Widget::Spinner,
        FieldState::Error(_) => return Widget::ErrorNotice,
        FieldState::Pending | FieldState::Ready | FieldState::Edited => {}
    }
    if !descriptor.is_visible() {
        return Widget::Hidden;
    }

    let multi = descriptor.is_multi_select();
    match descriptor.attribute_type {
        AttributeType::Info => return Widget::ReadOnly,
        AttributeType::Group => return Widget::GroupSelect { multi },
        AttributeType::Data | AttributeType::Custom => {}
    }
    if descriptor.properties.read_only {
        return Widget::ReadOnly;
    }
    if descriptor.properties.list {
        return Widget::Select { multi };
    }

    match descriptor.content_type {
        ContentType::String => Widget::TextInput,
        ContentType::Text => Widget::TextArea,
        ContentType::Secret => Widget::SecretInput,
        ContentType::Integer => Widget::NumberInput { integer: true },
        ContentType::Float => Widget::NumberInput { integer: false },
        ContentType::Boolean => Widget::Checkbox,
        ContentType::Date => Widget::DatePicker,
        ContentType::Time => Widget::TimePicker,
        ContentType::Datetime => Widget::DateTimePicker,
        ContentType::File => Widget::FileUpload,
        ContentType::Credential => Widget::Select { multi: false },
        ContentType::Object | ContentType::Codeblock => Widget::CodeEditor,
    }
}
