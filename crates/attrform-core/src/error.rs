//! Error types for `attrform-core`.
//!
//! Errors are scoped to the attribute that produced them. None of them abort a
//! whole form session: configuration and resolution errors park the affected
//! field in [`FieldState::Error`](crate::session::FieldState::Error), validation
//! errors block submission until corrected.

use attrform_transport::TransportError;

/// Errors in the descriptor set itself. Surfaced once per affected subtree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    /// The callback mappings form a dependency cycle.
    #[error("dependency cycle between attributes: {}", members.join(" -> "))]
    Cycle { members: Vec<String> },

    /// A mapping references an attribute that is not part of the set.
    #[error("attribute '{attribute}' maps from unknown attribute '{missing}'")]
    DanglingReference { attribute: String, missing: String },

    /// An upstream attribute is itself misconfigured.
    #[error("attribute '{attribute}' depends on misconfigured attribute '{upstream}'")]
    BrokenUpstream { attribute: String, upstream: String },

    /// Two descriptors share a name; the later one is ignored.
    #[error("duplicate attribute name '{name}' (uuid {uuid})")]
    DuplicateName { name: String, uuid: String },

    /// A constraint could not be compiled.
    #[error("invalid {kind} constraint on '{attribute}': {reason}")]
    InvalidConstraint {
        attribute: String,
        kind: String,
        reason: String,
    },
}

/// Errors from callback resolution. Field-scoped and retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    /// The transport failed (network, timeout, or non-2xx status).
    #[error("callback failed: {message}")]
    Transport {
        message: String,
        status_code: Option<u16>,
    },

    /// The connector answered with something that is not attribute content.
    #[error("malformed callback response: {reason}")]
    MalformedResponse { reason: String },

    /// The callback path still contains a placeholder no mapping fills.
    #[error("path variable '{name}' of '{context}' is not mapped")]
    UnboundPathVariable { context: String, name: String },

    /// A list attribute resolved to no selectable values.
    #[error("callback returned no content for list attribute '{attribute}'")]
    EmptyContent { attribute: String },
}

impl From<TransportError> for ResolutionError {
    fn from(err: TransportError) -> Self {
        Self::Transport {
            status_code: err.status_code(),
            message: err.to_string(),
        }
    }
}

/// Per-field validation failures. They block submission and clear once the
/// value is corrected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// A required attribute has no value.
    #[error("'{label}' is required")]
    Required { label: String },

    /// The value cannot be coerced to the attribute's content type.
    #[error("'{label}' expects {expected}, got {found}")]
    TypeMismatch {
        label: String,
        expected: String,
        found: String,
    },

    /// A selection is not one of the offered content items.
    #[error("'{label}' must be one of the offered values")]
    NotInContent { label: String },

    /// A regular-expression constraint did not match.
    #[error("{message}")]
    Pattern { message: String },

    /// A numeric range constraint failed.
    #[error("{message}")]
    OutOfRange { message: String, value: f64 },

    /// A date/time range constraint failed, or the value is not a date.
    #[error("{message}")]
    DateOutOfRange { message: String },

    /// Attributes nested under the selected group item are invalid.
    #[error("'{label}' has {count} invalid nested attribute(s)")]
    NestedInvalid { label: String, count: usize },
}

/// What a field error carries while the field sits in `Error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    /// Not retryable within the session.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Retryable with [`FormEvent::Retry`](crate::session::FormEvent::Retry).
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

/// Errors returned when an event cannot be applied to a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No field with this path exists.
    #[error("unknown attribute '{path}'")]
    UnknownField { path: String },

    /// The field cannot take user input in its current state.
    #[error("attribute '{path}' is not editable while {state}")]
    NotEditable { path: String, state: String },

    /// Only resolution errors can be retried.
    #[error("attribute '{path}' has nothing to retry")]
    NotRetryable { path: String },
}

/// Submission refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubmitError {
    /// Required fields are unsettled or values fail validation.
    #[error("submission blocked by {} issue(s)", .0.len())]
    Blocked(Vec<crate::validation::FieldIssue>),
}
