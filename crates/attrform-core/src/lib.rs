//! Core library for `attrform`.
//!
//! Contains the attribute descriptor model, the dependency graph between
//! attributes, the callback resolver, the form state machine, validation,
//! widget selection, and the collector/differ used to submit values. This
//! crate depends on `attrform-transport` for the callback transport trait
//! and knows nothing about HTTP or any particular connector.
//!
//! The usual flow:
//!
//! 1. Deserialize [`AttributeDescriptor`](descriptor::AttributeDescriptor)s.
//! 2. [`FormSession::mount`](session::FormSession::mount) them, or
//!    [`combine`](combiner::combine) them with persisted values and
//!    [`mount_edit`](session::FormSession::mount_edit).
//! 3. Feed user edits and callback outcomes through
//!    [`FormSession::apply`](session::FormSession::apply), or let a
//!    [`FormDriver`](driver::FormDriver) run the callbacks.
//! 4. [`submit`](session::FormSession::submit) the collected values.

pub mod collector;
pub mod combiner;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod graph;
pub mod render;
pub mod resolver;
pub mod session;
pub mod validation;
pub mod value;
