//! Form state machine.
//!
//! A [`FormSession`] owns one descriptor set, its dependency graph and one
//! [`FieldEntry`] per attribute. Everything that changes a field goes through
//! [`FormSession::apply`], which returns the side effects the caller has to
//! perform: start a callback ([`Effect::Resolve`]) or abandon one
//! ([`Effect::Cancel`]).
//!
//! ```text
//!            mount / upstream unsettled
//!   Pending <─────────────────────────────┐
//!      │ plan ready                        │
//!      v                                   │
//!   Loading ──failure──> Error ──Retry─────┘
//!      │ success
//!      v
//!   Ready ──ValueChanged──> Edited
//! ```
//!
//! Hidden attributes never resolve. Group items carrying an `attributes` set
//! open a nested session whose fields are addressed as `group/child`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use attrform_transport::CallbackRequest;
use serde_json::Value;
use tracing::{debug, info};

use crate::collector::{
    AttributeChange, FormValues, SubmitMode, collect_form_attributes, diff_attributes,
    nested_scope, select_for_submit,
};
use crate::combiner::{MergedAttributes, combine};
use crate::descriptor::{AttributeContent, AttributeDescriptor, AttributeType, AttributeValue};
use crate::error::{FieldError, ResolutionError, SessionError, SubmitError, ValidationError};
use crate::graph::{DependencyGraph, FieldPath};
use crate::resolver::{CallbackResolver, RequestPlan, ResolutionKey};
use crate::validation::{
    ConstraintRule, FieldIssue, IssueKind, compile_constraints, validate_value,
};
use crate::value::FieldValue;

/// Lifecycle state of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldState {
    /// Not rendered. Constant content still feeds mappings.
    Hidden,
    /// Waiting for upstream values.
    Pending,
    /// A callback is in flight.
    Loading,
    /// Content available, no user value.
    Ready,
    /// Holds a user (or persisted) value.
    Edited,
    Error(FieldError),
}

impl FieldState {
    /// Whether downstream callbacks may read this field.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Hidden | Self::Ready | Self::Edited)
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hidden => "hidden",
            Self::Pending => "pending",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Edited => "edited",
            Self::Error(_) => "error",
        }
    }
}

impl fmt::Display for FieldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A planned resolution, handed out in [`Effect::Resolve`] and handed back
/// with its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionTicket {
    /// Field path, `group/child` for nested fields.
    pub path: String,
    pub generation: u64,
    pub request: CallbackRequest,
    pub key: ResolutionKey,
}

/// Inputs to the state machine.
#[derive(Debug, Clone)]
pub enum FormEvent {
    /// User input. `None` clears the field.
    ValueChanged {
        path: String,
        value: Option<FieldValue>,
    },
    ResolutionSucceeded {
        ticket: ResolutionTicket,
        content: Vec<AttributeContent>,
    },
    ResolutionFailed {
        ticket: ResolutionTicket,
        error: ResolutionError,
    },
    /// Re-plan a field sitting in a resolution error.
    Retry { path: String },
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Resolve(ResolutionTicket),
    /// Abandon the in-flight resolution of this field.
    Cancel { path: String },
}

/// Outcome of one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    pub effects: Vec<Effect>,
    /// The event was a response for a superseded generation and was ignored.
    pub stale: bool,
}

impl Transition {
    /// Tickets to resolve, in emission order.
    pub fn tickets(&self) -> impl Iterator<Item = &ResolutionTicket> {
        self.effects.iter().filter_map(|e| match e {
            Effect::Resolve(ticket) => Some(ticket),
            Effect::Cancel { .. } => None,
        })
    }

    fn prefixed(mut self, name: &str) -> Self {
        for effect in &mut self.effects {
            match effect {
                Effect::Resolve(ticket) => ticket.path = format!("{name}/{}", ticket.path),
                Effect::Cancel { path } => *path = format!("{name}/{path}"),
            }
        }
        self
    }
}

/// Live state of one attribute.
#[derive(Debug)]
pub struct FieldEntry {
    descriptor: AttributeDescriptor,
    state: FieldState,
    content: Vec<AttributeContent>,
    value: Option<FieldValue>,
    generation: u64,
    memo: Option<ResolutionKey>,
    rules: Vec<ConstraintRule>,
    nested: Option<Box<FormSession>>,
    surfaced: bool,
}

impl FieldEntry {
    #[must_use]
    pub fn descriptor(&self) -> &AttributeDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    #[must_use]
    pub fn state(&self) -> &FieldState {
        &self.state
    }

    /// Current content: the declared content until a callback replaces it.
    #[must_use]
    pub fn content(&self) -> &[AttributeContent] {
        &self.content
    }

    #[must_use]
    pub fn value(&self) -> Option<&FieldValue> {
        self.value.as_ref()
    }

    /// Generation of the latest planned resolution.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Session opened for the selected group item, if any.
    #[must_use]
    pub fn nested(&self) -> Option<&FormSession> {
        self.nested.as_deref()
    }

    /// Appeared through a dependency change after an edit-mode mount.
    #[must_use]
    pub fn is_surfaced(&self) -> bool {
        self.surfaced
    }

    fn is_loading(&self) -> bool {
        self.state == FieldState::Loading
    }

    /// Content-derived value for hidden constants and read-only fields.
    fn content_default(&self) -> Option<FieldValue> {
        let first = self.content.first()?;
        Some(if self.descriptor.is_multi_select() {
            FieldValue::Items(self.content.clone())
        } else if self.descriptor.is_selectable() {
            FieldValue::Item(first.clone())
        } else {
            FieldValue::Scalar(first.data.clone())
        })
    }

    fn takes_content_value(&self) -> bool {
        !self.descriptor.is_visible() || self.descriptor.properties.read_only
    }
}

/// One form instance over one descriptor set.
#[derive(Debug)]
pub struct FormSession {
    scope: String,
    graph: DependencyGraph,
    fields: Vec<FieldEntry>,
    index: HashMap<String, usize>,
    generations: Arc<AtomicU64>,
    originals: Option<Vec<AttributeValue>>,
    /// Item data this nested session was opened from.
    origin: Option<Value>,
}

impl FormSession {
    /// Mount a fresh form.
    ///
    /// Returns the session and the resolutions to start: every callback
    /// attribute whose mappings are satisfied by declared content.
    #[must_use]
    pub fn mount(scope: &str, descriptors: &[AttributeDescriptor]) -> (Self, Transition) {
        Self::mount_with(scope, descriptors, Arc::new(AtomicU64::new(0)), BTreeMap::new(), None)
    }

    /// Mount an edit form from persisted values.
    ///
    /// Fields with a persisted value start `Edited` and keep their merged
    /// content without a callback round trip. Their current inputs are
    /// recorded as already resolved, so only a later upstream edit reloads
    /// them.
    #[must_use]
    pub fn mount_edit(scope: &str, merged: MergedAttributes) -> (Self, Transition) {
        let MergedAttributes {
            descriptors,
            values,
            persisted,
            orphans,
        } = merged;
        if !orphans.is_empty() {
            debug!(
                scope,
                orphans = ?orphans.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
                "persisted values without descriptors ignored"
            );
        }
        let seeded = values
            .into_iter()
            .map(|(name, value)| {
                let raw = persisted.get(&name).cloned();
                (name, (value, raw))
            })
            .collect();
        let originals: Vec<AttributeValue> = descriptors
            .iter()
            .filter_map(|d| {
                persisted.get(&d.name).map(|raw| AttributeValue {
                    uuid: Some(d.uuid.clone()),
                    name: d.name.clone(),
                    value: raw.clone(),
                })
            })
            .collect();
        Self::mount_with(
            scope,
            &descriptors,
            Arc::new(AtomicU64::new(0)),
            seeded,
            Some(originals),
        )
    }

    fn mount_with(
        scope: &str,
        descriptors: &[AttributeDescriptor],
        generations: Arc<AtomicU64>,
        mut seeded: BTreeMap<String, (FieldValue, Option<Value>)>,
        originals: Option<Vec<AttributeValue>>,
    ) -> (Self, Transition) {
        let graph = DependencyGraph::build(descriptors);
        let mut session = Self {
            scope: scope.to_owned(),
            fields: Vec::with_capacity(descriptors.len()),
            index: HashMap::new(),
            graph,
            generations,
            originals,
            origin: None,
        };

        for descriptor in descriptors {
            if session.index.contains_key(&descriptor.name) {
                continue;
            }
            let (rules, constraint_error) = match compile_constraints(descriptor) {
                Ok(rules) => (rules, None),
                Err(err) => (Vec::new(), Some(err)),
            };
            let mut entry = FieldEntry {
                state: FieldState::Ready,
                content: descriptor.content.clone(),
                value: None,
                generation: 0,
                memo: None,
                rules,
                nested: None,
                surfaced: false,
                descriptor: descriptor.clone(),
            };

            if let Some(err) = session.graph.broken().get(&descriptor.name) {
                entry.state = FieldState::Error(err.clone().into());
            } else if let Some(err) = constraint_error {
                entry.state = FieldState::Error(err.into());
            } else if !descriptor.is_visible() {
                entry.state = FieldState::Hidden;
                entry.value = entry.content_default();
            } else if let Some((value, _)) = seeded.get(&descriptor.name) {
                entry.state = FieldState::Edited;
                entry.value = Some(value.clone());
            } else if descriptor.has_callback() {
                entry.state = FieldState::Pending;
            } else if entry.takes_content_value() {
                entry.value = entry.content_default();
            }

            session
                .index
                .insert(descriptor.name.clone(), session.fields.len());
            session.fields.push(entry);
        }

        let mut transition = Transition::default();
        let order = session.graph.order().to_vec();
        for name in &order {
            let Some(idx) = session.index.get(name).copied() else {
                continue;
            };
            let entry = &session.fields[idx];
            if entry.state == FieldState::Edited && entry.descriptor.has_callback() {
                // Seeded from persisted data: inputs count as resolved.
                if let Ok(RequestPlan::Ready { key, .. }) = session.plan(idx) {
                    session.fields[idx].memo = Some(key);
                }
                continue;
            }
            session.reevaluate(idx, &mut transition);
        }

        for idx in 0..session.fields.len() {
            let raw = seeded
                .remove(session.fields[idx].name())
                .and_then(|(_, raw)| raw);
            session.sync_nested(idx, raw.as_ref(), &mut transition);
        }

        info!(
            scope,
            fields = session.fields.len(),
            resolving = transition.tickets().count(),
            "form session mounted"
        );
        (session, transition)
    }

    /// Apply one event. The only way field state changes after mount.
    ///
    /// # Errors
    ///
    /// - [`SessionError::UnknownField`] for a path naming no field.
    /// - [`SessionError::NotEditable`] for input to a field that is
    ///   read-only, informational, hidden or not settled.
    /// - [`SessionError::NotRetryable`] for a retry of a field not in a
    ///   resolution error.
    pub fn apply(&mut self, event: FormEvent) -> Result<Transition, SessionError> {
        match event {
            FormEvent::ValueChanged { path, value } => self.change_value(&path, value),
            FormEvent::ResolutionSucceeded { ticket, content } => {
                Ok(self.complete(&ticket.path, ticket.generation, Ok(content)))
            }
            FormEvent::ResolutionFailed { ticket, error } => {
                Ok(self.complete(&ticket.path, ticket.generation, Err(error)))
            }
            FormEvent::Retry { path } => self.retry(&path),
        }
    }

    fn change_value(
        &mut self,
        path: &str,
        value: Option<FieldValue>,
    ) -> Result<Transition, SessionError> {
        if let Some((group, rest)) = path.split_once('/') {
            let nested = self.nested_mut(group, path)?;
            return nested
                .change_value(rest, value)
                .map(|t| t.prefixed(group))
                .map_err(|e| rescope(e, group));
        }

        let idx = self.position(path)?;
        let entry = &mut self.fields[idx];
        if !entry.descriptor.accepts_input()
            || !matches!(entry.state, FieldState::Ready | FieldState::Edited)
        {
            return Err(SessionError::NotEditable {
                path: path.to_owned(),
                state: entry.state.to_string(),
            });
        }

        entry.value = value.filter(|v| !v.is_empty());
        entry.state = if entry.value.is_some() {
            FieldState::Edited
        } else {
            FieldState::Ready
        };
        debug!(field = %path, state = %entry.state, "value changed");

        let mut transition = Transition::default();
        self.sync_nested(idx, None, &mut transition);
        self.cascade(path, &mut transition);
        Ok(transition)
    }

    fn complete(
        &mut self,
        path: &str,
        generation: u64,
        outcome: Result<Vec<AttributeContent>, ResolutionError>,
    ) -> Transition {
        let stale = Transition {
            effects: Vec::new(),
            stale: true,
        };
        if let Some((group, rest)) = path.split_once('/') {
            let Ok(nested) = self.nested_mut(group, path) else {
                debug!(field = %path, generation, "discarding response for closed nested form");
                return stale;
            };
            return nested.complete(rest, generation, outcome).prefixed(group);
        }

        let Some(idx) = self.index.get(path).copied() else {
            return stale;
        };
        let entry = &mut self.fields[idx];
        if entry.generation != generation || !entry.is_loading() {
            debug!(
                field = %path,
                generation,
                current = entry.generation,
                "discarding stale resolution"
            );
            return stale;
        }

        match outcome {
            Ok(content) => {
                let selectable = entry.descriptor.is_selectable();
                entry.value = entry
                    .value
                    .take()
                    .and_then(|v| v.retain_in(&content, selectable));
                entry.content = content;
                if entry.descriptor.properties.read_only {
                    entry.value = entry.content_default();
                }
                if entry.descriptor.properties.list && entry.content.is_empty() {
                    entry.state = FieldState::Error(
                        ResolutionError::EmptyContent {
                            attribute: entry.descriptor.name.clone(),
                        }
                        .into(),
                    );
                } else {
                    entry.state = if entry.value.is_some() {
                        FieldState::Edited
                    } else {
                        FieldState::Ready
                    };
                }
                if let Some(originals) = &self.originals {
                    entry.surfaced = !originals.iter().any(|o| o.name == entry.descriptor.name);
                }
                debug!(field = %path, generation, state = %entry.state, "resolution applied");
            }
            Err(error) => {
                info!(field = %path, generation, %error, "resolution failed");
                entry.state = FieldState::Error(error.into());
            }
        }

        let mut transition = Transition::default();
        self.sync_nested(idx, None, &mut transition);
        self.cascade(path, &mut transition);
        transition
    }

    fn retry(&mut self, path: &str) -> Result<Transition, SessionError> {
        if let Some((group, rest)) = path.split_once('/') {
            let nested = self.nested_mut(group, path)?;
            return nested
                .retry(rest)
                .map(|t| t.prefixed(group))
                .map_err(|e| rescope(e, group));
        }

        let idx = self.position(path)?;
        let entry = &mut self.fields[idx];
        if !matches!(entry.state, FieldState::Error(FieldError::Resolution(_))) {
            return Err(SessionError::NotRetryable {
                path: path.to_owned(),
            });
        }
        entry.state = FieldState::Pending;
        entry.memo = None;

        let mut transition = Transition::default();
        self.reevaluate(idx, &mut transition);
        Ok(transition)
    }

    /// Re-evaluate everything downstream of `name`, in dependency order.
    fn cascade(&mut self, name: &str, transition: &mut Transition) {
        for downstream in self.graph.downstream(name) {
            if let Some(idx) = self.index.get(&downstream).copied() {
                self.reevaluate(idx, transition);
                self.sync_nested(idx, None, transition);
            }
        }
    }

    /// Bring one callback field in line with its upstream values.
    fn reevaluate(&mut self, idx: usize, transition: &mut Transition) {
        let entry = &self.fields[idx];
        if !entry.descriptor.has_callback()
            || matches!(
                entry.state,
                FieldState::Hidden | FieldState::Error(FieldError::Configuration(_))
            )
        {
            return;
        }

        let upstream_settled = self
            .graph
            .upstream(entry.name())
            .all(|u| self.index.get(u).is_some_and(|&i| self.fields[i].state.is_settled()));
        let plan = if upstream_settled {
            self.plan(idx)
        } else {
            Ok(RequestPlan::Unsatisfied {
                missing: self.graph.upstream(entry.name()).map(str::to_owned).collect(),
            })
        };

        let next_generation = || self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        match plan {
            Ok(RequestPlan::Ready { request, key }) => {
                let entry = &self.fields[idx];
                if entry.memo.as_ref() == Some(&key) && entry.state != FieldState::Pending {
                    return;
                }
                let generation = next_generation();
                let entry = &mut self.fields[idx];
                if entry.is_loading() {
                    transition.effects.push(Effect::Cancel {
                        path: entry.descriptor.name.clone(),
                    });
                }
                entry.generation = generation;
                entry.memo = Some(key.clone());
                entry.state = FieldState::Loading;
                debug!(field = %entry.descriptor.name, generation, %key, "resolution planned");
                transition.effects.push(Effect::Resolve(ResolutionTicket {
                    path: entry.descriptor.name.clone(),
                    generation,
                    request,
                    key,
                }));
            }
            Ok(RequestPlan::Unsatisfied { missing }) => {
                let entry = &self.fields[idx];
                if entry.state == FieldState::Pending && entry.memo.is_none() {
                    return;
                }
                let generation = next_generation();
                let entry = &mut self.fields[idx];
                if entry.is_loading() {
                    transition.effects.push(Effect::Cancel {
                        path: entry.descriptor.name.clone(),
                    });
                }
                debug!(field = %entry.descriptor.name, ?missing, "waiting for upstream values");
                entry.generation = generation;
                entry.memo = None;
                entry.state = FieldState::Pending;
                entry.value = None;
                entry.content.clear();
            }
            Err(error) => {
                let generation = next_generation();
                let entry = &mut self.fields[idx];
                if entry.is_loading() {
                    transition.effects.push(Effect::Cancel {
                        path: entry.descriptor.name.clone(),
                    });
                }
                info!(field = %entry.descriptor.name, %error, "callback cannot be planned");
                entry.generation = generation;
                entry.memo = None;
                entry.state = FieldState::Error(error.into());
            }
        }
    }

    fn plan(&self, idx: usize) -> Result<RequestPlan, ResolutionError> {
        let entry = &self.fields[idx];
        CallbackResolver::plan(
            &entry.descriptor,
            self.graph.mappings(entry.name()),
            |path| self.lookup(path),
        )
    }

    fn lookup(&self, path: &FieldPath) -> Option<Value> {
        let entry = &self.fields[*self.index.get(&path.attribute)?];
        if !entry.state.is_settled() {
            return None;
        }
        entry.value.as_ref()?.resolve_path(&path.segments)
    }

    /// Open, keep or close the nested session of a group field so it matches
    /// the selected item.
    fn sync_nested(&mut self, idx: usize, persisted: Option<&Value>, transition: &mut Transition) {
        let entry = &self.fields[idx];
        let wanted = if entry.descriptor.attribute_type == AttributeType::Group
            && entry.state.is_settled()
        {
            entry
                .value
                .as_ref()
                .and_then(FieldValue::as_item)
                .and_then(|item| item.nested_descriptors().map(|d| (item.data.clone(), d)))
        } else {
            None
        };

        let current = entry.nested.as_ref().and_then(|n| n.origin.clone());
        let name = entry.descriptor.name.clone();
        match wanted {
            Some((data, _)) if current.as_ref() == Some(&data) => {}
            Some((data, descriptors)) => {
                self.close_nested(idx, transition);
                let scope = nested_scope(&self.scope, &name);
                let seeded = persisted
                    .and_then(|raw| raw.get("attributes"))
                    .and_then(|raw| serde_json::from_value::<Vec<AttributeValue>>(raw.clone()).ok())
                    .map(|values| combine(&descriptors, &values));
                let (mut nested, opened) = match seeded {
                    Some(merged) => {
                        let originals = merged
                            .persisted
                            .iter()
                            .map(|(n, v)| AttributeValue::new(n.clone(), v.clone()))
                            .collect();
                        let values = merged
                            .values
                            .into_iter()
                            .map(|(n, v)| {
                                let raw = merged.persisted.get(&n).cloned();
                                (n, (v, raw))
                            })
                            .collect();
                        Self::mount_with(
                            &scope,
                            &merged.descriptors,
                            Arc::clone(&self.generations),
                            values,
                            Some(originals),
                        )
                    }
                    None => Self::mount_with(
                        &scope,
                        &descriptors,
                        Arc::clone(&self.generations),
                        BTreeMap::new(),
                        None,
                    ),
                };
                nested.origin = Some(data);
                debug!(field = %name, nested = nested.fields.len(), "nested form opened");
                transition.effects.extend(opened.prefixed(&name).effects);
                self.fields[idx].nested = Some(Box::new(nested));
            }
            None => self.close_nested(idx, transition),
        }
    }

    fn close_nested(&mut self, idx: usize, transition: &mut Transition) {
        let Some(nested) = self.fields[idx].nested.take() else {
            return;
        };
        let name = &self.fields[idx].descriptor.name;
        for path in nested.loading_paths() {
            transition.effects.push(Effect::Cancel {
                path: format!("{name}/{path}"),
            });
        }
    }

    fn loading_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for entry in &self.fields {
            if entry.is_loading() {
                paths.push(entry.descriptor.name.clone());
            }
            if let Some(nested) = &entry.nested {
                paths.extend(
                    nested
                        .loading_paths()
                        .into_iter()
                        .map(|p| format!("{}/{p}", entry.descriptor.name)),
                );
            }
        }
        paths
    }

    fn position(&self, path: &str) -> Result<usize, SessionError> {
        self.index
            .get(path)
            .copied()
            .ok_or_else(|| SessionError::UnknownField {
                path: path.to_owned(),
            })
    }

    fn nested_mut(&mut self, group: &str, full: &str) -> Result<&mut Self, SessionError> {
        let unknown = || SessionError::UnknownField {
            path: full.to_owned(),
        };
        let idx = self.index.get(group).copied().ok_or_else(unknown)?;
        self.fields[idx].nested.as_deref_mut().ok_or_else(unknown)
    }

    /// Look up a field by path (`name` or `group/child`).
    #[must_use]
    pub fn field(&self, path: &str) -> Option<&FieldEntry> {
        match path.split_once('/') {
            Some((group, rest)) => self.field(group)?.nested()?.field(rest),
            None => self.index.get(path).map(|&i| &self.fields[i]),
        }
    }

    /// Fields in declaration order, duplicates excluded.
    pub fn fields(&self) -> impl Iterator<Item = &FieldEntry> {
        self.fields.iter()
    }

    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Whether any field, nested ones included, is waiting on a callback.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        !self.loading_paths().is_empty()
    }

    /// Field-scoped issues blocking submission.
    ///
    /// Settled fields are checked for required values, type coercion,
    /// content membership and constraints. Required fields that have not
    /// settled are reported as unsettled. Nested group forms are validated
    /// recursively.
    #[must_use]
    pub fn validate(&self) -> Vec<FieldIssue> {
        let mut issues = Vec::new();
        for entry in &self.fields {
            let descriptor = &entry.descriptor;
            if descriptor.attribute_type == AttributeType::Info {
                continue;
            }
            match &entry.state {
                FieldState::Hidden => {}
                FieldState::Pending | FieldState::Loading | FieldState::Error(_) => {
                    if descriptor.is_required() {
                        issues.push(FieldIssue {
                            path: descriptor.name.clone(),
                            kind: IssueKind::Unsettled {
                                state: entry.state.to_string(),
                            },
                        });
                    }
                }
                FieldState::Ready | FieldState::Edited => {
                    issues.extend(
                        validate_value(descriptor, &entry.rules, entry.value(), &entry.content)
                            .into_iter()
                            .map(|err| FieldIssue {
                                path: descriptor.name.clone(),
                                kind: IssueKind::Invalid(err),
                            }),
                    );
                    if let Some(nested) = &entry.nested {
                        let inner = nested.validate();
                        if !inner.is_empty() {
                            let count = inner.len();
                            issues.extend(inner.into_iter().map(|issue| FieldIssue {
                                path: format!("{}/{}", descriptor.name, issue.path),
                                kind: issue.kind,
                            }));
                            issues.push(FieldIssue {
                                path: descriptor.name.clone(),
                                kind: IssueKind::Invalid(ValidationError::NestedInvalid {
                                    label: descriptor.label().to_owned(),
                                    count,
                                }),
                            });
                        }
                    }
                }
            }
        }
        issues
    }

    /// Values of settled fields as a per-scope map, nested forms included.
    #[must_use]
    pub fn values(&self) -> FormValues {
        let mut values = FormValues::default();
        self.fill_values(&mut values);
        values
    }

    fn fill_values(&self, values: &mut FormValues) {
        // Pending, loading and errored fields hold values fetched for stale inputs.
        for entry in self.fields.iter().filter(|e| e.state.is_settled()) {
            if let Some(value) = &entry.value {
                values.set(&self.scope, entry.name(), value.clone());
            }
            if let Some(nested) = &entry.nested {
                nested.fill_values(values);
            }
        }
    }

    /// Descriptors with their live content in place of the declared one.
    fn live_descriptors(&self) -> Vec<AttributeDescriptor> {
        self.fields
            .iter()
            .map(|entry| {
                let mut descriptor = entry.descriptor.clone();
                if entry.state.is_settled() {
                    descriptor.content.clone_from(&entry.content);
                } else {
                    descriptor.content.clear();
                }
                descriptor
            })
            .collect()
    }

    /// Collect the submission list.
    #[must_use]
    pub fn collect(&self) -> Vec<AttributeValue> {
        collect_form_attributes(&self.scope, &self.live_descriptors(), &self.values())
    }

    /// Edit-mode changes against the values the session was mounted with.
    ///
    /// Fields that are pending, loading or in error are left out.
    #[must_use]
    pub fn changes(&self) -> Vec<AttributeChange> {
        let surfaced: BTreeSet<String> = self
            .fields
            .iter()
            .filter(|e| e.surfaced)
            .map(|e| e.descriptor.name.clone())
            .collect();
        let unsettled: BTreeSet<&str> = self
            .fields
            .iter()
            .filter(|e| !e.state.is_settled())
            .map(FieldEntry::name)
            .collect();
        let mut changes = diff_attributes(
            &self.collect(),
            self.originals.as_deref().unwrap_or_default(),
            &surfaced,
        );
        changes.retain(|c| !unsettled.contains(c.name.as_str()));
        changes
    }

    /// Validate and produce the values to submit.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::Blocked`] with every issue found.
    pub fn submit(&self, mode: SubmitMode) -> Result<Vec<AttributeValue>, SubmitError> {
        let issues = self.validate();
        if !issues.is_empty() {
            info!(scope = %self.scope, issues = issues.len(), "submission blocked");
            return Err(SubmitError::Blocked(issues));
        }
        Ok(match mode {
            SubmitMode::Create => self.collect(),
            SubmitMode::Update => select_for_submit(&self.changes()),
        })
    }
}

fn rescope(err: SessionError, group: &str) -> SessionError {
    match err {
        SessionError::UnknownField { path } => SessionError::UnknownField {
            path: format!("{group}/{path}"),
        },
        SessionError::NotEditable { path, state } => SessionError::NotEditable {
            path: format!("{group}/{path}"),
            state,
        },
        SessionError::NotRetryable { path } => SessionError::NotRetryable {
            path: format!("{group}/{path}"),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::descriptor::{
        AttributeCallback, AttributeProperties, CallbackMapping, ContentType, MappingTarget,
    };
    use crate::error::ConfigurationError;
    use attrform_transport::CallbackMethod;
    use serde_json::json;

    fn plain(name: &str, content_type: ContentType) -> AttributeDescriptor {
        AttributeDescriptor {
            uuid: format!("uuid-{name}"),
            name: name.to_owned(),
            description: None,
            attribute_type: AttributeType::Data,
            content_type,
            properties: AttributeProperties {
                label: name.to_owned(),
                visible: true,
                required: false,
                read_only: false,
                list: false,
                multi_select: false,
                group: None,
            },
            constraints: Vec::new(),
            content: Vec::new(),
            attribute_callback: None,
        }
    }

    fn list(name: &str, items: &[&str]) -> AttributeDescriptor {
        let mut d = plain(name, ContentType::String);
        d.properties.list = true;
        d.content = items
            .iter()
            .map(|i| AttributeContent::new(json!(i)))
            .collect();
        d
    }

    fn fed_by(name: &str, from: &str, context: &str) -> AttributeDescriptor {
        let mut d = plain(name, ContentType::String);
        d.properties.list = true;
        d.attribute_callback = Some(AttributeCallback {
            callback_context: context.to_owned(),
            callback_method: CallbackMethod::Post,
            mappings: vec![CallbackMapping {
                from: Some(format!("{from}.data")),
                to: from.to_owned(),
                targets: [MappingTarget::PathVariable].into_iter().collect(),
                attribute_type: None,
                value: None,
            }],
        });
        d
    }

    fn pick(value: &str) -> Option<FieldValue> {
        Some(FieldValue::Item(AttributeContent::new(json!(value))))
    }

    fn set(session: &mut FormSession, path: &str, value: Option<FieldValue>) -> Transition {
        session
            .apply(FormEvent::ValueChanged {
                path: path.to_owned(),
                value,
            })
            .unwrap()
    }

    fn only_ticket(t: &Transition) -> ResolutionTicket {
        let tickets: Vec<_> = t.tickets().cloned().collect();
        assert_eq!(tickets.len(), 1, "expected one ticket in {t:?}");
        tickets.into_iter().next().unwrap()
    }

    fn succeed(session: &mut FormSession, ticket: &ResolutionTicket, items: &[&str]) -> Transition {
        session
            .apply(FormEvent::ResolutionSucceeded {
                ticket: ticket.clone(),
                content: items
                    .iter()
                    .map(|i| AttributeContent::new(json!(i)))
                    .collect(),
            })
            .unwrap()
    }

    fn state(session: &FormSession, path: &str) -> FieldState {
        session.field(path).unwrap().state().clone()
    }

    #[test]
    fn mount_sets_initial_states() {
        let mut hidden = plain("secret", ContentType::String);
        hidden.properties.visible = false;
        hidden.content = vec![AttributeContent::new(json!("k"))];
        let (session, transition) = FormSession::mount(
            "connector",
            &[
                list("kind", &["basic"]),
                fed_by("attributes", "kind", "v1/{kind}"),
                hidden,
            ],
        );
        assert!(transition.effects.is_empty());
        assert_eq!(state(&session, "kind"), FieldState::Ready);
        assert_eq!(state(&session, "attributes"), FieldState::Pending);
        assert_eq!(state(&session, "secret"), FieldState::Hidden);
        assert_eq!(
            session.field("secret").unwrap().value(),
            Some(&FieldValue::Scalar(json!("k")))
        );
    }

    #[test]
    fn hidden_constant_feeds_callback_at_mount() {
        let mut kind = plain("kind", ContentType::String);
        kind.properties.visible = false;
        kind.content = vec![AttributeContent::new(json!("fixed"))];
        let (session, transition) =
            FormSession::mount("", &[kind, fed_by("options", "kind", "v1/{kind}/options")]);

        let ticket = only_ticket(&transition);
        assert_eq!(ticket.path, "options");
        assert_eq!(ticket.request.path, "v1/fixed/options");
        assert_eq!(state(&session, "options"), FieldState::Loading);
    }

    #[test]
    fn scenario_b_selection_drives_group_resolution() {
        let mut group = fed_by("attributes", "kind", "v1/kinds/{kind}/attributes");
        group.attribute_type = AttributeType::Group;
        group.properties.list = false;
        let (mut session, _) =
            FormSession::mount("", &[list("kind", &["basic", "advanced"]), group]);
        assert_eq!(state(&session, "attributes"), FieldState::Pending);

        let first = only_ticket(&set(&mut session, "kind", pick("basic")));
        assert_eq!(first.request.path, "v1/kinds/basic/attributes");
        assert_eq!(state(&session, "attributes"), FieldState::Loading);

        let second_transition = set(&mut session, "kind", pick("advanced"));
        assert!(second_transition.effects.contains(&Effect::Cancel {
            path: "attributes".to_owned()
        }));
        let second = only_ticket(&second_transition);
        assert!(second.generation > first.generation);

        let late = succeed(&mut session, &first, &["from-basic"]);
        assert!(late.stale);
        assert_eq!(state(&session, "attributes"), FieldState::Loading);

        let applied = succeed(&mut session, &second, &["from-advanced"]);
        assert!(!applied.stale);
        assert_eq!(state(&session, "attributes"), FieldState::Ready);
        assert_eq!(
            session.field("attributes").unwrap().content(),
            &[AttributeContent::new(json!("from-advanced"))]
        );
    }

    #[test]
    fn cascade_invalidates_transitive_downstream() {
        let (mut session, _) = FormSession::mount(
            "",
            &[
                list("a", &["x", "y"]),
                fed_by("b", "a", "v1/b/{a}"),
                fed_by("c", "b", "v1/c/{b}"),
            ],
        );
        let tb = only_ticket(&set(&mut session, "a", pick("x")));
        assert_eq!(state(&session, "c"), FieldState::Pending);
        let settled = succeed(&mut session, &tb, &["b1"]);
        assert!(settled.effects.is_empty());
        assert_eq!(state(&session, "c"), FieldState::Pending);

        let tc = only_ticket(&set(&mut session, "b", pick("b1")));
        assert_eq!(tc.request.path, "v1/c/b1");
        assert_eq!(state(&session, "c"), FieldState::Loading);

        // Editing the root drops b's selection and c back to pending.
        let t = set(&mut session, "a", pick("y"));
        assert_eq!(state(&session, "b"), FieldState::Loading);
        assert_eq!(state(&session, "c"), FieldState::Pending);
        assert!(t.effects.contains(&Effect::Cancel {
            path: "c".to_owned()
        }));
        assert_eq!(session.field("c").unwrap().value(), None);
        assert!(session.field("c").unwrap().content().is_empty());
    }

    #[test]
    fn clearing_upstream_returns_downstream_to_pending() {
        let (mut session, _) =
            FormSession::mount("", &[list("a", &["x"]), fed_by("b", "a", "v1/{a}")]);
        let ticket = only_ticket(&set(&mut session, "a", pick("x")));
        succeed(&mut session, &ticket, &["one"]);
        set(&mut session, "b", pick("one"));

        set(&mut session, "a", None);
        assert_eq!(state(&session, "b"), FieldState::Pending);
        assert_eq!(session.field("b").unwrap().value(), None);
    }

    #[test]
    fn same_inputs_do_not_replan() {
        let (mut session, _) =
            FormSession::mount("", &[list("a", &["x"]), fed_by("b", "a", "v1/{a}")]);
        let ticket = only_ticket(&set(&mut session, "a", pick("x")));
        succeed(&mut session, &ticket, &["one"]);

        let again = set(&mut session, "a", pick("x"));
        assert!(again.effects.is_empty());
        assert_eq!(state(&session, "b"), FieldState::Ready);
    }

    #[test]
    fn refreshed_content_drops_vanished_selection() {
        let (mut session, _) =
            FormSession::mount("", &[list("a", &["x", "y"]), fed_by("b", "a", "v1/{a}")]);
        let t1 = only_ticket(&set(&mut session, "a", pick("x")));
        succeed(&mut session, &t1, &["keep", "gone"]);
        set(&mut session, "b", pick("gone"));

        let t2 = only_ticket(&set(&mut session, "a", pick("y")));
        succeed(&mut session, &t2, &["keep"]);
        assert_eq!(state(&session, "b"), FieldState::Ready);
        assert_eq!(session.field("b").unwrap().value(), None);

        set(&mut session, "b", pick("keep"));
        let t3 = only_ticket(&set(&mut session, "a", pick("x")));
        succeed(&mut session, &t3, &["keep", "gone"]);
        assert_eq!(session.field("b").unwrap().value(), pick("keep").as_ref());
        assert_eq!(state(&session, "b"), FieldState::Edited);
    }

    #[test]
    fn failure_then_retry() {
        let (mut session, _) =
            FormSession::mount("", &[list("a", &["x"]), fed_by("b", "a", "v1/{a}")]);
        let ticket = only_ticket(&set(&mut session, "a", pick("x")));
        session
            .apply(FormEvent::ResolutionFailed {
                ticket,
                error: ResolutionError::Transport {
                    message: "connection refused".to_owned(),
                    status_code: None,
                },
            })
            .unwrap();
        assert!(matches!(
            state(&session, "b"),
            FieldState::Error(FieldError::Resolution(_))
        ));
        assert!(matches!(
            session.apply(FormEvent::ValueChanged {
                path: "b".to_owned(),
                value: pick("one")
            }),
            Err(SessionError::NotEditable { .. })
        ));

        let retried = session
            .apply(FormEvent::Retry {
                path: "b".to_owned(),
            })
            .unwrap();
        let ticket = only_ticket(&retried);
        succeed(&mut session, &ticket, &["one"]);
        assert_eq!(state(&session, "b"), FieldState::Ready);

        assert_eq!(
            session.apply(FormEvent::Retry {
                path: "b".to_owned()
            }),
            Err(SessionError::NotRetryable {
                path: "b".to_owned()
            })
        );
    }

    #[test]
    fn empty_list_content_is_an_error() {
        let (mut session, _) =
            FormSession::mount("", &[list("a", &["x"]), fed_by("b", "a", "v1/{a}")]);
        let ticket = only_ticket(&set(&mut session, "a", pick("x")));
        succeed(&mut session, &ticket, &[]);
        assert_eq!(
            state(&session, "b"),
            FieldState::Error(FieldError::Resolution(ResolutionError::EmptyContent {
                attribute: "b".to_owned()
            }))
        );
    }

    #[test]
    fn cycle_members_start_in_error() {
        let (session, transition) = FormSession::mount(
            "",
            &[
                fed_by("a", "b", "v1/{b}"),
                fed_by("b", "a", "v1/{a}"),
                plain("free", ContentType::String),
            ],
        );
        assert!(transition.effects.is_empty());
        assert!(matches!(
            state(&session, "a"),
            FieldState::Error(FieldError::Configuration(ConfigurationError::Cycle { .. }))
        ));
        assert_eq!(state(&session, "free"), FieldState::Ready);
    }

    #[test]
    fn unknown_and_read_only_fields_reject_input() {
        let mut fixed = plain("fixed", ContentType::String);
        fixed.properties.read_only = true;
        fixed.content = vec![AttributeContent::new(json!("v"))];
        let (mut session, _) = FormSession::mount("", &[fixed]);
        assert!(matches!(
            session.apply(FormEvent::ValueChanged {
                path: "nope".to_owned(),
                value: None
            }),
            Err(SessionError::UnknownField { .. })
        ));
        assert!(matches!(
            session.apply(FormEvent::ValueChanged {
                path: "fixed".to_owned(),
                value: None
            }),
            Err(SessionError::NotEditable { .. })
        ));
        assert_eq!(
            session.collect(),
            vec![AttributeValue {
                uuid: Some("uuid-fixed".to_owned()),
                name: "fixed".to_owned(),
                value: json!("v")
            }]
        );
    }

    #[test]
    fn scenario_a_untouched_fields_are_not_submitted() {
        let mut port = plain("port", ContentType::Integer);
        port.content = vec![AttributeContent::new(json!(443))];
        let (mut session, _) =
            FormSession::mount("", &[port, plain("https", ContentType::Boolean)]);
        set(&mut session, "https", Some(FieldValue::Scalar(json!(true))));

        let submitted = session.submit(SubmitMode::Create).unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].name, "https");
        assert_eq!(submitted[0].value, json!(true));
    }

    #[test]
    fn scenario_c_required_blocks_submission() {
        let mut name = plain("name", ContentType::String);
        name.properties.required = true;
        let (mut session, _) = FormSession::mount(
            "",
            &[
                name,
                plain("note", ContentType::Text),
                list("a", &["x"]),
                fed_by("b", "a", "v1/{a}"),
            ],
        );
        set(&mut session, "note", Some(FieldValue::Scalar(json!("hello"))));

        let Err(SubmitError::Blocked(issues)) = session.submit(SubmitMode::Create) else {
            unreachable!("submission must be blocked");
        };
        assert_eq!(
            issues,
            vec![FieldIssue {
                path: "name".to_owned(),
                kind: IssueKind::Invalid(ValidationError::Required {
                    label: "name".to_owned()
                })
            }]
        );
    }

    #[test]
    fn required_loading_field_blocks_submission() {
        let mut b = fed_by("b", "a", "v1/{a}");
        b.properties.required = true;
        let (mut session, _) = FormSession::mount("", &[list("a", &["x"]), b]);
        set(&mut session, "a", pick("x"));
        let Err(SubmitError::Blocked(issues)) = session.submit(SubmitMode::Create) else {
            unreachable!("submission must be blocked");
        };
        assert_eq!(
            issues[0].kind,
            IssueKind::Unsettled {
                state: "loading".to_owned()
            }
        );
    }

    #[test]
    fn unsettled_optional_field_is_not_submitted() {
        let (mut session, _) =
            FormSession::mount("", &[list("a", &["x", "y"]), fed_by("b", "a", "v1/{a}")]);
        let ticket = only_ticket(&set(&mut session, "a", pick("x")));
        succeed(&mut session, &ticket, &["one"]);
        set(&mut session, "b", pick("one"));

        let reload = only_ticket(&set(&mut session, "a", pick("y")));
        assert_eq!(state(&session, "b"), FieldState::Loading);
        let only_a = vec![AttributeValue {
            uuid: Some("uuid-a".to_owned()),
            name: "a".to_owned(),
            value: json!("y"),
        }];
        assert_eq!(session.submit(SubmitMode::Create).unwrap(), only_a);
        assert!(session.values().get("", "b").is_none());

        session
            .apply(FormEvent::ResolutionFailed {
                ticket: reload,
                error: ResolutionError::Transport {
                    message: "connector down".to_owned(),
                    status_code: Some(503),
                },
            })
            .unwrap();
        assert!(matches!(state(&session, "b"), FieldState::Error(_)));
        assert_eq!(session.submit(SubmitMode::Create).unwrap(), only_a);
    }

    #[test]
    fn edit_mode_loading_field_is_left_out_of_changes() {
        let descriptors = vec![
            list("kind", &["basic", "advanced"]),
            fed_by("options", "kind", "v1/{kind}"),
        ];
        let persisted = vec![
            AttributeValue::new("kind", json!("basic")),
            AttributeValue::new("options", json!("o1")),
        ];
        let (mut edit, _) = FormSession::mount_edit("", combine(&descriptors, &persisted));
        set(&mut edit, "kind", pick("advanced"));
        assert_eq!(state(&edit, "options"), FieldState::Loading);

        let submitted = edit.submit(SubmitMode::Update).unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].name, "kind");
    }

    fn template_group() -> AttributeDescriptor {
        let mut group = plain("template", ContentType::Object);
        group.attribute_type = AttributeType::Group;
        group.content = vec![AttributeContent::labelled(
            "Web server",
            json!({
                "name": "web",
                "attributes": [{
                    "uuid": "n-1",
                    "name": "cn",
                    "type": "data",
                    "contentType": "string",
                    "properties": {"label": "Common name", "required": true}
                }]
            }),
        )];
        group
    }

    #[test]
    fn group_selection_opens_nested_form() {
        let group = template_group();
        let item = group.content[0].clone();
        let (mut session, _) = FormSession::mount("ra", &[group]);
        set(&mut session, "template", Some(FieldValue::Item(item)));

        let nested = session.field("template").unwrap().nested().unwrap();
        assert_eq!(nested.scope(), "ra/template");
        assert_eq!(state(&session, "template/cn"), FieldState::Ready);

        let issues = session.validate();
        assert!(issues.iter().any(|i| i.path == "template/cn"));

        set(
            &mut session,
            "template/cn",
            Some(FieldValue::Scalar(json!("example.com"))),
        );
        assert!(session.validate().is_empty());
        assert_eq!(
            session.collect()[0].value,
            json!({
                "name": "web",
                "attributes": [{"uuid": "n-1", "name": "cn", "value": "example.com"}]
            })
        );

        set(&mut session, "template", None);
        assert!(session.field("template/cn").is_none());
    }

    #[test]
    fn edit_mode_round_trip_and_diff() {
        let mut port = plain("port", ContentType::Integer);
        port.properties.required = true;
        let descriptors = vec![
            port,
            list("kind", &["basic", "advanced"]),
            fed_by("options", "kind", "v1/{kind}"),
            template_group(),
        ];
        let (mut fresh, _) = FormSession::mount("", &descriptors);
        set(&mut fresh, "port", Some(FieldValue::Scalar(json!("8443"))));
        let ticket = only_ticket(&set(&mut fresh, "kind", pick("basic")));
        succeed(&mut fresh, &ticket, &["o1", "o2"]);
        set(&mut fresh, "options", pick("o2"));
        let item = fresh.field("template").unwrap().content()[0].clone();
        set(&mut fresh, "template", Some(FieldValue::Item(item)));
        set(&mut fresh, "template/cn", Some(FieldValue::Scalar(json!("a.example"))));
        let collected = fresh.collect();

        let (edit, transition) = FormSession::mount_edit("", combine(&descriptors, &collected));
        assert!(transition.effects.is_empty());
        assert_eq!(edit.collect(), collected);
        assert_eq!(state(&edit, "options"), FieldState::Edited);
        assert_eq!(
            edit.field("template/cn").unwrap().value(),
            Some(&FieldValue::Scalar(json!("a.example")))
        );
        assert!(
            edit.changes()
                .iter()
                .all(|c| c.status == crate::collector::ChangeStatus::Unchanged)
        );
        assert!(edit.submit(SubmitMode::Update).unwrap().is_empty());
    }

    #[test]
    fn edit_mode_upstream_change_reloads_and_diffs() {
        let descriptors = vec![
            list("kind", &["basic", "advanced"]),
            fed_by("options", "kind", "v1/{kind}"),
        ];
        let persisted = vec![
            AttributeValue::new("kind", json!("basic")),
            AttributeValue::new("options", json!("o1")),
        ];
        let (mut edit, _) = FormSession::mount_edit("", combine(&descriptors, &persisted));

        let ticket = only_ticket(&set(&mut edit, "kind", pick("advanced")));
        assert_eq!(ticket.request.path, "v1/advanced");
        succeed(&mut edit, &ticket, &["o9"]);
        assert_eq!(edit.field("options").unwrap().value(), None);

        let submitted = edit.submit(SubmitMode::Update).unwrap();
        assert_eq!(
            submitted,
            vec![
                AttributeValue {
                    uuid: Some("uuid-kind".to_owned()),
                    name: "kind".to_owned(),
                    value: json!("advanced")
                },
                AttributeValue {
                    uuid: Some("uuid-options".to_owned()),
                    name: "options".to_owned(),
                    value: Value::Null
                },
            ]
        );
    }

    #[test]
    fn stale_response_for_unknown_path_is_ignored() {
        let (mut session, _) = FormSession::mount("", &[plain("a", ContentType::String)]);
        let ticket = ResolutionTicket {
            path: "ghost/child".to_owned(),
            generation: 9,
            request: CallbackRequest::new(CallbackMethod::Get, "x"),
            key: ResolutionKey {
                uuid: "u".to_owned(),
                inputs: String::new(),
            },
        };
        let t = session
            .apply(FormEvent::ResolutionSucceeded {
                ticket,
                content: Vec::new(),
            })
            .unwrap();
        assert!(t.stale);
    }
}
