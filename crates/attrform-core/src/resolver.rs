//! Callback resolver.
//!
//! Turns an attribute's parsed mappings plus the current values of the
//! attributes they reference into a [`CallbackRequest`], invokes it through a
//! [`CallbackTransport`], and parses the answer into content items.
//!
//! Planning is synchronous and pure; only [`CallbackResolver::resolve`]
//! suspends. Successful results are memoized by [`ResolutionKey`], so asking
//! twice for the same inputs costs one network call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use attrform_transport::{CallbackRequest, CallbackTransport};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::descriptor::{AttributeContent, AttributeDescriptor, MappingTarget};
use crate::error::ResolutionError;
use crate::graph::{FieldPath, ParsedMapping};

/// Memoization key: the attribute plus the inputs its mappings referenced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolutionKey {
    pub uuid: String,
    /// Canonical JSON of the mapped inputs, in mapping order.
    pub inputs: String,
}

impl fmt::Display for ResolutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uuid, self.inputs)
    }
}

/// Result of planning a callback.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPlan {
    /// Some mapping has neither a live value nor a literal. No call is made.
    Unsatisfied { missing: Vec<String> },
    /// Ready to invoke.
    Ready {
        request: CallbackRequest,
        key: ResolutionKey,
    },
}

/// Builds, executes and memoizes callback requests.
///
/// The memo never expires on its own. It lives as long as the form it serves:
/// drivers sharing a resolver share the memo, and
/// [`FormDriver::into_session`](crate::driver::FormDriver::into_session)
/// clears it when the form is handed back.
pub struct CallbackResolver {
    transport: Arc<dyn CallbackTransport>,
    cache: RwLock<HashMap<ResolutionKey, Vec<AttributeContent>>>,
}

impl CallbackResolver {
    /// Create a resolver over the given transport.
    #[must_use]
    pub fn new(transport: Arc<dyn CallbackTransport>) -> Self {
        Self {
            transport,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Plan the request for `descriptor`.
    ///
    /// `lookup` reads the current value at a field path, returning `None`
    /// when the referenced attribute has no settled value.
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError::UnboundPathVariable`] if the callback path
    /// keeps a placeholder after substitution.
    pub fn plan<F>(
        descriptor: &AttributeDescriptor,
        mappings: &[ParsedMapping],
        lookup: F,
    ) -> Result<RequestPlan, ResolutionError>
    where
        F: Fn(&FieldPath) -> Option<Value>,
    {
        let Some(callback) = &descriptor.attribute_callback else {
            return Ok(RequestPlan::Unsatisfied {
                missing: Vec::new(),
            });
        };

        let mut missing = Vec::new();
        let mut inputs = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let live = mapping.source.as_ref().and_then(&lookup);
            match live.or_else(|| mapping.literal.clone()) {
                Some(value) => inputs.push((mapping, value)),
                None => missing.push(
                    mapping
                        .source
                        .as_ref()
                        .map_or_else(|| mapping.to.clone(), ToString::to_string),
                ),
            }
        }
        if !missing.is_empty() {
            return Ok(RequestPlan::Unsatisfied { missing });
        }

        let mut request = CallbackRequest::new(callback.callback_method, "");
        let mut path = callback.callback_context.clone();
        let mut body = Map::new();
        for (mapping, value) in &inputs {
            for target in &mapping.targets {
                match target {
                    MappingTarget::PathVariable => {
                        let placeholder = format!("{{{}}}", mapping.to);
                        let encoded = urlencoding::encode(&param_text(value)).into_owned();
                        path = path.replace(&placeholder, &encoded);
                    }
                    MappingTarget::QueryParameter => match value {
                        Value::Array(items) => request.query.extend(
                            items.iter().map(|v| (mapping.to.clone(), param_text(v))),
                        ),
                        other => request.query.push((mapping.to.clone(), param_text(other))),
                    },
                    MappingTarget::RequestBody => {
                        insert_dotted(&mut body, &mapping.to, value.clone());
                    }
                }
            }
        }

        if let Some(name) = unbound_placeholder(&path) {
            return Err(ResolutionError::UnboundPathVariable {
                context: callback.callback_context.clone(),
                name,
            });
        }
        request.path = path;
        if !body.is_empty() {
            request.body = Some(body);
        }

        let key_inputs: Vec<(String, &Value)> = inputs
            .iter()
            .map(|(m, v)| {
                let origin = m
                    .source
                    .as_ref()
                    .map_or_else(|| format!("={}", m.to), ToString::to_string);
                (origin, v)
            })
            .collect();
        let key = ResolutionKey {
            uuid: descriptor.uuid.clone(),
            inputs: serde_json::to_string(&key_inputs).unwrap_or_default(),
        };

        Ok(RequestPlan::Ready { request, key })
    }

    /// Execute a planned request, serving memoized results when available.
    ///
    /// # Errors
    ///
    /// - [`ResolutionError::Transport`] if the transport fails.
    /// - [`ResolutionError::MalformedResponse`] if the answer is not content.
    pub async fn resolve(
        &self,
        request: &CallbackRequest,
        key: &ResolutionKey,
    ) -> Result<Vec<AttributeContent>, ResolutionError> {
        if let Some(content) = self.cache.read().await.get(key) {
            debug!(%key, "callback served from memo");
            return Ok(content.clone());
        }

        debug!(method = %request.method, path = %request.path, %key, "resolving callback");
        let raw = self.transport.invoke(request).await.map_err(|e| {
            warn!(path = %request.path, error = %e, "callback failed");
            ResolutionError::from(e)
        })?;
        let content = parse_content(raw)?;

        self.cache.write().await.insert(key.clone(), content.clone());
        Ok(content)
    }

    /// Drop every memoized result.
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }
}

impl fmt::Debug for CallbackResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackResolver").finish_non_exhaustive()
    }
}

/// Interpret a callback answer as content items.
///
/// Accepts an array of items (bare values become unlabelled items), a single
/// `{data, reference?}` object, or an object map `{reference: data}`.
///
/// # Errors
///
/// Returns [`ResolutionError::MalformedResponse`] for scalars and items that
/// do not deserialize.
pub fn parse_content(raw: Value) -> Result<Vec<AttributeContent>, ResolutionError> {
    let malformed = |reason: String| ResolutionError::MalformedResponse { reason };
    match raw {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(ref map) if map.contains_key("data") => {
                    serde_json::from_value(item).map_err(|e| malformed(e.to_string()))
                }
                other => Ok(AttributeContent::new(other)),
            })
            .collect(),
        Value::Object(map) if map.contains_key("data") => {
            serde_json::from_value(Value::Object(map))
                .map(|item| vec![item])
                .map_err(|e| malformed(e.to_string()))
        }
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(reference, data)| AttributeContent::labelled(reference, data))
            .collect()),
        Value::Null => Ok(Vec::new()),
        other => Err(malformed(format!("expected content list, got {other}"))),
    }
}

fn param_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn insert_dotted(body: &mut Map<String, Value>, to: &str, value: Value) {
    let mut parts: Vec<&str> = to.split('.').filter(|p| !p.is_empty()).collect();
    let Some(last) = parts.pop() else {
        return;
    };
    let mut current = body;
    for part in parts {
        let slot = current
            .entry(part.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else {
            return;
        };
        current = next;
    }
    current.insert(last.to_owned(), value);
}

fn unbound_placeholder(path: &str) -> Option<String> {
    let start = path.find('{')?;
    let end = path[start..].find('}')? + start;
    Some(path[start + 1..end].to_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::descriptor::{
        AttributeCallback, AttributeProperties, AttributeType, CallbackMapping, ContentType,
    };
    use crate::graph::DependencyGraph;
    use attrform_transport::{CallbackMethod, MemoryTransport};
    use serde_json::json;
    use std::collections::{BTreeSet, HashMap};

    fn with_callback(context: &str, mappings: Vec<CallbackMapping>) -> AttributeDescriptor {
        AttributeDescriptor {
            uuid: "uuid-target".to_owned(),
            name: "target".to_owned(),
            description: None,
            attribute_type: AttributeType::Data,
            content_type: ContentType::String,
            properties: AttributeProperties {
                label: "Target".to_owned(),
                visible: true,
                required: true,
                read_only: false,
                list: true,
                multi_select: false,
                group: None,
            },
            constraints: Vec::new(),
            content: Vec::new(),
            attribute_callback: Some(AttributeCallback {
                callback_context: context.to_owned(),
                callback_method: CallbackMethod::Post,
                mappings,
            }),
        }
    }

    fn mapping(from: Option<&str>, to: &str, targets: &[MappingTarget]) -> CallbackMapping {
        CallbackMapping {
            from: from.map(str::to_owned),
            to: to.to_owned(),
            targets: targets.iter().copied().collect::<BTreeSet<_>>(),
            attribute_type: None,
            value: None,
        }
    }

    fn parsed(d: &AttributeDescriptor) -> Vec<ParsedMapping> {
        DependencyGraph::build(std::slice::from_ref(d))
            .mappings(&d.name)
            .to_vec()
    }

    fn values(pairs: &[(&str, Value)]) -> impl Fn(&FieldPath) -> Option<Value> {
        let map: HashMap<String, Value> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect();
        move |path: &FieldPath| map.get(&path.attribute).cloned()
    }

    #[test]
    fn partitions_mappings_by_target() {
        let d = with_callback(
            "v1/kinds/{kind}/attributes",
            vec![
                mapping(Some("kind.data"), "kind", &[MappingTarget::PathVariable]),
                mapping(Some("ra.data"), "raProfile", &[MappingTarget::QueryParameter]),
                mapping(
                    Some("cred.data"),
                    "credential.uuid",
                    &[MappingTarget::RequestBody],
                ),
            ],
        );
        let plan = CallbackResolver::plan(
            &d,
            &parsed(&d),
            values(&[
                ("kind", json!("basic auth")),
                ("ra", json!("ra-1")),
                ("cred", json!("c-9")),
            ]),
        )
        .unwrap();

        let RequestPlan::Ready { request, key } = plan else {
            unreachable!("plan should be ready");
        };
        assert_eq!(request.path, "v1/kinds/basic%20auth/attributes");
        assert_eq!(request.query, vec![("raProfile".to_owned(), "ra-1".to_owned())]);
        assert_eq!(
            Value::Object(request.body.unwrap()),
            json!({"credential": {"uuid": "c-9"}})
        );
        assert_eq!(key.uuid, "uuid-target");
    }

    #[test]
    fn missing_input_is_unsatisfied_not_error() {
        let d = with_callback(
            "v1/kinds/{kind}",
            vec![mapping(Some("kind.data"), "kind", &[MappingTarget::PathVariable])],
        );
        let plan = CallbackResolver::plan(&d, &parsed(&d), values(&[])).unwrap();
        assert_eq!(
            plan,
            RequestPlan::Unsatisfied {
                missing: vec!["kind.data".to_owned()]
            }
        );
    }

    #[test]
    fn literal_value_is_a_constant_and_a_fallback() {
        let mut constant = mapping(None, "mode", &[MappingTarget::QueryParameter]);
        constant.value = Some(json!("full"));
        let mut fallback = mapping(Some("kind.data"), "kind", &[MappingTarget::QueryParameter]);
        fallback.value = Some(json!("basic"));
        let d = with_callback("v1/list", vec![constant, fallback]);

        let RequestPlan::Ready { request, .. } =
            CallbackResolver::plan(&d, &parsed(&d), values(&[])).unwrap()
        else {
            unreachable!("literals satisfy the plan");
        };
        assert_eq!(
            request.query,
            vec![
                ("mode".to_owned(), "full".to_owned()),
                ("kind".to_owned(), "basic".to_owned())
            ]
        );
    }

    #[test]
    fn multi_value_query_repeats_the_key() {
        let d = with_callback(
            "v1/list",
            vec![mapping(Some("tags.data"), "tag", &[MappingTarget::QueryParameter])],
        );
        let RequestPlan::Ready { request, .. } =
            CallbackResolver::plan(&d, &parsed(&d), values(&[("tags", json!(["a", 2]))])).unwrap()
        else {
            unreachable!("plan should be ready");
        };
        assert_eq!(request.path_and_query(), "v1/list?tag=a&tag=2");
    }

    #[test]
    fn unbound_path_variable_is_an_error() {
        let d = with_callback(
            "v1/{kind}/{version}",
            vec![mapping(
                Some("kind.data"),
                "kind",
                &[MappingTarget::PathVariable],
            )],
        );
        let err =
            CallbackResolver::plan(&d, &parsed(&d), values(&[("kind", json!("k"))])).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::UnboundPathVariable {
                context: "v1/{kind}/{version}".to_owned(),
                name: "version".to_owned()
            }
        );
    }

    #[test]
    fn key_tracks_only_referenced_inputs() {
        let d = with_callback(
            "v1/list",
            vec![mapping(Some("kind.data"), "kind", &[MappingTarget::QueryParameter])],
        );
        let plan_a = CallbackResolver::plan(
            &d,
            &parsed(&d),
            values(&[("kind", json!("k")), ("other", json!(1))]),
        )
        .unwrap();
        let plan_b = CallbackResolver::plan(
            &d,
            &parsed(&d),
            values(&[("kind", json!("k")), ("other", json!(2))]),
        )
        .unwrap();
        let plan_c =
            CallbackResolver::plan(&d, &parsed(&d), values(&[("kind", json!("j"))])).unwrap();

        let key = |p: RequestPlan| match p {
            RequestPlan::Ready { key, .. } => key,
            RequestPlan::Unsatisfied { .. } => unreachable!("plan should be ready"),
        };
        let (a, b, c) = (key(plan_a), key(plan_b), key(plan_c));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn parse_content_shapes() {
        assert_eq!(
            parse_content(json!([{"data": 1, "reference": "one"}, "two"])).unwrap(),
            vec![
                AttributeContent::labelled("one", json!(1)),
                AttributeContent::new(json!("two"))
            ]
        );
        assert_eq!(
            parse_content(json!({"data": {"x": 1}})).unwrap(),
            vec![AttributeContent::new(json!({"x": 1}))]
        );
        assert_eq!(
            parse_content(json!({"tpl-a": {"oid": "1.2"}})).unwrap(),
            vec![AttributeContent::labelled("tpl-a", json!({"oid": "1.2"}))]
        );
        assert!(parse_content(json!(42)).is_err());
    }

    #[tokio::test]
    async fn memoized_key_calls_transport_once() {
        let transport = MemoryTransport::new();
        transport
            .respond(CallbackMethod::Post, "v1/list?kind=k", json!([{"data": "x"}]))
            .await;
        let resolver = CallbackResolver::new(Arc::new(transport.clone()));

        let d = with_callback(
            "v1/list",
            vec![mapping(Some("kind.data"), "kind", &[MappingTarget::QueryParameter])],
        );
        let RequestPlan::Ready { request, key } =
            CallbackResolver::plan(&d, &parsed(&d), values(&[("kind", json!("k"))])).unwrap()
        else {
            unreachable!("plan should be ready");
        };

        let first = resolver.resolve(&request, &key).await.unwrap();
        let second = resolver.resolve(&request, &key).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.call_count().await, 1);

        resolver.clear().await;
        resolver.resolve(&request, &key).await.unwrap();
        assert_eq!(transport.call_count().await, 2);
    }

    #[tokio::test]
    async fn failures_are_not_memoized() {
        let transport = MemoryTransport::new();
        transport
            .fail(CallbackMethod::Post, "v1/list", 503, "busy")
            .await;
        let resolver = CallbackResolver::new(Arc::new(transport.clone()));
        let request = CallbackRequest::new(CallbackMethod::Post, "v1/list");
        let key = ResolutionKey {
            uuid: "u".to_owned(),
            inputs: "[]".to_owned(),
        };

        let err = resolver.resolve(&request, &key).await.unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::Transport {
                status_code: Some(503),
                ..
            }
        ));

        transport
            .respond(CallbackMethod::Post, "v1/list", json!([]))
            .await;
        assert!(resolver.resolve(&request, &key).await.unwrap().is_empty());
        assert_eq!(transport.call_count().await, 2);
    }
}
