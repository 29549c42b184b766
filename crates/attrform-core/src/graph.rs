//! Dependency graph between attributes.
//!
//! An edge `A -> B` means "B's callback consumes A's value". The graph is
//! built once per descriptor set. Mapping paths are parsed here so the rest
//! of the engine never re-parses `"kind.data"` strings.
//!
//! # Failure containment
//!
//! - A cycle marks every callback-bearing attribute as broken; plain
//!   attributes stay usable.
//! - A mapping from an unknown attribute breaks that attribute and everything
//!   downstream of it.
//!
//! [`DependencyGraph::order`] only ever contains healthy attributes, so a
//! caller never sees a partial order that silently hides a cycle.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use serde_json::Value;
use tracing::warn;

use crate::descriptor::{AttributeDescriptor, MappingTarget};
use crate::error::ConfigurationError;

/// A parsed `from` reference: attribute name plus segments into its value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    pub attribute: String,
    pub segments: Vec<String>,
}

impl FieldPath {
    /// Parse `attr.data.id` into `attr` + `["data", "id"]`.
    ///
    /// Returns `None` for an empty attribute name.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split('.');
        let attribute = parts.next().filter(|a| !a.is_empty())?.to_owned();
        let segments = parts
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        Some(Self {
            attribute,
            segments,
        })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.attribute)?;
        for segment in &self.segments {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

/// A callback mapping with its `from` already parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMapping {
    pub source: Option<FieldPath>,
    pub to: String,
    pub targets: BTreeSet<MappingTarget>,
    pub literal: Option<Value>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}

/// Dependency graph over one descriptor set.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    order: Vec<String>,
    downstream: BTreeMap<String, BTreeSet<String>>,
    upstream: BTreeMap<String, BTreeSet<String>>,
    mappings: BTreeMap<String, Vec<ParsedMapping>>,
    broken: BTreeMap<String, ConfigurationError>,
    duplicates: Vec<ConfigurationError>,
}

impl DependencyGraph {
    /// Build the graph for a descriptor set.
    ///
    /// Never fails as a whole: configuration problems are recorded per
    /// attribute and available through [`broken`](Self::broken).
    #[must_use]
    pub fn build(descriptors: &[AttributeDescriptor]) -> Self {
        let mut graph = Self::default();

        let mut names: Vec<&str> = Vec::with_capacity(descriptors.len());
        let mut callback_bearing = BTreeSet::new();
        for d in descriptors {
            if names.contains(&d.name.as_str()) {
                warn!(name = %d.name, uuid = %d.uuid, "duplicate attribute name ignored");
                graph.duplicates.push(ConfigurationError::DuplicateName {
                    name: d.name.clone(),
                    uuid: d.uuid.clone(),
                });
                continue;
            }
            names.push(&d.name);
            graph.downstream.entry(d.name.clone()).or_default();
            graph.upstream.entry(d.name.clone()).or_default();

            let Some(callback) = &d.attribute_callback else {
                continue;
            };
            callback_bearing.insert(d.name.clone());
            let parsed = callback
                .mappings
                .iter()
                .map(|m| ParsedMapping {
                    source: m.from.as_deref().and_then(FieldPath::parse),
                    to: m.to.clone(),
                    targets: m.targets.clone(),
                    literal: m.value.clone(),
                })
                .collect();
            graph.mappings.insert(d.name.clone(), parsed);
        }

        // Edges, noting references to attributes outside the set.
        let mut dangling = Vec::new();
        let references: Vec<(String, String)> = graph
            .mappings
            .iter()
            .flat_map(|(name, mappings)| {
                mappings
                    .iter()
                    .filter_map(|m| m.source.as_ref())
                    .map(move |source| (source.attribute.clone(), name.clone()))
            })
            .collect();
        for (source, name) in references {
            if names.contains(&source.as_str()) {
                graph
                    .downstream
                    .entry(source.clone())
                    .or_default()
                    .insert(name.clone());
                graph.upstream.entry(name).or_default().insert(source);
            } else {
                dangling.push(ConfigurationError::DanglingReference {
                    attribute: name,
                    missing: source,
                });
            }
        }

        let cycle_members = graph.find_cycles(&names);
        if cycle_members.is_empty() {
            for err in dangling {
                let ConfigurationError::DanglingReference { attribute, .. } = &err else {
                    continue;
                };
                let attribute = attribute.clone();
                for downstream in graph.reachable_from(&attribute) {
                    graph
                        .broken
                        .entry(downstream.clone())
                        .or_insert(ConfigurationError::BrokenUpstream {
                            attribute: downstream,
                            upstream: attribute.clone(),
                        });
                }
                graph.broken.insert(attribute, err);
            }
        } else {
            warn!(members = ?cycle_members, "dependency cycle, disabling callback attributes");
            for name in &callback_bearing {
                graph.broken.insert(
                    name.clone(),
                    ConfigurationError::Cycle {
                        members: cycle_members.clone(),
                    },
                );
            }
        }

        graph.order = graph.topological_order(&names);
        graph
    }

    /// DFS three-colour search. Returns every attribute on some cycle.
    fn find_cycles(&self, names: &[&str]) -> Vec<String> {
        let mut color: HashMap<&str, Color> = names.iter().map(|n| (*n, Color::White)).collect();
        let mut members = BTreeSet::new();

        for &start in names {
            if color.get(start) != Some(&Color::White) {
                continue;
            }
            // Explicit stack of (node, next child index) to keep the path.
            let mut path: Vec<&str> = vec![start];
            let mut cursor: Vec<usize> = vec![0];
            color.insert(start, Color::Grey);

            while let Some(&node) = path.last() {
                let children: Vec<&str> = self
                    .downstream
                    .get(node)
                    .map(|s| s.iter().map(String::as_str).collect())
                    .unwrap_or_default();
                let Some(idx) = cursor.last_mut() else {
                    break;
                };
                if let Some(&child) = children.get(*idx) {
                    *idx += 1;
                    match color.get(child).copied().unwrap_or(Color::Black) {
                        Color::White => {
                            color.insert(child, Color::Grey);
                            path.push(child);
                            cursor.push(0);
                        }
                        Color::Grey => {
                            if let Some(pos) = path.iter().position(|n| *n == child) {
                                members.extend(path[pos..].iter().map(|n| (*n).to_owned()));
                            }
                        }
                        Color::Black => {}
                    }
                } else {
                    color.insert(node, Color::Black);
                    path.pop();
                    cursor.pop();
                }
            }
        }

        members.into_iter().collect()
    }

    /// Kahn's algorithm over healthy attributes, ties broken by declaration order.
    fn topological_order(&self, names: &[&str]) -> Vec<String> {
        let healthy: Vec<&str> = names
            .iter()
            .copied()
            .filter(|n| !self.broken.contains_key(*n))
            .collect();
        let mut indegree: HashMap<&str, usize> = healthy
            .iter()
            .map(|n| {
                let count = self
                    .upstream
                    .get(*n)
                    .map_or(0, |ups| ups.iter().filter(|u| !self.broken.contains_key(*u)).count());
                (*n, count)
            })
            .collect();

        let mut order = Vec::with_capacity(healthy.len());
        let mut ready: VecDeque<&str> = healthy
            .iter()
            .copied()
            .filter(|n| indegree.get(n) == Some(&0))
            .collect();
        while let Some(node) = ready.pop_front() {
            order.push(node.to_owned());
            let mut released = Vec::new();
            for child in self.downstream.get(node).into_iter().flatten() {
                if let Some(deg) = indegree.get_mut(child.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        released.push(child.as_str());
                    }
                }
            }
            released.sort_by_key(|c| names.iter().position(|n| n == c));
            ready.extend(released);
        }
        order
    }

    fn reachable_from(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([name]);
        while let Some(node) = queue.pop_front() {
            for child in self.downstream.get(node).into_iter().flatten() {
                if seen.insert(child.clone()) {
                    queue.push_back(child);
                }
            }
        }
        seen.remove(name);
        seen
    }

    /// Healthy attributes in dependency order.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Every healthy attribute transitively downstream of `name`, in
    /// dependency order.
    #[must_use]
    pub fn downstream(&self, name: &str) -> Vec<String> {
        let reachable = self.reachable_from(name);
        self.order
            .iter()
            .filter(|n| reachable.contains(*n))
            .cloned()
            .collect()
    }

    /// Direct upstream attributes of `name`.
    pub fn upstream<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + use<'a> {
        self.upstream.get(name).into_iter().flatten().map(String::as_str)
    }

    /// Parsed mappings of a callback-bearing attribute.
    #[must_use]
    pub fn mappings(&self, name: &str) -> &[ParsedMapping] {
        self.mappings.get(name).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn is_broken(&self, name: &str) -> bool {
        self.broken.contains_key(name)
    }

    /// Misconfigured attributes and why.
    #[must_use]
    pub fn broken(&self) -> &BTreeMap<String, ConfigurationError> {
        &self.broken
    }

    /// Duplicate declarations that were dropped.
    #[must_use]
    pub fn duplicates(&self) -> &[ConfigurationError] {
        &self.duplicates
    }
}
