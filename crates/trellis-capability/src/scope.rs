//! Capability scopes and cross-scope visibility.
//!
//! The set of scope kinds is closed, so visibility between scopes is decided
//! by matching on the variants rather than through dynamic dispatch. The
//! include graph (profiles including profiles, socket-binding groups including
//! groups, server groups referencing one of each) comes from a
//! [`ResolutionContext`] built from the root resource.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use trellis_model::{PathAddress, Resource};

pub const PROFILE: &str = "profile";
pub const SOCKET_BINDING_GROUP: &str = "socket-binding-group";
pub const SERVER_GROUP: &str = "server-group";
pub const HOST: &str = "host";
pub const INCLUDES: &str = "includes";

/// Partition within which a capability name is unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "name")]
pub enum CapabilityScope {
    Global,
    Host(String),
    Profile(String),
    SocketBindingGroup(String),
    ServerGroup(String),
}

impl CapabilityScope {
    /// Scope of capabilities registered by a resource at `address`.
    pub fn for_address(address: &PathAddress) -> Self {
        let Some(first) = address.element(0) else {
            return CapabilityScope::Global;
        };
        let name = first.value().to_owned();
        match first.key() {
            PROFILE => CapabilityScope::Profile(name),
            SOCKET_BINDING_GROUP => CapabilityScope::SocketBindingGroup(name),
            SERVER_GROUP => CapabilityScope::ServerGroup(name),
            HOST => CapabilityScope::Host(name),
            _ => CapabilityScope::Global,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, CapabilityScope::Global)
    }
}

impl fmt::Display for CapabilityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityScope::Global => write!(f, "global"),
            CapabilityScope::Host(n) => write!(f, "{HOST}={n}"),
            CapabilityScope::Profile(n) => write!(f, "{PROFILE}={n}"),
            CapabilityScope::SocketBindingGroup(n) => write!(f, "{SOCKET_BINDING_GROUP}={n}"),
            CapabilityScope::ServerGroup(n) => write!(f, "{SERVER_GROUP}={n}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ServerGroupRefs {
    profile: Option<String>,
    socket_binding_group: Option<String>,
}

/// Include relationships between domain-level scopes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionContext {
    profile_includes: BTreeMap<String, BTreeSet<String>>,
    group_includes: BTreeMap<String, BTreeSet<String>>,
    server_groups: BTreeMap<String, ServerGroupRefs>,
}

impl ResolutionContext {
    /// Read the include graph from `profile=*`, `socket-binding-group=*` and
    /// `server-group=*` children of the root resource.
    pub fn from_root(root: &Resource) -> Self {
        let mut context = Self::default();
        for element in root.child_elements() {
            let Some(child) = root.child(&element) else {
                continue;
            };
            let name = element.value().to_owned();
            match element.key() {
                PROFILE => {
                    context
                        .profile_includes
                        .insert(name, string_list(child.model().get(INCLUDES)));
                }
                SOCKET_BINDING_GROUP => {
                    context
                        .group_includes
                        .insert(name, string_list(child.model().get(INCLUDES)));
                }
                SERVER_GROUP => {
                    let text = |key: &str| {
                        child
                            .model()
                            .get(key)
                            .and_then(Value::as_str)
                            .map(str::to_owned)
                    };
                    context.server_groups.insert(
                        name,
                        ServerGroupRefs {
                            profile: text(PROFILE),
                            socket_binding_group: text(SOCKET_BINDING_GROUP),
                        },
                    );
                }
                _ => {}
            }
        }
        context
    }

    #[must_use]
    pub fn with_profile(mut self, name: &str, includes: &[&str]) -> Self {
        self.profile_includes.insert(
            name.to_owned(),
            includes.iter().map(|s| (*s).to_owned()).collect(),
        );
        self
    }

    #[must_use]
    pub fn with_socket_binding_group(mut self, name: &str, includes: &[&str]) -> Self {
        self.group_includes.insert(
            name.to_owned(),
            includes.iter().map(|s| (*s).to_owned()).collect(),
        );
        self
    }

    #[must_use]
    pub fn with_server_group(
        mut self,
        name: &str,
        profile: Option<&str>,
        socket_binding_group: Option<&str>,
    ) -> Self {
        self.server_groups.insert(
            name.to_owned(),
            ServerGroupRefs {
                profile: profile.map(str::to_owned),
                socket_binding_group: socket_binding_group.map(str::to_owned),
            },
        );
        self
    }

    /// Scopes whose capabilities a requirement in `scope` sees directly:
    /// the scope itself, everything it transitively includes, and global.
    pub fn visible_scopes(&self, scope: &CapabilityScope) -> BTreeSet<CapabilityScope> {
        let mut visible = BTreeSet::from([CapabilityScope::Global]);
        match scope {
            CapabilityScope::Global => {}
            CapabilityScope::Host(_) => {
                visible.insert(scope.clone());
            }
            CapabilityScope::Profile(name) => {
                visible.extend(
                    include_closure(&self.profile_includes, name)
                        .into_iter()
                        .map(CapabilityScope::Profile),
                );
            }
            CapabilityScope::SocketBindingGroup(name) => {
                visible.extend(
                    include_closure(&self.group_includes, name)
                        .into_iter()
                        .map(CapabilityScope::SocketBindingGroup),
                );
            }
            CapabilityScope::ServerGroup(name) => {
                visible.insert(scope.clone());
                if let Some(refs) = self.server_groups.get(name) {
                    if let Some(profile) = &refs.profile {
                        visible.extend(self.visible_scopes(&CapabilityScope::Profile(profile.clone())));
                    }
                    if let Some(group) = &refs.socket_binding_group {
                        visible.extend(
                            self.visible_scopes(&CapabilityScope::SocketBindingGroup(group.clone())),
                        );
                    }
                }
            }
        }
        visible
    }

    /// Scopes other than `scope` that transitively include it. A requirement
    /// in `scope` may be satisfied through any of them.
    pub fn including_scopes(&self, scope: &CapabilityScope) -> BTreeSet<CapabilityScope> {
        match scope {
            CapabilityScope::Profile(name) => including(&self.profile_includes, name)
                .into_iter()
                .map(CapabilityScope::Profile)
                .collect(),
            CapabilityScope::SocketBindingGroup(name) => including(&self.group_includes, name)
                .into_iter()
                .map(CapabilityScope::SocketBindingGroup)
                .collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Whether a capability registered in `candidate` can satisfy a
    /// requirement declared in `dependent`.
    pub fn can_satisfy(&self, candidate: &CapabilityScope, dependent: &CapabilityScope) -> bool {
        if self.visible_scopes(dependent).contains(candidate) {
            return true;
        }
        self.including_scopes(dependent)
            .iter()
            .any(|s| self.visible_scopes(s).contains(candidate))
    }
}

fn string_list(value: Option<&Value>) -> BTreeSet<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        Some(Value::String(s)) => BTreeSet::from([s.clone()]),
        _ => BTreeSet::new(),
    }
}

/// `start` plus everything reachable through `graph`; cycle safe.
fn include_closure(graph: &BTreeMap<String, BTreeSet<String>>, start: &str) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut pending = vec![start.to_owned()];
    while let Some(next) = pending.pop() {
        if !seen.insert(next.clone()) {
            continue;
        }
        if let Some(includes) = graph.get(&next) {
            pending.extend(includes.iter().cloned());
        }
    }
    seen
}

fn including(graph: &BTreeMap<String, BTreeSet<String>>, target: &str) -> BTreeSet<String> {
    graph
        .keys()
        .filter(|name| name.as_str() != target)
        .filter(|name| include_closure(graph, name).contains(target))
        .cloned()
        .collect()
}
