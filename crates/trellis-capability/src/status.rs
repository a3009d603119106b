use crate::capability::{CapabilityId, RuntimeCapability};
use crate::registry::CapabilitySet;
use crate::scope::{CapabilityScope, HOST};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::trace;
use trellis_model::PathAddress;

const SUBSYSTEM: &str = "subsystem";

/// Whether a resource's capabilities run with the configuration the model
/// describes. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeStatus {
    #[default]
    Normal,
    ReloadRequired,
    RestartRequired,
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeStatus::Normal => "normal",
            RuntimeStatus::ReloadRequired => "reload-required",
            RuntimeStatus::RestartRequired => "restart-required",
        };
        f.write_str(s)
    }
}

/// Registration metadata consulted by [`CapabilitySet::runtime_status`].
pub trait CapabilityMetadata {
    /// Capabilities the resource at `address` is part of without registering
    /// them itself. `None` defers to the parent resource; an empty list means
    /// the resource belongs to no capability.
    fn incorporating_capabilities(&self, address: &PathAddress) -> Option<Vec<RuntimeCapability>>;
}

impl<F> CapabilityMetadata for F
where
    F: Fn(&PathAddress) -> Option<Vec<RuntimeCapability>>,
{
    fn incorporating_capabilities(&self, address: &PathAddress) -> Option<Vec<RuntimeCapability>> {
        self(address)
    }
}

fn is_climb_boundary(address: &PathAddress) -> bool {
    if address.is_empty() {
        return true;
    }
    if address.last_element().is_some_and(|e| e.key() == SUBSYSTEM) {
        return true;
    }
    address.len() <= 2 && address.element(0).is_some_and(|e| e.key() == HOST)
}

impl CapabilitySet {
    /// Most severe reload/restart marker among the capabilities associated
    /// with `address` and every capability depending on them.
    pub fn runtime_status(
        &self,
        address: &PathAddress,
        metadata: &dyn CapabilityMetadata,
    ) -> RuntimeStatus {
        let mut pending = self.associated_capabilities(address, metadata);
        let mut visited = BTreeSet::new();
        let mut status = RuntimeStatus::Normal;
        while let Some(id) = pending.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            if self.restart_required.contains(&id) {
                trace!("{id} requires restart");
                return RuntimeStatus::RestartRequired;
            }
            if self.reload_required.contains(&id) {
                status = RuntimeStatus::ReloadRequired;
            }
            pending.extend(
                self.requirements()
                    .filter(|r| r.required == id.name && (r.scope == id.scope || id.scope.is_global()))
                    .map(|r| r.dependent_id()),
            );
        }
        status
    }

    /// Capabilities registered at `address` or, failing that, at the nearest
    /// ancestor whose capabilities the resource is incorporated into.
    fn associated_capabilities(
        &self,
        address: &PathAddress,
        metadata: &dyn CapabilityMetadata,
    ) -> Vec<CapabilityId> {
        let mut current = address.clone();
        loop {
            let registered = self.capabilities_at(&current);
            if !registered.is_empty() {
                return registered;
            }
            if let Some(incorporating) = metadata.incorporating_capabilities(&current) {
                let parent = current.parent();
                let scope = CapabilityScope::for_address(&current);
                return incorporating
                    .iter()
                    .map(|cap| CapabilityId::new(cap.for_address(&parent).name(), scope.clone()))
                    .filter(|id| self.capabilities.contains_key(id))
                    .collect();
            }
            if is_climb_boundary(&current) {
                return Vec::new();
            }
            current = current.parent();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityRegistration, RegistrationPoint};

    fn addr(s: &str) -> PathAddress {
        PathAddress::parse(s).unwrap()
    }

    fn register(set: &mut CapabilitySet, cap: RuntimeCapability, at: &str) {
        let address = addr(at);
        let scope = CapabilityScope::for_address(&address);
        set.register_capability(CapabilityRegistration::new(
            cap,
            scope,
            RegistrationPoint::new(address),
        ))
        .unwrap();
    }

    fn inherit(_: &PathAddress) -> Option<Vec<RuntimeCapability>> {
        None
    }

    #[test]
    fn child_inherits_parent_marker() {
        let mut set = CapabilitySet::default();
        register(&mut set, RuntimeCapability::new("org.web"), "/subsystem=web");
        assert_eq!(
            set.runtime_status(&addr("/subsystem=web/connector=http"), &inherit),
            RuntimeStatus::Normal
        );
        set.capability_reload_required(&addr("/subsystem=web"));
        assert_eq!(
            set.runtime_status(&addr("/subsystem=web/connector=http"), &inherit),
            RuntimeStatus::ReloadRequired
        );
    }

    #[test]
    fn dependents_are_walked_and_restart_wins() {
        let mut set = CapabilitySet::default();
        register(&mut set, RuntimeCapability::new("org.ds"), "/subsystem=ds");
        register(
            &mut set,
            RuntimeCapability::new("org.jpa").with_requirement("org.ds"),
            "/subsystem=jpa",
        );
        register(
            &mut set,
            RuntimeCapability::new("org.ejb").with_requirement("org.jpa"),
            "/subsystem=ejb",
        );
        set.capability_reload_required(&addr("/subsystem=jpa"));
        assert_eq!(
            set.runtime_status(&addr("/subsystem=ds"), &inherit),
            RuntimeStatus::ReloadRequired
        );
        set.capability_restart_required(&addr("/subsystem=ejb"));
        assert_eq!(
            set.runtime_status(&addr("/subsystem=ds"), &inherit),
            RuntimeStatus::RestartRequired
        );
    }

    #[test]
    fn climb_stops_at_subsystem_and_host_boundaries() {
        let mut set = CapabilitySet::default();
        register(&mut set, RuntimeCapability::new("org.host"), "/host=h");
        set.capability_restart_required(&addr("/host=h"));
        assert_eq!(
            set.runtime_status(&addr("/host=h/subsystem=jmx/expose=x"), &inherit),
            RuntimeStatus::Normal
        );
        assert_eq!(
            set.runtime_status(&addr("/host=h/interface=i/x=y"), &inherit),
            RuntimeStatus::Normal
        );
        assert_eq!(
            set.runtime_status(&addr("/host=h"), &inherit),
            RuntimeStatus::RestartRequired
        );
    }

    #[test]
    fn incorporating_capabilities_use_parent_value() {
        let mut set = CapabilitySet::default();
        let base = RuntimeCapability::new("org.pool").dynamic();
        let at = addr("/subsystem=ds/pool=main");
        register(&mut set, base.for_address(&at), "/subsystem=ds/pool=main");
        set.capability_reload_required(&at);

        let metadata = |a: &PathAddress| {
            (a.last_element().map(|e| e.key()) == Some("setting"))
                .then(|| vec![RuntimeCapability::new("org.pool").dynamic()])
        };
        assert_eq!(
            set.runtime_status(&addr("/subsystem=ds/pool=main/setting=timeout"), &metadata),
            RuntimeStatus::ReloadRequired
        );

        let none = |_: &PathAddress| Some(Vec::new());
        assert_eq!(
            set.runtime_status(&addr("/subsystem=ds/pool=main/setting=timeout"), &none),
            RuntimeStatus::Normal
        );
    }

    #[test]
    fn status_ordering() {
        assert!(RuntimeStatus::RestartRequired > RuntimeStatus::ReloadRequired);
        assert!(RuntimeStatus::ReloadRequired > RuntimeStatus::Normal);
        assert_eq!(RuntimeStatus::ReloadRequired.to_string(), "reload-required");
    }
}
