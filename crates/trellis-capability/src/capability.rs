use crate::scope::CapabilityScope;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use trellis_model::PathAddress;

/// Identity of a registered capability: its full name within a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CapabilityId {
    pub name: String,
    pub scope: CapabilityScope,
}

impl CapabilityId {
    pub fn new(name: impl Into<String>, scope: CapabilityScope) -> Self {
        Self {
            name: name.into(),
            scope,
        }
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scope.is_global() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} ({})", self.name, self.scope)
        }
    }
}

/// The resource (and optionally attribute) that caused a registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistrationPoint {
    pub address: PathAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl RegistrationPoint {
    pub fn new(address: PathAddress) -> Self {
        Self {
            address,
            attribute: None,
        }
    }

    pub fn for_attribute(address: PathAddress, attribute: impl Into<String>) -> Self {
        Self {
            address,
            attribute: Some(attribute.into()),
        }
    }
}

impl fmt::Display for RegistrationPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.attribute {
            Some(attr) => write!(f, "{} (attribute '{attr}')", self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// A capability definition. Dynamic capabilities are templates whose full
/// name is `<base>.<element value>` of the registering resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuntimeCapability {
    name: String,
    #[serde(default)]
    dynamic: bool,
    #[serde(default)]
    requirements: BTreeSet<String>,
}

impl RuntimeCapability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dynamic: false,
            requirements: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    #[must_use]
    pub fn with_requirement(mut self, required: impl Into<String>) -> Self {
        self.requirements.insert(required.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Hard requirements registered alongside this capability.
    pub fn requirements(&self) -> &BTreeSet<String> {
        &self.requirements
    }

    pub fn dynamic_name(&self, element_value: &str) -> String {
        format!("{}.{element_value}", self.name)
    }

    /// Concrete capability for a registering resource. Static capabilities
    /// are returned unchanged.
    pub fn for_address(&self, address: &PathAddress) -> RuntimeCapability {
        if !self.dynamic {
            return self.clone();
        }
        let name = match address.last_element() {
            Some(element) => self.dynamic_name(element.value()),
            None => self.name.clone(),
        };
        RuntimeCapability {
            name,
            dynamic: false,
            requirements: self.requirements.clone(),
        }
    }
}

/// A capability together with every resource currently providing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRegistration {
    pub capability: RuntimeCapability,
    pub scope: CapabilityScope,
    pub points: BTreeSet<RegistrationPoint>,
}

impl CapabilityRegistration {
    pub fn new(
        capability: RuntimeCapability,
        scope: CapabilityScope,
        point: RegistrationPoint,
    ) -> Self {
        Self {
            capability,
            scope,
            points: BTreeSet::from([point]),
        }
    }

    pub fn id(&self) -> CapabilityId {
        CapabilityId::new(self.capability.name(), self.scope.clone())
    }
}

/// A dependent capability's need for another capability.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequirementRegistration {
    pub dependent: String,
    pub required: String,
    pub scope: CapabilityScope,
    #[serde(default)]
    pub runtime_only: bool,
    pub points: BTreeSet<RegistrationPoint>,
}

impl RequirementRegistration {
    pub fn new(
        dependent: impl Into<String>,
        required: impl Into<String>,
        scope: CapabilityScope,
        point: RegistrationPoint,
    ) -> Self {
        Self {
            dependent: dependent.into(),
            required: required.into(),
            scope,
            runtime_only: false,
            points: BTreeSet::from([point]),
        }
    }

    /// Soft requirement: only enforced when the runtime is present.
    #[must_use]
    pub fn runtime_only(mut self) -> Self {
        self.runtime_only = true;
        self
    }

    pub fn dependent_id(&self) -> CapabilityId {
        CapabilityId::new(self.dependent.clone(), self.scope.clone())
    }
}

impl fmt::Display for RequirementRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' required by '{}'", self.required, self.dependent_id())?;
        let points: Vec<String> = self.points.iter().map(ToString::to_string).collect();
        if !points.is_empty() {
            write!(f, " at {}", points.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_capability_takes_element_value() {
        let cap = RuntimeCapability::new("org.trellis.network.socket-binding").dynamic();
        let addr = PathAddress::parse("/socket-binding-group=std/socket-binding=http").unwrap();
        let concrete = cap.for_address(&addr);
        assert_eq!(concrete.name(), "org.trellis.network.socket-binding.http");
        assert!(!concrete.is_dynamic());
    }

    #[test]
    fn static_capability_is_unchanged() {
        let cap = RuntimeCapability::new("org.foo.bar").with_requirement("org.foo.baz");
        let concrete = cap.for_address(&PathAddress::parse("/subsystem=foo").unwrap());
        assert_eq!(concrete, cap);
    }

    #[test]
    fn capability_id_display_mentions_non_global_scope() {
        let id = CapabilityId::new("org.foo", CapabilityScope::Profile("full".to_owned()));
        assert_eq!(id.to_string(), "org.foo (profile=full)");
        let global = CapabilityId::new("org.foo", CapabilityScope::Global);
        assert_eq!(global.to_string(), "org.foo");
    }

    #[test]
    fn requirement_display_lists_points() {
        let req = RequirementRegistration::new(
            "org.web",
            "org.net.http",
            CapabilityScope::Global,
            RegistrationPoint::for_attribute(
                PathAddress::parse("/subsystem=web").unwrap(),
                "socket-binding",
            ),
        );
        let text = req.to_string();
        assert!(text.contains("'org.net.http' required by 'org.web'"));
        assert!(text.contains("/subsystem=web (attribute 'socket-binding')"));
    }
}
