//! Requirement resolution.
//!
//! A requirement is satisfied when a capability of the required name is
//! registered in a scope visible from the dependent's scope. Failing that, it
//! may be satisfied through a scope that includes the dependent's scope (a
//! profile included by several others, say). Such indirect matches must be
//! consistent: all indirectly satisfied requirements of one dependent scope
//! need at least one including scope that satisfies all of them.

use crate::capability::{CapabilityId, RequirementRegistration};
use crate::registry::CapabilitySet;
use crate::scope::{CapabilityScope, ResolutionContext};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use trellis_model::Resource;

/// Domain-level capabilities that cannot resolve while only the host
/// configuration is loaded.
pub const HOST_XML_DEFERRED: [&str; 3] = [
    "org.trellis.domain.profile",
    "org.trellis.domain.server-group",
    "org.trellis.domain.socket-binding-group",
];

/// Outcome of [`CapabilitySet::resolve_capabilities`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityValidation {
    /// Unsatisfied requirements, grouped by the dependent capability.
    pub missing_requirements: BTreeMap<CapabilityId, BTreeSet<RequirementRegistration>>,
    /// Requirements satisfiable only through including scopes that have no
    /// scope in common.
    pub inconsistent_requirements: BTreeSet<RequirementRegistration>,
}

impl CapabilityValidation {
    pub fn is_valid(&self) -> bool {
        self.missing_requirements.is_empty() && self.inconsistent_requirements.is_empty()
    }

    /// Human-readable description of every problem, one per line.
    pub fn failure_description(&self) -> String {
        let mut lines = Vec::new();
        if !self.missing_requirements.is_empty() {
            lines.push("required capabilities are not available:".to_owned());
            for requirements in self.missing_requirements.values() {
                for requirement in requirements {
                    lines.push(format!("    {requirement}"));
                }
            }
        }
        if !self.inconsistent_requirements.is_empty() {
            lines.push(
                "requirements cannot be consistently resolved from a single including scope:"
                    .to_owned(),
            );
            for requirement in &self.inconsistent_requirements {
                lines.push(format!("    {requirement}"));
            }
        }
        lines.join("\n")
    }
}

fn is_deferred(requirement: &RequirementRegistration) -> bool {
    matches!(requirement.scope, CapabilityScope::Host(_))
        && HOST_XML_DEFERRED.iter().any(|base| {
            requirement.required == *base
                || requirement
                    .required
                    .strip_prefix(base)
                    .is_some_and(|rest| rest.starts_with('.'))
        })
}

impl CapabilitySet {
    /// Check every registered requirement against the registered
    /// capabilities, using the include graph found under `root`.
    pub fn resolve_capabilities(&self, root: &Resource, host_xml_only: bool) -> CapabilityValidation {
        self.resolve_with_context(&ResolutionContext::from_root(root), host_xml_only)
    }

    pub fn resolve_with_context(
        &self,
        context: &ResolutionContext,
        host_xml_only: bool,
    ) -> CapabilityValidation {
        let mut validation = CapabilityValidation::default();
        // dependent scope -> (requirement, including scopes that satisfy it)
        let mut indirect: BTreeMap<
            CapabilityScope,
            Vec<(&RequirementRegistration, BTreeSet<CapabilityScope>)>,
        > = BTreeMap::new();

        for requirement in self.requirements() {
            if host_xml_only && is_deferred(requirement) {
                debug!("deferring validation of {requirement} until the domain model is loaded");
                continue;
            }
            match self.find_satisfying_scopes(context, requirement) {
                Satisfaction::Direct => {}
                Satisfaction::Indirect(scopes) => indirect
                    .entry(requirement.scope.clone())
                    .or_default()
                    .push((requirement, scopes)),
                Satisfaction::Missing => {
                    validation
                        .missing_requirements
                        .entry(requirement.dependent_id())
                        .or_default()
                        .insert(requirement.clone());
                }
            }
        }

        for (scope, group) in indirect {
            let mut common: Option<BTreeSet<CapabilityScope>> = None;
            for (_, scopes) in &group {
                common = Some(match common {
                    None => scopes.clone(),
                    Some(acc) => acc.intersection(scopes).cloned().collect(),
                });
            }
            if common.is_some_and(|c| c.is_empty()) {
                debug!("requirements of {scope} resolve against disjoint including scopes");
                validation
                    .inconsistent_requirements
                    .extend(group.into_iter().map(|(r, _)| r.clone()));
            }
        }

        validation
    }

    fn find_satisfying_scopes(
        &self,
        context: &ResolutionContext,
        requirement: &RequirementRegistration,
    ) -> Satisfaction {
        let visible = context.visible_scopes(&requirement.scope);
        if visible
            .iter()
            .any(|scope| self.has_capability(&requirement.required, scope))
        {
            return Satisfaction::Direct;
        }

        let candidates: Vec<&CapabilityScope> = self
            .capabilities
            .keys()
            .filter(|id| id.name == requirement.required)
            .map(|id| &id.scope)
            .filter(|scope| context.can_satisfy(scope, &requirement.scope))
            .collect();
        if candidates.is_empty() {
            return Satisfaction::Missing;
        }

        let through: BTreeSet<CapabilityScope> = context
            .including_scopes(&requirement.scope)
            .into_iter()
            .filter(|including| {
                let reachable = context.visible_scopes(including);
                candidates.iter().any(|c| reachable.contains(*c))
            })
            .collect();
        if through.is_empty() {
            Satisfaction::Missing
        } else {
            Satisfaction::Indirect(through)
        }
    }
}

enum Satisfaction {
    Direct,
    Indirect(BTreeSet<CapabilityScope>),
    Missing,
}
