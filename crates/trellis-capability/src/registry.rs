use crate::capability::{
    CapabilityId, CapabilityRegistration, RegistrationPoint, RequirementRegistration,
};
use crate::scope::CapabilityScope;
use crate::CapabilityError;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, trace};
use trellis_model::PathAddress;

type Requirements = BTreeMap<CapabilityId, BTreeMap<String, RequirementRegistration>>;

/// Registered capabilities, their requirements and pending reload/restart
/// markers. Reference counted by registration point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    pub(crate) capabilities: BTreeMap<CapabilityId, CapabilityRegistration>,
    pub(crate) requirements: Requirements,
    pub(crate) runtime_only_requirements: Requirements,
    pub(crate) reload_required: BTreeSet<CapabilityId>,
    pub(crate) restart_required: BTreeSet<CapabilityId>,
}

impl CapabilitySet {
    /// Register a capability, or add a registration point to an existing one,
    /// and register each of its hard requirements from the same point.
    ///
    /// Registering the identical capability again from a point that already
    /// provides it changes nothing.
    pub fn register_capability(
        &mut self,
        registration: CapabilityRegistration,
    ) -> Result<(), CapabilityError> {
        let id = registration.id();
        match self.capabilities.get_mut(&id) {
            Some(existing) => {
                if existing.capability != registration.capability {
                    return Err(CapabilityError::AlreadyRegistered {
                        id: id.to_string(),
                        points: join_points(&existing.points),
                    });
                }
                for point in &registration.points {
                    if !existing.points.insert(point.clone()) {
                        trace!("capability {id} already registered at {point}");
                    }
                }
            }
            None => {
                debug!("registering capability {id}");
                self.capabilities.insert(id.clone(), registration.clone());
            }
        }

        for required in registration.capability.requirements() {
            for point in &registration.points {
                add_requirement(
                    &mut self.requirements,
                    RequirementRegistration::new(
                        id.name.clone(),
                        required.clone(),
                        id.scope.clone(),
                        point.clone(),
                    ),
                );
            }
        }
        Ok(())
    }

    /// Register a requirement not declared by the dependent capability itself
    /// (e.g. one named by an attribute value).
    pub fn register_additional_requirement(
        &mut self,
        requirement: RequirementRegistration,
    ) -> Result<(), CapabilityError> {
        let dependent = requirement.dependent_id();
        if !self.capabilities.contains_key(&dependent) {
            return Err(CapabilityError::UnknownDependent {
                dependent: dependent.to_string(),
                required: requirement.required,
            });
        }
        debug!(
            "registering requirement {} -> {}",
            dependent, requirement.required
        );
        if requirement.runtime_only {
            add_requirement(&mut self.runtime_only_requirements, requirement);
        } else {
            add_requirement(&mut self.requirements, requirement);
        }
        Ok(())
    }

    /// Drop the requirement's registration points; the requirement goes away
    /// with its last point.
    pub fn remove_requirement(&mut self, requirement: &RequirementRegistration) {
        let table = if requirement.runtime_only {
            &mut self.runtime_only_requirements
        } else {
            &mut self.requirements
        };
        let dependent = requirement.dependent_id();
        let Some(by_required) = table.get_mut(&dependent) else {
            return;
        };
        if let Some(existing) = by_required.get_mut(&requirement.required) {
            for point in &requirement.points {
                existing.points.remove(point);
            }
            if existing.points.is_empty() {
                debug!("removed requirement {dependent} -> {}", requirement.required);
                by_required.remove(&requirement.required);
            }
        }
        if by_required.is_empty() {
            table.remove(&dependent);
        }
    }

    /// Remove one registration point of a capability. The capability, its
    /// requirements and its reload/restart markers go away with the last
    /// point. Returns the registration when it was fully removed.
    pub fn remove_capability(
        &mut self,
        name: &str,
        scope: &CapabilityScope,
        point: &RegistrationPoint,
    ) -> Option<CapabilityRegistration> {
        let id = CapabilityId::new(name, scope.clone());
        let existing = self.capabilities.get_mut(&id)?;
        existing.points.remove(point);
        let fully_removed = existing.points.is_empty();

        for table in [&mut self.requirements, &mut self.runtime_only_requirements] {
            if fully_removed {
                table.remove(&id);
                continue;
            }
            if let Some(by_required) = table.get_mut(&id) {
                for requirement in by_required.values_mut() {
                    requirement.points.remove(point);
                }
                by_required.retain(|_, r| !r.points.is_empty());
                if by_required.is_empty() {
                    table.remove(&id);
                }
            }
        }

        if !fully_removed {
            return None;
        }
        debug!("removed capability {id}");
        self.reload_required.remove(&id);
        self.restart_required.remove(&id);
        self.capabilities.remove(&id)
    }

    pub fn has_capability(&self, name: &str, scope: &CapabilityScope) -> bool {
        self.capabilities
            .contains_key(&CapabilityId::new(name, scope.clone()))
    }

    pub fn capability(&self, id: &CapabilityId) -> Option<&CapabilityRegistration> {
        self.capabilities.get(id)
    }

    pub fn capability_ids(&self) -> impl Iterator<Item = &CapabilityId> {
        self.capabilities.keys()
    }

    pub fn requirement(
        &self,
        dependent: &CapabilityId,
        required: &str,
    ) -> Option<&RequirementRegistration> {
        self.requirements
            .get(dependent)
            .and_then(|r| r.get(required))
            .or_else(|| {
                self.runtime_only_requirements
                    .get(dependent)
                    .and_then(|r| r.get(required))
            })
    }

    /// Every hard and runtime-only requirement, in dependent order.
    pub fn requirements(&self) -> impl Iterator<Item = &RequirementRegistration> {
        self.requirements
            .values()
            .chain(self.runtime_only_requirements.values())
            .flat_map(BTreeMap::values)
    }

    /// Full names of dynamic capabilities registered under `base` in `scope`.
    pub fn dynamic_capability_names(&self, base: &str, scope: &CapabilityScope) -> Vec<String> {
        let prefix = format!("{base}.");
        self.capabilities
            .keys()
            .filter(|id| &id.scope == scope && id.name.starts_with(&prefix))
            .map(|id| id.name[prefix.len()..].to_owned())
            .collect()
    }

    /// Capabilities with a registration point at `address`.
    pub fn capabilities_at(&self, address: &PathAddress) -> Vec<CapabilityId> {
        self.capabilities
            .iter()
            .filter(|(_, reg)| reg.points.iter().any(|p| &p.address == address))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Mark every capability registered at `address` as needing a reload.
    /// Returns the ids that were not already marked.
    pub fn capability_reload_required(&mut self, address: &PathAddress) -> Vec<CapabilityId> {
        let ids = self.capabilities_at(address);
        ids.into_iter()
            .filter(|id| self.reload_required.insert(id.clone()))
            .collect()
    }

    pub fn capability_restart_required(&mut self, address: &PathAddress) -> Vec<CapabilityId> {
        let ids = self.capabilities_at(address);
        ids.into_iter()
            .filter(|id| self.restart_required.insert(id.clone()))
            .collect()
    }

    pub fn revert_reload_required(&mut self, ids: &[CapabilityId]) {
        for id in ids {
            self.reload_required.remove(id);
        }
    }

    pub fn revert_restart_required(&mut self, ids: &[CapabilityId]) {
        for id in ids {
            self.restart_required.remove(id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty() && self.requirements.is_empty()
    }
}

fn add_requirement(table: &mut Requirements, requirement: RequirementRegistration) {
    let by_required = table.entry(requirement.dependent_id()).or_default();
    match by_required.get_mut(&requirement.required) {
        Some(existing) => existing.points.extend(requirement.points),
        None => {
            by_required.insert(requirement.required.clone(), requirement);
        }
    }
}

fn join_points(points: &BTreeSet<RegistrationPoint>) -> String {
    points
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// The published capability registry.
///
/// It is only ever changed by publishing a [`ShadowRegistry`]; readers take
/// a short read lock and never observe a half-applied transaction.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    published: RwLock<CapabilitySet>,
}

impl CapabilityRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Writable copy for one in-flight operation.
    pub fn create_shadow_copy(self: &Arc<Self>) -> ShadowRegistry {
        ShadowRegistry {
            published: Arc::clone(self),
            working: self.published.read().clone(),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&CapabilitySet) -> R) -> R {
        f(&self.published.read())
    }

    pub fn snapshot(&self) -> CapabilitySet {
        self.published.read().clone()
    }

    pub fn clear(&self) {
        *self.published.write() = CapabilitySet::default();
    }
}

/// Per-transaction writable copy of the registry.
#[derive(Debug)]
pub struct ShadowRegistry {
    published: Arc<CapabilityRegistry>,
    working: CapabilitySet,
}

impl ShadowRegistry {
    /// Replace the published registry with this copy.
    pub fn publish(self) {
        debug!(
            "publishing capability registry ({} capabilities)",
            self.working.capabilities.len()
        );
        *self.published.published.write() = self.working;
    }

    /// Discard this copy; the published registry is untouched.
    pub fn rollback(self) {
        trace!("discarding capability registry shadow copy");
    }
}

impl Deref for ShadowRegistry {
    type Target = CapabilitySet;

    fn deref(&self) -> &CapabilitySet {
        &self.working
    }
}

impl DerefMut for ShadowRegistry {
    fn deref_mut(&mut self) -> &mut CapabilitySet {
        &mut self.working
    }
}
