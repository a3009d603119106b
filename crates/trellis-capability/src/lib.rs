//! Capability and requirement registry for trellis.
//!
//! Resources register named capabilities (optionally scoped to a profile,
//! host, socket-binding group or server group) and the capabilities they
//! require. The published `CapabilityRegistry` only changes when an
//! operation publishes its `ShadowRegistry`; `CapabilitySet::resolve_capabilities`
//! reports missing and inconsistently resolvable requirements as data.

pub mod capability;
pub mod registry;
pub mod resolution;
pub mod scope;
pub mod status;

pub use capability::{
    CapabilityId, CapabilityRegistration, RegistrationPoint, RequirementRegistration,
    RuntimeCapability,
};
pub use registry::{CapabilityRegistry, CapabilitySet, ShadowRegistry};
pub use resolution::{CapabilityValidation, HOST_XML_DEFERRED};
pub use scope::{CapabilityScope, ResolutionContext};
pub use status::{CapabilityMetadata, RuntimeStatus};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capability '{id}' is already registered by {points} with a different definition")]
    AlreadyRegistered { id: String, points: String },
    #[error("cannot register requirement '{required}': dependent capability '{dependent}' is not registered")]
    UnknownDependent { dependent: String, required: String },
}
