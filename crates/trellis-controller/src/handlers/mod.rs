//! Operation step handlers and the standard add, remove, write-attribute and
//! read building blocks.

mod add;
mod read;
mod remove;
mod write_attribute;

pub use add::{AddOperation, AddStepHandler, ModelOnlyAddHandler};
pub use read::{ReadAttributeHandler, ReadResourceHandler};
pub use remove::{ModelOnlyRemoveHandler, RemoveOperation, RemoveStepHandler};
pub use write_attribute::{
    ModelOnlyWriteAttributeHandler, WriteAttributeHandler, WriteAttributeOperation,
};

use crate::context::OperationContext;
use crate::ControllerError;
use std::sync::Arc;
use trellis_capability::RuntimeCapability;
use trellis_model::{AttributeDefinition, Operation, PathAddress};

/// One unit of work in an operation. Handlers are shared between operations
/// and may run on several threads at once during parallel boot.
pub trait OperationStepHandler: Send + Sync {
    fn execute(&self, ctx: &mut OperationContext, operation: &Operation)
        -> Result<(), ControllerError>;
}

impl<F> OperationStepHandler for F
where
    F: Fn(&mut OperationContext, &Operation) -> Result<(), ControllerError> + Send + Sync,
{
    fn execute(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
    ) -> Result<(), ControllerError> {
        self(ctx, operation)
    }
}

pub fn from_fn<F>(f: F) -> Arc<dyn OperationStepHandler>
where
    F: Fn(&mut OperationContext, &Operation) -> Result<(), ControllerError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Attributes and capabilities a standard handler works with.
#[derive(Debug, Clone, Default)]
pub struct HandlerParameters {
    pub attributes: Vec<AttributeDefinition>,
    pub capabilities: Vec<RuntimeCapability>,
}

impl HandlerParameters {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_attribute(mut self, attribute: AttributeDefinition) -> Self {
        self.attributes.push(attribute);
        self
    }

    #[must_use]
    pub fn with_capability(mut self, capability: RuntimeCapability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDefinition> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// Dependent capability name for an attribute-declared requirement.
pub(crate) fn dependent_name(
    reference: &trellis_model::CapabilityReference,
    address: &PathAddress,
) -> String {
    match (reference.dynamic_dependent, address.last_element()) {
        (true, Some(element)) => format!("{}.{}", reference.dependent, element.value()),
        _ => reference.dependent.clone(),
    }
}
