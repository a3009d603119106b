//! Handlers for resources declared in a model file.

use serde_json::{Map, Value};
use trellis_controller::{
    AddStepHandler, ControllerError, HandlerParameters, OperationContext, RemoveStepHandler,
    ServiceContainer, WriteAttributeHandler,
};
use trellis_model::{AttributeDefinition, Operation, PathElement, RestartLevel, ServiceName};

/// A service a resource installs, named after the resource.
#[derive(Debug, Clone)]
pub struct ServiceTemplate {
    pub name: String,
    pub requires: Vec<String>,
}

impl ServiceTemplate {
    fn expand(template: &str, operation: &Operation) -> ServiceName {
        let name = operation.address.last_element().map_or("", PathElement::value);
        ServiceName::new(template.replace("{name}", name))
    }

    fn service(&self, operation: &Operation) -> ServiceName {
        Self::expand(&self.name, operation)
    }

    fn dependencies(&self, operation: &Operation) -> Vec<ServiceName> {
        self.requires
            .iter()
            .map(|r| Self::expand(r, operation))
            .collect()
    }

    fn install(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<(), ControllerError> {
        ctx.service_container(true)?
            .install(self.service(operation), self.dependencies(operation))
    }

    fn remove(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<(), ControllerError> {
        ctx.remove_service(&self.service(operation))?;
        Ok(())
    }
}

pub struct GenericAdd {
    parameters: HandlerParameters,
    service: Option<ServiceTemplate>,
}

impl GenericAdd {
    pub fn new(parameters: HandlerParameters, service: Option<ServiceTemplate>) -> Self {
        Self {
            parameters,
            service,
        }
    }
}

impl AddStepHandler for GenericAdd {
    fn parameters(&self) -> &HandlerParameters {
        &self.parameters
    }

    fn requires_runtime(&self, _ctx: &OperationContext) -> bool {
        self.service.is_some()
    }

    fn perform_runtime(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
        _model: &Map<String, Value>,
    ) -> Result<(), ControllerError> {
        match &self.service {
            Some(service) => service.install(ctx, operation),
            None => Ok(()),
        }
    }

    fn rollback_runtime(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
        _model: &Map<String, Value>,
    ) {
        if let Some(service) = &self.service {
            if let Err(e) = service.remove(ctx, operation) {
                tracing::warn!("rolling back {operation}: {e}");
            }
        }
    }
}

pub struct GenericRemove {
    parameters: HandlerParameters,
    service: Option<ServiceTemplate>,
}

impl GenericRemove {
    pub fn new(parameters: HandlerParameters, service: Option<ServiceTemplate>) -> Self {
        Self {
            parameters,
            service,
        }
    }
}

impl RemoveStepHandler for GenericRemove {
    fn parameters(&self) -> &HandlerParameters {
        &self.parameters
    }

    fn requires_runtime(&self, _ctx: &OperationContext) -> bool {
        self.service.is_some()
    }

    fn perform_runtime(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
        _model: &Map<String, Value>,
    ) -> Result<(), ControllerError> {
        match &self.service {
            Some(service) => service.remove(ctx, operation),
            None => Ok(()),
        }
    }

    fn recover_services(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
        _model: &Map<String, Value>,
    ) {
        if let Some(service) = &self.service {
            if let Err(e) = service.install(ctx, operation) {
                tracing::warn!("recovering services of {operation}: {e}");
            }
        }
    }
}

/// Attribute writes have no runtime effect of their own; anything but
/// restart level `none` asks for a reload (or a restart, for `jvm`).
pub struct GenericWrite {
    attributes: Vec<AttributeDefinition>,
}

impl GenericWrite {
    pub fn new(attributes: Vec<AttributeDefinition>) -> Self {
        Self { attributes }
    }
}

impl WriteAttributeHandler for GenericWrite {
    type Handback = ();

    fn attributes(&self) -> &[AttributeDefinition] {
        &self.attributes
    }

    fn apply_update_to_runtime(
        &self,
        _ctx: &mut OperationContext,
        _operation: &Operation,
        attribute: &AttributeDefinition,
        resolved: &Value,
        current: &Value,
    ) -> Result<(bool, ()), ControllerError> {
        Ok((attribute.restart != RestartLevel::None && resolved != current, ()))
    }

    fn revert_update_to_runtime(
        &self,
        _ctx: &mut OperationContext,
        _operation: &Operation,
        _attribute: &AttributeDefinition,
        _restored: &Value,
        _handback: (),
    ) -> Result<(), ControllerError> {
        Ok(())
    }
}
