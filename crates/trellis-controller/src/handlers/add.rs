use super::{dependent_name, HandlerParameters, OperationStepHandler};
use crate::context::{OperationContext, Stage};
use crate::ControllerError;
use serde_json::{Map, Value};
use std::sync::Arc;
use trellis_model::{Operation, Resource, ADD_INDEX};

/// The pieces of an `add` operation. Only `parameters` is required; the
/// defaults create the resource, copy validated attributes into it and
/// register the capabilities it provides.
pub trait AddStepHandler: Send + Sync + 'static {
    fn parameters(&self) -> &HandlerParameters;

    fn create_resource(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
    ) -> Result<(), ControllerError> {
        let index = add_index(ctx, operation);
        ctx.add_resource(&operation.address, index, Resource::new())
    }

    fn populate_model(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
    ) -> Result<(), ControllerError> {
        let attributes = &self.parameters().attributes;
        ctx.with_resource_for_update(&operation.address, |resource| {
            attributes
                .iter()
                .try_for_each(|a| a.validate_and_set(operation, resource.model_mut()))
        })??;
        Ok(())
    }

    /// Register the resource's capabilities, then the requirements named by
    /// capability-reference attributes.
    fn record_capabilities_and_requirements(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
    ) -> Result<(), ControllerError> {
        let mut capabilities = self.parameters().capabilities.clone();
        if let Some(registration) = ctx.root_registration().sub_registration(&operation.address) {
            for capability in registration.capabilities() {
                if !capabilities.contains(capability) {
                    capabilities.push(capability.clone());
                }
            }
        }
        for capability in &capabilities {
            ctx.register_capability(capability, None)?;
        }

        let model = ctx.read_model(&operation.address)?;
        for attribute in &self.parameters().attributes {
            let Some(reference) = &attribute.capability_reference else {
                continue;
            };
            let value = attribute.resolve(model.get(&attribute.name).unwrap_or(&Value::Null));
            if let Some(value) = value.as_str() {
                ctx.register_requirement(
                    &dependent_name(reference, &operation.address),
                    &reference.required_name(value),
                    Some(attribute.name.as_str()),
                    false,
                )?;
            }
        }
        Ok(())
    }

    fn requires_runtime(&self, _ctx: &OperationContext) -> bool {
        true
    }

    fn perform_runtime(
        &self,
        _ctx: &mut OperationContext,
        _operation: &Operation,
        _model: &Map<String, Value>,
    ) -> Result<(), ControllerError> {
        Ok(())
    }

    /// Undo whatever `perform_runtime` managed to do. Also called when
    /// `perform_runtime` itself failed part way.
    fn rollback_runtime(
        &self,
        _ctx: &mut OperationContext,
        _operation: &Operation,
        _model: &Map<String, Value>,
    ) {
    }
}

/// `add-index` is honoured only for child types the parent keeps ordered.
fn add_index(ctx: &OperationContext, operation: &Operation) -> Option<usize> {
    let index = operation.param(ADD_INDEX)?.as_u64()?;
    let element = operation.address.last_element()?;
    ctx.root_registration()
        .sub_registration(&operation.address.parent())
        .filter(|parent| parent.is_ordered_child_type(element.key()))
        .map(|_| index as usize)
}

/// Runs an [`AddStepHandler`]: MODEL work immediately, runtime work as a
/// RUNTIME step whose rollback is registered before it starts.
pub struct AddOperation<H>(Arc<H>);

impl<H: AddStepHandler> AddOperation<H> {
    pub fn new(handler: H) -> Self {
        Self(Arc::new(handler))
    }
}

impl<H: AddStepHandler> OperationStepHandler for AddOperation<H> {
    fn execute(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
    ) -> Result<(), ControllerError> {
        self.0.create_resource(ctx, operation)?;
        self.0.populate_model(ctx, operation)?;
        self.0.record_capabilities_and_requirements(ctx, operation)?;
        if !self.0.requires_runtime(ctx) {
            return Ok(());
        }
        let handler = Arc::clone(&self.0);
        ctx.add_step_fn(Stage::Runtime, operation.clone(), move |ctx, operation| {
            let model = ctx.read_model(&operation.address)?;
            let rollback = Arc::clone(&handler);
            let (op, saved) = (operation.clone(), model.clone());
            ctx.complete_step_with_rollback(move |ctx| rollback.rollback_runtime(ctx, &op, &saved))?;
            handler.perform_runtime(ctx, operation, &model)
        })
    }
}

/// An `add` that only touches the model and capability registry.
#[derive(Debug, Clone, Default)]
pub struct ModelOnlyAddHandler {
    parameters: HandlerParameters,
}

impl ModelOnlyAddHandler {
    pub fn new(parameters: HandlerParameters) -> Self {
        Self { parameters }
    }
}

impl AddStepHandler for ModelOnlyAddHandler {
    fn parameters(&self) -> &HandlerParameters {
        &self.parameters
    }

    fn requires_runtime(&self, _ctx: &OperationContext) -> bool {
        false
    }
}
