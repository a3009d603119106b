use super::{dependent_name, HandlerParameters, OperationStepHandler};
use crate::attachment::AttachmentKey;
use crate::context::{OperationContext, Stage};
use crate::ControllerError;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use trellis_model::{Operation, PathAddress, REMOVE};

/// Addresses whose removable children have already been scheduled for
/// removal in this operation.
const REMOVE_VISITED: AttachmentKey<BTreeSet<PathAddress>> = AttachmentKey::new("remove-visited");

pub trait RemoveStepHandler: Send + Sync + 'static {
    fn parameters(&self) -> &HandlerParameters;

    fn perform_remove(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
        _model: &Map<String, Value>,
    ) -> Result<(), ControllerError> {
        ctx.remove_resource(&operation.address)?;
        Ok(())
    }

    /// Drop attribute-declared requirements, then the resource's own
    /// capabilities.
    fn record_capabilities_and_requirements(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
        model: &Map<String, Value>,
    ) -> Result<(), ControllerError> {
        for attribute in &self.parameters().attributes {
            let Some(reference) = &attribute.capability_reference else {
                continue;
            };
            let value = attribute.resolve(model.get(&attribute.name).unwrap_or(&Value::Null));
            if let Some(value) = value.as_str() {
                ctx.deregister_requirement(
                    &dependent_name(reference, &operation.address),
                    &reference.required_name(value),
                    Some(attribute.name.as_str()),
                )?;
            }
        }

        let mut capabilities = self.parameters().capabilities.clone();
        if let Some(registration) = ctx.root_registration().sub_registration(&operation.address) {
            for capability in registration.capabilities() {
                if !capabilities.contains(capability) {
                    capabilities.push(capability.clone());
                }
            }
        }
        for capability in &capabilities {
            ctx.deregister_capability(capability, None)?;
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

    /// Restore services stopped by `perform_runtime` when the operation rolls
    /// back.
    fn recover_services(
        &self,
        _ctx: &mut OperationContext,
        _operation: &Operation,
        _model: &Map<String, Value>,
    ) {
    }
}

/// Runs a [`RemoveStepHandler`]. Children whose type has its own `remove`
/// are removed first, each by its own handler, before the resource itself.
pub struct RemoveOperation<H>(Arc<H>);

impl<H: RemoveStepHandler> RemoveOperation<H> {
    pub fn new(handler: H) -> Self {
        Self(Arc::new(handler))
    }
}

impl<H: RemoveStepHandler> OperationStepHandler for RemoveOperation<H> {
    fn execute(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
    ) -> Result<(), ControllerError> {
        let address = &operation.address;
        let resource = ctx.read_resource(address, false)?;

        let mut removable = Vec::new();
        if let Some(registration) = ctx.root_registration().sub_registration(address) {
            for element in resource.child_elements() {
                if registration.is_removable(&element) {
                    removable.push(address.append(element)?);
                }
            }
        }
        if !removable.is_empty()
            && ctx.update_attachment(REMOVE_VISITED, |visited| visited.insert(address.clone()))
        {
            for child in removable {
                ctx.add_operation_step_first(Operation::new(REMOVE, child), Stage::Model)?;
            }
            let again: Arc<dyn OperationStepHandler> = Arc::new(Self(Arc::clone(&self.0)));
            return ctx.add_step_first(again, operation.clone(), Stage::Model);
        }

        let model = resource.model().clone();
        self.0
            .record_capabilities_and_requirements(ctx, operation, &model)?;
        self.0.perform_remove(ctx, operation, &model)?;
        if !self.0.requires_runtime(ctx) {
            return Ok(());
        }
        let handler = Arc::clone(&self.0);
        ctx.add_step_fn(Stage::Runtime, operation.clone(), move |ctx, operation| {
            let recover = Arc::clone(&handler);
            let (op, saved) = (operation.clone(), model.clone());
            ctx.complete_step_with_rollback(move |ctx| recover.recover_services(ctx, &op, &saved))?;
            handler.perform_runtime(ctx, operation, &model)
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelOnlyRemoveHandler {
    parameters: HandlerParameters,
}

impl ModelOnlyRemoveHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameters(parameters: HandlerParameters) -> Self {
        Self { parameters }
    }
}

impl RemoveStepHandler for ModelOnlyRemoveHandler {
    fn parameters(&self) -> &HandlerParameters {
        &self.parameters
    }

    fn requires_runtime(&self, _ctx: &OperationContext) -> bool {
        false
    }
}
