use super::{dependent_name, OperationStepHandler};
use crate::context::{OperationContext, Stage};
use crate::ControllerError;
use serde_json::Value;
use std::sync::Arc;
use tracing::error;
use trellis_model::{AttributeDefinition, Operation, RestartLevel, NAME, VALUE};

/// Runtime half of `write-attribute`. The model update, validation and
/// capability-reference bookkeeping are done by [`WriteAttributeOperation`].
pub trait WriteAttributeHandler: Send + Sync + 'static {
    /// Whatever `revert_update_to_runtime` needs to undo the update.
    type Handback: Send + 'static;

    fn attributes(&self) -> &[AttributeDefinition];

    fn requires_runtime(&self, _ctx: &OperationContext) -> bool {
        true
    }

    /// Apply `resolved` to the running system. Returns whether the change
    /// only takes effect after a reload (or a restart, for attributes with
    /// restart level `jvm`).
    fn apply_update_to_runtime(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
        attribute: &AttributeDefinition,
        resolved: &Value,
        current: &Value,
    ) -> Result<(bool, Self::Handback), ControllerError>;

    fn revert_update_to_runtime(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
        attribute: &AttributeDefinition,
        restored: &Value,
        handback: Self::Handback,
    ) -> Result<(), ControllerError>;
}

pub struct WriteAttributeOperation<H>(Arc<H>);

impl<H: WriteAttributeHandler> WriteAttributeOperation<H> {
    pub fn new(handler: H) -> Self {
        Self(Arc::new(handler))
    }
}

impl<H: WriteAttributeHandler> OperationStepHandler for WriteAttributeOperation<H> {
    fn execute(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
    ) -> Result<(), ControllerError> {
        let name = operation.require_string(NAME)?.to_owned();
        let attribute = self
            .0
            .attributes()
            .iter()
            .find(|a| a.name == name)
            .cloned()
            .ok_or_else(|| {
                ControllerError::failed(format!(
                    "unknown attribute '{name}' at {}",
                    operation.address
                ))
            })?;
        let new_value = operation.param(VALUE).cloned().unwrap_or(Value::Null);
        attribute.validate(&new_value)?;

        let old_value = ctx.with_resource_for_update(&operation.address, |resource| {
            let model = resource.model_mut();
            let old = model.get(&name).cloned().unwrap_or(Value::Null);
            if new_value.is_null() {
                model.remove(&name);
            } else {
                model.insert(name.clone(), new_value.clone());
            }
            old
        })?;

        if let Some(reference) = &attribute.capability_reference {
            let dependent = dependent_name(reference, &operation.address);
            if let Some(old) = attribute.resolve(&old_value).as_str() {
                ctx.deregister_requirement(&dependent, &reference.required_name(old), Some(name.as_str()))?;
            }
            if let Some(new) = attribute.resolve(&new_value).as_str() {
                ctx.register_requirement(
                    &dependent,
                    &reference.required_name(new),
                    Some(name.as_str()),
                    false,
                )?;
            }
        }

        if !self.0.requires_runtime(ctx) {
            return Ok(());
        }
        let handler = Arc::clone(&self.0);
        ctx.add_step_fn(Stage::Runtime, operation.clone(), move |ctx, operation| {
            let resolved = attribute.resolve(&new_value);
            let current = attribute.resolve(&old_value);
            let (reload, handback) =
                handler.apply_update_to_runtime(ctx, operation, &attribute, &resolved, &current)?;
            let restart = reload && attribute.restart == RestartLevel::Jvm;
            if restart {
                ctx.restart_required()?;
            } else if reload {
                ctx.reload_required()?;
            }
            let op = operation.clone();
            ctx.complete_step_with_rollback(move |ctx| {
                if let Err(e) =
                    handler.revert_update_to_runtime(ctx, &op, &attribute, &current, handback)
                {
                    error!("reverting {} of {op}: {e}", attribute.name);
                }
                if restart {
                    ctx.revert_restart_required();
                } else if reload {
                    ctx.revert_reload_required();
                }
            })
        })
    }
}

/// A `write-attribute` that only updates the model.
#[derive(Debug, Clone, Default)]
pub struct ModelOnlyWriteAttributeHandler {
    attributes: Vec<AttributeDefinition>,
}

impl ModelOnlyWriteAttributeHandler {
    pub fn new(attributes: Vec<AttributeDefinition>) -> Self {
        Self { attributes }
    }
}

impl WriteAttributeHandler for ModelOnlyWriteAttributeHandler {
    type Handback = ();

    fn attributes(&self) -> &[AttributeDefinition] {
        &self.attributes
    }

    fn requires_runtime(&self, _ctx: &OperationContext) -> bool {
        false
    }

    fn apply_update_to_runtime(
        &self,
        _ctx: &mut OperationContext,
        _operation: &Operation,
        _attribute: &AttributeDefinition,
        _resolved: &Value,
        _current: &Value,
    ) -> Result<(bool, ()), ControllerError> {
        Ok((false, ()))
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
