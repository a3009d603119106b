use super::OperationStepHandler;
use crate::context::OperationContext;
use crate::ControllerError;
use serde_json::Value;
use trellis_model::{Operation, NAME, RECURSIVE};

/// `read-resource`: the attributes and children of the target, recursively
/// on request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadResourceHandler;

impl OperationStepHandler for ReadResourceHandler {
    fn execute(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
    ) -> Result<(), ControllerError> {
        let recursive = operation.bool_param(RECURSIVE);
        let resource = ctx.read_resource(&operation.address, recursive)?;
        ctx.set_result(resource.to_model_node(recursive));
        Ok(())
    }
}

/// `read-attribute`: the stored value, or the attribute's default.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadAttributeHandler;

impl OperationStepHandler for ReadAttributeHandler {
    fn execute(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
    ) -> Result<(), ControllerError> {
        let name = operation.require_string(NAME)?;
        let model = ctx.read_model(&operation.address)?;
        let value = match model.get(name) {
            Some(value) => value.clone(),
            None => {
                let registration = ctx.root_registration();
                let attribute = registration
                    .sub_registration(&operation.address)
                    .and_then(|r| r.attribute(name))
                    .ok_or_else(|| {
                        ControllerError::failed(format!(
                            "unknown attribute '{name}' at {}",
                            operation.address
                        ))
                    })?;
                attribute.resolve(&Value::Null)
            }
        };
        ctx.set_result(value);
        Ok(())
    }
}
