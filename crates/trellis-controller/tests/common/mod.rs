#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use trellis_capability::RuntimeCapability;
use trellis_controller::{
    AddOperation, AddStepHandler, ControllerConfig, ControllerError, HandlerParameters,
    ModelController, ModelOnlyAddHandler, ModelOnlyRemoveHandler, ModelOnlyWriteAttributeHandler,
    OperationContext, OperationStepHandler, RemoveOperation, ResourceRegistration, ServiceContainer, ServiceRegistry,
    WriteAttributeHandler, WriteAttributeOperation,
};
use trellis_model::{
    AttributeDefinition, AttributeType, CapabilityReference, Operation, PathAddress, PathElement,
    RestartLevel, ServiceName, ADD, REMOVE, WRITE_ATTRIBUTE,
};

pub const WEB_CAPABILITY: &str = "org.trellis.web";
pub const CONNECTOR_CAPABILITY: &str = "org.trellis.web.connector";
pub const SOCKET_CAPABILITY: &str = "org.trellis.socket-binding";
pub const SUBSYSTEM_CAPABILITY: &str = "org.trellis.subsystem";

pub type RuntimeValues = Arc<Mutex<BTreeMap<String, Value>>>;

pub fn address(s: &str) -> PathAddress {
    PathAddress::parse(s).unwrap()
}

pub fn add(at: &str) -> Operation {
    Operation::new(ADD, address(at))
}

pub fn remove(at: &str) -> Operation {
    Operation::new(REMOVE, address(at))
}

pub fn write(at: &str, name: &str, value: impl Into<Value>) -> Operation {
    Operation::new(WRITE_ATTRIBUTE, address(at))
        .with_param("name", name)
        .with_param("value", value)
}

fn port() -> AttributeDefinition {
    AttributeDefinition::new("port", AttributeType::Int)
}

fn socket_binding_ref() -> AttributeDefinition {
    AttributeDefinition::new("socket-binding", AttributeType::String)
        .required()
        .with_capability_reference(
            CapabilityReference::new(SOCKET_CAPABILITY, CONNECTOR_CAPABILITY)
                .with_dynamic_dependent(),
        )
}

/// Installs `trellis.web` in RUNTIME, depending on the service named by
/// `requires-service`.
struct WebAdd {
    parameters: HandlerParameters,
}

impl AddStepHandler for WebAdd {
    fn parameters(&self) -> &HandlerParameters {
        &self.parameters
    }

    fn perform_runtime(
        &self,
        ctx: &mut OperationContext,
        _operation: &Operation,
        model: &Map<String, Value>,
    ) -> Result<(), ControllerError> {
        let dependencies = model
            .get("requires-service")
            .and_then(Value::as_str)
            .map(|s| vec![ServiceName::new(s)])
            .unwrap_or_default();
        ctx.service_container(true)?
            .install(ServiceName::new("trellis.web"), dependencies)
    }

    fn rollback_runtime(
        &self,
        ctx: &mut OperationContext,
        _operation: &Operation,
        _model: &Map<String, Value>,
    ) {
        let _ = ctx.remove_service(&ServiceName::new("trellis.web"));
    }
}

/// Generic subsystem whose RUNTIME fails when `fail-runtime` is set.
struct SubsystemAdd {
    parameters: HandlerParameters,
}

impl AddStepHandler for SubsystemAdd {
    fn parameters(&self) -> &HandlerParameters {
        &self.parameters
    }

    fn perform_runtime(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
        model: &Map<String, Value>,
    ) -> Result<(), ControllerError> {
        if model.get("fail-runtime").and_then(Value::as_bool) == Some(true) {
            return Err(ControllerError::failed(format!(
                "{} refused to start",
                operation.address
            )));
        }
        let name = operation
            .address
            .last_element()
            .map(|e| format!("trellis.subsystem.{}", e.value()))
            .unwrap_or_default();
        ctx.service_container(true)?
            .install(ServiceName::new(name), Vec::new())
    }
}

/// Mirrors connector attributes into `values`; every change needs a reload.
pub struct ConnectorWriter {
    attributes: Vec<AttributeDefinition>,
    values: RuntimeValues,
}

impl WriteAttributeHandler for ConnectorWriter {
    type Handback = Value;

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
    ) -> Result<(bool, Value), ControllerError> {
        self.values
            .lock()
            .insert(attribute.name.clone(), resolved.clone());
        Ok((true, current.clone()))
    }

    fn revert_update_to_runtime(
        &self,
        _ctx: &mut OperationContext,
        _operation: &Operation,
        attribute: &AttributeDefinition,
        _restored: &Value,
        handback: Value,
    ) -> Result<(), ControllerError> {
        self.values.lock().insert(attribute.name.clone(), handback);
        Ok(())
    }
}

pub fn registration(values: &RuntimeValues) -> ResourceRegistration {
    registration_with(values, Vec::new())
}

/// The test model, with `extra` operations registered on the root resource.
pub fn registration_with(
    values: &RuntimeValues,
    extra: Vec<(&str, Arc<dyn OperationStepHandler>)>,
) -> ResourceRegistration {
    let socket_binding = ResourceRegistration::new()
        .with_attribute(port())
        .with_capability(RuntimeCapability::new(SOCKET_CAPABILITY).dynamic())
        .with_operation(
            ADD,
            Arc::new(AddOperation::new(ModelOnlyAddHandler::new(
                HandlerParameters::new().with_attribute(port().required()),
            ))),
        )
        .with_operation(
            REMOVE,
            Arc::new(RemoveOperation::new(ModelOnlyRemoveHandler::new())),
        )
        .with_operation(
            WRITE_ATTRIBUTE,
            Arc::new(WriteAttributeOperation::new(
                ModelOnlyWriteAttributeHandler::new(vec![port()]),
            )),
        );

    let connector_parameters = HandlerParameters::new()
        .with_attribute(socket_binding_ref())
        .with_attribute(port());
    let connector = ResourceRegistration::new()
        .with_attribute(socket_binding_ref())
        .with_attribute(port())
        .with_capability(RuntimeCapability::new(CONNECTOR_CAPABILITY).dynamic())
        .with_operation(
            ADD,
            Arc::new(AddOperation::new(ModelOnlyAddHandler::new(
                connector_parameters.clone(),
            ))),
        )
        .with_operation(
            REMOVE,
            Arc::new(RemoveOperation::new(ModelOnlyRemoveHandler::with_parameters(
                connector_parameters,
            ))),
        )
        .with_operation(
            WRITE_ATTRIBUTE,
            Arc::new(WriteAttributeOperation::new(ConnectorWriter {
                attributes: vec![
                    socket_binding_ref(),
                    port().with_restart(RestartLevel::AllServices),
                ],
                values: Arc::clone(values),
            })),
        );

    let requires_service = AttributeDefinition::new("requires-service", AttributeType::String);
    let web = ResourceRegistration::new()
        .with_attribute(requires_service.clone())
        .with_capability(RuntimeCapability::new(WEB_CAPABILITY))
        .with_ordered_child_type("connector")
        .with_operation(
            ADD,
            Arc::new(AddOperation::new(WebAdd {
                parameters: HandlerParameters::new().with_attribute(requires_service),
            })),
        )
        .with_operation(
            REMOVE,
            Arc::new(RemoveOperation::new(ModelOnlyRemoveHandler::new())),
        )
        .with_child(&PathElement::wildcard("connector"), connector);

    let fail_runtime = AttributeDefinition::new("fail-runtime", AttributeType::Boolean);
    let subsystem = ResourceRegistration::new()
        .with_attribute(fail_runtime.clone())
        .with_capability(RuntimeCapability::new(SUBSYSTEM_CAPABILITY).dynamic())
        .with_operation(
            ADD,
            Arc::new(AddOperation::new(SubsystemAdd {
                parameters: HandlerParameters::new().with_attribute(fail_runtime),
            })),
        )
        .with_operation(
            REMOVE,
            Arc::new(RemoveOperation::new(ModelOnlyRemoveHandler::new())),
        );

    let root = ResourceRegistration::new()
        .with_global_operations()
        .with_child(&PathElement::wildcard("socket-binding"), socket_binding)
        .with_child(&PathElement::new("subsystem", "web").unwrap(), web)
        .with_child(&PathElement::wildcard("subsystem"), subsystem);
    extra
        .into_iter()
        .fold(root, |root, (name, handler)| root.with_operation(name, handler))
}

pub struct Fixture {
    pub controller: ModelController,
    pub container: Arc<ServiceRegistry>,
    pub values: RuntimeValues,
}

pub fn fixture() -> Fixture {
    fixture_with(Vec::new(), test_config())
}

pub fn fixture_with(
    extra: Vec<(&str, Arc<dyn OperationStepHandler>)>,
    config: ControllerConfig,
) -> Fixture {
    let values: RuntimeValues = Arc::default();
    let container = ServiceRegistry::new();
    let controller = ModelController::new(
        registration_with(&values, extra),
        Arc::clone(&container) as Arc<dyn ServiceContainer>,
        config,
    );
    Fixture {
        controller,
        container,
        values,
    }
}

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        max_parallel_boot_tasks: 2,
        lock_timeout_ms: 10_000,
        stability_timeout_ms: 5_000,
        ..ControllerConfig::default()
    }
}
